//! Error types of the replay controller.
//!
//! Every variant maps to an integer status code through `status_code()`. Stepper
//! failures keep their own codes when they surface through the controller.

use crate::interp::InterpolationError;
use crate::nvector::AllocError;
use crate::solver::IntegrationError;
use thiserror::Error;

/// Illegal session configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `steps_per_checkpoint` was zero
    #[error("the number of steps between checkpoints must be positive")]
    ZeroInterval,

    /// Unrecognized interpolation name
    #[error("unknown interpolation kind {0:?} (expected \"hermite\" or \"polynomial\")")]
    UnknownInterpolation(String),
}

impl ConfigError {
    /// Integer status code
    pub fn status_code(&self) -> i32 {
        -22
    }
}

/// Errors raised by [`AdjointSession`](crate::AdjointSession)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdjointError {
    /// Rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Argument or call sequence rejected
    #[error("illegal input: {0}")]
    IllegalInput(String),

    /// A vector copy could not be allocated
    #[error(transparent)]
    MemFail(#[from] AllocError),

    /// The forward stepper failed during the forward pass
    #[error("forward integration failed: {0}")]
    Forward(#[source] IntegrationError),

    /// The backward stepper failed
    #[error("backward integration failed: {0}")]
    Backward(#[source] IntegrationError),

    /// Forward solution requested outside the resident interval
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),

    /// Backward call before `set_backward`
    #[error("no backward problem has been set up")]
    NoBackwardProblem,

    /// Backward initial time outside the forward range
    #[error("tB0 = {tb0} lies outside the forward range [{t_initial}, {t_final}]")]
    BadTb0 {
        /// Rejected time
        tb0: f64,
        /// Forward initial time
        t_initial: f64,
        /// Forward frontier
        t_final: f64,
    },

    /// Backward output time outside the forward range
    #[error("tBout = {tbout} lies outside the forward range [{t_initial}, {t_final}]")]
    BadTbOut {
        /// Rejected time
        tbout: f64,
        /// Forward initial time
        t_initial: f64,
        /// Forward frontier
        t_final: f64,
    },

    /// The forward stepper could not be put back at a checkpoint
    #[error("could not restore checkpoint {id}: {source}")]
    RestoreFailed {
        /// Checkpoint id
        id: usize,
        /// Stepper error
        source: IntegrationError,
    },

    /// Replaying the forward stepper over a checkpoint interval failed
    #[error("forward replay from checkpoint {id} failed: {source}")]
    ReplayFailed {
        /// Checkpoint id
        id: usize,
        /// Stepper error
        source: IntegrationError,
    },

    /// Replay took more steps than the buffer holds
    #[error("replay of checkpoint {id} did not reach t1 = {t1} within {capacity} points")]
    ReplayOverrun {
        /// Checkpoint id
        id: usize,
        /// Interval end
        t1: f64,
        /// Buffer capacity
        capacity: usize,
    },
}

impl AdjointError {
    /// Integer status code
    pub fn status_code(&self) -> i32 {
        match self {
            AdjointError::Config(e) => e.status_code(),
            AdjointError::IllegalInput(_) => -22,
            AdjointError::MemFail(_) => -20,
            AdjointError::Forward(e) | AdjointError::Backward(e) => e.status_code(),
            AdjointError::Interpolation(e) => e.status_code(),
            AdjointError::NoBackwardProblem => -104,
            AdjointError::BadTb0 { .. } => -103,
            AdjointError::BadTbOut { .. } => -108,
            AdjointError::RestoreFailed { .. } => -105,
            AdjointError::ReplayFailed { .. } | AdjointError::ReplayOverrun { .. } => -106,
        }
    }
}
