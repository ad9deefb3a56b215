//! # rkf78-adjoint: Checkpointed Adjoint Sensitivities
//!
//! Adjoint (reverse-mode) sensitivity analysis for ODE initial value problems,
//! built on a Runge-Kutta-Fehlberg 7(8) stepper.
//!
//! ## Features
//!
//! - 13-stage embedded RK7(8) pair with adaptive step-size control
//! - Nordsieck-style solution history with variable order (1 to 5), dense
//!   output and exact hot restart from a saved state
//! - Checkpoints every N forward steps, so memory grows with the number of
//!   checkpoints rather than the number of steps
//! - Forward solution reconstructed for the backward pass by cubic Hermite
//!   or variable-degree Newton polynomial interpolation
//! - Backward quadratures for gradient accumulation
//! - Generic over the state vector: `[f64; N]`, `Vec<f64>` or any
//!   [`NVector`] implementation
//!
//! ## Basic Usage
//!
//! ```rust
//! use rkf78_adjoint::{
//!     AdjointConfig, AdjointSession, AdjointSystem, InterpolationKind, OdeSystem, RhsError,
//!     Rkf78, Task, Tolerances,
//! };
//!
//! // Forward problem: y' = -p y
//! struct Decay { p: f64 }
//!
//! impl OdeSystem<[f64; 1]> for Decay {
//!     fn rhs(&self, _t: f64, y: &[f64; 1], ydot: &mut [f64; 1]) -> Result<(), RhsError> {
//!         ydot[0] = -self.p * y[0];
//!         Ok(())
//!     }
//! }
//!
//! // Adjoint: yB' = p yB, with dG/dp accumulated as qB' = y yB
//! struct DecayAdjoint { p: f64 }
//!
//! impl AdjointSystem<[f64; 1]> for DecayAdjoint {
//!     fn rhs(&self, _t: f64, _y: &[f64; 1], yb: &[f64; 1], ybdot: &mut [f64; 1]) -> Result<(), RhsError> {
//!         ybdot[0] = self.p * yb[0];
//!         Ok(())
//!     }
//!
//!     fn quad_rhs(&self, _t: f64, y: &[f64; 1], yb: &[f64; 1], qbdot: &mut [f64; 1]) -> Result<(), RhsError> {
//!         qbdot[0] = y[0] * yb[0];
//!         Ok(())
//!     }
//! }
//!
//! let p = 0.5;
//! let mut forward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
//! forward.set_step_limits(1e-14, 0.1);
//! forward.init(0.0, &[1.0]).unwrap();
//!
//! let config = AdjointConfig {
//!     steps_per_checkpoint: 10,
//!     interpolation: InterpolationKind::Hermite,
//! };
//! let mut session = AdjointSession::new(forward, &config).unwrap();
//!
//! let mut y = [0.0];
//! session.integrate_forward(&Decay { p }, 2.0, Task::Normal, &mut y).unwrap();
//!
//! // Sensitivity of G = y(2) with respect to p
//! session.set_backward(Rkf78::new(Tolerances::new(1e-10, 1e-10)), 2.0, &[1.0]).unwrap();
//! session.init_backward_quadrature(&[0.0], None).unwrap();
//! let mut yb = [0.0];
//! session
//!     .integrate_backward(&Decay { p }, &DecayAdjoint { p }, 0.0, Task::Normal, &mut yb)
//!     .unwrap();
//!
//! let mut qb = [0.0];
//! session.get_quad_b(&mut qb).unwrap();
//! // y(2) = e^(-2p), so dG/dp = -2 e^(-2p)
//! assert!((qb[0] + 2.0 * (-2.0 * p).exp()).abs() < 1e-6);
//! ```
//!
//! The quadrature runs from 2 down to 0, so `qB(0) = -∫ y yB dt`, which is
//! `dG/dp` because `∂f/∂p = -y`.
//!
//! ## Checkpoint Interval
//!
//! `steps_per_checkpoint` trades memory for recomputation. Each checkpoint
//! keeps the active history slots of the stepper; the data point buffer holds
//! `steps_per_checkpoint + 1` points. During the backward pass every interval
//! except the newest is replayed once.
//!
//! ## Logging
//!
//! Checkpoint creation, restores and buffer refills are reported through
//! [`tracing`] at debug level, per-step stores at trace level. The crate
//! installs no subscriber.
//!
//! ## References
//!
//! 1. Fehlberg, E. (1968). "Classical Fifth-, Sixth-, Seventh-, and
//!    Eighth-Order Runge-Kutta Formulas with Stepsize Control".
//!    NASA TR R-287.
//!
//! 2. Hindmarsh, A.C., Serban, R. (2002). "User Documentation for CVODES".
//!    LLNL, UCRL-SM-208111.
//!
//! 3. Nordsieck, A. (1962). "On Numerical Integration of Ordinary
//!    Differential Equations". Mathematics of Computation 16.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod adjoint;
pub mod checkpoint;
pub mod coefficients;
pub mod error;
pub mod interp;
pub mod nvector;
pub mod solver;

pub use adjoint::{AdjointConfig, AdjointSession, AdjointStats, AdjointSystem, ForwardOutcome};
pub use checkpoint::{Checkpoint, CheckpointInfo, CheckpointStore};
pub use error::{AdjointError, ConfigError};
pub use interp::{DataPoint, DataPointBuffer, InterpolationError, InterpolationKind};
pub use nvector::{AllocError, NVector};
pub use solver::{
    AbsTol, IntegrationError, OdeSystem, RhsError, Rkf78, SavedHistory, Stats, StepController,
    StepData, Task, TaskStatus, Tolerances,
};
