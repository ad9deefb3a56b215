//! Replay controller: forward pass with checkpointing, backward pass with
//! on-demand forward replay.
//!
//! [`AdjointSession`] owns the forward stepper. During
//! [`integrate_forward`](AdjointSession::integrate_forward) it snapshots the
//! stepper every `steps_per_checkpoint` accepted steps and records one data
//! point per step for the newest interval. During
//! [`integrate_backward`](AdjointSession::integrate_backward) the adjoint
//! right-hand side receives the forward solution interpolated from those
//! points. When the backward time leaves the resident interval, the forward
//! stepper is restored from the bracketing checkpoint and replayed to refill
//! the buffer.
//!
//! # Example
//!
//! ```
//! use rkf78_adjoint::{
//!     AdjointConfig, AdjointSession, AdjointSystem, OdeSystem, RhsError, Rkf78, Task,
//!     Tolerances,
//! };
//!
//! struct Decay;
//!
//! impl OdeSystem<[f64; 1]> for Decay {
//!     fn rhs(&self, _t: f64, y: &[f64; 1], ydot: &mut [f64; 1]) -> Result<(), RhsError> {
//!         ydot[0] = -y[0];
//!         Ok(())
//!     }
//! }
//!
//! struct DecayAdjoint;
//!
//! impl AdjointSystem<[f64; 1]> for DecayAdjoint {
//!     fn rhs(&self, _t: f64, _y: &[f64; 1], yb: &[f64; 1], ybdot: &mut [f64; 1]) -> Result<(), RhsError> {
//!         ybdot[0] = yb[0];
//!         Ok(())
//!     }
//! }
//!
//! let mut forward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
//! forward.init(0.0, &[1.0]).unwrap();
//! let mut session = AdjointSession::new(forward, &AdjointConfig::default()).unwrap();
//!
//! let mut y = [0.0];
//! session.integrate_forward(&Decay, 1.0, Task::Normal, &mut y).unwrap();
//!
//! let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
//! session.set_backward(backward, 1.0, &[1.0]).unwrap();
//! let mut yb = [0.0];
//! session
//!     .integrate_backward(&Decay, &DecayAdjoint, 0.0, Task::Normal, &mut yb)
//!     .unwrap();
//!
//! // d y(1) / d y(0) = e^-1
//! assert!((yb[0] - (-1.0f64).exp()).abs() < 1e-8);
//! ```

use crate::checkpoint::{CheckpointInfo, CheckpointStore};
use crate::error::{AdjointError, ConfigError};
use crate::interp::{DataPoint, DataPointBuffer, InterpolationError, InterpolationKind};
use crate::nvector::NVector;
use crate::solver::{IntegrationError, OdeSystem, RhsError, Rkf78, Task, TaskStatus, Tolerances};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use tracing::{debug, warn};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdjointConfig {
    /// Accepted forward steps between consecutive checkpoints
    pub steps_per_checkpoint: u64,
    /// How the forward solution is reconstructed between steps
    pub interpolation: InterpolationKind,
}

impl Default for AdjointConfig {
    fn default() -> Self {
        Self {
            steps_per_checkpoint: 100,
            interpolation: InterpolationKind::Hermite,
        }
    }
}

impl AdjointConfig {
    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps_per_checkpoint == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Adjoint system: dyB/dt = fB(t, y(t), yB), with optional quadratures
/// dqB/dt = gB(t, y(t), yB).
///
/// `y` is the forward solution at `t`, interpolated from stored data.
pub trait AdjointSystem<V: NVector> {
    /// Backward right-hand side
    fn rhs(&self, t: f64, y: &V, yb: &V, yb_dot: &mut V) -> Result<(), RhsError>;

    /// Backward quadrature integrand
    fn quad_rhs(&self, _t: f64, _y: &V, _yb: &V, qb_dot: &mut V) -> Result<(), RhsError> {
        qb_dot.fill(0.0);
        Ok(())
    }
}

/// Result of a forward call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardOutcome {
    /// Time the output vector corresponds to
    pub t: f64,
    /// Stop reason
    pub status: TaskStatus,
    /// Checkpoints in the store, root included
    pub checkpoints: usize,
}

/// Replay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdjointStats {
    /// Checkpoint restores (each followed by a buffer refill)
    pub restores: u64,
    /// Forward steps re-taken during refills
    pub replayed_steps: u64,
    /// Forward solution lookups made by the backward right-hand side
    pub interpolations: u64,
    /// Lookups that fell outside the resident interval
    pub interpolation_failures: u64,
}

/// Backward right-hand side with the forward solution injected
struct WithForward<'a, B, V> {
    sys: &'a B,
    buffer: RefCell<&'a mut DataPointBuffer<V>>,
    y: RefCell<&'a mut V>,
    calls: Cell<u64>,
    failure: RefCell<Option<InterpolationError>>,
}

impl<B: AdjointSystem<V>, V: NVector> WithForward<'_, B, V> {
    fn with_forward<R>(&self, t: f64, f: impl FnOnce(&V) -> Result<R, RhsError>) -> Result<R, RhsError> {
        let mut y = self.y.borrow_mut();
        self.calls.set(self.calls.get() + 1);
        if let Err(e) = self.buffer.borrow_mut().get_y(t, &mut **y) {
            // The stepper retries with a smaller step
            *self.failure.borrow_mut() = Some(e);
            return Err(RhsError::Recoverable);
        }
        f(&**y)
    }
}

impl<B: AdjointSystem<V>, V: NVector> OdeSystem<V> for WithForward<'_, B, V> {
    fn rhs(&self, t: f64, yb: &V, yb_dot: &mut V) -> Result<(), RhsError> {
        self.with_forward(t, |y| self.sys.rhs(t, y, yb, yb_dot))
    }

    fn quad_rhs(&self, t: f64, yb: &V, qb_dot: &mut V) -> Result<(), RhsError> {
        self.with_forward(t, |y| self.sys.quad_rhs(t, y, yb, qb_dot))
    }
}

/// Checkpointed forward/backward integration
#[derive(Debug)]
pub struct AdjointSession<V: NVector> {
    forward: Rkf78<V>,
    backward: Option<Rkf78<V>>,
    checkpoints: CheckpointStore<V>,
    buffer: DataPointBuffer<V>,
    steps: u64,
    t_initial: f64,
    t_final: f64,
    direction: f64,
    h0u: f64,
    started: bool,
    frontier_lost: bool,
    forward_failed: bool,
    resident: Option<usize>,
    t_for_quad: f64,
    ytmp: V,
    stats: AdjointStats,
}

impl<V: NVector> AdjointSession<V> {
    /// Wrap an initialized forward stepper that has not taken any step yet.
    ///
    /// Allocates `steps_per_checkpoint + 1` data points.
    pub fn new(forward: Rkf78<V>, config: &AdjointConfig) -> Result<Self, AdjointError> {
        config.validate()?;
        let template = forward
            .y()
            .ok_or_else(|| AdjointError::IllegalInput("forward stepper must be initialized".to_string()))?;
        if forward.data().nst > 0 {
            return Err(AdjointError::IllegalInput(
                "forward stepper has already taken steps".to_string(),
            ));
        }
        let capacity = usize::try_from(config.steps_per_checkpoint)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or(AdjointError::Config(ConfigError::ZeroInterval))?;
        let buffer = DataPointBuffer::new(config.interpolation, capacity, template)?;
        let ytmp = template.try_clone()?;
        let t0 = forward.t();
        debug!(
            steps = config.steps_per_checkpoint,
            interpolation = %config.interpolation,
            "adjoint session created"
        );
        Ok(Self {
            forward,
            backward: None,
            checkpoints: CheckpointStore::new(),
            buffer,
            steps: config.steps_per_checkpoint,
            t_initial: t0,
            t_final: t0,
            direction: 1.0,
            h0u: 0.0,
            started: false,
            frontier_lost: false,
            forward_failed: false,
            resident: None,
            t_for_quad: t0,
            ytmp,
            stats: AdjointStats::default(),
        })
    }

    /// Integrate forward toward `tout`, checkpointing along the way.
    ///
    /// Follows [`Rkf78::solve`] semantics for `task`. Not available once a
    /// backward pass has replayed the forward stepper.
    pub fn integrate_forward<F: OdeSystem<V>>(
        &mut self,
        sys: &F,
        tout: f64,
        task: Task,
        yout: &mut V,
    ) -> Result<ForwardOutcome, AdjointError> {
        if self.frontier_lost {
            return Err(AdjointError::IllegalInput(
                "forward integration cannot resume after a checkpoint replay".to_string(),
            ));
        }
        if self.forward_failed {
            return Err(AdjointError::IllegalInput(
                "forward integration cannot resume after a failed checkpoint allocation".to_string(),
            ));
        }
        if !self.started {
            self.checkpoints.init_root(&self.forward)?;
            self.buffer.store(0, &self.forward, sys)?;
            self.t_initial = self.forward.t();
            self.t_final = self.t_initial;
            self.started = true;
        }

        let result = self.forward_loop(sys, tout, task, yout);

        if self.h0u == 0.0 && self.forward.data().nst > 0 {
            self.h0u = self.forward.initial_step();
            self.direction = self.h0u.signum();
        }
        let np = (self.forward.data().nst % self.steps) as usize + 1;
        self.buffer.mark_fresh(np, self.direction);
        self.resident = self.checkpoints.head_index();

        if let Err(e) = &result {
            warn!(t = self.t_final, error = %e, "forward pass stopped");
            // Stepper, store and buffer no longer agree on the interval
            if matches!(e, AdjointError::MemFail(_)) {
                self.forward_failed = true;
            }
        }
        result.map(|(t, status)| ForwardOutcome {
            t,
            status,
            checkpoints: self.checkpoints.len(),
        })
    }

    fn forward_loop<F: OdeSystem<V>>(
        &mut self,
        sys: &F,
        tout: f64,
        task: Task,
        yout: &mut V,
    ) -> Result<(f64, TaskStatus), AdjointError> {
        let data = self.forward.data();
        if task == Task::Normal && data.nst > 0 && (data.tn - tout) * data.h >= 0.0 {
            self.forward
                .solution_at(sys, tout, yout)
                .map_err(AdjointError::Forward)?;
            return Ok((tout, TaskStatus::Success));
        }

        let mut taken = 0u64;
        loop {
            if taken >= self.forward.max_steps {
                return Err(AdjointError::Forward(IntegrationError::TooMuchWork {
                    t: self.forward.t(),
                    steps: taken,
                }));
            }
            let (t, status) = self
                .forward
                .solve(sys, tout, Task::OneStep, yout)
                .map_err(AdjointError::Forward)?;
            taken += 1;

            let nst = self.forward.data().nst;
            let slot = (nst % self.steps) as usize;
            if slot == 0 {
                if let Some(head) = self.checkpoints.head_mut() {
                    head.set_t1(t);
                }
                self.checkpoints.push_current(&self.forward)?;
                self.forward.request_setup();
            }
            self.buffer.store(slot, &self.forward, sys)?;
            if let Some(head) = self.checkpoints.head_mut() {
                head.set_t1(t);
            }
            self.t_final = t;

            if task == Task::OneStep {
                return Ok((t, status));
            }
            if (t - tout) * self.forward.data().h >= 0.0 {
                self.forward
                    .solution_at(sys, tout, yout)
                    .map_err(AdjointError::Forward)?;
                return Ok((tout, TaskStatus::Success));
            }
            if status == TaskStatus::TstopReturn {
                return Ok((t, status));
            }
        }
    }

    /// Attach the backward stepper and initialize it at `tb0`.
    ///
    /// `tb0` must lie inside the range covered by the forward pass.
    pub fn set_backward(&mut self, mut stepper: Rkf78<V>, tb0: f64, yb0: &V) -> Result<(), AdjointError> {
        self.check_tb0(tb0)?;
        stepper.init(tb0, yb0).map_err(AdjointError::Backward)?;
        self.backward = Some(stepper);
        self.t_for_quad = tb0;
        debug!(tb0, "backward problem attached");
        Ok(())
    }

    /// Restart the attached backward stepper at `tb0`
    pub fn reinit_backward(&mut self, tb0: f64, yb0: &V) -> Result<(), AdjointError> {
        self.check_tb0(tb0)?;
        let backward = self.backward.as_mut().ok_or(AdjointError::NoBackwardProblem)?;
        backward.reinit(tb0, yb0).map_err(AdjointError::Backward)?;
        self.t_for_quad = tb0;
        Ok(())
    }

    fn check_tb0(&self, tb0: f64) -> Result<(), AdjointError> {
        if !self.started || self.t_final == self.t_initial {
            return Err(AdjointError::IllegalInput(
                "the forward pass has not advanced".to_string(),
            ));
        }
        let sign = self.direction;
        if !tb0.is_finite() || sign * (tb0 - self.t_initial) < 0.0 || sign * (self.t_final - tb0) < 0.0 {
            return Err(AdjointError::BadTb0 {
                tb0,
                t_initial: self.t_initial,
                t_final: self.t_final,
            });
        }
        Ok(())
    }

    /// Enable quadratures on the backward problem
    pub fn init_backward_quadrature(&mut self, yqb0: &V, tol: Option<Tolerances<V>>) -> Result<(), AdjointError> {
        let backward = self.backward.as_mut().ok_or(AdjointError::NoBackwardProblem)?;
        backward.quad_init(yqb0, tol).map_err(AdjointError::Backward)
    }

    /// Integrate the backward problem toward `tbout`.
    ///
    /// Crosses checkpoint intervals from newest to oldest, replaying the
    /// forward pass over each interval the backward time enters.
    pub fn integrate_backward<F: OdeSystem<V>, B: AdjointSystem<V>>(
        &mut self,
        fwd: &F,
        bwd: &B,
        tbout: f64,
        task: Task,
        yb_out: &mut V,
    ) -> Result<(f64, TaskStatus), AdjointError> {
        let tbn = self
            .backward
            .as_ref()
            .ok_or(AdjointError::NoBackwardProblem)?
            .t();
        let sign = self.direction;
        if !tbout.is_finite()
            || sign * (tbout - self.t_initial) < 0.0
            || sign * (self.t_final - tbout) < 0.0
        {
            return Err(AdjointError::BadTbOut {
                tbout,
                t_initial: self.t_initial,
                t_final: self.t_final,
            });
        }

        let mut index = self
            .checkpoints
            .head_index()
            .ok_or_else(|| AdjointError::IllegalInput("no forward data".to_string()))?;
        while let Some(prev) = self.checkpoints.previous(index) {
            match self.checkpoints.get(index) {
                Some(ck) if sign * (tbn - ck.t0()) <= 0.0 => index = prev,
                _ => break,
            }
        }

        loop {
            if self.resident != Some(index) {
                self.replay_checkpoint(fwd, index)?;
            }
            let t0 = self.checkpoints.get(index).map_or(self.t_initial, |ck| ck.t0());

            let (t, status) = self.backward_solve(bwd, t0, tbout, task, yb_out)?;
            self.t_for_quad = t;

            if task == Task::OneStep || t == tbout {
                return Ok((t, status));
            }
            match self.checkpoints.previous(index) {
                Some(prev) => index = prev,
                None => return Ok((t, status)),
            }
        }
    }

    fn backward_solve<B: AdjointSystem<V>>(
        &mut self,
        bwd: &B,
        t0: f64,
        tbout: f64,
        task: Task,
        yb_out: &mut V,
    ) -> Result<(f64, TaskStatus), AdjointError> {
        let backward = self.backward.as_mut().ok_or(AdjointError::NoBackwardProblem)?;
        backward.set_stop_time(t0);

        let adapter = WithForward {
            sys: bwd,
            buffer: RefCell::new(&mut self.buffer),
            y: RefCell::new(&mut self.ytmp),
            calls: Cell::new(0),
            failure: RefCell::new(None),
        };
        let result = backward.solve(&adapter, tbout, task, yb_out);
        let failure = adapter.failure.into_inner();
        self.stats.interpolations += adapter.calls.get();
        if failure.is_some() {
            self.stats.interpolation_failures += 1;
        }

        result.map_err(|e| match (e, failure) {
            (
                IntegrationError::RepeatedRhsFailure { .. } | IntegrationError::StepSizeTooSmall { .. },
                Some(bad),
            ) => AdjointError::Interpolation(bad),
            (e, _) => {
                warn!(error = %e, "backward integration failed");
                AdjointError::Backward(e)
            }
        })
    }

    /// Restore the checkpoint at chronological `index` and refill the buffer
    /// by replaying the forward stepper over its interval.
    pub fn replay_checkpoint<F: OdeSystem<V>>(&mut self, fwd: &F, index: usize) -> Result<(), AdjointError> {
        let ck = self
            .checkpoints
            .get(index)
            .ok_or_else(|| AdjointError::IllegalInput(format!("no checkpoint at index {}", index)))?;
        let (id, t0, t1) = (ck.id(), ck.t0(), ck.t1());

        self.frontier_lost = true;
        self.resident = None;
        self.buffer.invalidate();
        ck.restore_into(&mut self.forward, self.h0u)
            .map_err(|source| AdjointError::RestoreFailed { id, source })?;
        self.stats.restores += 1;
        debug!(id, t0, t1, "checkpoint restored");

        self.buffer.store(0, &self.forward, fwd)?;
        let sign = self.direction;
        let capacity = self.buffer.capacity();
        let mut np = 1;
        let mut t = t0;
        while sign * (t - t1) < 0.0 {
            if np >= capacity {
                return Err(AdjointError::ReplayOverrun { id, t1, capacity });
            }
            let (tr, _) = self
                .forward
                .solve(fwd, t1, Task::OneStep, &mut self.ytmp)
                .map_err(|source| AdjointError::ReplayFailed { id, source })?;
            self.buffer.store(np, &self.forward, fwd)?;
            self.stats.replayed_steps += 1;
            np += 1;
            t = tr;
        }

        self.buffer.mark_fresh(np, sign);
        self.resident = Some(index);
        debug!(id, points = np, "forward data refilled");
        Ok(())
    }

    /// Forward solution at `t`, interpolated from the resident interval
    pub fn get_y(&mut self, t: f64, y: &mut V) -> Result<(), AdjointError> {
        self.buffer.get_y(t, y).map_err(AdjointError::Interpolation)
    }

    /// Run `f` with the interpolated forward solution at `t`.
    ///
    /// Lets user code outside the right-hand side (Jacobian-vector products,
    /// preconditioner setup) see the same `y(t)` the backward problem sees.
    pub fn eval_with_forward<R>(&mut self, t: f64, f: impl FnOnce(&V) -> R) -> Result<R, AdjointError> {
        self.buffer.get_y(t, &mut self.ytmp)?;
        Ok(f(&self.ytmp))
    }

    /// Backward quadratures at the time of the last backward return
    pub fn get_quad_b(&self, qb: &mut V) -> Result<(), AdjointError> {
        let backward = self.backward.as_ref().ok_or(AdjointError::NoBackwardProblem)?;
        backward.get_quad(self.t_for_quad, qb).map_err(AdjointError::Backward)
    }

    /// Switch the interpolation strategy.
    ///
    /// The buffer is reallocated, so the next backward call replays its
    /// interval even if it was resident.
    pub fn set_interpolation(&mut self, kind: InterpolationKind) -> Result<(), AdjointError> {
        if kind == self.buffer.kind() {
            return Ok(());
        }
        let buffer = DataPointBuffer::new(kind, self.buffer.capacity(), &self.ytmp)?;
        self.buffer = buffer;
        self.resident = None;
        if self.started {
            self.frontier_lost = true;
        }
        debug!(interpolation = %kind, "interpolation strategy replaced");
        Ok(())
    }

    /// Strategy in use
    pub fn interpolation(&self) -> InterpolationKind {
        self.buffer.kind()
    }

    /// Metadata of every checkpoint, newest first
    pub fn checkpoints_info(&self) -> Vec<CheckpointInfo> {
        self.checkpoints.info()
    }

    /// Checkpoint store
    pub fn checkpoints(&self) -> &CheckpointStore<V> {
        &self.checkpoints
    }

    /// Id of the checkpoint whose interval is in the buffer
    pub fn current_checkpoint(&self) -> Option<usize> {
        self.resident
            .and_then(|i| self.checkpoints.get(i))
            .map(|ck| ck.id())
    }

    /// Number of valid data points
    pub fn num_points(&self) -> usize {
        self.buffer.len()
    }

    /// Raw access to a stored data point
    pub fn data_point(&self, slot: usize) -> Result<DataPoint<'_, V>, AdjointError> {
        self.buffer.data_point(slot).map_err(AdjointError::Interpolation)
    }

    /// Start of the forward pass
    pub fn t_initial(&self) -> f64 {
        self.t_initial
    }

    /// Forward frontier
    pub fn t_final(&self) -> f64 {
        self.t_final
    }

    /// Replay counters
    pub fn stats(&self) -> &AdjointStats {
        &self.stats
    }

    /// Forward stepper
    pub fn forward(&self) -> &Rkf78<V> {
        &self.forward
    }

    /// Backward stepper, once attached
    pub fn backward(&self) -> Option<&Rkf78<V>> {
        self.backward.as_ref()
    }

    /// Tear down, returning the steppers
    pub fn into_parts(mut self) -> (Rkf78<V>, Option<Rkf78<V>>) {
        self.checkpoints.clear();
        (self.forward, self.backward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Decay;

    impl OdeSystem<[f64; 1]> for Decay {
        fn rhs(&self, _t: f64, y: &[f64; 1], ydot: &mut [f64; 1]) -> Result<(), RhsError> {
            ydot[0] = -y[0];
            Ok(())
        }
    }

    /// yB' = yB, so yB(t) = yB(T) e^(t - T)
    struct DecayAdjoint;

    impl AdjointSystem<[f64; 1]> for DecayAdjoint {
        fn rhs(&self, _t: f64, _y: &[f64; 1], yb: &[f64; 1], ybdot: &mut [f64; 1]) -> Result<(), RhsError> {
            ybdot[0] = yb[0];
            Ok(())
        }
    }

    fn session(steps: u64, kind: InterpolationKind) -> AdjointSession<[f64; 1]> {
        let mut forward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        forward.set_step_limits(1e-14, 0.1);
        forward.init(0.0, &[1.0]).unwrap();
        let config = AdjointConfig {
            steps_per_checkpoint: steps,
            interpolation: kind,
        };
        AdjointSession::new(forward, &config).unwrap()
    }

    // ==================== Configuration ====================

    #[test]
    fn test_config_defaults() {
        let config = AdjointConfig::default();
        assert_eq!(config.steps_per_checkpoint, 100);
        assert_eq!(config.interpolation, InterpolationKind::Hermite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut forward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        forward.init(0.0, &[1.0]).unwrap();
        let config = AdjointConfig {
            steps_per_checkpoint: 0,
            ..AdjointConfig::default()
        };
        let err = AdjointSession::new(forward, &config).unwrap_err();
        assert_eq!(err, AdjointError::Config(ConfigError::ZeroInterval));
        assert_eq!(err.status_code(), -22);
    }

    #[test]
    fn test_uninitialized_forward_rejected() {
        let forward: Rkf78<[f64; 1]> = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        let err = AdjointSession::new(forward, &AdjointConfig::default()).unwrap_err();
        assert!(matches!(err, AdjointError::IllegalInput(_)));
    }

    // ==================== Forward Pass ====================

    #[test]
    fn test_forward_records_checkpoints_and_points() {
        let mut s = session(4, InterpolationKind::Hermite);
        let mut y = [0.0];
        let out = s.integrate_forward(&Decay, 1.0, Task::Normal, &mut y).unwrap();

        assert_eq!(out.status, TaskStatus::Success);
        assert_eq!(out.t, 1.0);
        assert_relative_eq!(y[0], (-1.0f64).exp(), epsilon = 1e-9);

        let nst = s.forward().data().nst;
        assert_eq!(out.checkpoints as u64, nst / 4 + 1);
        assert_eq!(s.num_points() as u64, nst % 4 + 1);
        assert_eq!(s.current_checkpoint(), s.checkpoints().head().map(|ck| ck.id()));
        assert_eq!(s.t_final(), s.forward().t());
    }

    #[test]
    fn test_forward_one_step_mode() {
        let mut s = session(3, InterpolationKind::Hermite);
        let mut y = [0.0];
        for k in 1..=4u64 {
            let out = s.integrate_forward(&Decay, 1.0, Task::OneStep, &mut y).unwrap();
            assert_eq!(s.forward().data().nst, k);
            assert_eq!(out.t, s.forward().t());
        }
        assert_eq!(s.checkpoints().len(), 2);
        assert_eq!(s.num_points(), 2);
    }

    #[test]
    fn test_forward_rejected_after_replay() {
        let mut s = session(3, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 1.0, Task::Normal, &mut y).unwrap();
        s.replay_checkpoint(&Decay, 0).unwrap();
        let err = s.integrate_forward(&Decay, 2.0, Task::Normal, &mut y).unwrap_err();
        assert!(matches!(err, AdjointError::IllegalInput(_)));
    }

    // ==================== Backward Pass ====================

    #[test]
    fn test_backward_before_setup() {
        let mut s = session(3, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 1.0, Task::Normal, &mut y).unwrap();
        let err = s
            .integrate_backward(&Decay, &DecayAdjoint, 0.0, Task::Normal, &mut y)
            .unwrap_err();
        assert_eq!(err, AdjointError::NoBackwardProblem);
        assert_eq!(err.status_code(), -104);
    }

    #[test]
    fn test_bad_tb0_and_tbout() {
        let mut s = session(3, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 1.0, Task::Normal, &mut y).unwrap();

        let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        let err = s.set_backward(backward, 1.5, &[1.0]).unwrap_err();
        assert_eq!(err.status_code(), -103);

        let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        s.set_backward(backward, 1.0, &[1.0]).unwrap();
        let err = s
            .integrate_backward(&Decay, &DecayAdjoint, -0.5, Task::Normal, &mut y)
            .unwrap_err();
        assert_eq!(err.status_code(), -108);
    }

    #[test]
    fn test_backward_solution_matches_closed_form() {
        let mut s = session(5, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 2.0, Task::Normal, &mut y).unwrap();

        let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        s.set_backward(backward, 2.0, &[1.0]).unwrap();
        let mut yb = [0.0];
        let (t, status) = s
            .integrate_backward(&Decay, &DecayAdjoint, 0.5, Task::Normal, &mut yb)
            .unwrap();
        assert_eq!(t, 0.5);
        assert_eq!(status, TaskStatus::Success);
        assert_relative_eq!(yb[0], (-1.5f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn test_reinit_backward_restarts_from_newest_interval() {
        let mut s = session(5, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 2.0, Task::Normal, &mut y).unwrap();
        assert_eq!(s.reinit_backward(2.0, &[1.0]), Err(AdjointError::NoBackwardProblem));

        let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        s.set_backward(backward, 2.0, &[1.0]).unwrap();
        let mut yb = [0.0];
        s.integrate_backward(&Decay, &DecayAdjoint, 1.0, Task::Normal, &mut yb)
            .unwrap();

        s.reinit_backward(2.0, &[2.0]).unwrap();
        let (t, _) = s
            .integrate_backward(&Decay, &DecayAdjoint, 0.5, Task::Normal, &mut yb)
            .unwrap();
        assert_eq!(t, 0.5);
        assert_relative_eq!(yb[0], 2.0 * (-1.5f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn test_eval_with_forward_sees_interpolated_state() {
        let mut s = session(5, InterpolationKind::Polynomial);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 0.3, Task::Normal, &mut y).unwrap();
        let tf = s.t_final();
        let value = s.eval_with_forward(tf, |y| y[0]).unwrap();
        assert_relative_eq!(value, (-tf).exp(), epsilon = 1e-9);
    }

    #[test]
    fn test_set_interpolation_forces_replay() {
        let mut s = session(50, InterpolationKind::Hermite);
        let mut y = [0.0];
        s.integrate_forward(&Decay, 0.5, Task::Normal, &mut y).unwrap();
        assert!(s.current_checkpoint().is_some());

        s.set_interpolation(InterpolationKind::Polynomial).unwrap();
        assert_eq!(s.interpolation(), InterpolationKind::Polynomial);
        assert_eq!(s.current_checkpoint(), None);
        assert!(s.get_y(0.25, &mut y).is_err());

        let backward = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        s.set_backward(backward, 0.5, &[1.0]).unwrap();
        let mut yb = [0.0];
        s.integrate_backward(&Decay, &DecayAdjoint, 0.0, Task::Normal, &mut yb)
            .unwrap();
        assert_eq!(s.stats().restores, 1);
        assert_relative_eq!(yb[0], (-0.5f64).exp(), epsilon = 1e-8);
    }
}
