//! Runge-Kutta-Fehlberg 7(8) stepper with a restartable solution history
//!
//! Each accepted step is taken with the 13-stage embedded RK7(8) pair. After the
//! step the stepper rebuilds a Nordsieck-type history array
//!
//! `zn[j] ≈ h^j / j! * y^(j)(tn)`, `j = 0..=q`
//!
//! from the new value, the new derivative and the `q - 1` most recent step
//! points. The history gives dense output over the last step and carries all
//! the state needed to resume integration from a snapshot ([`StepData`] plus a
//! [`SavedHistory`]) without re-running the initial step selection.
//!
//! Reference: NASA TR R-287, Erwin Fehlberg, 1968

use crate::coefficients::{A, B, B_ERR, C, STAGES};
use crate::nvector::{try_clone_all, AllocError, NVector};
use thiserror::Error;
use tracing::{trace, warn};

/// Largest supported history order
pub const MAX_ORDER: usize = 5;

/// Length of the fixed-size bookkeeping arrays in [`StepData`]
pub const L_MAX: usize = MAX_ORDER + 1;

/// Multiple of the unit roundoff used to accept times just outside a valid range
pub const FUZZ_FACTOR: f64 = 100.0;

/// Unit roundoff
pub const UROUND: f64 = f64::EPSILON;

const ETAMAX_FIRST: f64 = 1.0e4;
const ETAMAX_DEFAULT: f64 = 10.0;
const MAX_ERR_FAILURES: u32 = 7;
const MAX_RHS_FAILURES: u32 = 10;
const RHS_FAILURE_ETA: f64 = 0.25;

/// Failure reported by a right-hand side callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RhsError {
    /// The stepper may retry with a smaller step
    #[error("recoverable right-hand side failure")]
    Recoverable,
    /// Integration must stop
    #[error("unrecoverable right-hand side failure")]
    Unrecoverable,
}

/// System of ordinary differential equations: dy/dt = f(t, y)
pub trait OdeSystem<V: NVector> {
    /// Evaluate the right-hand side of the ODE system
    ///
    /// # Arguments
    /// * `t` - Current time
    /// * `y` - Current state vector
    /// * `ydot` - Output: derivative dy/dt
    fn rhs(&self, t: f64, y: &V, ydot: &mut V) -> Result<(), RhsError>;

    /// Integrand of the quadrature variables, dq/dt = g(t, y).
    ///
    /// Only called once quadratures are enabled with [`Rkf78::quad_init`].
    fn quad_rhs(&self, _t: f64, _y: &V, yq_dot: &mut V) -> Result<(), RhsError> {
        yq_dot.fill(0.0);
        Ok(())
    }
}

/// How far a call to [`Rkf78::solve`] advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Step until `tout` is passed, then interpolate at `tout`
    Normal,
    /// Take exactly one internal step
    OneStep,
}

/// Non-failure outcome of a solve call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Requested output reached
    Success = 0,
    /// Stopped exactly at the stop time
    TstopReturn = 1,
}

impl TaskStatus {
    /// Integer status code (0 or 1)
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Integration statistics for diagnostics
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Right-hand side evaluations
    pub rhs_evals: u64,
    /// Quadrature integrand evaluations
    pub quad_evals: u64,
    /// Number of accepted steps
    pub accepted_steps: u64,
    /// Steps rejected by the error test
    pub rejected_steps: u64,
    /// Recoverable right-hand side failures
    pub rhs_failures: u64,
}

/// Step-size controller using an I-controller
///
/// h_new = safety * h * error^(-1/p)
/// where p = 8 for RKF78
#[derive(Debug, Clone)]
pub struct StepController {
    /// Safety factor (0.8-0.9 typical)
    pub safety: f64,
    /// Maximum growth factor per step
    pub max_factor: f64,
    /// Minimum reduction factor per step
    pub min_factor: f64,
    exponent: f64,
}

impl Default for StepController {
    fn default() -> Self {
        Self {
            safety: 0.9,
            max_factor: 5.0,
            min_factor: 0.2,
            exponent: 1.0 / 8.0,
        }
    }
}

impl StepController {
    /// Compute the step size adjustment factor
    pub fn compute_factor(&self, error: f64) -> f64 {
        if error == 0.0 {
            return self.max_factor;
        }

        let factor = self.safety * error.powf(-self.exponent);
        factor.clamp(self.min_factor, self.max_factor)
    }
}

/// Absolute tolerance, shared or per component
#[derive(Debug, Clone)]
pub enum AbsTol<V> {
    /// Same value for every component
    Scalar(f64),
    /// One value per component
    Vector(V),
}

/// Tolerance specification for error control
///
/// Error is computed as: |err_i| / (atol_i + rtol * |y_i|)
#[derive(Debug, Clone)]
pub struct Tolerances<V> {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: AbsTol<V>,
}

impl<V: NVector> Tolerances<V> {
    /// Create tolerances with uniform values
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self {
            rtol,
            atol: AbsTol::Scalar(atol),
        }
    }

    /// Create tolerances with per-component absolute values
    pub fn with_components(atol: V, rtol: f64) -> Self {
        Self {
            rtol,
            atol: AbsTol::Vector(atol),
        }
    }

    fn atol_at(&self, i: usize) -> f64 {
        match &self.atol {
            AbsTol::Scalar(a) => *a,
            AbsTol::Vector(v) => v.as_slice().get(i).copied().unwrap_or(f64::MIN_POSITIVE),
        }
    }

    /// Max norm of `v` weighted by `1 / (atol + rtol * |y|)`
    #[allow(clippy::needless_range_loop)]
    fn weighted_norm(&self, v: &V, y: &V) -> f64 {
        let vs = v.as_slice();
        let ys = y.as_slice();
        let mut max = 0.0_f64;
        for i in 0..vs.len().min(ys.len()) {
            let w = self.atol_at(i) + self.rtol * ys[i].abs();
            max = max.max(vs[i].abs() / w);
        }
        max
    }

    fn validate(&self, len: usize) -> Result<(), IntegrationError> {
        if !self.rtol.is_finite() || self.rtol < 0.0 {
            return Err(IntegrationError::IllegalInput {
                message: "rtol must be non-negative and finite".to_string(),
            });
        }
        match &self.atol {
            AbsTol::Scalar(a) => {
                if !a.is_finite() || *a <= 0.0 {
                    return Err(IntegrationError::IllegalInput {
                        message: "atol must be positive and finite".to_string(),
                    });
                }
            }
            AbsTol::Vector(v) => {
                if v.len() != len {
                    return Err(IntegrationError::IllegalInput {
                        message: format!("atol has {} components, state has {}", v.len(), len),
                    });
                }
                for (i, a) in v.as_slice().iter().enumerate() {
                    if !a.is_finite() || *a <= 0.0 {
                        return Err(IntegrationError::IllegalInput {
                            message: format!("atol[{}] must be positive and finite", i),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scalar stepper state needed for a hot restart.
///
/// Together with the history slots `0..=q` this fully determines the next
/// step the stepper takes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepData {
    /// Current time
    pub tn: f64,
    /// Accepted steps since (re)initialization
    pub nst: u64,
    /// Current history order
    pub q: usize,
    /// Order used on the last step
    pub qu: usize,
    /// Step size the history is scaled by
    pub h: f64,
    /// Step size to attempt next
    pub hprime: f64,
    /// Last step size actually used
    pub hu: f64,
    /// Largest growth factor allowed on the next step
    pub etamax: f64,
    /// Recent step sizes, newest first
    pub tau: [f64; L_MAX],
}

impl StepData {
    fn initial(t0: f64) -> Self {
        Self {
            tn: t0,
            nst: 0,
            q: 1,
            qu: 1,
            h: 0.0,
            hprime: 0.0,
            hu: 0.0,
            etamax: ETAMAX_FIRST,
            tau: [0.0; L_MAX],
        }
    }
}

/// Copy of the active history slots.
///
/// Holds slots `0..=q`, plus the spare slot `max_order` while `q < max_order`.
/// The spare carries the last extrapolation error.
#[derive(Debug, Clone)]
pub struct SavedHistory<V> {
    active: Vec<V>,
    spare: Option<V>,
}

impl<V: NVector> SavedHistory<V> {
    pub(crate) fn capture(zn: &[V], q: usize, max_order: usize) -> Result<Self, AllocError> {
        let active = try_clone_all(&zn[..=q])?;
        let spare = if q < max_order {
            Some(zn[max_order].try_clone()?)
        } else {
            None
        };
        Ok(Self { active, spare })
    }

    /// History with only the solution slot, used for the root snapshot
    pub(crate) fn leading(y0: &V) -> Result<Self, AllocError> {
        Ok(Self {
            active: try_clone_all(std::slice::from_ref(y0))?,
            spare: None,
        })
    }

    /// Active slots
    pub fn slots(&self) -> &[V] {
        &self.active
    }

    /// Spare slot, if one was kept
    pub fn spare(&self) -> Option<&V> {
        self.spare.as_ref()
    }

    /// Number of vectors owned by this copy
    pub fn owned_vectors(&self) -> usize {
        self.active.len() + usize::from(self.spare.is_some())
    }
}

/// Quadrature variables integrated alongside the state
#[derive(Debug, Clone)]
struct Quadrature<V> {
    tol: Option<Tolerances<V>>,
    zn: Vec<V>,
    k: Vec<V>,
    ynew: V,
    fnew: V,
    acor: V,
    past: Vec<V>,
}

#[derive(Debug, Clone)]
struct Workspace<V> {
    k: Vec<V>,
    ytemp: V,
    ynew: V,
    fnew: V,
    acor: V,
    past: Vec<V>,
    // Start of the last accepted step, for refined output inside it
    yprev: V,
    tprev: Option<f64>,
}

/// Runge-Kutta-Fehlberg 7(8) stepper
///
/// # Example
/// ```rust
/// use rkf78_adjoint::{IntegrationError, OdeSystem, RhsError, Rkf78, Task, Tolerances};
///
/// struct Decay;
///
/// impl OdeSystem<[f64; 1]> for Decay {
///     fn rhs(&self, _t: f64, y: &[f64; 1], ydot: &mut [f64; 1]) -> Result<(), RhsError> {
///         ydot[0] = -y[0];
///         Ok(())
///     }
/// }
///
/// # fn main() -> Result<(), IntegrationError> {
/// let mut solver = Rkf78::new(Tolerances::new(1e-10, 1e-10));
/// solver.init(0.0, &[1.0])?;
/// let mut y = [0.0];
/// let (t, _) = solver.solve(&Decay, 1.0, Task::Normal, &mut y)?;
/// assert_eq!(t, 1.0);
/// assert!((y[0] - (-1.0f64).exp()).abs() < 1e-9);
///
/// // Dense output inside the last step
/// let mut dy = [0.0];
/// solver.get_dky(1.0, 1, &mut dy)?;
/// assert!((dy[0] + y[0]).abs() < 1e-6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Rkf78<V: NVector> {
    tol: Tolerances<V>,
    controller: StepController,
    /// Minimum step size
    pub h_min: f64,
    /// Maximum step size
    pub h_max: f64,
    /// Maximum number of internal steps per call to [`Rkf78::solve`]
    pub max_steps: u64,
    max_order: usize,
    h_init: Option<f64>,
    tstop: Option<f64>,
    data: StepData,
    h0u: f64,
    force_setup: bool,
    zn: Vec<V>,
    quad: Option<Quadrature<V>>,
    work: Option<Workspace<V>>,
    /// Integration statistics
    pub stats: Stats,
}

impl<V: NVector> Rkf78<V> {
    /// Create a new stepper with specified tolerances.
    ///
    /// The stepper must be given an initial condition with [`Rkf78::init`].
    pub fn new(tol: Tolerances<V>) -> Self {
        Self {
            tol,
            controller: StepController::default(),
            h_min: 1e-14,
            h_max: f64::INFINITY,
            max_steps: 500,
            max_order: MAX_ORDER,
            h_init: None,
            tstop: None,
            data: StepData::initial(0.0),
            h0u: 0.0,
            force_setup: false,
            zn: Vec::new(),
            quad: None,
            work: None,
            stats: Stats::default(),
        }
    }

    /// Set minimum and maximum step sizes
    pub fn set_step_limits(&mut self, h_min: f64, h_max: f64) {
        self.h_min = h_min;
        self.h_max = h_max;
    }

    /// Limit the history order. Only allowed before [`Rkf78::init`].
    pub fn set_max_order(&mut self, max_order: usize) -> Result<(), IntegrationError> {
        if self.work.is_some() {
            return Err(IntegrationError::IllegalInput {
                message: "max order must be set before init".to_string(),
            });
        }
        if !(1..=MAX_ORDER).contains(&max_order) {
            return Err(IntegrationError::IllegalInput {
                message: format!("max order {} outside 1..={}", max_order, MAX_ORDER),
            });
        }
        self.max_order = max_order;
        Ok(())
    }

    /// Use `h0` as the first step instead of estimating one
    pub fn set_init_step(&mut self, h0: f64) {
        self.h_init = if h0 == 0.0 { None } else { Some(h0) };
    }

    /// Never step past `tstop`; steps landing on it stop there exactly
    pub fn set_stop_time(&mut self, tstop: f64) {
        self.tstop = Some(tstop);
    }

    /// Remove the stop time
    pub fn clear_stop_time(&mut self) {
        self.tstop = None;
    }

    /// Current stop time
    pub fn stop_time(&self) -> Option<f64> {
        self.tstop
    }

    /// Allocate the history and workspace and set the initial condition
    pub fn init(&mut self, t0: f64, y0: &V) -> Result<(), IntegrationError> {
        if !t0.is_finite() {
            return Err(IntegrationError::IllegalInput {
                message: "t0 must be finite".to_string(),
            });
        }
        if !y0.is_finite() {
            return Err(IntegrationError::IllegalInput {
                message: "y0 contains non-finite values".to_string(),
            });
        }
        self.tol.validate(y0.len())?;

        let zn = repeat_clone(y0, self.max_order + 1)?;
        let work = Workspace {
            k: repeat_clone(y0, STAGES)?,
            ytemp: y0.try_clone()?,
            ynew: y0.try_clone()?,
            fnew: y0.try_clone()?,
            acor: y0.try_clone()?,
            past: repeat_clone(y0, self.max_order + 1)?,
            yprev: y0.try_clone()?,
            tprev: None,
        };
        self.zn = zn;
        self.work = Some(work);
        self.reinit(t0, y0)
    }

    /// Restart from a new initial condition, reusing allocated storage.
    ///
    /// The next step selects its size again, honoring [`Rkf78::set_init_step`].
    pub fn reinit(&mut self, t0: f64, y0: &V) -> Result<(), IntegrationError> {
        if self.work.is_none() {
            return Err(IntegrationError::NotInitialized);
        }
        if y0.len() != self.zn[0].len() {
            return Err(IntegrationError::IllegalInput {
                message: "y0 length differs from the initialized state".to_string(),
            });
        }
        self.data = StepData::initial(t0);
        if let Some(work) = self.work.as_mut() {
            work.tprev = None;
        }
        self.zn[0].copy_from(y0);
        for slot in self.zn.iter_mut().skip(1) {
            slot.fill(0.0);
        }
        if let Some(quad) = self.quad.as_mut() {
            for slot in quad.zn.iter_mut().skip(1) {
                slot.fill(0.0);
            }
        }
        self.force_setup = false;
        Ok(())
    }

    /// Enable quadrature variables with initial value `yq0`.
    ///
    /// With `tol` set, quadrature errors take part in step acceptance.
    pub fn quad_init(&mut self, yq0: &V, tol: Option<Tolerances<V>>) -> Result<(), IntegrationError> {
        if self.work.is_none() {
            return Err(IntegrationError::NotInitialized);
        }
        if let Some(t) = &tol {
            t.validate(yq0.len())?;
        }
        let mut zn = repeat_clone(yq0, self.max_order + 1)?;
        for slot in zn.iter_mut().skip(1) {
            slot.fill(0.0);
        }
        self.quad = Some(Quadrature {
            tol,
            zn,
            k: repeat_clone(yq0, STAGES)?,
            ynew: yq0.try_clone()?,
            fnew: yq0.try_clone()?,
            acor: yq0.try_clone()?,
            past: repeat_clone(yq0, self.max_order + 1)?,
        });
        Ok(())
    }

    /// Reset the quadrature variables to `yq0`
    pub fn quad_reinit(&mut self, yq0: &V) -> Result<(), IntegrationError> {
        let quad = self
            .quad
            .as_mut()
            .ok_or(IntegrationError::QuadratureNotInitialized)?;
        quad.zn[0].copy_from(yq0);
        for slot in quad.zn.iter_mut().skip(1) {
            slot.fill(0.0);
        }
        Ok(())
    }

    /// Overwrite the live state with a snapshot and force a fresh derivative
    /// evaluation on the next step.
    pub fn load_state(
        &mut self,
        data: &StepData,
        zn: &SavedHistory<V>,
        znq: Option<&SavedHistory<V>>,
    ) -> Result<(), IntegrationError> {
        if self.work.is_none() {
            return Err(IntegrationError::NotInitialized);
        }
        if data.q > self.max_order || zn.active.len() != data.q + 1 {
            return Err(IntegrationError::IllegalInput {
                message: format!(
                    "snapshot of order {} with {} slots does not fit max order {}",
                    data.q,
                    zn.active.len(),
                    self.max_order
                ),
            });
        }
        copy_saved(&mut self.zn, zn, self.max_order);
        match (znq, self.quad.as_mut()) {
            (Some(saved), Some(quad)) => copy_saved(&mut quad.zn, saved, self.max_order),
            (Some(_), None) => return Err(IntegrationError::QuadratureNotInitialized),
            (None, _) => {}
        }
        self.data = *data;
        self.force_setup = true;
        if let Some(work) = self.work.as_mut() {
            work.tprev = None;
        }
        Ok(())
    }

    /// Recompute the derivative at the current point on the next step
    /// instead of reusing the history.
    pub fn request_setup(&mut self) {
        self.force_setup = true;
    }

    /// Scalar state
    pub fn data(&self) -> &StepData {
        &self.data
    }

    /// Current time
    pub fn t(&self) -> f64 {
        self.data.tn
    }

    /// Current solution, `zn[0]`
    pub fn y(&self) -> Option<&V> {
        self.zn.first()
    }

    /// Live history slots `0..=max_order`
    pub fn history(&self) -> &[V] {
        &self.zn
    }

    /// Live quadrature history, if quadratures are enabled
    pub fn quad_history(&self) -> Option<&[V]> {
        self.quad.as_ref().map(|q| q.zn.as_slice())
    }

    /// True once [`Rkf78::quad_init`] succeeded
    pub fn has_quadratures(&self) -> bool {
        self.quad.is_some()
    }

    /// Largest order the history may reach
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Size of the first step attempted after the last (re)initialization
    pub fn initial_step(&self) -> f64 {
        self.h0u
    }

    /// True once [`Rkf78::init`] succeeded
    pub fn is_initialized(&self) -> bool {
        self.work.is_some()
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Snapshot of the active history slots
    pub fn save_history(&self) -> Result<SavedHistory<V>, AllocError> {
        SavedHistory::capture(&self.zn, self.data.q, self.max_order)
    }

    /// Snapshot of the active quadrature history slots
    pub fn save_quad_history(&self) -> Result<Option<SavedHistory<V>>, AllocError> {
        self.quad
            .as_ref()
            .map(|quad| SavedHistory::capture(&quad.zn, self.data.q, self.max_order))
            .transpose()
    }

    /// Advance toward `tout`.
    ///
    /// Returns the time reached and whether the stop time was hit. In
    /// [`Task::Normal`] mode `yout` is interpolated at `tout`; otherwise it is
    /// the solution at the returned time.
    pub fn solve<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        tout: f64,
        task: Task,
        yout: &mut V,
    ) -> Result<(f64, TaskStatus), IntegrationError> {
        let mut work = self.work.take().ok_or(IntegrationError::NotInitialized)?;
        let result = self.solve_with(sys, tout, task, yout, &mut work);
        self.work = Some(work);
        result
    }

    fn solve_with<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        tout: f64,
        task: Task,
        yout: &mut V,
        work: &mut Workspace<V>,
    ) -> Result<(f64, TaskStatus), IntegrationError> {
        if !tout.is_finite() {
            return Err(IntegrationError::IllegalInput {
                message: "tout must be finite".to_string(),
            });
        }
        if self.data.h == 0.0 {
            self.start(sys, tout, work)?;
        }

        if let Some(tstop) = self.tstop {
            if (tstop - self.data.tn) * self.data.h < 0.0 {
                return Err(IntegrationError::IllegalInput {
                    message: format!("stop time {} is behind t = {}", tstop, self.data.tn),
                });
            }
        }

        if self.data.nst > 0 {
            if task == Task::Normal && (self.data.tn - tout) * self.data.h >= 0.0 {
                self.check_dense_time(tout)?;
                self.refined_output(sys, tout, yout, work)?;
                return Ok((tout, TaskStatus::Success));
            }
            if self.at_stop_time() {
                yout.copy_from(&self.zn[0]);
                return Ok((self.data.tn, TaskStatus::TstopReturn));
            }
        }

        // Normal mode lands on tout instead of interpolating past it
        let barrier = match (task, self.tstop) {
            (Task::Normal, Some(tstop)) if (tstop - tout) * self.data.h < 0.0 => Some(tstop),
            (Task::Normal, _) => Some(tout),
            (Task::OneStep, tstop) => tstop,
        };

        let mut nstloc = 0u64;
        loop {
            if nstloc >= self.max_steps {
                warn!(t = self.data.tn, steps = nstloc, "too much work before tout");
                return Err(IntegrationError::TooMuchWork {
                    t: self.data.tn,
                    steps: nstloc,
                });
            }

            self.step_once(sys, barrier, work)?;
            nstloc += 1;

            if task == Task::Normal && (self.data.tn - tout) * self.data.h >= 0.0 {
                self.check_dense_time(tout)?;
                self.refined_output(sys, tout, yout, work)?;
                return Ok((tout, TaskStatus::Success));
            }
            if self.at_stop_time() {
                yout.copy_from(&self.zn[0]);
                return Ok((self.data.tn, TaskStatus::TstopReturn));
            }
            if task == Task::OneStep {
                yout.copy_from(&self.zn[0]);
                return Ok((self.data.tn, TaskStatus::Success));
            }
        }
    }

    fn at_stop_time(&self) -> bool {
        match self.tstop {
            Some(tstop) => {
                let troundoff = FUZZ_FACTOR * UROUND * (self.data.tn.abs() + self.data.h.abs());
                (self.data.tn - tstop).abs() <= troundoff
            }
            None => false,
        }
    }

    /// Choose the first step and fill the derivative slot
    fn start<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        tout: f64,
        work: &mut Workspace<V>,
    ) -> Result<(), IntegrationError> {
        let t0 = self.data.tn;
        let tdist = tout - t0;
        if tdist == 0.0 {
            return Err(IntegrationError::IllegalInput {
                message: "tout equals the initial time".to_string(),
            });
        }

        self.eval_rhs(sys, t0, 0, work)?;

        let mut h = match self.h_init {
            Some(h0) => {
                if h0 * tdist < 0.0 {
                    return Err(IntegrationError::IllegalInput {
                        message: "initial step sign does not match direction to tout".to_string(),
                    });
                }
                h0
            }
            None => {
                let d0 = self.tol.weighted_norm(&self.zn[0], &self.zn[0]);
                let d1 = self.tol.weighted_norm(&work.k[0], &self.zn[0]);
                let guess = if d0 < 1e-5 || d1 < 1e-5 {
                    1e-6
                } else {
                    0.01 * d0 / d1
                };
                let mut guess = guess.min(tdist.abs()).min(self.h_max).max(self.h_min) * tdist.signum();
                if let Some(tstop) = self.tstop {
                    if tstop != t0 && (t0 + guess - tstop) * guess > 0.0 {
                        guess = tstop - t0;
                    }
                }

                // The history starts at first order: keep h²/2 |y''| within tolerance
                work.ytemp.copy_from(&self.zn[0]);
                work.ytemp.axpy(guess, &work.k[0]);
                self.stats.rhs_evals += 1;
                let d2 = match sys.rhs(t0 + guess, &work.ytemp, &mut work.k[1]) {
                    Ok(()) => {
                        work.ytemp.copy_from(&work.k[1]);
                        work.ytemp.scale_add(1.0, -1.0, &work.k[0]);
                        self.tol.weighted_norm(&work.ytemp, &self.zn[0]) / guess.abs()
                    }
                    // The first step attempt will shrink on its own
                    Err(RhsError::Recoverable) => 0.0,
                    Err(e) => return Err(rhs_failure(e, t0 + guess)),
                };
                let h_first = if d2 > 0.0 { (2.0 / d2).sqrt() } else { guess.abs() };
                h_first.min(guess.abs()).max(self.h_min) * tdist.signum()
            }
        };
        if h.abs() > self.h_max {
            h = self.h_max * h.signum();
        }
        if let Some(tstop) = self.tstop {
            if tstop == t0 {
                return Err(IntegrationError::IllegalInput {
                    message: "stop time equals the initial time".to_string(),
                });
            }
            if (t0 + h - tstop) * h > 0.0 {
                h = tstop - t0;
            }
        }

        self.data.h = h;
        self.data.hprime = h;
        self.h0u = h;
        self.zn[1].scale(h, &work.k[0]);
        if let Some(quad) = self.quad.as_mut() {
            quad.zn[1].scale(h, &quad.k[0]);
        }
        trace!(t0, h, "initial step selected");
        Ok(())
    }

    /// Evaluate f (and g) at `(t, zn[0])` into stage `slot`
    fn eval_rhs<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        t: f64,
        slot: usize,
        work: &mut Workspace<V>,
    ) -> Result<(), IntegrationError> {
        self.stats.rhs_evals += 1;
        sys.rhs(t, &self.zn[0], &mut work.k[slot])
            .map_err(|e| rhs_failure(e, t))?;
        if let Some(quad) = self.quad.as_mut() {
            self.stats.quad_evals += 1;
            sys.quad_rhs(t, &self.zn[0], &mut quad.k[slot])
                .map_err(|e| rhs_failure(e, t))?;
        }
        Ok(())
    }

    /// Scale the history to a new step size
    fn rescale_to(&mut self, h_new: f64) -> Result<(), IntegrationError> {
        if h_new.abs() < self.h_min {
            warn!(t = self.data.tn, h = h_new, "step size below minimum");
            return Err(IntegrationError::StepSizeTooSmall {
                t: self.data.tn,
                h: h_new,
            });
        }
        let eta = h_new / self.data.h;
        let mut factor = 1.0;
        for j in 1..=self.data.q {
            factor *= eta;
            self.zn[j].scale_in_place(factor);
        }
        if let Some(quad) = self.quad.as_mut() {
            let mut factor = 1.0;
            for j in 1..=self.data.q {
                factor *= eta;
                quad.zn[j].scale_in_place(factor);
            }
        }
        self.data.h = h_new;
        self.data.hprime = h_new;
        Ok(())
    }

    /// Take one accepted step, never passing `barrier`
    fn step_once<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        barrier: Option<f64>,
        work: &mut Workspace<V>,
    ) -> Result<(), IntegrationError> {
        if self.data.nst > 0 && self.data.hprime != self.data.h {
            self.rescale_to(self.data.hprime)?;
        }

        let tn = self.data.tn;
        if self.data.nst == 0 || self.force_setup {
            self.eval_rhs(sys, tn, 0, work)?;
            self.force_setup = false;
        } else {
            let inv_h = 1.0 / self.data.h;
            work.k[0].scale(inv_h, &self.zn[1]);
            if let Some(quad) = self.quad.as_mut() {
                quad.k[0].scale(inv_h, &quad.zn[1]);
            }
        }

        let mut nef = 0u32;
        let mut ncf = 0u32;
        loop {
            let mut t_new = tn + self.data.h;
            if let Some(tb) = barrier {
                let h = self.data.h;
                if (tn + h - tb) * h > 0.0 {
                    self.rescale_to(tb - tn)?;
                }
                let h = self.data.h;
                if (tn + h - tb).abs() <= FUZZ_FACTOR * UROUND * (tn.abs() + h.abs()) {
                    t_new = tb;
                } else {
                    t_new = tn + h;
                }
            }
            let h = self.data.h;

            let outcome = self
                .compute_stages(sys, tn, h, work)
                .map(|()| self.compute_solution(h, work))
                .and_then(|err| {
                    if err <= 1.0 {
                        self.eval_new_derivative(sys, t_new, work)?;
                    }
                    Ok(err)
                });

            match outcome {
                Ok(err) if err <= 1.0 => {
                    work.yprev.copy_from(&self.zn[0]);
                    work.tprev = Some(tn);
                    self.complete_step(t_new, h, err, nef > 0, work);
                    return Ok(());
                }
                Ok(err) => {
                    nef += 1;
                    self.stats.rejected_steps += 1;
                    if nef >= MAX_ERR_FAILURES {
                        warn!(t = tn, h, failures = nef, "error test failed repeatedly");
                        return Err(IntegrationError::ErrorTestFailures { t: tn, failures: nef });
                    }
                    let factor = self.controller.compute_factor(err).min(1.0);
                    self.rescale_to(h * factor)?;
                }
                Err(RhsError::Recoverable) => {
                    ncf += 1;
                    self.stats.rhs_failures += 1;
                    if ncf >= MAX_RHS_FAILURES {
                        warn!(t = tn, h, failures = ncf, "right-hand side failed repeatedly");
                        return Err(IntegrationError::RepeatedRhsFailure { t: tn, failures: ncf });
                    }
                    self.rescale_to(h * RHS_FAILURE_ETA)?;
                }
                Err(RhsError::Unrecoverable) => {
                    warn!(t = tn, "right-hand side failed unrecoverably");
                    return Err(IntegrationError::UnrecoverableRhs { t: tn });
                }
            }
        }
    }

    /// Compute stages 1..13 from the stage-0 derivative already in `work.k[0]`
    fn compute_stages<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        t: f64,
        h: f64,
        work: &mut Workspace<V>,
    ) -> Result<(), RhsError> {
        for i in 1..STAGES {
            work.ytemp.copy_from(&self.zn[0]);
            for j in 0..i {
                if A[i][j] != 0.0 {
                    work.ytemp.axpy(h * A[i][j], &work.k[j]);
                }
            }
            let ti = t + C[i] * h;
            self.stats.rhs_evals += 1;
            sys.rhs(ti, &work.ytemp, &mut work.k[i])?;
            if let Some(quad) = self.quad.as_mut() {
                self.stats.quad_evals += 1;
                sys.quad_rhs(ti, &work.ytemp, &mut quad.k[i])?;
            }
        }
        Ok(())
    }

    /// Form the 8th-order solution and return the normalized error
    fn compute_solution(&mut self, h: f64, work: &mut Workspace<V>) -> f64 {
        work.ynew.copy_from(&self.zn[0]);
        for i in 0..STAGES {
            if B[i] != 0.0 {
                work.ynew.axpy(h * B[i], &work.k[i]);
            }
        }
        if !work.ynew.is_finite() {
            return f64::INFINITY;
        }
        if let Some(quad) = self.quad.as_mut() {
            quad.ynew.copy_from(&quad.zn[0]);
            for i in 0..STAGES {
                if B[i] != 0.0 {
                    quad.ynew.axpy(h * B[i], &quad.k[i]);
                }
            }
        }
        self.error_estimate(h, work)
    }

    fn error_estimate(&self, h: f64, work: &Workspace<V>) -> f64 {
        let mut err = stage_error(&self.tol, &work.k, h, &work.ynew);
        if let Some(quad) = &self.quad {
            if let Some(tol) = &quad.tol {
                err = err.max(stage_error(tol, &quad.k, h, &quad.ynew));
            }
        }
        err
    }

    fn eval_new_derivative<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        t_new: f64,
        work: &mut Workspace<V>,
    ) -> Result<(), RhsError> {
        self.stats.rhs_evals += 1;
        sys.rhs(t_new, &work.ynew, &mut work.fnew)?;
        if let Some(quad) = self.quad.as_mut() {
            self.stats.quad_evals += 1;
            sys.quad_rhs(t_new, &work.ynew, &mut quad.fnew)?;
        }
        Ok(())
    }

    /// Commit an accepted step: update bookkeeping, pick the new order and
    /// rebuild the history around `t_new`.
    fn complete_step(&mut self, t_new: f64, h: f64, err: f64, had_failures: bool, work: &mut Workspace<V>) {
        let q_old = self.data.q;
        let max_order = self.max_order;

        // Extrapolation error of the old history at the new point
        extrapolate(&self.zn, q_old, 1.0, &mut work.acor);
        work.acor.scale_add(-1.0, 1.0, &work.ynew);

        for i in (1..L_MAX).rev() {
            self.data.tau[i] = self.data.tau[i - 1];
        }
        self.data.tau[0] = h;
        self.data.nst += 1;
        self.data.qu = q_old;
        self.data.hu = h;

        // Every stored value is accurate to the step tolerance, so the order
        // climbs by one per step until the history is full
        let q_new = (q_old + 1).min(max_order);

        let nodes = history_nodes(&self.data.tau, h, q_new);
        rebuild_history(
            &mut self.zn,
            &mut work.past,
            &nodes,
            q_old,
            q_new,
            &work.ynew,
            &work.fnew,
            h,
        );
        if q_new < max_order {
            self.zn[max_order].copy_from(&work.acor);
        }

        if let Some(quad) = self.quad.as_mut() {
            extrapolate(&quad.zn, q_old, 1.0, &mut quad.acor);
            quad.acor.scale_add(-1.0, 1.0, &quad.ynew);
            rebuild_history(
                &mut quad.zn,
                &mut quad.past,
                &nodes,
                q_old,
                q_new,
                &quad.ynew,
                &quad.fnew,
                h,
            );
            if q_new < max_order {
                quad.zn[max_order].copy_from(&quad.acor);
            }
        }

        self.data.q = q_new;
        self.data.tn = t_new;

        let factor = self.controller.compute_factor(err).min(self.data.etamax);
        let mut h_next = (h.abs() * factor).clamp(self.h_min, self.h_max);
        if !h_next.is_finite() {
            h_next = h.abs();
        }
        self.data.hprime = h_next * h.signum();
        self.data.etamax = if had_failures { 1.0 } else { ETAMAX_DEFAULT };

        self.stats.accepted_steps += 1;
        trace!(t = t_new, h, q = q_new, err, "step accepted");
    }

    /// Interpolate the k-th derivative of the solution at `t`.
    ///
    /// `t` must lie within the last step `[tn - hu, tn]`, widened by a few
    /// units of roundoff.
    pub fn get_dky(&self, t: f64, k: usize, dky: &mut V) -> Result<(), IntegrationError> {
        if self.zn.is_empty() {
            return Err(IntegrationError::NotInitialized);
        }
        if k > self.data.q {
            return Err(IntegrationError::BadK { k, q: self.data.q });
        }
        self.check_dense_time(t)?;
        evaluate_history(&self.zn, self.data.q, self.data.tn, self.data.h, t, k, dky);
        Ok(())
    }

    /// Solution at `t` inside the last step, to the accuracy of the step.
    ///
    /// Repeats the last step from its start with the length shortened to end
    /// at `t`. Unlike [`Rkf78::get_dky`] this costs right-hand side
    /// evaluations, but the stepper state is left untouched, so later steps
    /// are the same as without the call.
    pub fn solution_at<S: OdeSystem<V>>(&mut self, sys: &S, t: f64, y: &mut V) -> Result<(), IntegrationError> {
        let mut work = self.work.take().ok_or(IntegrationError::NotInitialized)?;
        let result = self
            .check_dense_time(t)
            .and_then(|()| self.refined_output(sys, t, y, &mut work));
        self.work = Some(work);
        result
    }

    fn refined_output<S: OdeSystem<V>>(
        &mut self,
        sys: &S,
        t: f64,
        y: &mut V,
        work: &mut Workspace<V>,
    ) -> Result<(), IntegrationError> {
        let tp = match work.tprev {
            Some(tp) if t != self.data.tn => tp,
            _ => return self.get_dky(t, 0, y),
        };
        let h = t - tp;
        if h == 0.0 {
            y.copy_from(&work.yprev);
            return Ok(());
        }
        self.stats.rhs_evals += 1;
        sys.rhs(tp, &work.yprev, &mut work.k[0])
            .map_err(|e| rhs_failure(e, tp))?;
        for i in 1..STAGES {
            work.ytemp.copy_from(&work.yprev);
            for j in 0..i {
                if A[i][j] != 0.0 {
                    work.ytemp.axpy(h * A[i][j], &work.k[j]);
                }
            }
            let ti = tp + C[i] * h;
            self.stats.rhs_evals += 1;
            sys.rhs(ti, &work.ytemp, &mut work.k[i])
                .map_err(|e| rhs_failure(e, ti))?;
        }
        y.copy_from(&work.yprev);
        for i in 0..STAGES {
            if B[i] != 0.0 {
                y.axpy(h * B[i], &work.k[i]);
            }
        }
        Ok(())
    }

    /// Interpolate the quadrature variables at `t` (same time window as
    /// [`Rkf78::get_dky`])
    pub fn get_quad(&self, t: f64, yq: &mut V) -> Result<(), IntegrationError> {
        let quad = self
            .quad
            .as_ref()
            .ok_or(IntegrationError::QuadratureNotInitialized)?;
        self.check_dense_time(t)?;
        evaluate_history(&quad.zn, self.data.q, self.data.tn, self.data.h, t, 0, yq);
        Ok(())
    }

    fn check_dense_time(&self, t: f64) -> Result<(), IntegrationError> {
        let tn = self.data.tn;
        let hu = self.data.hu;
        let mut tfuzz = FUZZ_FACTOR * UROUND * (tn.abs() + hu.abs());
        if hu < 0.0 {
            tfuzz = -tfuzz;
        }
        let tp = tn - hu - tfuzz;
        let tn1 = tn + tfuzz;
        if (t - tp) * (t - tn1) > 0.0 {
            return Err(IntegrationError::BadTime {
                t,
                lo: tp.min(tn1),
                hi: tp.max(tn1),
            });
        }
        Ok(())
    }
}

fn rhs_failure(e: RhsError, t: f64) -> IntegrationError {
    match e {
        RhsError::Recoverable => IntegrationError::RepeatedRhsFailure { t, failures: 1 },
        RhsError::Unrecoverable => IntegrationError::UnrecoverableRhs { t },
    }
}

fn repeat_clone<V: NVector>(v: &V, n: usize) -> Result<Vec<V>, AllocError> {
    let mut out = Vec::new();
    out.try_reserve_exact(n).map_err(|_| AllocError { len: v.len() })?;
    for _ in 0..n {
        out.push(v.try_clone()?);
    }
    Ok(out)
}

fn copy_saved<V: NVector>(zn: &mut [V], saved: &SavedHistory<V>, max_order: usize) {
    for (dst, src) in zn.iter_mut().zip(saved.active.iter()) {
        dst.copy_from(src);
    }
    if let Some(spare) = &saved.spare {
        zn[max_order].copy_from(spare);
    }
}

/// Normalized error `|h * sum(B_ERR[i] * k[i])| / (atol + rtol * |y|)`, max over components
#[allow(clippy::needless_range_loop)]
fn stage_error<V: NVector>(tol: &Tolerances<V>, k: &[V], h: f64, y: &V) -> f64 {
    let ys = y.as_slice();
    let mut max_err: f64 = 0.0;
    for n in 0..ys.len() {
        let mut err_n = 0.0;
        for i in 0..STAGES {
            if B_ERR[i] != 0.0 {
                err_n += B_ERR[i] * k[i].as_slice()[n];
            }
        }
        let scale = tol.atol_at(n) + tol.rtol * ys[n].abs();
        max_err = max_err.max((h * err_n).abs() / scale);
    }
    max_err
}

/// `out = sum_j zn[j] * s^j` for `j = 0..=q`
fn extrapolate<V: NVector>(zn: &[V], q: usize, s: f64, out: &mut V) {
    out.copy_from(&zn[q]);
    for j in (0..q).rev() {
        out.scale_add(s, 1.0, &zn[j]);
    }
}

/// Interpolation nodes in units of `h` relative to the new point: the new
/// point twice (value and derivative), then past points newest first.
fn history_nodes(tau: &[f64; L_MAX], h: f64, q: usize) -> [f64; L_MAX] {
    let mut nodes = [0.0; L_MAX];
    let mut elapsed = 0.0;
    for k in 1..q {
        elapsed += tau[k - 1];
        nodes[k + 1] = -elapsed / h;
    }
    nodes
}

/// Replace `zn[0..=q_new]` by the monomial coefficients of the polynomial
/// through `y_new`, `h * f_new` and the old history at the past nodes.
#[allow(clippy::too_many_arguments)]
fn rebuild_history<V: NVector>(
    zn: &mut [V],
    past: &mut [V],
    nodes: &[f64; L_MAX],
    q_old: usize,
    q_new: usize,
    y_new: &V,
    f_new: &V,
    h: f64,
) {
    // Past values from the old history, s measured from the old tn
    for k in 1..q_new {
        let s = 1.0 + nodes[k + 1];
        extrapolate(zn, q_old, s, &mut past[k + 1]);
    }

    zn[0].copy_from(y_new);
    zn[1].copy_from(y_new);
    for k in 1..q_new {
        zn[k + 1].copy_from(&past[k + 1]);
    }

    // Divided differences, node 0 doubled
    for level in 1..=q_new {
        for i in (level..=q_new).rev() {
            if level == 1 && i == 1 {
                zn[1].scale(h, f_new);
            } else {
                let c = 1.0 / (nodes[i] - nodes[i - level]);
                let (lo, hi) = zn.split_at_mut(i);
                hi[0].scale_add(c, -c, &lo[i - 1]);
            }
        }
    }

    // Newton form to monomial coefficients
    for i in (0..q_new).rev() {
        for j in i..q_new {
            let (lo, hi) = zn.split_at_mut(j + 1);
            lo[j].axpy(-nodes[i], &hi[0]);
        }
    }
}

/// k-th derivative of the history polynomial at `t`
fn evaluate_history<V: NVector>(zn: &[V], q: usize, tn: f64, h: f64, t: f64, k: usize, out: &mut V) {
    let s = if h == 0.0 { 0.0 } else { (t - tn) / h };
    let falling = |j: usize| -> f64 { ((j - k + 1)..=j).map(|m| m as f64).product() };
    out.scale(falling(q), &zn[q]);
    for j in (k..q).rev() {
        out.scale_add(s, falling(j), &zn[j]);
    }
    if k > 0 && h != 0.0 {
        out.scale_in_place(h.powi(-(k as i32)));
    }
}

/// Errors that can occur during integration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    /// Stepper used before [`Rkf78::init`]
    #[error("stepper has not been initialized")]
    NotInitialized,
    /// Quadrature operation without [`Rkf78::quad_init`]
    #[error("quadratures have not been initialized")]
    QuadratureNotInitialized,
    /// Invalid input parameters
    #[error("illegal input: {message}")]
    IllegalInput {
        /// Description of the invalid input
        message: String,
    },
    /// Too many internal steps in one call
    #[error("{steps} steps taken before reaching tout (t = {t})")]
    TooMuchWork {
        /// Time reached
        t: f64,
        /// Steps taken in this call
        steps: u64,
    },
    /// Step size became too small
    #[error("step size {h} too small at t = {t}")]
    StepSizeTooSmall {
        /// Time at which step size became too small
        t: f64,
        /// Step size that was too small
        h: f64,
    },
    /// The error test failed too often on one step
    #[error("error test failed {failures} times at t = {t}")]
    ErrorTestFailures {
        /// Time of the failing step
        t: f64,
        /// Failures on that step
        failures: u32,
    },
    /// The right-hand side kept reporting recoverable failures
    #[error("right-hand side failed {failures} times at t = {t}")]
    RepeatedRhsFailure {
        /// Time of the failing step
        t: f64,
        /// Failures on that step
        failures: u32,
    },
    /// The right-hand side reported an unrecoverable failure
    #[error("right-hand side failed unrecoverably at t = {t}")]
    UnrecoverableRhs {
        /// Time of the failing step
        t: f64,
    },
    /// Vector allocation failed
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Dense output requested outside the last step
    #[error("t = {t} outside the interpolation interval [{lo}, {hi}]")]
    BadTime {
        /// Requested time
        t: f64,
        /// Lower end of the valid interval
        lo: f64,
        /// Upper end of the valid interval
        hi: f64,
    },
    /// Derivative order above the history order
    #[error("derivative order {k} exceeds history order {q}")]
    BadK {
        /// Requested derivative order
        k: usize,
        /// Current history order
        q: usize,
    },
}

impl IntegrationError {
    /// Negative integer status code
    pub fn status_code(&self) -> i32 {
        match self {
            IntegrationError::TooMuchWork { .. } => -1,
            IntegrationError::StepSizeTooSmall { .. } => -2,
            IntegrationError::ErrorTestFailures { .. } => -3,
            IntegrationError::RepeatedRhsFailure { .. } => -10,
            IntegrationError::UnrecoverableRhs { .. } => -11,
            IntegrationError::Alloc(_) => -20,
            IntegrationError::IllegalInput { .. } => -22,
            IntegrationError::NotInitialized => -23,
            IntegrationError::BadK { .. } => -24,
            IntegrationError::BadTime { .. } => -25,
            IntegrationError::QuadratureNotInitialized => -30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Harmonic oscillator: y'' + ω²y = 0
    /// State: [y, y']
    struct HarmonicOscillator {
        omega: f64,
    }

    impl OdeSystem<[f64; 2]> for HarmonicOscillator {
        fn rhs(&self, _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), RhsError> {
            dydt[0] = y[1];
            dydt[1] = -self.omega * self.omega * y[0];
            Ok(())
        }
    }

    /// y' = -y, with the integral of y as a quadrature
    struct Decay;

    impl OdeSystem<Vec<f64>> for Decay {
        fn rhs(&self, _t: f64, y: &Vec<f64>, ydot: &mut Vec<f64>) -> Result<(), RhsError> {
            ydot[0] = -y[0];
            Ok(())
        }

        fn quad_rhs(&self, _t: f64, y: &Vec<f64>, yq_dot: &mut Vec<f64>) -> Result<(), RhsError> {
            yq_dot[0] = y[0];
            Ok(())
        }
    }

    fn decay_solver() -> Rkf78<Vec<f64>> {
        let mut solver = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        solver.init(0.0, &vec![1.0]).unwrap();
        solver
    }

    // ==================== Basic Integration ====================

    #[test]
    fn test_exponential_decay_normal_mode() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        let (t, status) = solver.solve(&Decay, 1.0, Task::Normal, &mut y).unwrap();

        assert_eq!(t, 1.0);
        assert_eq!(status, TaskStatus::Success);
        let exact = (-1.0_f64).exp();
        assert!(
            (y[0] - exact).abs() < 1e-8,
            "y(1) = {}, expected {}",
            y[0],
            exact
        );
    }

    #[test]
    fn test_harmonic_oscillator() {
        let omega = 2.0;
        let sys = HarmonicOscillator { omega };
        let period = 2.0 * std::f64::consts::PI / omega;

        let mut solver = Rkf78::new(Tolerances::new(1e-12, 1e-12));
        solver.init(0.0, &[1.0, 0.0]).unwrap();
        let mut y = [0.0; 2];
        solver.solve(&sys, period, Task::Normal, &mut y).unwrap();

        println!("y(T) = {:?}, steps = {}", y, solver.stats.accepted_steps);
        assert!((y[0] - 1.0).abs() < 1e-8, "y(T) = {}", y[0]);
        assert!(y[1].abs() < 1e-7, "y'(T) = {}", y[1]);
    }

    #[test]
    fn test_backward_integration() {
        let mut solver = Rkf78::new(Tolerances::new(1e-10, 1e-10));
        let e = 1.0_f64.exp();
        solver.init(1.0, &vec![(-1.0_f64).exp()]).unwrap();
        let mut y = vec![0.0];
        let (t, _) = solver.solve(&Decay, 0.0, Task::Normal, &mut y).unwrap();

        assert_eq!(t, 0.0);
        assert!(solver.data().h < 0.0);
        assert!((y[0] - 1.0).abs() < 1e-8, "y(0) = {} (e = {})", y[0], e);
    }

    #[test]
    fn test_one_step_mode_advances_once() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        let (t1, _) = solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        assert_eq!(solver.data().nst, 1);
        assert_eq!(t1, solver.t());
        assert_eq!(y[0], solver.history()[0][0]);

        let (t2, _) = solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        assert_eq!(solver.data().nst, 2);
        assert!(t2 > t1);
    }

    #[test]
    fn test_normal_mode_tout_already_passed() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        let (t1, _) = solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        let nst = solver.data().nst;

        let tout = 0.5 * t1;
        let (t, _) = solver.solve(&Decay, tout, Task::Normal, &mut y).unwrap();
        assert_eq!(t, tout);
        assert_eq!(solver.data().nst, nst, "no step should be taken");
        assert!((y[0] - (-tout).exp()).abs() < 1e-12, "y = {}", y[0]);
    }

    #[test]
    fn test_solution_at_matches_step_accuracy() {
        let mut solver = decay_solver();
        solver.h_max = 0.1;
        let mut y = vec![0.0];
        for _ in 0..12 {
            solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let tn = solver.t();
        let hu = solver.data().hu;
        let mut out = vec![0.0];
        for frac in [0.1, 0.5, 0.9] {
            let t = tn - frac * hu;
            solver.solution_at(&Decay, t, &mut out).unwrap();
            let err = (out[0] - (-t).exp()).abs();
            assert!(err < 1e-9, "t = {}: error {}", t, err);
        }
        assert!(solver.solution_at(&Decay, tn - 2.0 * hu, &mut out).is_err());
    }

    #[test]
    fn test_solution_at_leaves_steps_unchanged() {
        let mut a = decay_solver();
        let mut b = decay_solver();
        let mut y = vec![0.0];
        let mut out = vec![0.0];
        for _ in 0..6 {
            let ta = a.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap().0;
            let tb = b.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap().0;
            assert_eq!(ta, tb);
            let t = tb - 0.5 * b.data().hu;
            b.solution_at(&Decay, t, &mut out).unwrap();
        }
        assert_eq!(a.history()[0], b.history()[0]);
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_first_step_fits_first_order_history() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        let h0 = solver.initial_step();
        // h²/2 |y''| <= atol + rtol |y| = 2e-10
        assert!(0.5 * h0 * h0 <= 2.0e-10 * 1.0001, "h0 = {}", h0);
        assert_eq!(solver.data().q, 2);
    }

    // ==================== Stop Time ====================

    #[test]
    fn test_stop_time_is_hit_exactly() {
        let mut solver = decay_solver();
        solver.set_stop_time(0.3);
        let mut y = vec![0.0];
        let mut last = (0.0, TaskStatus::Success);
        for _ in 0..1000 {
            last = solver.solve(&Decay, 1.0, Task::OneStep, &mut y).unwrap();
            if last.1 == TaskStatus::TstopReturn {
                break;
            }
            assert!(last.0 < 0.3);
        }
        assert_eq!(last.1, TaskStatus::TstopReturn);
        assert_eq!(last.0, 0.3);
        assert_eq!(solver.t(), 0.3);

        // Calling again at the stop time returns immediately
        let nst = solver.data().nst;
        let again = solver.solve(&Decay, 1.0, Task::OneStep, &mut y).unwrap();
        assert_eq!(again, (0.3, TaskStatus::TstopReturn));
        assert_eq!(solver.data().nst, nst);
    }

    #[test]
    fn test_stop_time_behind_is_rejected() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        solver.solve(&Decay, 1.0, Task::Normal, &mut y).unwrap();
        solver.set_stop_time(0.1);
        let result = solver.solve(&Decay, 2.0, Task::Normal, &mut y);
        assert!(matches!(result, Err(IntegrationError::IllegalInput { .. })));
    }

    // ==================== History and Dense Output ====================

    #[test]
    fn test_history_derivative_slot() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        for _ in 0..5 {
            solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let h = solver.data().h;
        let zn = solver.history();
        // zn[1] = h * y'(tn) = -h * y(tn)
        assert!((zn[1][0] + h * zn[0][0]).abs() < 1e-14);
    }

    #[test]
    fn test_order_grows_on_smooth_problem() {
        let mut solver = decay_solver();
        solver.h_max = 0.05;
        let mut y = vec![0.0];
        solver.solve(&Decay, 5.0, Task::Normal, &mut y).unwrap();
        assert_eq!(solver.data().q, MAX_ORDER);
        assert_eq!(solver.data().qu, MAX_ORDER);
    }

    #[test]
    fn test_dense_output_within_last_step() {
        let mut solver = decay_solver();
        solver.h_max = 0.1;
        let mut y = vec![0.0];
        for _ in 0..30 {
            solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let tn = solver.t();
        let hu = solver.data().hu;
        let mut dky = vec![0.0];
        for frac in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let t = tn - frac * hu;
            solver.get_dky(t, 0, &mut dky).unwrap();
            let err = (dky[0] - (-t).exp()).abs();
            assert!(err < 1e-6, "t = {}: error {}", t, err);

            solver.get_dky(t, 1, &mut dky).unwrap();
            let err = (dky[0] + (-t).exp()).abs();
            assert!(err < 1e-4, "t = {}: derivative error {}", t, err);
        }
    }

    #[test]
    fn test_dense_output_rejects_outside_last_step() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        for _ in 0..3 {
            solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let tn = solver.t();
        let hu = solver.data().hu;
        let mut dky = vec![0.0];
        assert!(matches!(
            solver.get_dky(tn - 2.0 * hu, 0, &mut dky),
            Err(IntegrationError::BadTime { .. })
        ));
        assert!(matches!(
            solver.get_dky(tn + 0.5 * hu, 0, &mut dky),
            Err(IntegrationError::BadTime { .. })
        ));
        assert!(matches!(
            solver.get_dky(tn, MAX_ORDER + 1, &mut dky),
            Err(IntegrationError::BadK { .. })
        ));
    }

    // ==================== Quadratures ====================

    #[test]
    fn test_quadrature_integral() {
        let mut solver = decay_solver();
        solver
            .quad_init(&vec![0.0], Some(Tolerances::new(1e-10, 1e-10)))
            .unwrap();
        let mut y = vec![0.0];
        solver.solve(&Decay, 2.0, Task::Normal, &mut y).unwrap();
        let mut yq = vec![0.0];
        solver.get_quad(2.0, &mut yq).unwrap();

        let exact = 1.0 - (-2.0_f64).exp();
        assert!((yq[0] - exact).abs() < 1e-8, "∫y = {}, expected {}", yq[0], exact);
    }

    #[test]
    fn test_quadrature_requires_init() {
        let solver = decay_solver();
        let mut yq = vec![0.0];
        assert_eq!(
            solver.get_quad(0.0, &mut yq),
            Err(IntegrationError::QuadratureNotInitialized)
        );
    }

    // ==================== Hot Restart ====================

    #[test]
    fn test_load_state_replays_bit_for_bit() {
        let mut solver = decay_solver();
        solver
            .quad_init(&vec![0.0], Some(Tolerances::new(1e-10, 1e-10)))
            .unwrap();
        let mut y = vec![0.0];
        for _ in 0..4 {
            solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }

        let data = *solver.data();
        let zn = solver.save_history().unwrap();
        let znq = solver.save_quad_history().unwrap();
        solver.request_setup();

        let mut first = Vec::new();
        for _ in 0..6 {
            let (t, _) = solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
            first.push((t, y[0]));
        }

        solver.load_state(&data, &zn, znq.as_ref()).unwrap();
        let mut second = Vec::new();
        for _ in 0..6 {
            let (t, _) = solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
            second.push((t, y[0]));
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_saved_history_spare_slot() {
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        solver.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        let saved = solver.save_history().unwrap();
        assert_eq!(saved.slots().len(), solver.data().q + 1);
        assert!(saved.spare().is_some());
        assert_eq!(saved.owned_vectors(), solver.data().q + 2);
    }

    #[test]
    fn test_load_state_rejects_mismatched_snapshot() {
        let mut solver = decay_solver();
        let zn = solver.save_history().unwrap();
        let mut data = *solver.data();
        data.q = 3;
        assert!(matches!(
            solver.load_state(&data, &zn, None),
            Err(IntegrationError::IllegalInput { .. })
        ));
    }

    // ==================== Input Validation ====================

    #[test]
    fn test_negative_tolerance_rejected() {
        let mut solver: Rkf78<[f64; 1]> = Rkf78::new(Tolerances::new(-1e-12, 1e-12));
        let result = solver.init(0.0, &[1.0]);
        assert!(matches!(result, Err(IntegrationError::IllegalInput { .. })));
    }

    #[test]
    fn test_nan_initial_state_rejected() {
        let mut solver: Rkf78<[f64; 1]> = Rkf78::new(Tolerances::new(1e-12, 1e-12));
        let result = solver.init(0.0, &[f64::NAN]);
        assert!(matches!(result, Err(IntegrationError::IllegalInput { .. })));
    }

    #[test]
    fn test_solve_before_init() {
        let mut solver: Rkf78<Vec<f64>> = Rkf78::new(Tolerances::new(1e-12, 1e-12));
        let mut y = vec![0.0];
        let result = solver.solve(&Decay, 1.0, Task::Normal, &mut y);
        assert_eq!(result, Err(IntegrationError::NotInitialized));
        assert_eq!(IntegrationError::NotInitialized.status_code(), -23);
    }

    #[test]
    fn test_init_step_wrong_sign_rejected() {
        let mut solver = decay_solver();
        solver.set_init_step(-0.1);
        let mut y = vec![0.0];
        let result = solver.solve(&Decay, 1.0, Task::Normal, &mut y);
        assert!(matches!(result, Err(IntegrationError::IllegalInput { .. })));
    }

    #[test]
    fn test_max_order_bounds() {
        let mut solver: Rkf78<Vec<f64>> = Rkf78::new(Tolerances::new(1e-12, 1e-12));
        assert!(solver.set_max_order(0).is_err());
        assert!(solver.set_max_order(MAX_ORDER + 1).is_err());
        solver.set_max_order(2).unwrap();
        solver.init(0.0, &vec![1.0]).unwrap();
        assert_eq!(solver.history().len(), 3);
        assert!(solver.set_max_order(3).is_err());
    }

    // ==================== Failure Handling ====================

    #[test]
    fn test_unrecoverable_rhs_failure() {
        struct Broken;
        impl OdeSystem<Vec<f64>> for Broken {
            fn rhs(&self, t: f64, _y: &Vec<f64>, ydot: &mut Vec<f64>) -> Result<(), RhsError> {
                if t > 0.0 {
                    return Err(RhsError::Unrecoverable);
                }
                ydot[0] = 1.0;
                Ok(())
            }
        }
        let mut solver = decay_solver();
        let mut y = vec![0.0];
        let result = solver.solve(&Broken, 1.0, Task::Normal, &mut y);
        assert!(matches!(result, Err(IntegrationError::UnrecoverableRhs { .. })));
        assert_eq!(result.unwrap_err().status_code(), -11);
    }

    #[test]
    fn test_recoverable_rhs_failure_shrinks_step() {
        // Fails for any stage beyond t = 0.05; a small enough step succeeds
        struct Fenced;
        impl OdeSystem<Vec<f64>> for Fenced {
            fn rhs(&self, t: f64, y: &Vec<f64>, ydot: &mut Vec<f64>) -> Result<(), RhsError> {
                if t > 0.05 {
                    return Err(RhsError::Recoverable);
                }
                ydot[0] = -y[0];
                Ok(())
            }
        }
        let mut solver = decay_solver();
        solver.set_init_step(0.5);
        let mut y = vec![0.0];
        let (t, _) = solver.solve(&Fenced, 1.0, Task::OneStep, &mut y).unwrap();
        assert!(t <= 0.05, "t = {}", t);
        assert!(solver.stats.rhs_failures > 0);
    }

    #[test]
    fn test_step_controller_bounds() {
        let controller = StepController::default();
        assert_eq!(controller.compute_factor(0.0), controller.max_factor);
        assert_eq!(controller.compute_factor(1e-30), controller.max_factor);
        assert_eq!(controller.compute_factor(1e30), controller.min_factor);
        let unit = controller.compute_factor(1.0);
        assert!((unit - controller.safety).abs() < 1e-15);
    }
}
