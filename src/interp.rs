//! Data point buffer and interpolation of the forward solution.
//!
//! One checkpoint interval worth of forward data is resident at a time. The
//! backward pass asks for `y(t)` at arbitrary times inside that interval and
//! gets either a cubic Hermite value (from stored `y` and `y'`) or a Newton
//! divided-difference polynomial over neighbouring points whose degree follows
//! the order the forward stepper used.
//!
//! Lookups keep a cursor on the last bracketing index, so a monotone sweep
//! costs O(1) amortized per query. Coefficients are rebuilt only when the
//! bracketing interval changes.

use crate::error::ConfigError;
use crate::nvector::{AllocError, NVector};
use crate::solver::{OdeSystem, RhsError, Rkf78, FUZZ_FACTOR, L_MAX, UROUND};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;
use tracing::{trace, warn};

/// Interpolation strategy for the forward solution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationKind {
    /// Cubic Hermite from `y` and `y'`
    #[default]
    Hermite,
    /// Variable-degree Newton polynomial from `y` and the step order
    Polynomial,
}

impl fmt::Display for InterpolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationKind::Hermite => write!(f, "hermite"),
            InterpolationKind::Polynomial => write!(f, "polynomial"),
        }
    }
}

impl FromStr for InterpolationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hermite" => Ok(InterpolationKind::Hermite),
            "polynomial" => Ok(InterpolationKind::Polynomial),
            _ => Err(ConfigError::UnknownInterpolation(s.to_string())),
        }
    }
}

/// Errors from the data point buffer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpolationError {
    /// Requested time outside the resident interval
    #[error("t = {t} lies outside the stored forward data [{lo}, {hi}]")]
    BadTime {
        /// Requested time
        t: f64,
        /// Earliest stored time
        lo: f64,
        /// Latest stored time
        hi: f64,
    },
    /// Nothing has been stored yet
    #[error("no forward data points are stored")]
    Empty,
    /// Slot index past the end of the buffer
    #[error("slot {slot} is outside the buffer ({len} points)")]
    SlotOutOfRange {
        /// Requested slot
        slot: usize,
        /// Valid points or capacity
        len: usize,
    },
    /// Derivative evaluation for a Hermite point failed
    #[error("right-hand side failed while storing a data point: {0}")]
    Rhs(#[from] RhsError),
}

impl InterpolationError {
    /// Integer status code
    pub fn status_code(&self) -> i32 {
        match self {
            InterpolationError::BadTime { .. } | InterpolationError::Empty => -109,
            InterpolationError::SlotOutOfRange { .. } => -22,
            InterpolationError::Rhs(RhsError::Recoverable) => -10,
            InterpolationError::Rhs(RhsError::Unrecoverable) => -11,
        }
    }
}

/// Borrowed view of one stored point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataPoint<'a, V> {
    /// Hermite payload
    Hermite {
        /// Time
        t: f64,
        /// Solution
        y: &'a V,
        /// Derivative
        yd: &'a V,
    },
    /// Polynomial payload
    Polynomial {
        /// Time
        t: f64,
        /// Solution
        y: &'a V,
        /// Order used by the step that ended here
        order: usize,
    },
}

#[derive(Debug, Clone)]
enum Points<V> {
    Hermite {
        y: Vec<V>,
        yd: Vec<V>,
        /// `Y0`, `Y1` of the current bracket
        coeffs: [V; 2],
    },
    Polynomial {
        y: Vec<V>,
        order: Vec<usize>,
        /// Newton coefficients over `nodes[..=degree]`
        dd: Vec<V>,
        nodes: [f64; L_MAX],
        degree: usize,
        dt: f64,
        window: Option<RangeInclusive<usize>>,
    },
}

/// Fixed-capacity buffer of forward data points
#[derive(Debug, Clone)]
pub struct DataPointBuffer<V> {
    kind: InterpolationKind,
    t: Vec<f64>,
    points: Points<V>,
    len: usize,
    direction: f64,
    last: usize,
    fresh: bool,
    coeff_index: Option<usize>,
    rebuilds: u64,
}

fn try_filled<V: NVector>(n: usize, template: &V) -> Result<Vec<V>, AllocError> {
    let mut out = Vec::new();
    out.try_reserve_exact(n)
        .map_err(|_| AllocError { len: template.len() })?;
    for _ in 0..n {
        let mut v = template.try_clone()?;
        v.fill(0.0);
        out.push(v);
    }
    Ok(out)
}

impl<V: NVector> DataPointBuffer<V> {
    /// Allocate `capacity` points shaped like `template`
    pub fn new(kind: InterpolationKind, capacity: usize, template: &V) -> Result<Self, AllocError> {
        let points = match kind {
            InterpolationKind::Hermite => Points::Hermite {
                y: try_filled(capacity, template)?,
                yd: try_filled(capacity, template)?,
                coeffs: [template.try_clone()?, template.try_clone()?],
            },
            InterpolationKind::Polynomial => Points::Polynomial {
                y: try_filled(capacity, template)?,
                order: vec![1; capacity],
                dd: try_filled(L_MAX, template)?,
                nodes: [0.0; L_MAX],
                degree: 0,
                dt: 0.0,
                window: None,
            },
        };
        Ok(Self {
            kind,
            t: vec![0.0; capacity],
            points,
            len: 0,
            direction: 1.0,
            last: 0,
            fresh: false,
            coeff_index: None,
            rebuilds: 0,
        })
    }

    /// Strategy in use
    pub fn kind(&self) -> InterpolationKind {
        self.kind
    }

    /// Maximum number of points
    pub fn capacity(&self) -> usize {
        self.t.len()
    }

    /// Number of valid points
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no interval is resident
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Times of the valid points
    pub fn times(&self) -> &[f64] {
        &self.t[..self.len]
    }

    /// How often interpolation coefficients were rebuilt
    pub fn coefficient_builds(&self) -> u64 {
        self.rebuilds
    }

    /// Point indices used by the last polynomial evaluation
    pub fn polynomial_window(&self) -> Option<RangeInclusive<usize>> {
        match &self.points {
            Points::Polynomial { window, .. } => window.clone(),
            Points::Hermite { .. } => None,
        }
    }

    /// Record the stepper's current state at `slot`.
    ///
    /// Hermite points need `y'`: on the very first step it comes from the
    /// right-hand side, afterwards from the history slot `zn[1] / h`.
    pub fn store<S: OdeSystem<V>>(
        &mut self,
        slot: usize,
        stepper: &Rkf78<V>,
        sys: &S,
    ) -> Result<(), InterpolationError> {
        if slot >= self.capacity() {
            return Err(InterpolationError::SlotOutOfRange {
                slot,
                len: self.capacity(),
            });
        }
        let zn = stepper.history();
        let data = stepper.data();
        let t = data.tn;
        match &mut self.points {
            Points::Hermite { y, yd, .. } => {
                y[slot].copy_from(&zn[0]);
                if data.nst == 0 {
                    sys.rhs(t, &zn[0], &mut yd[slot])?;
                } else {
                    yd[slot].scale(1.0 / data.h, &zn[1]);
                }
            }
            Points::Polynomial { y, order, .. } => {
                y[slot].copy_from(&zn[0]);
                order[slot] = data.qu;
            }
        }
        self.t[slot] = t;
        trace!(slot, t, "data point stored");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record_hermite(&mut self, slot: usize, t: f64, y: &V, yd: &V) {
        if let Points::Hermite { y: ys, yd: yds, .. } = &mut self.points {
            ys[slot].copy_from(y);
            yds[slot].copy_from(yd);
            self.t[slot] = t;
        }
    }

    #[cfg(test)]
    pub(crate) fn record_polynomial(&mut self, slot: usize, t: f64, y: &V, order: usize) {
        if let Points::Polynomial { y: ys, order: os, .. } = &mut self.points {
            ys[slot].copy_from(y);
            os[slot] = order;
            self.t[slot] = t;
        }
    }

    /// Declare the first `len` points a freshly loaded interval.
    ///
    /// `direction` is the sign of forward time.
    pub fn mark_fresh(&mut self, len: usize, direction: f64) {
        self.len = len.min(self.capacity());
        self.direction = if direction < 0.0 { -1.0 } else { 1.0 };
        self.fresh = true;
        self.coeff_index = None;
    }

    /// Forget the resident interval
    pub fn invalidate(&mut self) {
        self.len = 0;
        self.fresh = false;
        self.coeff_index = None;
    }

    /// Raw access to a valid point
    pub fn data_point(&self, slot: usize) -> Result<DataPoint<'_, V>, InterpolationError> {
        if slot >= self.len {
            return Err(InterpolationError::SlotOutOfRange { slot, len: self.len });
        }
        let t = self.t[slot];
        Ok(match &self.points {
            Points::Hermite { y, yd, .. } => DataPoint::Hermite {
                t,
                y: &y[slot],
                yd: &yd[slot],
            },
            Points::Polynomial { y, order, .. } => DataPoint::Polynomial {
                t,
                y: &y[slot],
                order: order[slot],
            },
        })
    }

    fn bad_time(&self, t: f64) -> InterpolationError {
        let (a, b) = (self.t[0], self.t[self.len - 1]);
        warn!(t, lo = a.min(b), hi = a.max(b), "forward solution requested outside stored data");
        InterpolationError::BadTime {
            t,
            lo: a.min(b),
            hi: a.max(b),
        }
    }

    /// Index `i` such that `t` lies in `[t[i-1], t[i]]` (in integration direction).
    ///
    /// Returns 0 only when `t` matches the first point within roundoff.
    pub fn find_index(&mut self, t: f64) -> Result<usize, InterpolationError> {
        if self.len == 0 {
            return Err(InterpolationError::Empty);
        }
        let fuzz = FUZZ_FACTOR * UROUND;
        let sign = self.direction;
        let n = self.len;

        if self.fresh {
            self.last = n - 1;
            self.fresh = false;
        }

        if n < 2 {
            return if (t - self.t[0]).abs() > fuzz {
                Err(self.bad_time(t))
            } else {
                Ok(0)
            };
        }

        let last = self.last.clamp(1, n - 1);
        if sign * (t - self.t[last - 1]) < 0.0 {
            let mut indx = last;
            while indx > 0 && sign * (t - self.t[indx - 1]) <= 0.0 {
                indx -= 1;
            }
            trace!(t, from = last, to = indx, "rescan to the left");
            if indx == 0 {
                self.last = 1;
                if (t - self.t[0]).abs() > fuzz {
                    return Err(self.bad_time(t));
                }
                return Ok(0);
            }
            self.last = indx;
            Ok(indx)
        } else if sign * (t - self.t[last]) > 0.0 {
            let mut indx = last;
            while indx < n && sign * (t - self.t[indx]) > 0.0 {
                indx += 1;
            }
            trace!(t, from = last, to = indx, "rescan to the right");
            if indx == n {
                if (t - self.t[n - 1]).abs() > fuzz {
                    return Err(self.bad_time(t));
                }
                indx = n - 1;
            }
            self.last = indx;
            Ok(indx)
        } else {
            self.last = last;
            Ok(last)
        }
    }

    /// Interpolated forward solution at `t`, written into `y`
    pub fn get_y(&mut self, t: f64, y: &mut V) -> Result<(), InterpolationError> {
        let indx = self.find_index(t)?;

        if indx == 0 || t == self.t[indx - 1] {
            y.copy_from(self.solution(indx.saturating_sub(1)));
            return Ok(());
        }
        if t == self.t[indx] {
            y.copy_from(self.solution(indx));
            return Ok(());
        }

        if self.coeff_index != Some(indx) {
            self.compute_coefficients(indx);
            self.coeff_index = Some(indx);
            self.rebuilds += 1;
        }
        self.evaluate(indx, t, y);
        Ok(())
    }

    fn solution(&self, slot: usize) -> &V {
        match &self.points {
            Points::Hermite { y, .. } | Points::Polynomial { y, .. } => &y[slot],
        }
    }

    fn compute_coefficients(&mut self, indx: usize) {
        let n = self.len;
        let forward = self.direction > 0.0;
        match &mut self.points {
            Points::Hermite { y, yd, coeffs } => {
                let delta = self.t[indx] - self.t[indx - 1];
                let [c0, c1] = coeffs;
                // Y1 = delta (yd1 + yd0) - 2 (y1 - y0)
                c0.linear_sum(1.0, &y[indx], -1.0, &y[indx - 1]);
                c1.linear_sum(1.0, &yd[indx], 1.0, &yd[indx - 1]);
                c1.scale_add(delta, -2.0, c0);
                // Y0 = y1 - y0 - delta yd0
                c0.axpy(-delta, &yd[indx - 1]);
            }
            Points::Polynomial {
                y,
                order,
                dd,
                nodes,
                degree,
                dt,
                window,
            } => {
                let tag = if forward { order[indx] } else { order[indx - 1] };
                let p = tag.clamp(1, n - 1).min(L_MAX - 1);
                let lo = if forward {
                    indx.max(p) - p
                } else {
                    (indx - 1).min(n - 1 - p)
                };
                let hi = lo + p;
                for j in 0..=p {
                    let k = if forward { hi - j } else { lo + j };
                    nodes[j] = self.t[k];
                    dd[j].copy_from(&y[k]);
                }
                *dt = (self.t[indx] - self.t[indx - 1]).abs();
                for i in 1..=p {
                    for j in (i..=p).rev() {
                        let factor = *dt / (nodes[j] - nodes[j - i]);
                        let (head, tail) = dd.split_at_mut(j);
                        tail[0].scale_add(factor, -factor, &head[j - 1]);
                    }
                }
                *degree = p;
                *window = Some(lo..=hi);
            }
        }
    }

    fn evaluate(&self, indx: usize, t: f64, out: &mut V) {
        match &self.points {
            Points::Hermite { y, yd, coeffs } => {
                let (t0, t1) = (self.t[indx - 1], self.t[indx]);
                let delta = t1 - t0;
                let f1 = t - t0;
                let f2 = (f1 / delta) * (f1 / delta);
                let f3 = f2 * (t - t1) / delta;
                out.linear_sum(1.0, &y[indx - 1], f1, &yd[indx - 1]);
                out.axpy(f2, &coeffs[0]);
                out.axpy(f3, &coeffs[1]);
            }
            Points::Polynomial {
                dd,
                nodes,
                degree,
                dt,
                ..
            } => {
                out.copy_from(&dd[*degree]);
                for i in (0..*degree).rev() {
                    let factor = (t - nodes[i]) / dt;
                    out.scale_add(factor, 1.0, &dd[i]);
                }
            }
        }
    }
}
