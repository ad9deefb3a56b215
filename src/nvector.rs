//! Numeric vector capability used by the stepper, checkpoints and interpolation.
//!
//! Everything above this module treats state vectors as opaque: they are cloned,
//! scaled and combined, never indexed by position outside of norm computations.
//! Implementations are provided for fixed-size arrays and `Vec<f64>`.

use thiserror::Error;

/// A vector clone could not be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate a vector of length {len}")]
pub struct AllocError {
    /// Length of the vector that could not be allocated
    pub len: usize,
}

/// Opaque n-dimensional real vector.
///
/// Binary operations assume both operands have the same length.
pub trait NVector: Clone + std::fmt::Debug {
    /// Components as a slice
    fn as_slice(&self) -> &[f64];

    /// Components as a mutable slice
    fn as_mut_slice(&mut self) -> &mut [f64];

    /// Clone that reports allocation failure instead of aborting.
    fn try_clone(&self) -> Result<Self, AllocError> {
        Ok(self.clone())
    }

    /// Number of components
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True for a zero-length vector
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// self = x
    fn copy_from(&mut self, x: &Self) {
        for (s, &xi) in self.as_mut_slice().iter_mut().zip(x.as_slice()) {
            *s = xi;
        }
    }

    /// self = c * x
    fn scale(&mut self, c: f64, x: &Self) {
        for (s, &xi) in self.as_mut_slice().iter_mut().zip(x.as_slice()) {
            *s = c * xi;
        }
    }

    /// self *= c
    fn scale_in_place(&mut self, c: f64) {
        for s in self.as_mut_slice() {
            *s *= c;
        }
    }

    /// self = a * x + b * y
    fn linear_sum(&mut self, a: f64, x: &Self, b: f64, y: &Self) {
        for ((s, &xi), &yi) in self
            .as_mut_slice()
            .iter_mut()
            .zip(x.as_slice())
            .zip(y.as_slice())
        {
            *s = a * xi + b * yi;
        }
    }

    /// self = a * self + b * y
    fn scale_add(&mut self, a: f64, b: f64, y: &Self) {
        for (s, &yi) in self.as_mut_slice().iter_mut().zip(y.as_slice()) {
            *s = a * *s + b * yi;
        }
    }

    /// self += a * x
    fn axpy(&mut self, a: f64, x: &Self) {
        for (s, &xi) in self.as_mut_slice().iter_mut().zip(x.as_slice()) {
            *s += a * xi;
        }
    }

    /// Set every component to `c`
    fn fill(&mut self, c: f64) {
        for s in self.as_mut_slice() {
            *s = c;
        }
    }

    /// Infinity norm
    fn max_norm(&self) -> f64 {
        self.as_slice().iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    /// True if every component is finite
    fn is_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }
}

impl<const N: usize> NVector for [f64; N] {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }
}

impl NVector for Vec<f64> {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn try_clone(&self) -> Result<Self, AllocError> {
        let mut out = Vec::new();
        out.try_reserve_exact(self.len())
            .map_err(|_| AllocError { len: self.len() })?;
        out.extend_from_slice(self);
        Ok(out)
    }
}

/// Clone every vector in `src`, failing on the first allocation error.
pub(crate) fn try_clone_all<V: NVector>(src: &[V]) -> Result<Vec<V>, AllocError> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len()).map_err(|_| AllocError {
        len: src.first().map_or(0, |v| v.len()),
    })?;
    for v in src {
        out.push(v.try_clone()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_sum_and_axpy() {
        let x = [1.0, 2.0, 3.0];
        let y = [4.0, 5.0, 6.0];
        let mut z = [0.0; 3];
        z.linear_sum(2.0, &x, -1.0, &y);
        assert_eq!(z, [-2.0, -1.0, 0.0]);

        z.axpy(0.5, &y);
        assert_eq!(z, [0.0, 1.5, 3.0]);

        z.scale_add(2.0, 1.0, &x);
        assert_eq!(z, [1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_max_norm_and_finite() {
        let v = vec![-3.0, 2.0, 0.5];
        assert_eq!(v.max_norm(), 3.0);
        assert!(v.is_finite());

        let w = vec![1.0, f64::NAN];
        assert!(!w.is_finite());
    }

    #[test]
    fn test_vec_try_clone_matches_clone() {
        let v = vec![1.0, -2.0, 3.5];
        let c = v.try_clone().unwrap();
        assert_eq!(c, v);
        assert_eq!(c.capacity(), v.len());
    }

    #[test]
    fn test_try_clone_all() {
        let src = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let out = try_clone_all(&src).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_scale_and_fill() {
        let mut v = [0.0; 2];
        v.scale(3.0, &[1.0, -1.0]);
        assert_eq!(v, [3.0, -3.0]);
        v.scale_in_place(0.5);
        assert_eq!(v, [1.5, -1.5]);
        v.fill(7.0);
        assert_eq!(v, [7.0, 7.0]);
    }
}
