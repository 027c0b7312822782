//! Gaussian noise models
//!
//! Factors whiten their residuals and Jacobians before handing them to the
//! engine, so all linear algebra downstream runs on unit-covariance
//! systems. Only diagonal models are provided; a robust model can wrap one
//! by scaling the whitened residual.

#![forbid(unsafe_code)]

use nalgebra::{DMatrix, DVector};

/// Diagonal Gaussian noise, stored as per-row standard deviations.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagonalNoise {
    sigmas: DVector<f64>,
    inv_sigmas: DVector<f64>,
}

impl DiagonalNoise {
    /// Model with the given per-row standard deviations. All sigmas must
    /// be strictly positive.
    pub fn from_sigmas(sigmas: &[f64]) -> Self {
        assert!(
            sigmas.iter().all(|&s| s > 0.0),
            "noise sigmas must be positive"
        );
        let sigmas = DVector::from_column_slice(sigmas);
        let inv_sigmas = sigmas.map(|s| 1.0 / s);
        Self { sigmas, inv_sigmas }
    }

    /// Model with `dim` identical standard deviations.
    pub fn isotropic(dim: usize, sigma: f64) -> Self {
        Self::from_sigmas(&vec![sigma; dim])
    }

    /// Residual dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.sigmas.len()
    }

    /// Per-row standard deviations.
    #[inline]
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// `Σ^(-1/2) · r`.
    pub fn whiten_vector(&self, r: &DVector<f64>) -> DVector<f64> {
        debug_assert_eq!(r.len(), self.dim());
        r.component_mul(&self.inv_sigmas)
    }

    /// Scale each row of `a` by the matching inverse sigma.
    pub fn whiten_matrix_in_place(&self, a: &mut DMatrix<f64>) {
        debug_assert_eq!(a.nrows(), self.dim());
        for i in 0..a.nrows() {
            let w = self.inv_sigmas[i];
            for j in 0..a.ncols() {
                a[(i, j)] *= w;
            }
        }
    }

    /// `½‖Σ^(-1/2) r‖²`.
    pub fn quadratic_error(&self, r: &DVector<f64>) -> f64 {
        0.5 * self.whiten_vector(r).norm_squared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    #[test]
    fn whitening_scales_rows() {
        let noise = DiagonalNoise::from_sigmas(&[0.5, 2.0]);
        let r = dvector![1.0, 1.0];
        assert_eq!(noise.whiten_vector(&r), dvector![2.0, 0.5]);

        let mut a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 8.0]);
        noise.whiten_matrix_in_place(&mut a);
        assert_eq!(a, DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 2.0, 4.0]));

        // ½‖[2, 0.5]‖²
        assert_abs_diff_eq!(noise.quadratic_error(&r), 0.5 * 4.25, epsilon = 1e-12);
    }
}
