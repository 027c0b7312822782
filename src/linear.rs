//! Linear (Gaussian) factors and conditionals
//!
//! Three dense block forms flow through elimination:
//!
//! - [`JacobianFactor`] — `½‖A₁x₁ + … + Aₖxₖ − b‖²`, the whitened
//!   linearization of a nonlinear factor.
//! - [`HessianFactor`] — the same quadratic in information form
//!   `½(xᵀGx − 2gᵀx + c)`, used for the cached marginal a clique passes to
//!   its parent.
//! - [`GaussianConditional`] — `p(F | S)` as the upper-triangular rows
//!   `[R_FF R_FS | d]` produced by eliminating the frontal block `F`.
//!
//! All labels are dense [`VarIndex`]es; key lists carry their per-variable
//! dims so blocks can be located by column offset.

#![forbid(unsafe_code)]

use nalgebra::{DMatrix, DVector};

use crate::ordering::VarIndex;
use crate::Error;

/// A whitened linear factor `½‖Σᵢ Aᵢxᵢ − b‖²`.
#[derive(Clone, Debug, PartialEq)]
pub struct JacobianFactor {
    keys: Vec<VarIndex>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
}

impl JacobianFactor {
    /// Assemble from per-variable blocks, in key order.
    pub fn new(keys: Vec<VarIndex>, blocks: Vec<DMatrix<f64>>, rhs: DVector<f64>) -> Self {
        debug_assert_eq!(keys.len(), blocks.len());
        debug_assert!(blocks.iter().all(|b| b.nrows() == rhs.len()));
        Self { keys, blocks, rhs }
    }

    /// Variable labels, in block order.
    #[inline]
    pub fn keys(&self) -> &[VarIndex] {
        &self.keys
    }

    /// The block multiplying variable position `i`.
    #[inline]
    pub fn block(&self, i: usize) -> &DMatrix<f64> {
        &self.blocks[i]
    }

    /// Right-hand side `b`.
    #[inline]
    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    /// Residual row count.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    /// Per-variable column widths.
    pub fn dims(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.ncols()).collect()
    }

    /// `½‖Σᵢ Aᵢxᵢ − b‖²` with `x` gathered per label.
    pub fn error<F: Fn(VarIndex) -> DVector<f64>>(&self, x: F) -> f64 {
        let mut r = -self.rhs.clone();
        for (key, block) in self.keys.iter().zip(&self.blocks) {
            r += block * x(*key);
        }
        0.5 * r.norm_squared()
    }

    /// Per-variable gradient of the quadratic at `x = 0`: `−Aᵢᵀb`.
    pub fn gradient_at_zero(&self) -> Vec<(VarIndex, DVector<f64>)> {
        self.keys
            .iter()
            .zip(&self.blocks)
            .map(|(key, block)| (*key, -(block.transpose() * &self.rhs)))
            .collect()
    }

    /// Rewrite every label through `map`.
    pub fn relabel<F: Fn(VarIndex) -> VarIndex>(&mut self, map: F) {
        for key in &mut self.keys {
            *key = map(*key);
        }
    }
}

/// A quadratic in information form `½(xᵀGx − 2gᵀx + c)`.
///
/// Stored as the full symmetric augmented matrix
/// `[[G, g], [gᵀ, c]] = [A b]ᵀ[A b]`, so the error at `x` is
/// `½·[x; −1]ᵀ·info·[x; −1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct HessianFactor {
    keys: Vec<VarIndex>,
    dims: Vec<usize>,
    info: DMatrix<f64>,
}

impl HessianFactor {
    /// Wrap an augmented information matrix. `info` must be square with
    /// side `Σ dims + 1` and symmetric.
    pub fn new(keys: Vec<VarIndex>, dims: Vec<usize>, info: DMatrix<f64>) -> Self {
        debug_assert_eq!(keys.len(), dims.len());
        debug_assert_eq!(info.nrows(), dims.iter().sum::<usize>() + 1);
        debug_assert_eq!(info.nrows(), info.ncols());
        Self { keys, dims, info }
    }

    /// `[A b]ᵀ[A b]` of a Jacobian factor.
    pub fn from_jacobian(jf: &JacobianFactor) -> Self {
        let keys = jf.keys().to_vec();
        let dims = jf.dims();
        let total: usize = dims.iter().sum();
        let mut ab = DMatrix::zeros(jf.rows(), total + 1);
        let mut off = 0;
        for i in 0..keys.len() {
            ab.view_mut((0, off), (jf.rows(), dims[i])).copy_from(jf.block(i));
            off += dims[i];
        }
        ab.view_mut((0, total), (jf.rows(), 1)).copy_from(jf.rhs());
        let info = ab.transpose() * ab;
        Self { keys, dims, info }
    }

    /// Variable labels.
    #[inline]
    pub fn keys(&self) -> &[VarIndex] {
        &self.keys
    }

    /// Per-variable widths.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// The augmented information matrix.
    #[inline]
    pub fn info(&self) -> &DMatrix<f64> {
        &self.info
    }

    /// `½(xᵀGx − 2gᵀx + c)` with `x` gathered per label.
    pub fn error<F: Fn(VarIndex) -> DVector<f64>>(&self, x: F) -> f64 {
        let n = self.info.nrows() - 1;
        let mut xa = DVector::zeros(n + 1);
        let mut off = 0;
        for (key, dim) in self.keys.iter().zip(&self.dims) {
            xa.rows_mut(off, *dim).copy_from(&x(*key));
            off += dim;
        }
        xa[n] = -1.0;
        0.5 * (xa.transpose() * &self.info * xa)[(0, 0)]
    }

    /// Convert back to square-root form `[R | d]` via an in-place
    /// rank-revealing Cholesky of `G`.
    ///
    /// Cached marginals are only positive *semi*definite in general (a
    /// subtree may carry no information about part of its separator), so
    /// a vanishing pivot zeroes its row instead of failing; only a
    /// genuinely negative pivot surfaces [`Error::IndefiniteSystem`].
    pub fn to_jacobian(&self) -> Result<JacobianFactor, Error> {
        let n = self.info.nrows() - 1;
        let mut u = self.info.view((0, 0), (n, n)).into_owned();
        let tol = 1e-9 * (0..n).fold(1.0_f64, |m, i| m.max(u[(i, i)].abs()));
        let mut live = vec![true; n];
        for j in 0..n {
            let mut pivot = u[(j, j)];
            for k in 0..j {
                pivot -= u[(k, j)] * u[(k, j)];
            }
            if pivot < -tol {
                return Err(Error::IndefiniteSystem { column: j });
            }
            if pivot <= tol {
                live[j] = false;
                for i in j..n {
                    u[(j, i)] = 0.0;
                }
                continue;
            }
            let r = pivot.sqrt();
            u[(j, j)] = r;
            for i in (j + 1)..n {
                let mut v = u[(j, i)];
                for k in 0..j {
                    v -= u[(k, j)] * u[(k, i)];
                }
                u[(j, i)] = v / r;
            }
        }
        // zero the strict lower triangle left stale by the factorization
        for i in 1..n {
            for j in 0..i {
                u[(i, j)] = 0.0;
            }
        }
        // d solves Rᵀ d = g, skipping rows without information
        let g = self.info.view((0, n), (n, 1)).into_owned();
        let mut d = DVector::zeros(n);
        for i in 0..n {
            if !live[i] {
                continue;
            }
            let mut v = g[(i, 0)];
            for k in 0..i {
                v -= u[(k, i)] * d[k];
            }
            d[i] = v / u[(i, i)];
        }
        let mut blocks = Vec::with_capacity(self.keys.len());
        let mut off = 0;
        for dim in &self.dims {
            blocks.push(u.view((0, off), (n, *dim)).into_owned());
            off += dim;
        }
        Ok(JacobianFactor::new(self.keys.clone(), blocks, d))
    }

    /// Rewrite every label through `map`.
    pub fn relabel<F: Fn(VarIndex) -> VarIndex>(&mut self, map: F) {
        for key in &mut self.keys {
            *key = map(*key);
        }
    }
}

/// Either linear form, as stored in an elimination workspace.
#[derive(Clone, Debug)]
pub enum LinearFactor {
    /// Square-root form.
    Jacobian(JacobianFactor),
    /// Information form.
    Hessian(HessianFactor),
}

impl LinearFactor {
    /// Variable labels of either form.
    pub fn keys(&self) -> &[VarIndex] {
        match self {
            LinearFactor::Jacobian(f) => f.keys(),
            LinearFactor::Hessian(f) => f.keys(),
        }
    }

    /// Quadratic error of either form.
    pub fn error<F: Fn(VarIndex) -> DVector<f64>>(&self, x: F) -> f64 {
        match self {
            LinearFactor::Jacobian(f) => f.error(x),
            LinearFactor::Hessian(f) => f.error(x),
        }
    }
}

/// A Gaussian conditional `p(F | S)` over one or more frontal variables.
///
/// `keys` lists frontals then separator, both in elimination order; `rsd`
/// packs the rows `[R_FF R_FS | d]` with `R_FF` upper-triangular; `sigmas`
/// carries the per-row noise scaling (unit for conditionals produced by
/// the whitened kernels).
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianConditional {
    keys: Vec<VarIndex>,
    dims: Vec<usize>,
    nr_frontals: usize,
    rsd: DMatrix<f64>,
    sigmas: DVector<f64>,
}

impl GaussianConditional {
    /// Wrap packed rows. `rsd` must have `Σ frontal dims` rows and
    /// `Σ dims + 1` columns.
    pub fn new(
        keys: Vec<VarIndex>,
        dims: Vec<usize>,
        nr_frontals: usize,
        rsd: DMatrix<f64>,
        sigmas: DVector<f64>,
    ) -> Self {
        debug_assert_eq!(keys.len(), dims.len());
        debug_assert!(nr_frontals >= 1 && nr_frontals <= keys.len());
        debug_assert_eq!(rsd.nrows(), dims[..nr_frontals].iter().sum::<usize>());
        debug_assert_eq!(rsd.ncols(), dims.iter().sum::<usize>() + 1);
        debug_assert_eq!(sigmas.len(), rsd.nrows());
        Self { keys, dims, nr_frontals, rsd, sigmas }
    }

    /// All labels: frontals then separator.
    #[inline]
    pub fn keys(&self) -> &[VarIndex] {
        &self.keys
    }

    /// Frontal labels.
    #[inline]
    pub fn frontals(&self) -> &[VarIndex] {
        &self.keys[..self.nr_frontals]
    }

    /// Separator labels.
    #[inline]
    pub fn separator(&self) -> &[VarIndex] {
        &self.keys[self.nr_frontals..]
    }

    /// Number of frontal variables.
    #[inline]
    pub fn nr_frontals(&self) -> usize {
        self.nr_frontals
    }

    /// Per-variable widths, frontals then separator.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total frontal dimension (row count).
    #[inline]
    pub fn frontal_dim(&self) -> usize {
        self.rsd.nrows()
    }

    /// Packed `[R_FF R_FS | d]` rows.
    #[inline]
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.rsd
    }

    /// Per-row noise scaling.
    #[inline]
    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    /// Column offset of variable position `pos`.
    pub fn col_offset(&self, pos: usize) -> usize {
        self.dims[..pos].iter().sum()
    }

    /// The rhs column `d`.
    pub fn rhs(&self) -> DVector<f64> {
        let total: usize = self.dims.iter().sum();
        self.rsd.view((0, total), (self.rsd.nrows(), 1)).column(0).into_owned()
    }

    /// Solve `R_FF · x_F = d − R_FS · x_S` by back-substitution, with the
    /// separator gathered through `separator_values`. Returns the stacked
    /// frontal solution.
    pub fn solve<F: Fn(VarIndex) -> DVector<f64>>(&self, separator_values: F) -> DVector<f64> {
        let rows = self.rsd.nrows();
        let mut rhs = self.rhs();
        for pos in self.nr_frontals..self.keys.len() {
            let off = self.col_offset(pos);
            let xs = separator_values(self.keys[pos]);
            debug_assert_eq!(xs.len(), self.dims[pos]);
            rhs -= self.rsd.view((0, off), (rows, self.dims[pos])) * xs;
        }
        let mut x = DVector::zeros(rows);
        for i in (0..rows).rev() {
            let mut v = rhs[i];
            for j in (i + 1)..rows {
                v -= self.rsd[(i, j)] * x[j];
            }
            x[i] = v / self.rsd[(i, i)];
        }
        x
    }

    /// `[R_FF R_FS] · x` with `x` gathered per label.
    pub fn multiply<F: Fn(VarIndex) -> DVector<f64>>(&self, x: F) -> DVector<f64> {
        let rows = self.rsd.nrows();
        let mut out = DVector::zeros(rows);
        for (pos, key) in self.keys.iter().enumerate() {
            let off = self.col_offset(pos);
            out += self.rsd.view((0, off), (rows, self.dims[pos])) * x(*key);
        }
        out
    }

    /// `½‖[R S]·x − d‖²`, the conditional's share of the linearized
    /// system error at step `x`.
    pub fn linear_error<F: Fn(VarIndex) -> DVector<f64>>(&self, x: F) -> f64 {
        (self.multiply(x) - self.rhs()).norm_squared() * 0.5
    }

    /// Reinterpret as a plain linear factor over all labels.
    pub fn as_jacobian(&self) -> JacobianFactor {
        let rows = self.rsd.nrows();
        let mut blocks = Vec::with_capacity(self.keys.len());
        for pos in 0..self.keys.len() {
            let off = self.col_offset(pos);
            blocks.push(self.rsd.view((0, off), (rows, self.dims[pos])).into_owned());
        }
        JacobianFactor::new(self.keys.clone(), blocks, self.rhs())
    }

    /// Gradient of `½‖[R S]·x − d‖²` at `x = 0`: `−[R S]ᵀd`, frontal rows
    /// first then separator rows.
    pub fn gradient_contribution(&self) -> DVector<f64> {
        let total: usize = self.dims.iter().sum();
        let d = self.rhs();
        let r = self.rsd.view((0, 0), (self.rsd.nrows(), total));
        -(r.transpose() * d)
    }

    /// Rewrite every label through `map`.
    pub fn relabel<F: Fn(VarIndex) -> VarIndex>(&mut self, map: F) {
        for key in &mut self.keys {
            *key = map(*key);
        }
    }

    /// Stack a single-frontal conditional `p(j | keys(self))` on top of
    /// this one, producing `p(j, F | S)`. The top's separator must equal
    /// this conditional's full key list, in the same order.
    pub fn combine(top: &GaussianConditional, bottom: &GaussianConditional) -> GaussianConditional {
        debug_assert_eq!(top.nr_frontals, 1);
        debug_assert_eq!(top.separator(), bottom.keys());
        let w0 = top.dims[0];
        let bottom_total: usize = bottom.dims.iter().sum();
        let rows = top.rsd.nrows() + bottom.rsd.nrows();
        let cols = w0 + bottom_total + 1;
        let mut rsd = DMatrix::zeros(rows, cols);
        // top rows span every column
        rsd.view_mut((0, 0), (w0, cols)).copy_from(&top.rsd);
        // bottom rows shift right past the new frontal
        rsd.view_mut((w0, w0), (bottom.rsd.nrows(), bottom_total + 1))
            .copy_from(&bottom.rsd);
        let mut keys = Vec::with_capacity(1 + bottom.keys.len());
        keys.push(top.keys[0]);
        keys.extend_from_slice(&bottom.keys);
        let mut dims = Vec::with_capacity(keys.len());
        dims.push(w0);
        dims.extend_from_slice(&bottom.dims);
        let mut sigmas = DVector::zeros(rows);
        sigmas.rows_mut(0, w0).copy_from(&top.sigmas);
        sigmas.rows_mut(w0, bottom.rsd.nrows()).copy_from(&bottom.sigmas);
        GaussianConditional::new(keys, dims, bottom.nr_frontals + 1, rsd, sigmas)
    }
}
