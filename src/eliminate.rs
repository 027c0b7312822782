//! Variable elimination
//!
//! The kernel eliminates one frontal variable at a time: the factors
//! touching it are gathered into a dense augmented system, the frontal
//! block is factored out, and the Schur-complement marginal on the
//! remaining variables is passed back into the workspace. Two
//! factorization modes are supported, selected at engine construction:
//!
//! - **Cholesky** (default): form the information matrix
//!   `[A b]ᵀ[A b]` and run a partial in-place Cholesky of the frontal
//!   columns. A non-positive pivot fails with
//!   [`Error::IndefiniteSystem`]; the caller may retry with QR.
//! - **QR**: Householder triangularization of the stacked `[A | b]`,
//!   avoiding the squared condition number. Cached information-form
//!   factors are converted to square-root form on entry.
//!
//! Columns are eliminated in the order given; rows may be permuted inside
//! a single factorization, columns never are.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::linear::{GaussianConditional, HessianFactor, JacobianFactor, LinearFactor};
use crate::ordering::VarIndex;
use crate::{Error, Factorization};

/// Column layout of a dense elimination target: involved variables in
/// elimination order, with widths and running offsets.
struct Layout {
    vars: Vec<VarIndex>,
    dims: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl Layout {
    fn build<R, D>(factors: &[LinearFactor], frontal: VarIndex, rank_of: R, dim_of: D) -> Layout
    where
        R: Fn(VarIndex) -> usize,
        D: Fn(VarIndex) -> usize,
    {
        let mut vars: Vec<VarIndex> = Vec::new();
        for factor in factors {
            for &key in factor.keys() {
                if !vars.contains(&key) {
                    vars.push(key);
                }
            }
        }
        vars.sort_by_key(|&v| rank_of(v));
        debug_assert_eq!(vars.first().copied(), Some(frontal), "frontal must come first");
        let dims: Vec<usize> = vars.iter().map(|&v| dim_of(v)).collect();
        let mut offsets = Vec::with_capacity(dims.len());
        let mut total = 0;
        for &d in &dims {
            offsets.push(total);
            total += d;
        }
        Layout { vars, dims, offsets, total }
    }

    fn position(&self, key: VarIndex) -> usize {
        self.vars.iter().position(|&v| v == key).expect("key in layout")
    }
}

/// Output of eliminating one frontal variable.
struct Eliminated {
    conditional: GaussianConditional,
    /// Schur-complement marginal, fed back into the workspace. `None`
    /// when the separator is empty.
    marginal: Option<LinearFactor>,
    /// The same marginal in information form, cached at the clique.
    cache: Option<HessianFactor>,
}

/// The conditional sequence of an elimination run, with the marginal
/// emitted at each step (the per-clique separator cache).
pub struct BayesNetFragment {
    /// One conditional per eliminated variable, in elimination order.
    pub conditionals: Vec<GaussianConditional>,
    /// The information-form marginal emitted when the matching variable
    /// was eliminated. `None` when its separator was empty.
    pub caches: Vec<Option<HessianFactor>>,
}

/// Eliminate `order` from `factors`, one variable at a time, bucketing
/// each intermediate marginal at its lowest remaining variable.
///
/// Every key referenced by `factors` must appear in `order`. A variable
/// carrying no information (no factor reaches it when its turn comes)
/// fails with [`Error::IndefiniteSystem`], as does a non-positive
/// Cholesky pivot.
pub fn eliminate_sequential<D>(
    factors: Vec<LinearFactor>,
    order: &[VarIndex],
    dim_of: D,
    mode: Factorization,
) -> Result<BayesNetFragment, Error>
where
    D: Fn(VarIndex) -> usize,
{
    let rank: HashMap<VarIndex, usize> =
        order.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    let rank_of = |v: VarIndex| -> usize {
        *rank.get(&v).expect("factor key outside the elimination order")
    };

    let mut buckets: Vec<Vec<LinearFactor>> = (0..order.len()).map(|_| Vec::new()).collect();
    for factor in factors {
        let r = factor
            .keys()
            .iter()
            .map(|&k| rank_of(k))
            .min()
            .expect("factor with no keys");
        buckets[r].push(factor);
    }

    let mut conditionals = Vec::with_capacity(order.len());
    let mut caches = Vec::with_capacity(order.len());
    for (r, &frontal) in order.iter().enumerate() {
        let gathered = std::mem::take(&mut buckets[r]);
        if gathered.is_empty() {
            // no information reaches this variable
            return Err(Error::IndefiniteSystem { column: r });
        }
        let Eliminated { conditional, marginal, cache } =
            eliminate_one(&gathered, frontal, &rank_of, &dim_of, mode)?;
        if let Some(marginal) = marginal {
            let next = marginal
                .keys()
                .iter()
                .map(|&k| rank_of(k))
                .min()
                .expect("marginal with no keys");
            debug_assert!(next > r);
            buckets[next].push(marginal);
        }
        conditionals.push(conditional);
        caches.push(cache);
    }
    Ok(BayesNetFragment { conditionals, caches })
}

fn eliminate_one<R, D>(
    factors: &[LinearFactor],
    frontal: VarIndex,
    rank_of: &R,
    dim_of: &D,
    mode: Factorization,
) -> Result<Eliminated, Error>
where
    R: Fn(VarIndex) -> usize,
    D: Fn(VarIndex) -> usize,
{
    let layout = Layout::build(factors, frontal, rank_of, dim_of);
    match mode {
        Factorization::Cholesky => eliminate_cholesky(factors, &layout),
        Factorization::Qr => eliminate_qr(factors, &layout),
    }
}

// ---------------------------------------------------------------------------
// Cholesky path
// ---------------------------------------------------------------------------

fn eliminate_cholesky(factors: &[LinearFactor], layout: &Layout) -> Result<Eliminated, Error> {
    let n = layout.total;
    let mut info = DMatrix::zeros(n + 1, n + 1);
    for factor in factors {
        match factor {
            LinearFactor::Jacobian(jf) => scatter_jacobian(&mut info, jf, layout),
            LinearFactor::Hessian(hf) => scatter_hessian(&mut info, hf, layout),
        }
    }
    let width = layout.dims[0];
    partial_cholesky(&mut info, width)?;

    let conditional = conditional_from_rows(&info, width, layout);
    let (marginal, cache) = if layout.vars.len() > 1 {
        let rest = n + 1 - width;
        let mut schur = info.view((width, width), (rest, rest)).into_owned();
        for i in 0..rest {
            for j in 0..i {
                schur[(i, j)] = schur[(j, i)];
            }
        }
        let hf = HessianFactor::new(
            layout.vars[1..].to_vec(),
            layout.dims[1..].to_vec(),
            schur,
        );
        (Some(LinearFactor::Hessian(hf.clone())), Some(hf))
    } else {
        (None, None)
    };
    Ok(Eliminated { conditional, marginal, cache })
}

/// In-place upper Cholesky of the leading `width` columns of a full
/// symmetric augmented matrix; only the upper triangle is referenced and
/// updated. On return, rows `0..width` hold `[R | S | d]` and the
/// `width..` upper block holds the Schur complement.
fn partial_cholesky(info: &mut DMatrix<f64>, width: usize) -> Result<(), Error> {
    let n = info.nrows();
    for j in 0..width {
        let pivot = info[(j, j)];
        if pivot <= 0.0 {
            return Err(Error::IndefiniteSystem { column: j });
        }
        let r = pivot.sqrt();
        info[(j, j)] = r;
        for k in (j + 1)..n {
            info[(j, k)] /= r;
        }
        for i in (j + 1)..n {
            let lji = info[(j, i)];
            if lji != 0.0 {
                for k in i..n {
                    info[(i, k)] -= lji * info[(j, k)];
                }
            }
        }
    }
    Ok(())
}

fn scatter_jacobian(info: &mut DMatrix<f64>, jf: &JacobianFactor, layout: &Layout) {
    let rows = jf.rows();
    let mut ab = DMatrix::zeros(rows, layout.total + 1);
    for (i, &key) in jf.keys().iter().enumerate() {
        let pos = layout.position(key);
        ab.view_mut((0, layout.offsets[pos]), (rows, layout.dims[pos]))
            .copy_from(jf.block(i));
    }
    ab.view_mut((0, layout.total), (rows, 1)).copy_from(jf.rhs());
    *info += ab.transpose() * ab;
}

fn scatter_hessian(info: &mut DMatrix<f64>, hf: &HessianFactor, layout: &Layout) {
    let local = hf.info();
    let ln = local.nrows() - 1;
    // offsets of each factor variable inside both layouts
    let mut local_off = Vec::with_capacity(hf.keys().len() + 1);
    let mut global_off = Vec::with_capacity(hf.keys().len() + 1);
    let mut widths = Vec::with_capacity(hf.keys().len() + 1);
    let mut off = 0;
    for (i, &key) in hf.keys().iter().enumerate() {
        let pos = layout.position(key);
        local_off.push(off);
        global_off.push(layout.offsets[pos]);
        widths.push(hf.dims()[i]);
        off += hf.dims()[i];
    }
    debug_assert_eq!(off, ln);
    local_off.push(ln);
    global_off.push(layout.total);
    widths.push(1);
    for a in 0..local_off.len() {
        for b in 0..local_off.len() {
            for i in 0..widths[a] {
                for j in 0..widths[b] {
                    info[(global_off[a] + i, global_off[b] + j)] +=
                        local[(local_off[a] + i, local_off[b] + j)];
                }
            }
        }
    }
}

fn conditional_from_rows(m: &DMatrix<f64>, width: usize, layout: &Layout) -> GaussianConditional {
    let mut rsd = DMatrix::zeros(width, layout.total + 1);
    for i in 0..width {
        for j in i..(layout.total + 1) {
            rsd[(i, j)] = m[(i, j)];
        }
    }
    GaussianConditional::new(
        layout.vars.clone(),
        layout.dims.clone(),
        1,
        rsd,
        DVector::from_element(width, 1.0),
    )
}

// ---------------------------------------------------------------------------
// QR path
// ---------------------------------------------------------------------------

fn eliminate_qr(factors: &[LinearFactor], layout: &Layout) -> Result<Eliminated, Error> {
    // information-form inputs are converted to square-root form first
    let mut jacobians: Vec<JacobianFactor> = Vec::with_capacity(factors.len());
    for factor in factors {
        match factor {
            LinearFactor::Jacobian(jf) => jacobians.push(jf.clone()),
            LinearFactor::Hessian(hf) => jacobians.push(hf.to_jacobian()?),
        }
    }
    let m: usize = jacobians.iter().map(|j| j.rows()).sum();
    let width = layout.dims[0];
    if m < width {
        return Err(Error::IndefiniteSystem { column: 0 });
    }
    let mut ab = DMatrix::zeros(m, layout.total + 1);
    let mut row = 0;
    for jf in &jacobians {
        let rows = jf.rows();
        for (i, &key) in jf.keys().iter().enumerate() {
            let pos = layout.position(key);
            ab.view_mut((row, layout.offsets[pos]), (rows, layout.dims[pos]))
                .copy_from(jf.block(i));
        }
        ab.view_mut((row, layout.total), (rows, 1)).copy_from(jf.rhs());
        row += rows;
    }
    householder_triangularize(&mut ab, layout.total);

    let conditional = conditional_from_rows(&ab, width, layout);
    let (marginal, cache) = if layout.vars.len() > 1 {
        let upper = m.min(layout.total);
        let rows = upper.saturating_sub(width);
        let mut blocks = Vec::with_capacity(layout.vars.len() - 1);
        for pos in 1..layout.vars.len() {
            blocks.push(
                ab.view((width, layout.offsets[pos]), (rows, layout.dims[pos]))
                    .into_owned(),
            );
        }
        let rhs = ab.view((width, layout.total), (rows, 1)).column(0).into_owned();
        let jf = JacobianFactor::new(layout.vars[1..].to_vec(), blocks, rhs);
        let hf = HessianFactor::from_jacobian(&jf);
        (Some(LinearFactor::Jacobian(jf)), Some(hf))
    } else {
        (None, None)
    };
    Ok(Eliminated { conditional, marginal, cache })
}

/// Householder triangularization of the leading `ncols` columns of `a`
/// (the trailing rhs column is transformed but never pivoted on).
fn householder_triangularize(a: &mut DMatrix<f64>, ncols: usize) {
    let m = a.nrows();
    let all = a.ncols();
    for j in 0..ncols.min(m) {
        let mut sigma = 0.0;
        for i in j..m {
            sigma += a[(i, j)] * a[(i, j)];
        }
        let norm = sigma.sqrt();
        if norm == 0.0 {
            continue;
        }
        let alpha = if a[(j, j)] > 0.0 { -norm } else { norm };
        let v0 = a[(j, j)] - alpha;
        let vtv = sigma - a[(j, j)] * a[(j, j)] + v0 * v0;
        if vtv <= f64::MIN_POSITIVE {
            a[(j, j)] = alpha;
            continue;
        }
        for k in (j + 1)..all {
            let mut dot = v0 * a[(j, k)];
            for i in (j + 1)..m {
                dot += a[(i, j)] * a[(i, k)];
            }
            let s = 2.0 * dot / vtv;
            a[(j, k)] -= s * v0;
            for i in (j + 1)..m {
                a[(i, k)] -= s * a[(i, j)];
            }
        }
        a[(j, j)] = alpha;
        for i in (j + 1)..m {
            a[(i, j)] = 0.0;
        }
    }
}
