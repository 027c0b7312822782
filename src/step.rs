//! Nonlinear step controllers
//!
//! After re-elimination the Bayes tree holds a fresh square-root
//! factorization; this module turns it into a step for the nonlinear
//! estimate.
//!
//! - **Gauss–Newton.** `delta = R⁻¹d` by back-substitution from the roots
//!   downward. The *wildfire* rule skips any subtree whose cliques were
//!   not re-eliminated and whose separator values moved by at most the
//!   configured threshold, which is what makes steady-state updates cheap.
//! - **Powell dogleg.** Blends the Gauss–Newton step with the steepest
//!   descent step inside a trust region, evaluating the actual vs.
//!   predicted error reduction and adapting the radius.

#![forbid(unsafe_code)]

use nalgebra::DVector;
use tracing::trace;

use crate::bayestree::BayesTree;
use crate::ordering::{Permuted, VarIndex};
use crate::vector::VectorValues;
use crate::{DoglegParams, TrustAdaptation};

/// Smallest trust radius the search modes will shrink to before giving
/// up on the current update.
const MIN_TRUST_RADIUS: f64 = 1e-10;

/// Back-substitute the tree into `delta`, recomputing only cliques that
/// hold a replaced frontal or whose separator values changed by more than
/// `threshold`. Returns the number of variables refreshed.
pub(crate) fn optimize_wildfire(
    tree: &BayesTree,
    threshold: f64,
    replaced: &[bool],
    delta: &mut Permuted<VectorValues>,
) -> usize {
    let mut changed = vec![false; replaced.len()];
    let mut count = 0;
    for &root in tree.roots() {
        count += recalc(tree, root, threshold, replaced, &mut changed, delta);
    }
    count
}

fn recalc(
    tree: &BayesTree,
    id: crate::bayestree::CliqueId,
    threshold: f64,
    replaced: &[bool],
    changed: &mut [bool],
    delta: &mut Permuted<VectorValues>,
) -> usize {
    let clique = tree.clique(id).expect("live clique");
    let cond = clique.conditional();
    let should = cond
        .frontals()
        .iter()
        .any(|f| replaced.get(f.as_usize()).copied().unwrap_or(false))
        || cond
            .separator()
            .iter()
            .any(|s| changed.get(s.as_usize()).copied().unwrap_or(false));
    if !should {
        // unchanged separator, no replaced frontal: the whole subtree
        // keeps its previous delta
        return 0;
    }
    let solution = cond.solve(|k| delta.at(k.as_usize()).clone());
    let mut count = 0;
    let mut off = 0;
    for (pos, &f) in cond.frontals().iter().enumerate() {
        let w = cond.dims()[pos];
        let block = solution.rows(off, w).into_owned();
        let prev = delta.at(f.as_usize());
        let moved = block
            .iter()
            .zip(prev.iter())
            .fold(0.0_f64, |m, (a, b)| m.max((a - b).abs()));
        if moved > threshold {
            changed[f.as_usize()] = true;
        }
        delta.set(f.as_usize(), block);
        off += w;
        count += 1;
    }
    for &child in clique.children() {
        count += recalc(tree, child, threshold, replaced, changed, delta);
    }
    count
}

/// Gradient of the linearized system at `x = 0`, one block per logical
/// index: the sum-scatter of every clique's gradient contribution.
pub(crate) fn gradient_at_zero(tree: &BayesTree, dims: &[usize]) -> Vec<DVector<f64>> {
    let mut out: Vec<DVector<f64>> = dims.iter().map(|&d| DVector::zeros(d)).collect();
    for (_, clique) in tree.cliques() {
        let cond = clique.conditional();
        let grad = clique.gradient_contribution();
        let mut off = 0;
        for (pos, &key) in cond.keys().iter().enumerate() {
            let w = cond.dims()[pos];
            out[key.as_usize()] += grad.rows(off, w);
            off += w;
        }
    }
    out
}

/// Fill `rg` with the steepest-descent (Cauchy) step
/// `δ_sd = −α·g, α = ‖g‖²/‖Jg‖²`. Returns `α`.
pub(crate) fn steepest_descent_into(
    tree: &BayesTree,
    rg: &mut Permuted<VectorValues>,
) -> f64 {
    let n = rg.container().len();
    let dims: Vec<usize> = (0..n).map(|i| rg.at(i).len()).collect();
    let g = gradient_at_zero(tree, &dims);
    let g_sq: f64 = g.iter().map(|b| b.norm_squared()).sum();
    if g_sq == 0.0 {
        for i in 0..n {
            let zero = DVector::zeros(rg.at(i).len());
            rg.set(i, zero);
        }
        return 0.0;
    }
    let jg_sq: f64 = tree
        .cliques()
        .map(|(_, c)| {
            c.conditional()
                .multiply(|k| g[k.as_usize()].clone())
                .norm_squared()
        })
        .sum();
    let alpha = g_sq / jg_sq;
    for (i, gi) in g.into_iter().enumerate() {
        rg.set(i, gi * (-alpha));
    }
    alpha
}

/// `½Σ‖[R S]x − d‖²` over all cliques, the linearized system error at
/// step `x`.
pub(crate) fn tree_linear_error<F: Fn(VarIndex) -> DVector<f64>>(tree: &BayesTree, x: F) -> f64 {
    tree.cliques().map(|(_, c)| c.conditional().linear_error(&x)).sum()
}

/// The linearized system error at the zero step.
pub(crate) fn tree_linear_error_at_zero(tree: &BayesTree) -> f64 {
    tree.cliques()
        .map(|(_, c)| 0.5 * c.conditional().rhs().norm_squared())
        .sum()
}

/// The classic dogleg blend: Gauss–Newton inside the region, scaled
/// steepest descent outside it, otherwise the boundary point on the
/// segment between them. The flag reports whether the step lies on the
/// boundary.
pub(crate) fn dogleg_blend(
    radius: f64,
    newton: &VectorValues,
    descent: &VectorValues,
) -> (VectorValues, bool) {
    let gn_norm = newton.norm();
    if gn_norm <= radius {
        return (newton.clone(), false);
    }
    let sd_norm = descent.norm();
    if sd_norm >= radius {
        let mut out = descent.clone();
        out.scale(radius / sd_norm);
        return (out, true);
    }
    // ‖δ_sd + t(δ_gn − δ_sd)‖ = radius, t ∈ (0, 1)
    let mut diff = newton.clone();
    diff.axpy(-1.0, descent);
    let a = diff.squared_norm();
    let b = 2.0 * descent.dot(&diff);
    let c = descent.squared_norm() - radius * radius;
    let t = (-b + (b * b - 4.0 * a * c).sqrt()) / (2.0 * a);
    let mut out = descent.clone();
    out.axpy(t, &diff);
    (out, true)
}

/// Outcome of one dogleg pass.
pub(crate) struct DoglegOutcome {
    pub accepted: bool,
    pub iterations: usize,
}

/// Run the dogleg controller: blend, evaluate the gain ratio `ρ`, adapt
/// the trust radius, and write the accepted step into `delta` (leaving it
/// untouched when every candidate is rejected).
///
/// `nonlinear_error` evaluates the factor graph at the estimate retracted
/// by the candidate step; `error_at_zero` is the same evaluation at the
/// current linearization point.
pub(crate) fn dogleg_step(
    tree: &BayesTree,
    params: &DoglegParams,
    radius: &mut f64,
    newton: &Permuted<VectorValues>,
    descent: &Permuted<VectorValues>,
    delta: &mut Permuted<VectorValues>,
    nonlinear_error: &dyn Fn(&Permuted<VectorValues>) -> f64,
    error_at_zero: f64,
) -> DoglegOutcome {
    let cap = params.initial_trust_radius * DoglegParams::GROWTH_CAP;
    let lin_zero = tree_linear_error_at_zero(tree);
    let mut iterations = 0;
    loop {
        iterations += 1;
        let (candidate, hit_boundary) =
            dogleg_blend(*radius, newton.container(), descent.container());
        let view = Permuted::with_permutation(delta.permutation().clone(), candidate);
        let predicted = lin_zero - tree_linear_error(tree, |k| view.at(k.as_usize()).clone());
        if predicted <= 1e-15 {
            // converged: the candidate is (numerically) the zero step
            *delta.container_mut() = view.into_container();
            return DoglegOutcome { accepted: true, iterations };
        }
        let actual = error_at_zero - nonlinear_error(&view);
        let rho = actual / predicted;
        trace!(rho, radius = *radius, hit_boundary, "dogleg candidate");

        if rho < 0.25 {
            *radius *= 0.25;
        } else if rho > 0.75 && hit_boundary {
            let grow = !matches!(params.adaptation, TrustAdaptation::SearchReduceOnly);
            if grow {
                *radius = (*radius * 2.0).min(cap);
            }
        }
        if rho > 0.0 {
            *delta.container_mut() = view.into_container();
            return DoglegOutcome { accepted: true, iterations };
        }
        // rejected: revert (delta keeps its previous value)
        match params.adaptation {
            TrustAdaptation::OneStepPerIteration => {
                return DoglegOutcome { accepted: false, iterations };
            }
            TrustAdaptation::SearchEachIteration | TrustAdaptation::SearchReduceOnly => {
                if *radius < MIN_TRUST_RADIUS {
                    return DoglegOutcome { accepted: false, iterations };
                }
            }
        }
    }
}
