//! The incremental updater
//!
//! [`Smoother`] maintains the MAP estimate of a growing nonlinear factor
//! graph by keeping a Bayes tree in sync with it. Each [`Smoother::update`]
//! call runs one synchronous transaction:
//!
//! 1. **AddVariables** — fresh keys get fresh indices; the three running
//!    delta views and the `replaced` flags extend in lockstep.
//! 2. **AddFactors / RemoveFactors** — slots assigned, removals marked.
//! 3. **Mark** — affected = keys of new factors ∪ keys of removed factors
//!    ∪ relinearization candidates (L∞ delta above threshold) expanded to
//!    every clique involving them.
//! 4. **Detach** — the affected top of the tree (marked cliques plus all
//!    ancestors) is computed; its orphaned subtrees keep summarizing the
//!    rest of the world through their cached separator factors.
//! 5. **Re-eliminate** — the factors contained in the affected set are
//!    relinearized at the current linearization point and eliminated
//!    together with the orphan caches, with the affected variables moved
//!    to the top of the index space (constrained-last keys at the very
//!    end, grouped ascending).
//! 6. **Splice** — the replacement subtree is attached and the orphans
//!    hung back under it.
//! 7. **Step** — the configured controller turns the fresh factorization
//!    into a step and the estimate follows it.
//!
//! All fallible work (validation, relinearization, elimination) happens
//! before any tree mutation: a failed call leaves the engine observably
//! unchanged.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, trace};

use crate::bayestree::{BayesTree, Clique};
use crate::eliminate::eliminate_sequential;
use crate::factor::{Factor, FactorCache, Slot};
use crate::linear::{JacobianFactor, LinearFactor};
use crate::ordering::{Ordering, Permutation, Permuted, VarIndex};
use crate::step;
use crate::values::{Value, Values};
use crate::vector::VectorValues;
use crate::{Error, Key, Optimization, SmootherParams};

/// What one `update` call did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateResult {
    /// Slot assigned to each new factor, in input order.
    pub new_factor_slots: Vec<Slot>,
    /// Variables whose cliques were re-eliminated.
    pub variables_reeliminated: usize,
    /// Variables whose linearization point absorbed their delta.
    pub variables_relinearized: usize,
    /// Cliques in the tree after the update.
    pub cliques: usize,
    /// Factors relinearized during re-elimination (new factors included).
    pub factors_recalculated: usize,
    /// Nonlinear error before the update, when requested.
    pub error_before: Option<f64>,
    /// Nonlinear error after the update, when requested.
    pub error_after: Option<f64>,
}

/// Undo record for a variable whose linearization point was moved
/// provisionally during an update.
struct RelinUndo {
    key: Key,
    value: Box<dyn Value>,
    rows: [DVector<f64>; 3],
}

/// The incremental smoothing-and-mapping engine.
#[derive(Clone, Debug)]
pub struct Smoother {
    params: SmootherParams,
    factors: FactorCache,
    theta: Values,
    ordering: Ordering,
    tree: BayesTree,
    delta: Permuted<VectorValues>,
    delta_newton: Permuted<VectorValues>,
    delta_rg: Permuted<VectorValues>,
    replaced: Vec<bool>,
    update_count: u64,
    trust_radius: f64,
}

impl Default for Smoother {
    fn default() -> Self {
        Self::new(SmootherParams::default())
    }
}

impl Smoother {
    /// A fresh engine with the given configuration.
    pub fn new(params: SmootherParams) -> Self {
        let trust_radius = match &params.optimization {
            Optimization::Dogleg(d) => d.initial_trust_radius,
            Optimization::GaussNewton(_) => 0.0,
        };
        Self {
            params,
            factors: FactorCache::new(),
            theta: Values::new(),
            ordering: Ordering::new(),
            tree: BayesTree::new(),
            delta: Permuted::new(VectorValues::new()),
            delta_newton: Permuted::new(VectorValues::new()),
            delta_rg: Permuted::new(VectorValues::new()),
            replaced: Vec::new(),
            update_count: 0,
            trust_radius,
        }
    }

    /// Add `new_factors` and `new_values`, nothing removed or constrained.
    pub fn update_simple(
        &mut self,
        new_factors: Vec<Arc<dyn Factor>>,
        new_values: Values,
    ) -> Result<UpdateResult, Error> {
        self.update(new_factors, new_values, &[], &[])
    }

    /// One incremental update: add factors and variables, drop the given
    /// slots, re-eliminate the affected part of the tree, and step the
    /// estimate.
    ///
    /// `constrained_last` forces the listed keys to the end of the
    /// elimination order; higher group numbers go later. Listed keys are
    /// pulled into the re-eliminated set.
    pub fn update(
        &mut self,
        new_factors: Vec<Arc<dyn Factor>>,
        new_values: Values,
        remove_slots: &[Slot],
        constrained_last: &[(Key, usize)],
    ) -> Result<UpdateResult, Error> {
        // ---- validation: nothing is mutated before this block passes ----
        for key in new_values.keys() {
            if self.theta.contains(key) {
                return Err(Error::DuplicateKey { key });
            }
        }
        for &slot in remove_slots {
            self.factors.get(slot).ok_or(Error::UnknownSlot { slot })?;
        }
        for &(key, _) in constrained_last {
            if !self.theta.contains(key) && !new_values.contains(key) {
                return Err(Error::DuplicateKey { key });
            }
        }
        for factor in &new_factors {
            debug_assert!(!factor.keys().is_empty(), "factor with no keys");
            for &key in factor.keys() {
                if !self.theta.contains(key) && !new_values.contains(key) {
                    return Err(Error::DuplicateKey { key });
                }
            }
        }

        let error_before = self
            .params
            .evaluate_nonlinear_error
            .then(|| self.factors.error(&self.calculate_estimate()));

        // ---- step 1: add variables, extending the delta views in lockstep
        let added_keys: Vec<Key> = new_values.keys().collect();
        for (key, value) in new_values.iter() {
            let dim = value.dim();
            self.theta.insert(key, value.boxed_clone())?;
            self.ordering.insert(key)?;
            self.delta.container_mut().push_zero(dim);
            self.delta_newton.container_mut().push_zero(dim);
            self.delta_rg.container_mut().push_zero(dim);
            self.replaced.push(false);
        }

        // ---- steps 2-4: mark affected keys ----
        let mut marked: BTreeSet<Key> = BTreeSet::new();
        for factor in &new_factors {
            marked.extend(factor.keys().iter().copied());
        }
        for &slot in remove_slots {
            let factor = self.factors.get(slot).expect("validated slot");
            marked.extend(factor.keys().iter().copied());
        }
        for &(key, _) in constrained_last {
            marked.insert(key);
        }

        // ---- step 5: relinearization check ----
        let relin_keys = self.gather_relinearize_keys();
        if !relin_keys.is_empty() {
            let relin_idx: HashSet<VarIndex> = relin_keys
                .iter()
                .map(|&k| self.ordering.index_of(k).expect("known key"))
                .collect();
            marked.extend(relin_keys.iter().copied());
            // cliques holding a relinearized variable anywhere were built
            // from stale Jacobians and must be re-eliminated too
            for index in self.tree.find_all(&relin_idx) {
                marked.insert(self.ordering.key_of(index).expect("tree label"));
            }
        }

        if marked.is_empty() {
            // nothing structural: variables without factors may have been
            // added, the tree stands as-is
            self.update_count += 1;
            let error_after = error_before;
            return Ok(UpdateResult {
                cliques: self.tree.clique_count(),
                error_before,
                error_after,
                ..UpdateResult::default()
            });
        }

        // ---- step 6: affected top of the tree ----
        let marked_idx: Vec<VarIndex> = marked
            .iter()
            .map(|&k| self.ordering.index_of(k).expect("known key"))
            .collect();
        let top = self.tree.top_of(marked_idx.iter().copied());
        let mut affected: BTreeSet<VarIndex> = top.frontals.iter().copied().collect();
        affected.extend(marked_idx.iter().copied());

        // ---- relinearization: the linearization point absorbs the delta
        let mut relin_undo: Vec<RelinUndo> = Vec::new();
        for &key in &relin_keys {
            let index = self.ordering.index_of(key).expect("known key").as_usize();
            let step_vec = self.delta.at(index).clone();
            if step_vec.iter().all(|v| *v == 0.0) {
                continue;
            }
            let value = self.theta.at_dyn(key).expect("estimate closure").boxed_clone();
            let rows = [
                self.delta.at(index).clone(),
                self.delta_newton.at(index).clone(),
                self.delta_rg.at(index).clone(),
            ];
            relin_undo.push(RelinUndo { key, value, rows });
            self.theta.retract_key_in_place(key, &step_vec);
            for view in [&mut self.delta, &mut self.delta_newton, &mut self.delta_rg] {
                let phys = view.map_index(index);
                view.container_mut().at_mut(phys).fill(0.0);
            }
        }

        // ---- involved factors: fully contained in the affected set ----
        let affected_keys: HashSet<Key> = affected
            .iter()
            .map(|&i| self.ordering.key_of(i).expect("known index"))
            .collect();
        let removed: BTreeSet<Slot> = remove_slots.iter().copied().collect();
        let mut involved: Vec<Slot> = Vec::new();
        for slot in self.factors.touching_any(affected_keys.iter().copied()) {
            if removed.contains(&slot) {
                continue;
            }
            let factor = self.factors.get(slot).expect("live slot");
            if factor.keys().iter().all(|k| affected_keys.contains(k)) {
                involved.push(slot);
            }
        }

        // ---- linearize everything that enters the elimination ----
        let linearized: Result<Vec<JacobianFactor>, Error> = involved
            .iter()
            .map(|&slot| {
                let factor = self.factors.get(slot).expect("live slot").clone();
                self.linearize_checked(&factor)
            })
            .chain(new_factors.iter().map(|f| self.linearize_checked(f)))
            .collect();
        let linearized = match linearized {
            Ok(l) => l,
            Err(e) => {
                self.rollback(&added_keys, relin_undo);
                return Err(e);
            }
        };
        let factors_recalculated = linearized.len();

        // ---- permutation: affected variables move to the top ----
        let (perm, inv) = self.affected_to_top(&affected, constrained_last);
        let relabel = |j: VarIndex| VarIndex(inv.get(j.as_usize()));

        let mut workspace: Vec<LinearFactor> = linearized
            .into_iter()
            .map(|mut jf| {
                jf.relabel(relabel);
                LinearFactor::Jacobian(jf)
            })
            .collect();
        for &orphan in &top.orphans {
            let mut cache = self
                .tree
                .clique(orphan)
                .expect("live orphan")
                .cached_factor()
                .expect("non-root orphan carries a cache")
                .clone();
            cache.relabel(relabel);
            workspace.push(LinearFactor::Hessian(cache));
        }

        // ---- re-eliminate, still without touching the tree ----
        let n = self.ordering.len();
        let affected_count = affected.len();
        let order: Vec<VarIndex> = ((n - affected_count)..n).map(VarIndex).collect();
        let dim_of = |v: VarIndex| {
            let old = perm.get(v.as_usize());
            self.delta.container().dim(self.delta.map_index(old))
        };
        let fragment =
            match eliminate_sequential(workspace, &order, dim_of, self.params.factorization) {
                Ok(f) => f,
                Err(e) => {
                    self.rollback(&added_keys, relin_undo);
                    return Err(e);
                }
            };

        // ---- commit ----
        let mut new_factor_slots = Vec::with_capacity(new_factors.len());
        for factor in new_factors {
            new_factor_slots.push(self.factors.add(factor));
        }
        for &slot in remove_slots {
            self.factors.remove(slot).expect("validated slot");
        }
        #[cfg(debug_assertions)]
        self.factors.check_index();

        self.tree.detach_top(&top);
        self.ordering.permute_in_place(&perm);
        self.delta.permute(&perm);
        self.delta_newton.permute(&perm);
        self.delta_rg.permute(&perm);
        let old_replaced = std::mem::take(&mut self.replaced);
        self.replaced = (0..n).map(|i| old_replaced[perm.get(i)]).collect();
        self.tree.permute_with_inverse(&inv);

        self.tree.extend_with_fragment(fragment);
        self.tree.reattach_orphans(&top.orphans);
        for flag in &mut self.replaced[(n - affected_count)..n] {
            *flag = true;
        }

        debug!(
            reeliminated = affected_count,
            relinearized = relin_keys.len(),
            recalculated = factors_recalculated,
            cliques = self.tree.clique_count(),
            "update committed"
        );

        // ---- step controller ----
        self.run_step_controller();

        self.update_count += 1;
        let error_after = self
            .params
            .evaluate_nonlinear_error
            .then(|| self.factors.error(&self.calculate_estimate()));
        Ok(UpdateResult {
            new_factor_slots,
            variables_reeliminated: affected_count,
            variables_relinearized: relin_keys.len(),
            cliques: self.tree.clique_count(),
            factors_recalculated,
            error_before,
            error_after,
        })
    }

    /// Keys whose accumulated delta exceeds the relinearization
    /// threshold, when a check is due this round.
    fn gather_relinearize_keys(&self) -> Vec<Key> {
        let params = &self.params;
        let due = params.enable_relinearization
            && params.relinearize_skip > 0
            && self.update_count % params.relinearize_skip == 0
            && !self.tree.is_empty();
        if !due {
            return Vec::new();
        }
        let mut keys = Vec::new();
        for key in self.ordering.keys() {
            let index = self.ordering.index_of(key).expect("own key").as_usize();
            if self.delta.max_abs(index) > params.relinearize_threshold {
                keys.push(key);
            }
        }
        trace!(
            count = keys.len(),
            sample = ?keys.first().map(|&k| (params.key_formatter)(k)),
            "relinearization candidates"
        );
        keys
    }

    /// Build the permutation that compacts unaffected variables downward
    /// (relative order preserved) and moves the affected set to the top,
    /// unconstrained first, then constrained keys by ascending group.
    fn affected_to_top(
        &self,
        affected: &BTreeSet<VarIndex>,
        constrained_last: &[(Key, usize)],
    ) -> (Permutation, Permutation) {
        let n = self.ordering.len();
        let groups: BTreeMap<VarIndex, usize> = constrained_last
            .iter()
            .map(|&(key, group)| (self.ordering.index_of(key).expect("validated key"), group))
            .collect();
        let mut forward = Vec::with_capacity(n);
        for old in 0..n {
            if !affected.contains(&VarIndex(old)) {
                forward.push(old);
            }
        }
        for &index in affected.iter() {
            if !groups.contains_key(&index) {
                forward.push(index.as_usize());
            }
        }
        let mut constrained: Vec<(usize, VarIndex)> = affected
            .iter()
            .filter_map(|&index| groups.get(&index).map(|&g| (g, index)))
            .collect();
        constrained.sort_by_key(|&(group, index)| (group, index));
        forward.extend(constrained.into_iter().map(|(_, index)| index.as_usize()));
        let perm = Permutation::from_forward(forward);
        let inv = perm.inverse();
        (perm, inv)
    }

    /// Linearize `factor` at the current linearization point and verify
    /// its block widths against the variables' dims.
    fn linearize_checked(&self, factor: &Arc<dyn Factor>) -> Result<JacobianFactor, Error> {
        let jf = factor.linearize(&self.theta, &self.ordering)?;
        for (pos, &index) in jf.keys().iter().enumerate() {
            let key = self.ordering.key_of(index).expect("labeled with a known index");
            let expected = self.theta.dim_of(key).expect("estimate closure");
            let got = jf.block(pos).ncols();
            if expected != got {
                return Err(Error::InconsistentDims { key, expected, got });
            }
        }
        Ok(jf)
    }

    /// Undo the provisional mutations of a failed update: restore moved
    /// linearization points and their delta rows, then drop the freshly
    /// appended variables.
    fn rollback(&mut self, added_keys: &[Key], undo: Vec<RelinUndo>) {
        for RelinUndo { key, value, rows } in undo {
            self.theta.update(key, value);
            let index = self.ordering.index_of(key).expect("known key").as_usize();
            let [d, dn, drg] = rows;
            self.delta.set(index, d);
            self.delta_newton.set(index, dn);
            self.delta_rg.set(index, drg);
        }
        for &key in added_keys {
            self.theta.remove(key);
        }
        self.ordering.truncate(added_keys.len());
        self.delta.container_mut().truncate_last(added_keys.len());
        self.delta_newton.container_mut().truncate_last(added_keys.len());
        self.delta_rg.container_mut().truncate_last(added_keys.len());
        self.replaced.truncate(self.replaced.len() - added_keys.len());
    }

    /// Run the configured step controller over the updated tree and clear
    /// the `replaced` flags it consumed.
    fn run_step_controller(&mut self) {
        match self.params.optimization {
            Optimization::GaussNewton(gn) => {
                let refreshed = step::optimize_wildfire(
                    &self.tree,
                    gn.wildfire_threshold,
                    &self.replaced,
                    &mut self.delta,
                );
                trace!(refreshed, "gauss-newton back-substitution");
            }
            Optimization::Dogleg(dl) => {
                step::optimize_wildfire(&self.tree, 0.0, &self.replaced, &mut self.delta_newton);
                let alpha = step::steepest_descent_into(&self.tree, &mut self.delta_rg);
                let error_at_zero = self.factors.error(&self.theta);
                let theta = &self.theta;
                let ordering = &self.ordering;
                let factors = &self.factors;
                let evaluate = |candidate: &Permuted<VectorValues>| {
                    factors.error(&theta.retract(candidate, ordering))
                };
                let outcome = step::dogleg_step(
                    &self.tree,
                    &dl,
                    &mut self.trust_radius,
                    &self.delta_newton,
                    &self.delta_rg,
                    &mut self.delta,
                    &evaluate,
                    error_at_zero,
                );
                if dl.verbose {
                    debug!(
                        alpha,
                        radius = self.trust_radius,
                        accepted = outcome.accepted,
                        iterations = outcome.iterations,
                        "dogleg step"
                    );
                }
            }
        }
        for flag in &mut self.replaced {
            *flag = false;
        }
    }

    // ------------------------------------------------------------------
    // Read-only surface
    // ------------------------------------------------------------------

    /// Engine configuration.
    pub fn params(&self) -> &SmootherParams {
        &self.params
    }

    /// The current nonlinear estimate: the linearization point retracted
    /// along the most recent accepted step.
    pub fn calculate_estimate(&self) -> Values {
        self.theta.retract(&self.delta, &self.ordering)
    }

    /// Single-key variant of [`Smoother::calculate_estimate`].
    pub fn calculate_estimate_key(&self, key: Key) -> Option<Box<dyn Value>> {
        let value = self.theta.at_dyn(key)?;
        match self.ordering.index_of(key) {
            Some(index) if index.as_usize() < self.delta.container().len() => {
                Some(value.retract(self.delta.at(index.as_usize())))
            }
            _ => Some(value.boxed_clone()),
        }
    }

    /// Read-only view of the live factors by slot.
    pub fn factors_unsafe(&self) -> &FactorCache {
        &self.factors
    }

    /// The current key ↔ index mapping.
    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// The linearization point (the estimate *before* the running delta).
    pub fn linearization_point(&self) -> &Values {
        &self.theta
    }

    /// Read-only walk of the tree's cliques.
    pub fn cliques(&self) -> impl Iterator<Item = &Clique> {
        self.tree.cliques().map(|(_, c)| c)
    }

    /// The Bayes tree itself.
    pub fn bayes_tree(&self) -> &BayesTree {
        &self.tree
    }

    /// The running Gauss–Newton (or blended) delta view.
    pub fn delta(&self) -> &Permuted<VectorValues> {
        &self.delta
    }

    /// Gradient of the linearized system at the zero step, one block per
    /// index.
    pub fn gradient_at_zero(&self) -> Vec<DVector<f64>> {
        let dims: Vec<usize> = (0..self.ordering.len())
            .map(|i| self.delta.at(i).len())
            .collect();
        step::gradient_at_zero(&self.tree, &dims)
    }

    /// Sum of live factor errors at the current estimate.
    pub fn nonlinear_error(&self) -> f64 {
        self.factors.error(&self.calculate_estimate())
    }
}
