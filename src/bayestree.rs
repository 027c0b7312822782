//! The Bayes tree
//!
//! A directed tree of cliques, each holding a Gaussian conditional
//! `p(F | S)` and the cached information-form marginal its subtree passed
//! upward when it was eliminated. The tree is the square-root information
//! factorization of the current linearized graph: the product of all
//! clique conditionals equals the result of eliminating that graph under
//! the current ordering.
//!
//! ## Representation
//!
//! Cliques live in a slab arena addressed by [`CliqueId`]; parent links
//! are ids, children are owned id lists, so a deep copy of the tree is a
//! plain `clone()` and no ownership cycle exists. The `nodes` map sends
//! every frontal index to its clique.
//!
//! ## Incremental surgery
//!
//! [`BayesTree::top_of`] computes the sub-tree that must be re-eliminated
//! for a marked variable set (their cliques plus all ancestors), along
//! with the orphaned subtrees hanging below it. The caller eliminates a
//! replacement fragment, detaches the old top, splices the fragment in
//! with [`BayesTree::extend_with_fragment`], and hangs the orphans back
//! under the new top.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use nalgebra::DVector;

use crate::eliminate::BayesNetFragment;
use crate::linear::{GaussianConditional, HessianFactor};
use crate::ordering::{Permutation, VarIndex};

/// Arena address of a clique.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CliqueId(usize);

/// One clique: conditional, cached separator marginal, gradient
/// contribution, and tree links.
#[derive(Clone, Debug)]
pub struct Clique {
    conditional: GaussianConditional,
    cached: Option<HessianFactor>,
    gradient: DVector<f64>,
    parent: Option<CliqueId>,
    children: Vec<CliqueId>,
}

impl Clique {
    /// The conditional `p(F | S)`.
    #[inline]
    pub fn conditional(&self) -> &GaussianConditional {
        &self.conditional
    }

    /// The cached marginal on the separator; empty at a root.
    #[inline]
    pub fn cached_factor(&self) -> Option<&HessianFactor> {
        self.cached.as_ref()
    }

    /// Gradient of the clique's local quadratic at the origin,
    /// `−[R S]ᵀd`, frontal rows then separator rows.
    #[inline]
    pub fn gradient_contribution(&self) -> &DVector<f64> {
        &self.gradient
    }

    /// Parent clique, if any.
    #[inline]
    pub fn parent(&self) -> Option<CliqueId> {
        self.parent
    }

    /// Child cliques.
    #[inline]
    pub fn children(&self) -> &[CliqueId] {
        &self.children
    }
}

/// The detached-top description computed by [`BayesTree::top_of`].
#[derive(Clone, Debug, Default)]
pub struct TopInfo {
    /// Cliques to be destroyed and re-eliminated.
    pub top: Vec<CliqueId>,
    /// Subtrees whose parent lies in `top`.
    pub orphans: Vec<CliqueId>,
    /// Union of the frontal indices of `top`.
    pub frontals: Vec<VarIndex>,
}

/// Directed clique tree with arena storage.
#[derive(Clone, Debug, Default)]
pub struct BayesTree {
    arena: Vec<Option<Clique>>,
    free: Vec<usize>,
    roots: Vec<CliqueId>,
    nodes: HashMap<VarIndex, CliqueId>,
}

impl BayesTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cliques.
    pub fn clique_count(&self) -> usize {
        self.arena.iter().filter(|c| c.is_some()).count()
    }

    /// True when no clique exists.
    pub fn is_empty(&self) -> bool {
        self.clique_count() == 0
    }

    /// The clique at `id`, if live.
    #[inline]
    pub fn clique(&self, id: CliqueId) -> Option<&Clique> {
        self.arena.get(id.0).and_then(|c| c.as_ref())
    }

    /// Root cliques (one per connected component).
    #[inline]
    pub fn roots(&self) -> &[CliqueId] {
        &self.roots
    }

    /// The clique whose frontal set contains `index`.
    #[inline]
    pub fn clique_containing(&self, index: VarIndex) -> Option<CliqueId> {
        self.nodes.get(&index).copied()
    }

    /// Read-only walk of all live cliques.
    pub fn cliques(&self) -> impl Iterator<Item = (CliqueId, &Clique)> {
        self.arena
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (CliqueId(i), c)))
    }

    fn alloc(&mut self, clique: Clique) -> CliqueId {
        if let Some(slot) = self.free.pop() {
            self.arena[slot] = Some(clique);
            CliqueId(slot)
        } else {
            self.arena.push(Some(clique));
            CliqueId(self.arena.len() - 1)
        }
    }

    fn clique_mut(&mut self, id: CliqueId) -> &mut Clique {
        self.arena[id.0].as_mut().expect("live clique")
    }

    /// Splice an eliminated fragment into the tree, creating cliques in
    /// reverse elimination order and merging a conditional into its
    /// parent clique when its separator equals the parent's full key set.
    /// Returns the cliques created or grown.
    pub fn extend_with_fragment(&mut self, fragment: BayesNetFragment) -> Vec<CliqueId> {
        let BayesNetFragment { conditionals, caches } = fragment;
        let mut touched: Vec<CliqueId> = Vec::new();
        for (conditional, cache) in conditionals.into_iter().zip(caches).rev() {
            let frontal = conditional.frontals()[0];
            debug_assert_eq!(conditional.nr_frontals(), 1);
            if conditional.separator().is_empty() {
                let id = self.alloc(Clique {
                    conditional,
                    cached: cache,
                    gradient: DVector::zeros(0),
                    parent: None,
                    children: Vec::new(),
                });
                self.roots.push(id);
                self.nodes.insert(frontal, id);
                touched.push(id);
                continue;
            }
            let anchor = conditional.separator()[0];
            let parent_id = *self
                .nodes
                .get(&anchor)
                .expect("separator variable already inserted");
            let parent_keys = self.clique(parent_id).expect("live parent").conditional.keys();
            if conditional.separator() == parent_keys {
                // the conditional extends the parent clique's frontal set
                let merged = GaussianConditional::combine(
                    &conditional,
                    &self.clique(parent_id).expect("live parent").conditional,
                );
                self.clique_mut(parent_id).conditional = merged;
                self.nodes.insert(frontal, parent_id);
                if !touched.contains(&parent_id) {
                    touched.push(parent_id);
                }
            } else {
                let id = self.alloc(Clique {
                    conditional,
                    cached: cache,
                    gradient: DVector::zeros(0),
                    parent: Some(parent_id),
                    children: Vec::new(),
                });
                self.clique_mut(parent_id).children.push(id);
                self.nodes.insert(frontal, id);
                touched.push(id);
            }
        }
        for &id in &touched {
            let gradient = self.clique(id).expect("live clique").conditional.gradient_contribution();
            self.clique_mut(id).gradient = gradient;
        }
        #[cfg(debug_assertions)]
        self.check_invariants();
        touched
    }

    /// The affected top for a marked index set: every clique whose
    /// frontals intersect `marked`, plus every ancestor on the path to a
    /// root, plus the orphaned subtrees left behind.
    pub fn top_of(&self, marked: impl IntoIterator<Item = VarIndex>) -> TopInfo {
        let mut top: HashSet<CliqueId> = HashSet::new();
        for index in marked {
            let mut cursor = self.nodes.get(&index).copied();
            while let Some(id) = cursor {
                if !top.insert(id) {
                    break;
                }
                cursor = self.clique(id).and_then(|c| c.parent());
            }
        }
        let mut orphans = Vec::new();
        let mut frontals = Vec::new();
        for &id in &top {
            let clique = self.clique(id).expect("live clique");
            frontals.extend_from_slice(clique.conditional.frontals());
            for &child in clique.children() {
                if !top.contains(&child) {
                    orphans.push(child);
                }
            }
        }
        let mut top: Vec<CliqueId> = top.into_iter().collect();
        top.sort();
        orphans.sort();
        frontals.sort();
        TopInfo { top, orphans, frontals }
    }

    /// Frontal indices of every clique whose conditional involves any
    /// marked index, frontal or separator. Used to expand a
    /// relinearization set: such cliques were built from Jacobians at the
    /// old linearization point and must be re-eliminated.
    pub fn find_all(&self, marked: &HashSet<VarIndex>) -> HashSet<VarIndex> {
        let mut out = HashSet::new();
        for (_, clique) in self.cliques() {
            if clique.conditional.keys().iter().any(|k| marked.contains(k)) {
                out.extend(clique.conditional.frontals().iter().copied());
            }
        }
        out
    }

    /// Destroy the cliques of `info.top` and sever its orphans, leaving
    /// them detached (alive in the arena, absent from `roots`).
    pub fn detach_top(&mut self, info: &TopInfo) {
        for &orphan in &info.orphans {
            self.clique_mut(orphan).parent = None;
        }
        let top: HashSet<CliqueId> = info.top.iter().copied().collect();
        for &id in &info.top {
            let clique = self.arena[id.0].take().expect("live clique");
            self.free.push(id.0);
            for frontal in clique.conditional.frontals() {
                self.nodes.remove(frontal);
            }
            debug_assert!(
                clique.parent().map_or(true, |p| top.contains(&p)),
                "top must be upward closed"
            );
        }
        self.roots.retain(|r| !top.contains(r));
    }

    /// Hang detached orphans back under the clique where the lowest
    /// separator index is frontal.
    pub fn reattach_orphans(&mut self, orphans: &[CliqueId]) {
        for &orphan in orphans {
            let anchor = *self
                .clique(orphan)
                .expect("live orphan")
                .conditional
                .separator()
                .iter()
                .min()
                .expect("orphan with empty separator");
            let parent_id = *self.nodes.get(&anchor).expect("anchor re-eliminated");
            self.clique_mut(parent_id).children.push(orphan);
            self.clique_mut(orphan).parent = Some(parent_id);
        }
        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    /// Rewrite every index label in every conditional and cached factor
    /// through `inv` (the inverse of the ordering permutation just
    /// applied). Structure is preserved; only labels change.
    pub fn permute_with_inverse(&mut self, inv: &Permutation) {
        for slot in self.arena.iter_mut() {
            if let Some(clique) = slot {
                clique.conditional.relabel(|j| VarIndex(inv.get(j.as_usize())));
                if let Some(cached) = &mut clique.cached {
                    cached.relabel(|j| VarIndex(inv.get(j.as_usize())));
                }
            }
        }
        let relabeled: HashMap<VarIndex, CliqueId> = self
            .nodes
            .iter()
            .map(|(&j, &id)| (VarIndex(inv.get(j.as_usize())), id))
            .collect();
        self.nodes = relabeled;
    }

    /// Structural invariants, verified in debug builds.
    #[cfg(debug_assertions)]
    pub(crate) fn check_invariants(&self) {
        let mut seen_frontals: HashSet<VarIndex> = HashSet::new();
        for (id, clique) in self.cliques() {
            for &f in clique.conditional.frontals() {
                assert!(seen_frontals.insert(f), "frontal sets must be disjoint");
                assert_eq!(self.nodes.get(&f), Some(&id), "nodes map out of sync");
            }
            for &child in clique.children() {
                assert_eq!(
                    self.clique(child).expect("live child").parent(),
                    Some(id),
                    "child/parent links out of sync"
                );
            }
            // a clique attached under a root has its separator covered by
            // its ancestors' frontals; subtrees detached mid-surgery are
            // exempt until they are hung back
            let mut covered: HashSet<VarIndex> = HashSet::new();
            let mut topmost = id;
            let mut cursor = clique.parent();
            while let Some(p) = cursor {
                let parent = self.clique(p).expect("live ancestor");
                covered.extend(parent.conditional.frontals().iter().copied());
                topmost = p;
                cursor = parent.parent();
            }
            if self.roots.contains(&topmost) {
                for s in clique.conditional.separator() {
                    assert!(
                        covered.contains(s),
                        "separator {s:?} not frontal in any ancestor"
                    );
                }
            }
        }
        assert_eq!(seen_frontals.len(), self.nodes.len(), "nodes map covers frontals");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eliminate::eliminate_sequential;
    use crate::linear::{JacobianFactor, LinearFactor};
    use crate::Factorization;
    use nalgebra::{dvector, DMatrix};

    fn chain_fragment() -> BayesNetFragment {
        // x0 = 1, x1 − x0 = 2, x2 − x1 = −0.5
        let factors = vec![
            LinearFactor::Jacobian(JacobianFactor::new(
                vec![VarIndex(0)],
                vec![DMatrix::identity(1, 1)],
                dvector![1.0],
            )),
            LinearFactor::Jacobian(JacobianFactor::new(
                vec![VarIndex(0), VarIndex(1)],
                vec![-DMatrix::identity(1, 1), DMatrix::identity(1, 1)],
                dvector![2.0],
            )),
            LinearFactor::Jacobian(JacobianFactor::new(
                vec![VarIndex(1), VarIndex(2)],
                vec![-DMatrix::identity(1, 1), DMatrix::identity(1, 1)],
                dvector![-0.5],
            )),
        ];
        let order = [VarIndex(0), VarIndex(1), VarIndex(2)];
        eliminate_sequential(factors, &order, |_| 1, Factorization::Cholesky).unwrap()
    }

    #[test]
    fn chain_builds_two_cliques() {
        let mut tree = BayesTree::new();
        tree.extend_with_fragment(chain_fragment());
        assert_eq!(tree.clique_count(), 2);
        assert_eq!(tree.roots().len(), 1);

        // root holds {x1, x2}, child holds x0 | x1
        let root = tree.clique(tree.roots()[0]).unwrap();
        assert_eq!(root.conditional().frontals(), &[VarIndex(1), VarIndex(2)]);
        assert!(root.cached_factor().is_none());

        let child_id = tree.clique_containing(VarIndex(0)).unwrap();
        let child = tree.clique(child_id).unwrap();
        assert_eq!(child.conditional().separator(), &[VarIndex(1)]);
        assert!(child.cached_factor().is_some());
    }

    #[test]
    fn top_of_climbs_to_root() {
        let mut tree = BayesTree::new();
        tree.extend_with_fragment(chain_fragment());

        // marking the leaf variable pulls in its clique and the root
        let info = tree.top_of([VarIndex(0)]);
        assert_eq!(info.top.len(), 2);
        assert!(info.orphans.is_empty());
        assert_eq!(info.frontals, vec![VarIndex(0), VarIndex(1), VarIndex(2)]);

        // marking a root frontal orphans the leaf clique
        let info = tree.top_of([VarIndex(2)]);
        assert_eq!(info.top.len(), 1);
        assert_eq!(info.orphans.len(), 1);
        assert_eq!(info.frontals, vec![VarIndex(1), VarIndex(2)]);
    }

    #[test]
    fn find_all_marks_separator_involvement() {
        let mut tree = BayesTree::new();
        tree.extend_with_fragment(chain_fragment());
        // x1 is frontal in the root and separator of the leaf clique:
        // both cliques' frontals are involved
        let marked: HashSet<VarIndex> = [VarIndex(1)].into_iter().collect();
        let involved = tree.find_all(&marked);
        assert_eq!(
            involved,
            [VarIndex(0), VarIndex(1), VarIndex(2)].into_iter().collect()
        );
    }

    #[test]
    fn detach_and_reattach_round_trip() {
        let mut tree = BayesTree::new();
        tree.extend_with_fragment(chain_fragment());
        let info = tree.top_of([VarIndex(2)]);
        tree.detach_top(&info);
        assert_eq!(tree.clique_count(), 1);
        assert!(tree.roots().is_empty());

        // re-eliminate the detached variables with the orphan's cache
        let orphan_cache = tree
            .clique(info.orphans[0])
            .unwrap()
            .cached_factor()
            .unwrap()
            .clone();
        let factors = vec![
            LinearFactor::Hessian(orphan_cache),
            LinearFactor::Jacobian(JacobianFactor::new(
                vec![VarIndex(1), VarIndex(2)],
                vec![-DMatrix::identity(1, 1), DMatrix::identity(1, 1)],
                dvector![-0.5],
            )),
        ];
        let fragment = eliminate_sequential(
            factors,
            &[VarIndex(1), VarIndex(2)],
            |_| 1,
            Factorization::Cholesky,
        )
        .unwrap();
        tree.extend_with_fragment(fragment);
        tree.reattach_orphans(&info.orphans);
        assert_eq!(tree.clique_count(), 2);
        assert_eq!(tree.roots().len(), 1);
        let orphan = tree.clique(info.orphans[0]).unwrap();
        assert!(orphan.parent().is_some());
    }

    #[test]
    fn permute_round_trips() {
        let mut tree = BayesTree::new();
        tree.extend_with_fragment(chain_fragment());
        let reference = format!("{tree:?}");

        let p = Permutation::from_forward(vec![2, 0, 1]);
        tree.permute_with_inverse(&p.inverse());
        assert_ne!(format!("{tree:?}"), reference);
        tree.permute_with_inverse(&p.inverse().inverse());
        // labels and structure restored
        assert_eq!(
            tree.clique_containing(VarIndex(0)),
            tree.cliques().find(|(_, c)| c.conditional().frontals() == [VarIndex(0)]).map(|(id, _)| id)
        );
    }
}
