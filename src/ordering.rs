//! Ordering & permutation machinery
//!
//! The elimination order of the engine is a dense bijection between opaque
//! [`Key`]s and [`VarIndex`]es in `[0, N)`. Lower indices are eliminated
//! first. Incremental re-elimination reorders variables by applying a
//! [`Permutation`] **in place**: the ordering itself and every
//! [`Permuted`] view the engine holds are rewritten as O(N) metadata
//! updates, never as O(N·dim) data moves.
//!
//! ## Permutation convention
//!
//! A `Permutation` maps **logical** positions to **prior** positions:
//! `forward[new] = old`. After `permute_in_place(p)`, reading at logical
//! index `i` returns what reading at `p[i]` returned before the permute.
//! Permutations shorter than the structure they act on are implicitly
//! extended by the identity.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use crate::{Error, Key};

/// Dense elimination index of a variable, `i ∈ [0, N)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarIndex(pub usize);

impl VarIndex {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for VarIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bijection `Key ↔ VarIndex` defining the elimination order.
///
/// Both directions are O(1) expected via a hashed dual index.
#[derive(Clone, Debug, Default)]
pub struct Ordering {
    index_of: HashMap<Key, VarIndex>,
    key_of: Vec<Key>,
}

impl Ordering {
    /// An empty ordering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    #[inline]
    pub fn len(&self) -> usize {
        self.key_of.len()
    }

    /// True when no variable has been inserted yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.key_of.is_empty()
    }

    /// Append `key` at the next free index.
    ///
    /// Fails with [`Error::DuplicateKey`] if the key is already present.
    pub fn insert(&mut self, key: Key) -> Result<VarIndex, Error> {
        if self.index_of.contains_key(&key) {
            return Err(Error::DuplicateKey { key });
        }
        let index = VarIndex(self.key_of.len());
        self.index_of.insert(key, index);
        self.key_of.push(key);
        Ok(index)
    }

    /// Index of `key`, if present.
    #[inline]
    pub fn index_of(&self, key: Key) -> Option<VarIndex> {
        self.index_of.get(&key).copied()
    }

    /// Key at `index`, if in range.
    #[inline]
    pub fn key_of(&self, index: VarIndex) -> Option<Key> {
        self.key_of.get(index.0).copied()
    }

    /// True when `key` has an index.
    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.index_of.contains_key(&key)
    }

    /// Keys in index order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.key_of.iter().copied()
    }

    /// Drop the `count` highest indices. Used to roll back a failed update
    /// that had already appended fresh variables.
    pub(crate) fn truncate(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(key) = self.key_of.pop() {
                self.index_of.remove(&key);
            }
        }
    }

    /// Reorder all `Key ↔ VarIndex` pairs by `perm`.
    ///
    /// After the call, `key_of(i)` returns what `key_of(perm[i])` returned
    /// before. Every [`Permuted`] view the caller holds over containers in
    /// this index space must be rewritten with the same permutation.
    pub fn permute_in_place(&mut self, perm: &Permutation) {
        debug_assert!(perm.len() <= self.key_of.len());
        let old = std::mem::take(&mut self.key_of);
        self.key_of = (0..old.len()).map(|i| old[perm.get(i)]).collect();
        self.index_of.clear();
        for (i, key) in self.key_of.iter().enumerate() {
            self.index_of.insert(*key, VarIndex(i));
        }
    }
}

/// A bijection `Index → Index`, stored as `forward[new] = old`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation {
    forward: Vec<usize>,
}

impl Permutation {
    /// The identity permutation on `[0, n)`.
    pub fn identity(n: usize) -> Self {
        Self { forward: (0..n).collect() }
    }

    /// Build from an explicit `forward[new] = old` table.
    ///
    /// The table must be a bijection on `[0, len)`; this is checked in
    /// debug builds only (a malformed permutation is a programmer error).
    pub fn from_forward(forward: Vec<usize>) -> Self {
        #[cfg(debug_assertions)]
        {
            let mut seen = vec![false; forward.len()];
            for &o in &forward {
                assert!(o < forward.len() && !seen[o], "not a permutation");
                seen[o] = true;
            }
        }
        Self { forward }
    }

    /// Explicit length of the table (reads past it are identity).
    #[inline]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when the table is empty (pure identity).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// The prior position read at logical position `i`, extending by
    /// identity past the stored table.
    #[inline]
    pub fn get(&self, i: usize) -> usize {
        self.forward.get(i).copied().unwrap_or(i)
    }

    /// True when every stored entry maps to itself.
    pub fn is_identity(&self) -> bool {
        self.forward.iter().enumerate().all(|(i, &o)| i == o)
    }

    /// The inverse bijection: `inverse()[old] = new`.
    pub fn inverse(&self) -> Permutation {
        let mut inv = vec![0usize; self.forward.len()];
        for (new, &old) in self.forward.iter().enumerate() {
            inv[old] = new;
        }
        Permutation { forward: inv }
    }
}

/// A pairing of a [`Permutation`] with an indexed container.
///
/// Reading at logical index `i` returns the underlying element at
/// `perm[i]`. The view and the container share storage: pushing one
/// element onto the container extends the identity-permuted tail of the
/// view by one as well (the permutation table is simply not extended, and
/// reads past it are identity).
#[derive(Clone, Debug)]
pub struct Permuted<C> {
    perm: Permutation,
    container: C,
}

impl<C> Permuted<C> {
    /// Wrap `container` with an identity view.
    pub fn new(container: C) -> Self {
        Self { perm: Permutation::identity(0), container }
    }

    /// Pair `container` with an explicit permutation.
    pub(crate) fn with_permutation(perm: Permutation, container: C) -> Self {
        Self { perm, container }
    }

    /// Unwrap the underlying storage, discarding the view.
    pub(crate) fn into_container(self) -> C {
        self.container
    }

    /// The current permutation table.
    #[inline]
    pub fn permutation(&self) -> &Permutation {
        &self.perm
    }

    /// Shared access to the underlying storage.
    #[inline]
    pub fn container(&self) -> &C {
        &self.container
    }

    /// Mutable access to the underlying storage. Extending the container
    /// extends the identity tail of the view.
    #[inline]
    pub fn container_mut(&mut self) -> &mut C {
        &mut self.container
    }

    /// Physical position backing logical index `i`.
    #[inline]
    pub fn map_index(&self, i: usize) -> usize {
        self.perm.get(i)
    }

    /// Compose a further permutation onto the view: afterwards, reading at
    /// logical `i` returns what reading at `p[i]` returned before.
    pub fn permute(&mut self, p: &Permutation) {
        let n = p.len().max(self.perm.len());
        let forward = (0..n).map(|i| self.perm.get(p.get(i))).collect();
        self.perm = Permutation { forward };
    }

    /// Drop the permutation table once it has become the identity, as a
    /// compaction step. No data moves.
    pub fn compact(&mut self) {
        if self.perm.is_identity() {
            self.perm = Permutation::identity(0);
        }
    }
}
