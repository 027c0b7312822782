//! Nonlinear factors and the slot cache
//!
//! A factor is a residual over an ordered tuple of keys, polymorphic over
//! `{keys, dim, error, linearize}`. Factors are immutable once inserted
//! and identified by a dense, monotonically increasing **slot** assigned
//! at insertion. Removed factors vacate their slot; slots are never
//! reused.
//!
//! The cache also maintains the inverted index `Key → {slots}` used to
//! collect the factors touching an affected variable set.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::linear::JacobianFactor;
use crate::ordering::Ordering;
use crate::values::Values;
use crate::{Error, Key};

/// Dense slot of a factor, assigned at insertion time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub usize);

impl Slot {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A nonlinear residual over an ordered tuple of variables.
///
/// `error` returns `½‖Σ^(-1/2) r(θ)‖²`; `linearize` returns the whitened
/// first-order expansion `½‖A·δ − b‖²` around the given estimate, with
/// blocks in the same order as `keys()`.
pub trait Factor: fmt::Debug {
    /// The argument tuple.
    fn keys(&self) -> &[Key];

    /// Residual dimension.
    fn dim(&self) -> usize;

    /// Nonlinear error at `values` (nonnegative).
    fn error(&self, values: &Values) -> f64;

    /// Whitened linear approximation at `values`, labeled through
    /// `ordering`.
    fn linearize(&self, values: &Values, ordering: &Ordering) -> Result<JacobianFactor, Error>;
}

/// Slot table of live factors plus the inverted `Key → slots` index.
#[derive(Clone, Debug, Default)]
pub struct FactorCache {
    slots: Vec<Option<Arc<dyn Factor>>>,
    index: HashMap<Key, BTreeSet<Slot>>,
}

impl FactorCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots ever assigned (live and vacated).
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of live factors.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Insert a factor, assigning the next slot.
    pub fn add(&mut self, factor: Arc<dyn Factor>) -> Slot {
        let slot = Slot(self.slots.len());
        for &key in factor.keys() {
            self.index.entry(key).or_default().insert(slot);
        }
        self.slots.push(Some(factor));
        slot
    }

    /// Vacate `slot`, returning the factor that occupied it.
    ///
    /// Fails with [`Error::UnknownSlot`] when the slot is out of range or
    /// already vacated.
    pub fn remove(&mut self, slot: Slot) -> Result<Arc<dyn Factor>, Error> {
        let entry = self
            .slots
            .get_mut(slot.as_usize())
            .ok_or(Error::UnknownSlot { slot })?;
        let factor = entry.take().ok_or(Error::UnknownSlot { slot })?;
        for &key in factor.keys() {
            if let Some(set) = self.index.get_mut(&key) {
                set.remove(&slot);
                if set.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
        Ok(factor)
    }

    /// The live factor at `slot`.
    #[inline]
    pub fn get(&self, slot: Slot) -> Option<&Arc<dyn Factor>> {
        self.slots.get(slot.as_usize()).and_then(|s| s.as_ref())
    }

    /// Iterate live `(slot, factor)` pairs in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = (Slot, &Arc<dyn Factor>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|f| (Slot(i), f)))
    }

    /// Slots of live factors referencing `key`.
    pub fn touching(&self, key: Key) -> impl Iterator<Item = Slot> + '_ {
        self.index.get(&key).into_iter().flatten().copied()
    }

    /// Union of slots touching any of `keys`.
    pub fn touching_any<I: IntoIterator<Item = Key>>(&self, keys: I) -> BTreeSet<Slot> {
        let mut slots = BTreeSet::new();
        for key in keys {
            slots.extend(self.touching(key));
        }
        slots
    }

    /// Sum of live factor errors at `values`.
    pub fn error(&self, values: &Values) -> f64 {
        self.iter_live().map(|(_, f)| f.error(values)).sum()
    }

    /// Linearize the given live slots at `values`, labeled through
    /// `ordering`, in slot order.
    pub fn linearize_slots(
        &self,
        slots: &[Slot],
        values: &Values,
        ordering: &Ordering,
    ) -> Result<Vec<JacobianFactor>, Error> {
        slots
            .iter()
            .map(|&slot| {
                let factor = self.get(slot).ok_or(Error::UnknownSlot { slot })?;
                factor.linearize(values, ordering)
            })
            .collect()
    }

    /// Debug-build consistency check: the inverted index matches the key
    /// sets of live factors exactly.
    #[cfg(debug_assertions)]
    pub(crate) fn check_index(&self) {
        let mut rebuilt: HashMap<Key, BTreeSet<Slot>> = HashMap::new();
        for (slot, factor) in self.iter_live() {
            for &key in factor.keys() {
                rebuilt.entry(key).or_default().insert(slot);
            }
        }
        debug_assert_eq!(rebuilt, self.index, "inverted index out of sync");
    }
}
