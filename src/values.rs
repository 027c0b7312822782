//! Nonlinear estimate storage
//!
//! Variables are points on a manifold, polymorphic over the capability set
//! `{dim, retract, local_coordinates}`. The engine never interprets a
//! [`Value`] beyond these; concrete pose/point/rotation types live with
//! the application, not here.

#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DVector;

use crate::ordering::{Ordering, Permuted};
use crate::vector::VectorValues;
use crate::{Error, Key};

/// A point on a manifold.
///
/// `retract` applies a tangent-space delta; `local_coordinates` inverts it:
/// `a.local_coordinates(&a.retract(d)) ≈ d` for small `d`. Implementations
/// must keep `dim` constant over the value's lifetime.
pub trait Value: fmt::Debug {
    /// Tangent-space dimension.
    fn dim(&self) -> usize;

    /// Move along `delta` on the manifold.
    fn retract(&self, delta: &DVector<f64>) -> Box<dyn Value>;

    /// Tangent vector from `self` towards `other`.
    fn local_coordinates(&self, other: &dyn Value) -> DVector<f64>;

    /// Clone behind the trait object.
    fn boxed_clone(&self) -> Box<dyn Value>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Value> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// The nonlinear estimate: a map `Key → Value` with unique keys.
///
/// Every key appearing in any active factor must be present here; the
/// engine enforces that at `update` time.
#[derive(Clone, Debug, Default)]
pub struct Values {
    map: BTreeMap<Key, Box<dyn Value>>,
}

impl Values {
    /// An empty estimate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no variable is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True when `key` is present.
    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.map.contains_key(&key)
    }

    /// Insert a fresh variable. Fails with [`Error::DuplicateKey`] if the
    /// key already exists.
    pub fn insert(&mut self, key: Key, value: Box<dyn Value>) -> Result<(), Error> {
        if self.map.contains_key(&key) {
            return Err(Error::DuplicateKey { key });
        }
        self.map.insert(key, value);
        Ok(())
    }

    /// Overwrite the value of an existing variable, returning the previous
    /// one. `None` when the key was absent (nothing is inserted).
    pub fn update(&mut self, key: Key, value: Box<dyn Value>) -> Option<Box<dyn Value>> {
        if !self.map.contains_key(&key) {
            return None;
        }
        self.map.insert(key, value)
    }

    /// Remove a variable.
    pub(crate) fn remove(&mut self, key: Key) -> Option<Box<dyn Value>> {
        self.map.remove(&key)
    }

    /// The value behind `key` as a trait object.
    #[inline]
    pub fn at_dyn(&self, key: Key) -> Option<&dyn Value> {
        self.map.get(&key).map(|b| b.as_ref())
    }

    /// The value behind `key`, downcast to its concrete type.
    pub fn at<T: Value + 'static>(&self, key: Key) -> Option<&T> {
        self.map.get(&key).and_then(|b| b.as_any().downcast_ref::<T>())
    }

    /// Tangent dimension of the variable behind `key`.
    pub fn dim_of(&self, key: Key) -> Option<usize> {
        self.map.get(&key).map(|b| b.dim())
    }

    /// Iterate `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &dyn Value)> {
        self.map.iter().map(|(k, v)| (*k, v.as_ref()))
    }

    /// Keys in key order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.map.keys().copied()
    }

    /// Retract every variable along the matching row of `delta`, read
    /// through the view under `ordering`. Variables without an index (or
    /// with an out-of-range row) are copied unchanged.
    pub fn retract(&self, delta: &Permuted<VectorValues>, ordering: &Ordering) -> Values {
        let mut out = Values::new();
        for (key, value) in self.iter() {
            let moved = match ordering.index_of(key) {
                Some(index) if index.as_usize() < delta.container().len() => {
                    value.retract(delta.at(index.as_usize()))
                }
                _ => value.boxed_clone(),
            };
            out.map.insert(key, moved);
        }
        out
    }

    /// Retract a single variable in place. Used when a variable's
    /// linearization point absorbs its accumulated delta.
    pub fn retract_key_in_place(&mut self, key: Key, delta: &DVector<f64>) {
        if let Some(value) = self.map.get_mut(&key) {
            *value = value.retract(delta);
        }
    }
}
