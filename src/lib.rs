//! Crate root: public surface, core newtypes, and engine-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users
//! of the library. It centralizes the [`Key`] and configuration types, the
//! shared error taxonomy, and re-exports the submodules that implement the
//! incremental smoothing-and-mapping engine.
//!
//! ## Invariants (engine-wide)
//!
//! - **Estimate closure.** Every key appearing in any live factor is
//!   present in the engine's estimate. `update` validates this before
//!   mutating anything.
//! - **Tree/elimination equivalence.** The product of all clique
//!   conditionals in the Bayes tree equals the result of eliminating the
//!   current linearized factor graph under the current ordering. Every
//!   `update` call either completes with this invariant intact or fails
//!   leaving the engine observably unchanged.
//! - **Slot discipline.** Factors receive dense, monotonically increasing
//!   slots at insertion; removal vacates a slot and slots are never
//!   reused.
//! - **Single-threaded.** All mutable state hangs off the [`Smoother`]
//!   instance; two engines share nothing, and `update` is a synchronous,
//!   non-reentrant transaction.
//!
//! If an invariant is violated at runtime the failure mode is a **precise
//! error** (never UB); internal consistency is additionally asserted in
//! debug builds.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Directed clique tree of Gaussian conditionals (attach/detach/permute).
pub mod bayestree;
/// Dense partial factorization (Cholesky/QR) and sequential elimination.
pub mod eliminate;
/// Nonlinear factor trait and the slot cache with its inverted index.
pub mod factor;
/// Linear factors in square-root and information form, and conditionals.
pub mod linear;
/// Diagonal Gaussian noise models (whitening).
pub mod noise;
/// Key ↔ index bijection, permutations, and permuted views.
pub mod ordering;
/// The incremental updater: the `update` pipeline.
pub mod smoother;
/// Nonlinear value trait and the estimate map.
pub mod values;
/// Per-variable dense tangent storage.
pub mod vector;

mod step;

// ============================================================================
// Canonical re-exports (centralization)
// ============================================================================

pub use crate::bayestree::{BayesTree, Clique, CliqueId};
pub use crate::eliminate::{eliminate_sequential, BayesNetFragment};
pub use crate::factor::{Factor, FactorCache, Slot};
pub use crate::linear::{GaussianConditional, HessianFactor, JacobianFactor, LinearFactor};
pub use crate::noise::DiagonalNoise;
pub use crate::ordering::{Ordering, Permutation, Permuted, VarIndex};
pub use crate::smoother::{Smoother, UpdateResult};
pub use crate::values::{Value, Values};
pub use crate::vector::VectorValues;

// ============================================================================
// Keys
// ============================================================================

/// Opaque identifier of a variable: integer-like, totally ordered,
/// hashable. Variables need not be numbered contiguously; [`Symbol`]
/// offers a readable packing for debug output.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u64);

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", default_key_formatter(*self))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", default_key_formatter(*self))
    }
}

/// A readable key: a one-character tag plus an index, packed into the
/// high byte of a [`Key`]. `Symbol::new('x', 7)` prints as `x7`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    /// The character tag.
    pub chr: char,
    /// The per-tag index.
    pub index: u64,
}

impl Symbol {
    /// Pack `chr` and `index` into a symbol. The index must fit in 56
    /// bits and the tag must be ASCII.
    pub fn new(chr: char, index: u64) -> Self {
        debug_assert!(chr.is_ascii() && index < (1 << 56));
        Self { chr, index }
    }

    /// The packed key.
    pub fn key(self) -> Key {
        Key(((self.chr as u64) << 56) | self.index)
    }

    /// Recover a symbol from a packed key, when the high byte is a
    /// printable ASCII tag.
    pub fn try_from_key(key: Key) -> Option<Symbol> {
        let tag = (key.0 >> 56) as u8;
        if tag.is_ascii_graphic() {
            Some(Symbol { chr: tag as char, index: key.0 & ((1 << 56) - 1) })
        } else {
            None
        }
    }
}

impl From<Symbol> for Key {
    fn from(symbol: Symbol) -> Key {
        symbol.key()
    }
}

/// Debug stringifier for keys, configurable per engine.
pub type KeyFormatter = fn(Key) -> String;

/// The default formatter: `x7` for symbol-packed keys, the raw integer
/// otherwise.
pub fn default_key_formatter(key: Key) -> String {
    match Symbol::try_from_key(key) {
        Some(symbol) => format!("{}{}", symbol.chr, symbol.index),
        None => format!("{}", key.0),
    }
}

fn default_formatter() -> KeyFormatter {
    default_key_formatter
}

// ============================================================================
// Errors
// ============================================================================

/// Surfaced error taxonomy.
///
/// The engine is transactional at `update` granularity: on any of these,
/// the call fails and the engine is observably unchanged. Internal
/// invariant violations are programmer errors and assert in debug builds
/// instead of surfacing here.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// A freshly added key already exists, or a key that must already
    /// exist (constrained-last entry, factor argument) is unknown.
    #[error("duplicate or unknown key {key:?}")]
    DuplicateKey {
        /// The offending key.
        key: Key,
    },
    /// A removal referenced a dead or out-of-range slot.
    #[error("factor slot {slot} is dead or out of range")]
    UnknownSlot {
        /// The offending slot.
        slot: Slot,
    },
    /// A Cholesky pivot was non-positive (or a variable carried no
    /// information). The caller may retry with QR.
    #[error("indefinite system: non-positive pivot at column {column}")]
    IndefiniteSystem {
        /// Column at which factorization failed, within the elimination
        /// target.
        column: usize,
    },
    /// A linearized factor's block width disagrees with a variable's
    /// dimension.
    #[error("inconsistent dims for {key:?}: variable has {expected}, factor block has {got}")]
    InconsistentDims {
        /// The variable whose dimension disagrees.
        key: Key,
        /// The variable's tangent dimension.
        expected: usize,
        /// The factor block's column count.
        got: usize,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Factorization mode of the elimination kernel, fixed at construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Factorization {
    /// Information-matrix form with in-place partial Cholesky (default;
    /// fails on indefinite systems).
    Cholesky,
    /// Householder QR of the stacked Jacobian, avoiding the squared
    /// condition number.
    Qr,
}

/// Gauss–Newton step parameters.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussNewtonParams {
    /// Back-substitution skips a subtree when no frontal was replaced and
    /// its separator values moved at most this much (L∞).
    pub wildfire_threshold: f64,
}

impl Default for GaussNewtonParams {
    fn default() -> Self {
        Self { wildfire_threshold: 1e-3 }
    }
}

/// Trust-region adaptation policy for the dogleg controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustAdaptation {
    /// Shrink and retry within one `update` until a candidate is
    /// accepted.
    SearchEachIteration,
    /// As above, but the radius never grows.
    SearchReduceOnly,
    /// One blend per `update`; a rejected candidate reverts the step.
    OneStepPerIteration,
}

/// Powell dogleg parameters.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoglegParams {
    /// Initial trust radius Δ (> 0).
    pub initial_trust_radius: f64,
    /// Radius adaptation policy.
    pub adaptation: TrustAdaptation,
    /// Emit per-candidate trace events.
    pub verbose: bool,
}

impl DoglegParams {
    /// The trust radius never grows past `GROWTH_CAP ×` its initial
    /// value.
    pub const GROWTH_CAP: f64 = 1e3;
}

impl Default for DoglegParams {
    fn default() -> Self {
        Self {
            initial_trust_radius: 1.0,
            adaptation: TrustAdaptation::SearchEachIteration,
            verbose: false,
        }
    }
}

/// Step-controller selection, fixed for the engine's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Optimization {
    /// Pure Gauss–Newton with wildfire back-substitution.
    GaussNewton(GaussNewtonParams),
    /// Powell dogleg with a trust region.
    Dogleg(DoglegParams),
}

/// Engine configuration.
///
/// These parameters reflect the public knobs of the incremental updater;
/// they must stay fixed for the engine's lifetime (the step controller
/// and factorization mode in particular never change mid-stream).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmootherParams {
    /// Step controller and its parameters.
    pub optimization: Optimization,
    /// L∞ delta threshold above which a variable is relinearized.
    pub relinearize_threshold: f64,
    /// Run the relinearization check every this many updates (≥ 1).
    pub relinearize_skip: u64,
    /// Master switch for relinearization.
    pub enable_relinearization: bool,
    /// Fill the error fields of [`UpdateResult`].
    pub evaluate_nonlinear_error: bool,
    /// Elimination kernel mode.
    pub factorization: Factorization,
    /// Debug stringifier for keys.
    #[serde(skip, default = "default_formatter")]
    pub key_formatter: KeyFormatter,
}

impl Default for SmootherParams {
    fn default() -> Self {
        Self {
            optimization: Optimization::GaussNewton(GaussNewtonParams::default()),
            relinearize_threshold: 0.1,
            relinearize_skip: 10,
            enable_relinearization: true,
            evaluate_nonlinear_error: false,
            factorization: Factorization::Cholesky,
            key_formatter: default_key_formatter,
        }
    }
}
