//! Per-variable tangent storage
//!
//! [`VectorValues`] holds one dense block per variable, indexed physically.
//! The engine never reads it directly: the three running deltas (`delta`,
//! `deltaNewton`, `deltaRg`) are read through [`Permuted`] views so that a
//! reordering is a metadata update. Whole-container operations (norms,
//! scaling, blending) are permutation-invariant and work on the physical
//! blocks.

#![forbid(unsafe_code)]

use nalgebra::DVector;

use crate::ordering::Permuted;

/// Dense per-variable blocks, one `DVector` per variable slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VectorValues {
    blocks: Vec<DVector<f64>>,
}

impl VectorValues {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variable blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no block is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total scalar dimension across all blocks.
    pub fn total_dim(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    /// Append a block, returning its physical position.
    pub fn push(&mut self, block: DVector<f64>) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Append a zero block of dimension `dim`.
    pub fn push_zero(&mut self, dim: usize) -> usize {
        self.push(DVector::zeros(dim))
    }

    /// Drop the last `count` blocks (rollback of a failed extension).
    pub(crate) fn truncate_last(&mut self, count: usize) {
        let keep = self.blocks.len().saturating_sub(count);
        self.blocks.truncate(keep);
    }

    /// Block at physical position `i`.
    #[inline]
    pub fn at(&self, i: usize) -> &DVector<f64> {
        &self.blocks[i]
    }

    /// Mutable block at physical position `i`.
    #[inline]
    pub fn at_mut(&mut self, i: usize) -> &mut DVector<f64> {
        &mut self.blocks[i]
    }

    /// Dimension of the block at physical position `i`.
    #[inline]
    pub fn dim(&self, i: usize) -> usize {
        self.blocks[i].len()
    }

    /// Squared Euclidean norm over all blocks.
    pub fn squared_norm(&self) -> f64 {
        self.blocks.iter().map(|b| b.norm_squared()).sum()
    }

    /// Euclidean norm over all blocks.
    pub fn norm(&self) -> f64 {
        self.squared_norm().sqrt()
    }

    /// Dot product with a congruent container.
    pub fn dot(&self, other: &VectorValues) -> f64 {
        debug_assert_eq!(self.len(), other.len());
        self.blocks
            .iter()
            .zip(&other.blocks)
            .map(|(a, b)| a.dot(b))
            .sum()
    }

    /// Scale every block by `s`.
    pub fn scale(&mut self, s: f64) {
        for b in &mut self.blocks {
            *b *= s;
        }
    }

    /// `self += a · x` blockwise.
    pub fn axpy(&mut self, a: f64, x: &VectorValues) {
        debug_assert_eq!(self.len(), x.len());
        for (b, xb) in self.blocks.iter_mut().zip(&x.blocks) {
            b.axpy(a, xb, 1.0);
        }
    }

    /// Zero every block in place, keeping dimensions.
    pub fn set_zero(&mut self) {
        for b in &mut self.blocks {
            b.fill(0.0);
        }
    }

    /// A congruent container of zero blocks.
    pub fn zeros_like(&self) -> VectorValues {
        VectorValues {
            blocks: self.blocks.iter().map(|b| DVector::zeros(b.len())).collect(),
        }
    }

    /// Iterate physical blocks.
    pub fn iter(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.blocks.iter()
    }
}

impl Permuted<VectorValues> {
    /// Block at logical index `i`.
    #[inline]
    pub fn at(&self, i: usize) -> &DVector<f64> {
        self.container().at(self.map_index(i))
    }

    /// Overwrite the block at logical index `i`.
    pub fn set(&mut self, i: usize, block: DVector<f64>) {
        let phys = self.map_index(i);
        debug_assert_eq!(self.container().dim(phys), block.len());
        *self.container_mut().at_mut(phys) = block;
    }

    /// L∞ norm of the block at logical index `i`.
    pub fn max_abs(&self, i: usize) -> f64 {
        self.at(i).iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }
}
