//! Device matrix of per-block representative keys.
//!
//! Named after `self.block_k` (a `VectorTensor`) and `get_block_k`-style
//! accessors. Shape `(num_units, unit_size, num_global_block, dim_head)`,
//! growth axis 2, one representative key appended per committed block.

use crate::cache::grow_vector::GrowVector;
use crate::error::ManagerResult;
use crate::tensor::DeviceTensor;

const GROWTH_AXIS: usize = 2;

pub struct RepresentativeIndex {
    inner: GrowVector,
}

impl RepresentativeIndex {
    pub fn new(num_units: usize, unit_size: usize, dim_head: usize, initial_capacity: usize) -> Self {
        Self {
            inner: GrowVector::new(GROWTH_AXIS, &[num_units, unit_size, initial_capacity.max(1), dim_head]),
        }
    }

    /// Append one block's representative key, shape
    /// `(num_units, unit_size, 1, dim_head)`.
    pub fn append(&mut self, repr_k: &DeviceTensor) -> ManagerResult<()> {
        self.inner.append(repr_k)
    }

    /// Number of committed blocks (must equal `BlockStore`'s block count
    /// per unit).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All representative keys, shape `(num_units, unit_size,
    /// num_global_block, dim_head)`.
    pub fn get_data(&self) -> DeviceTensor {
        self.inner.get_data()
    }
}
