//! Append-only device-resident tensor with geometric capacity doubling.
//!
//! Named after `VectorTensor`-style growable buffers (same doubling
//! strategy, same `append`/`get_data` contract). The growth axis is a
//! fixed axis index with no hidden transpose bookkeeping — callers pick
//! the axis once at construction and every other axis stays put across
//! resizes.

use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

/// Append-only storage for a fixed element shape along one concat axis.
pub struct GrowVector {
    axis: usize,
    capacity: usize,
    len: usize,
    buffer: DeviceTensor,
}

impl GrowVector {
    /// `template_shape` is the full shape the buffer should have once
    /// fully occupied up to `initial_capacity` along `axis`; i.e.
    /// `template_shape[axis]` is interpreted as the initial capacity.
    pub fn new(axis: usize, template_shape: &[usize]) -> Self {
        let capacity = template_shape[axis];
        Self {
            axis,
            capacity,
            len: 0,
            buffer: DeviceTensor::zeros(template_shape),
        }
    }

    /// Current occupancy along the growth axis.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `t` along the growth axis, doubling capacity as needed.
    /// `t`'s shape must match the buffer's shape on every axis but the
    /// growth axis.
    pub fn append(&mut self, t: &DeviceTensor) -> ManagerResult<()> {
        let add_len = t.shape()[self.axis];
        if add_len == 0 {
            return Ok(());
        }

        while self.len + add_len > self.capacity {
            let new_capacity = (self.capacity.max(1)) * 2;
            let mut new_shape = self.buffer.shape().to_vec();
            new_shape[self.axis] = new_capacity;
            let mut new_buffer = DeviceTensor::zeros(&new_shape);
            if self.len > 0 {
                let valid = self.buffer.slice_axis(self.axis, 0..self.len);
                new_buffer.write_axis(self.axis, 0, &valid)?;
            }
            self.buffer = new_buffer;
            self.capacity = new_capacity;
        }

        self.buffer.write_axis(self.axis, self.len, t)?;
        self.len += add_len;
        Ok(())
    }

    /// The valid prefix of the buffer, i.e. everything appended so far.
    pub fn get_data(&self) -> DeviceTensor {
        self.buffer.slice_axis(self.axis, 0..self.len)
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl std::fmt::Debug for GrowVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowVector")
            .field("axis", &self.axis)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_capacity() {
        let mut gv = GrowVector::new(0, &[4, 2]);
        let t = DeviceTensor::from_data(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        gv.append(&t).unwrap();
        assert_eq!(gv.len(), 2);
        assert_eq!(gv.capacity(), 4);
        assert_eq!(gv.get_data(), t);
    }

    #[test]
    fn test_append_triggers_doubling() {
        let mut gv = GrowVector::new(0, &[2, 2]);
        let a = DeviceTensor::from_data(&[2, 2], vec![1.0, 1.0, 2.0, 2.0]).unwrap();
        let b = DeviceTensor::from_data(&[2, 2], vec![3.0, 3.0, 4.0, 4.0]).unwrap();
        gv.append(&a).unwrap();
        gv.append(&b).unwrap();
        assert_eq!(gv.len(), 4);
        assert!(gv.capacity() >= 4);
        let expected = DeviceTensor::concat_axis(&[&a, &b], 0).unwrap();
        assert_eq!(gv.get_data(), expected);
    }

    #[test]
    fn test_growth_axis_not_zero() {
        // (num_units=1, unit_size=1, capacity, dim_head=3), growth axis = 2
        let mut gv = GrowVector::new(2, &[1, 1, 2, 3]);
        let block1 = DeviceTensor::from_data(&[1, 1, 1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let block2 = DeviceTensor::from_data(&[1, 1, 1, 3], vec![4.0, 5.0, 6.0]).unwrap();
        let block3 = DeviceTensor::from_data(&[1, 1, 1, 3], vec![7.0, 8.0, 9.0]).unwrap();
        gv.append(&block1).unwrap();
        gv.append(&block2).unwrap();
        gv.append(&block3).unwrap();
        assert_eq!(gv.len(), 3);
        let data = gv.get_data();
        assert_eq!(data.shape(), &[1, 1, 3, 3]);
        assert_eq!(data.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }
}
