//! Minimal shaped tensor for the manager's host-resident algorithm state.
//!
//! Stands in for whatever accelerator tensor type a real deployment would
//! use (the actual dot-product attention and rotary embedding kernels are
//! external collaborators, see [`crate::attn`]). `DeviceTensor` is deliberately
//! not a general-purpose numeric library: it only implements the handful of
//! reductions the manager itself needs (mean, batched dot products, top-k).

use crate::error::{ManagerError, ManagerResult};

/// A row-major `f32` tensor with a small, dynamically-sized shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl DeviceTensor {
    /// Create a zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    /// Wrap an existing flat buffer with a shape, validating element count.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> ManagerResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::from_data",
                detail: format!(
                    "shape {:?} implies {} elements, got {}",
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }

    /// Slice along `axis`, keeping `range` of that axis. Copies.
    pub fn slice_axis(&self, axis: usize, range: std::ops::Range<usize>) -> Self {
        assert!(range.end <= self.shape[axis], "slice_axis out of bounds");
        let strides = self.strides();
        let mut new_shape = self.shape.clone();
        new_shape[axis] = range.len();

        if new_shape[axis] == 0 {
            return Self::zeros(&new_shape);
        }

        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = strides[axis];
        let axis_len = self.shape[axis];
        let new_axis_len = range.len();

        let mut out = Vec::with_capacity(new_shape.iter().product());
        for o in 0..outer {
            let base = o * axis_len * inner;
            let start = base + range.start * inner;
            let end = start + new_axis_len * inner;
            out.extend_from_slice(&self.data[start..end]);
        }

        Self {
            shape: new_shape,
            data: out,
        }
    }

    /// Concatenate tensors along `axis`; all other axes must match.
    pub fn concat_axis(tensors: &[&Self], axis: usize) -> ManagerResult<Self> {
        if tensors.is_empty() {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::concat_axis",
                detail: "no tensors to concatenate".to_string(),
            });
        }
        let rank = tensors[0].rank();
        for t in tensors {
            if t.rank() != rank {
                return Err(ManagerError::ShapeMismatch {
                    context: "DeviceTensor::concat_axis",
                    detail: "rank mismatch among operands".to_string(),
                });
            }
            for (i, (&a, &b)) in t.shape.iter().zip(tensors[0].shape.iter()).enumerate() {
                if i != axis && a != b {
                    return Err(ManagerError::ShapeMismatch {
                        context: "DeviceTensor::concat_axis",
                        detail: format!("axis {i} mismatch: {a} vs {b}"),
                    });
                }
            }
        }

        let mut new_shape = tensors[0].shape.clone();
        new_shape[axis] = tensors.iter().map(|t| t.shape[axis]).sum();

        let outer: usize = new_shape[..axis].iter().product();
        let inner: usize = new_shape[axis + 1..].iter().product();

        let mut out = vec![0.0f32; new_shape.iter().product()];
        for o in 0..outer {
            let mut axis_off = 0usize;
            for t in tensors {
                let t_axis_len = t.shape[axis];
                let src_base = o * t_axis_len * inner;
                let dst_base = o * new_shape[axis] * inner + axis_off * inner;
                let len = t_axis_len * inner;
                out[dst_base..dst_base + len]
                    .copy_from_slice(&t.data[src_base..src_base + len]);
                axis_off += t_axis_len;
            }
        }

        Ok(Self {
            shape: new_shape,
            data: out,
        })
    }

    /// Write `src` into `self` at `offset` along `axis`, in place.
    pub fn write_axis(&mut self, axis: usize, offset: usize, src: &Self) -> ManagerResult<()> {
        if src.rank() != self.rank() {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::write_axis",
                detail: "rank mismatch".to_string(),
            });
        }
        if offset + src.shape[axis] > self.shape[axis] {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::write_axis",
                detail: "write extends past destination axis".to_string(),
            });
        }
        for (i, (&a, &b)) in self.shape.iter().zip(src.shape.iter()).enumerate() {
            if i != axis && a != b {
                return Err(ManagerError::ShapeMismatch {
                    context: "DeviceTensor::write_axis",
                    detail: format!("axis {i} mismatch: {a} vs {b}"),
                });
            }
        }

        let inner: usize = self.shape[axis + 1..].iter().product();
        let outer: usize = self.shape[..axis].iter().product();
        let dst_axis_len = self.shape[axis];
        let src_axis_len = src.shape[axis];

        for o in 0..outer {
            let dst_base = o * dst_axis_len * inner + offset * inner;
            let src_base = o * src_axis_len * inner;
            let len = src_axis_len * inner;
            self.data[dst_base..dst_base + len]
                .copy_from_slice(&src.data[src_base..src_base + len]);
        }
        Ok(())
    }

    /// Mean over `axis`. If `keepdim` the axis is retained with length 1,
    /// otherwise it is removed.
    pub fn mean_axis(&self, axis: usize, keepdim: bool) -> Self {
        let axis_len = self.shape[axis];
        let mut summed = self.sum_axis(axis, true);
        let n = axis_len.max(1) as f32;
        for v in summed.data.iter_mut() {
            *v /= n;
        }
        if !keepdim {
            summed.shape.remove(axis);
        }
        summed
    }

    /// Sum over `axis`. If `keepdim` the axis is retained with length 1,
    /// otherwise it is removed.
    pub fn sum_axis(&self, axis: usize, keepdim: bool) -> Self {
        let inner: usize = self.shape[axis + 1..].iter().product();
        let outer: usize = self.shape[..axis].iter().product();
        let axis_len = self.shape[axis];

        let mut new_shape = self.shape.clone();
        new_shape[axis] = 1;
        let mut out = vec![0.0f32; outer * inner];

        for o in 0..outer {
            for a in 0..axis_len {
                let base = o * axis_len * inner + a * inner;
                for i in 0..inner {
                    out[o * inner + i] += self.data[base + i];
                }
            }
        }

        if !keepdim {
            new_shape.remove(axis);
        }

        Self {
            shape: new_shape,
            data: out,
        }
    }

    /// Reshape to `new_shape`, which must have the same element count.
    pub fn reshape(&self, new_shape: &[usize]) -> ManagerResult<Self> {
        let expected: usize = new_shape.iter().product();
        if expected != self.data.len() {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::reshape",
                detail: format!(
                    "cannot reshape {:?} ({} elements) into {:?}",
                    self.shape,
                    self.data.len(),
                    new_shape
                ),
            });
        }
        Ok(Self {
            shape: new_shape.to_vec(),
            data: self.data.clone(),
        })
    }

    /// Batched dot product over the last axis between `self` of shape
    /// `(..., L, D)` and `other` of shape `(..., C, D)` (leading axes must
    /// match), producing `(..., L, C)`.
    pub fn batched_dot_last(&self, other: &Self) -> ManagerResult<Self> {
        let rank = self.rank();
        if other.rank() != rank {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::batched_dot_last",
                detail: "rank mismatch".to_string(),
            });
        }
        if self.shape[rank - 1] != other.shape[rank - 1] {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::batched_dot_last",
                detail: "dim_head mismatch".to_string(),
            });
        }
        for i in 0..rank - 2 {
            if self.shape[i] != other.shape[i] {
                return Err(ManagerError::ShapeMismatch {
                    context: "DeviceTensor::batched_dot_last",
                    detail: format!("leading axis {i} mismatch"),
                });
            }
        }

        let d = self.shape[rank - 1];
        let l = self.shape[rank - 2];
        let c = other.shape[rank - 2];
        let batch: usize = self.shape[..rank - 2].iter().product();

        let mut new_shape = self.shape.clone();
        new_shape[rank - 2] = l;
        new_shape[rank - 1] = c;

        let mut out = vec![0.0f32; batch * l * c];
        for b in 0..batch {
            let a_base = b * l * d;
            let o_base = b * c * d;
            let out_base = b * l * c;
            for i in 0..l {
                for j in 0..c {
                    let mut acc = 0.0f32;
                    for k in 0..d {
                        acc += self.data[a_base + i * d + k] * other.data[o_base + j * d + k];
                    }
                    out[out_base + i * c + j] = acc;
                }
            }
        }

        Ok(Self {
            shape: new_shape,
            data: out,
        })
    }

    /// Batched matrix multiply: `self` of shape `(..., M, K)` against
    /// `other` of shape `(..., K, N)` (leading axes must match), producing
    /// `(..., M, N)`. Unlike [`Self::batched_dot_last`], which contracts
    /// each operand's own last axis, this contracts `self`'s last axis
    /// against `other`'s second-to-last axis, as attention-weight times
    /// value requires.
    pub fn batched_matmul(&self, other: &Self) -> ManagerResult<Self> {
        let rank = self.rank();
        if other.rank() != rank {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::batched_matmul",
                detail: "rank mismatch".to_string(),
            });
        }
        let k = self.shape[rank - 1];
        if other.shape[rank - 2] != k {
            return Err(ManagerError::ShapeMismatch {
                context: "DeviceTensor::batched_matmul",
                detail: format!("contraction axis mismatch: {} vs {}", k, other.shape[rank - 2]),
            });
        }
        for i in 0..rank - 2 {
            if self.shape[i] != other.shape[i] {
                return Err(ManagerError::ShapeMismatch {
                    context: "DeviceTensor::batched_matmul",
                    detail: format!("leading axis {i} mismatch"),
                });
            }
        }

        let m = self.shape[rank - 2];
        let n = other.shape[rank - 1];
        let batch: usize = self.shape[..rank - 2].iter().product();

        let mut new_shape = self.shape.clone();
        new_shape[rank - 2] = m;
        new_shape[rank - 1] = n;

        let mut out = vec![0.0f32; batch * m * n];
        for b in 0..batch {
            let a_base = b * m * k;
            let o_base = b * k * n;
            let out_base = b * m * n;
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for t in 0..k {
                        acc += self.data[a_base + i * k + t] * other.data[o_base + t * n + j];
                    }
                    out[out_base + i * n + j] = acc;
                }
            }
        }

        Ok(Self {
            shape: new_shape,
            data: out,
        })
    }

    /// Repeat each slot along `axis` `groups` times consecutively (GQA
    /// key/value head broadcast: kv head `g` serves query heads
    /// `[g*groups, (g+1)*groups)`).
    pub fn repeat_interleave_axis(&self, axis: usize, groups: usize) -> Self {
        if groups <= 1 {
            return self.clone();
        }
        let strides = self.strides();
        let inner = strides[axis];
        let axis_len = self.shape[axis];
        let outer: usize = self.shape[..axis].iter().product();

        let mut new_shape = self.shape.clone();
        new_shape[axis] = axis_len * groups;
        let mut out = Vec::with_capacity(new_shape.iter().product());

        for o in 0..outer {
            for a in 0..axis_len {
                let base = o * axis_len * inner + a * inner;
                let slot = &self.data[base..base + inner];
                for _ in 0..groups {
                    out.extend_from_slice(slot);
                }
            }
        }

        Self {
            shape: new_shape,
            data: out,
        }
    }

    /// Top-`k` indices along the last axis, one list per leading "row"
    /// (the product of all but the last axis). Ties broken by lower index.
    pub fn topk_indices_last(&self, k: usize) -> Vec<Vec<usize>> {
        let rank = self.rank();
        let last = self.shape[rank - 1];
        let rows: usize = self.shape[..rank - 1].iter().product();
        let k = k.min(last);

        let mut result = Vec::with_capacity(rows);
        for r in 0..rows {
            let base = r * last;
            let mut idx: Vec<usize> = (0..last).collect();
            idx.sort_by(|&a, &b| {
                self.data[base + b]
                    .partial_cmp(&self.data[base + a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            idx.truncate(k);
            result.push(idx);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_and_concat_roundtrip() {
        let t = DeviceTensor::from_data(&[2, 3], (0..6).map(|x| x as f32).collect()).unwrap();
        let a = t.slice_axis(1, 0..1);
        let b = t.slice_axis(1, 1..3);
        let joined = DeviceTensor::concat_axis(&[&a, &b], 1).unwrap();
        assert_eq!(joined, t);
    }

    #[test]
    fn test_mean_axis() {
        let t = DeviceTensor::from_data(&[1, 1, 4, 2], vec![1.0, 1.0, 3.0, 3.0, 5.0, 5.0, 7.0, 7.0])
            .unwrap();
        let m = t.mean_axis(2, true);
        assert_eq!(m.shape(), &[1, 1, 1, 2]);
        assert_eq!(m.data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_sum_axis_drops_axis_unless_keepdim() {
        let t = DeviceTensor::from_data(&[1, 1, 3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let kept = t.sum_axis(2, true);
        assert_eq!(kept.shape(), &[1, 1, 1, 2]);
        assert_eq!(kept.data(), &[9.0, 12.0]);

        let dropped = t.sum_axis(2, false);
        assert_eq!(dropped.shape(), &[1, 1, 2]);
        assert_eq!(dropped.data(), &[9.0, 12.0]);
    }

    #[test]
    fn test_batched_dot_last() {
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 1, 3, 2], vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0]).unwrap();
        let score = q.batched_dot_last(&k).unwrap();
        assert_eq!(score.shape(), &[1, 1, 1, 3]);
        assert_eq!(score.data(), &[1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_topk_indices_last() {
        let t = DeviceTensor::from_data(&[1, 4], vec![0.1, 0.9, 0.5, 0.2]).unwrap();
        let topk = t.topk_indices_last(2);
        assert_eq!(topk, vec![vec![1, 2]]);
    }

    #[test]
    fn test_batched_matmul() {
        // (1,1,2,3) x (1,1,3,2) -> (1,1,2,2)
        let a = DeviceTensor::from_data(&[1, 1, 2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = DeviceTensor::from_data(&[1, 1, 3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let out = a.batched_matmul(&b).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.data(), &[4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_repeat_interleave_axis() {
        let t = DeviceTensor::from_data(&[1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = t.repeat_interleave_axis(1, 2);
        assert_eq!(out.shape(), &[1, 4, 1, 2]);
        assert_eq!(out.data(), &[1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_write_axis() {
        let mut buf = DeviceTensor::zeros(&[1, 1, 4, 2]);
        let patch = DeviceTensor::from_data(&[1, 1, 2, 2], vec![9.0, 9.0, 8.0, 8.0]).unwrap();
        buf.write_axis(2, 1, &patch).unwrap();
        assert_eq!(
            buf.data(),
            &[0.0, 0.0, 9.0, 9.0, 8.0, 8.0, 0.0, 0.0]
        );
    }
}
