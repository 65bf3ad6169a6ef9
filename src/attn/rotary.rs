//! Rotary position embedding contract.
//!
//! Named after `RotaryEmbeddingESM`-style model-patching glue, implemented
//! here with the standard RoPE formula: pairs `(x_2i, x_2i+1)` rotated by
//! `theta_i * position` with `theta_i = base^(-2i/dim_head)`.

use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

pub struct RotaryEmbedding {
    dim_head: usize,
    base: f64,
    /// `cos[p][i]`/`sin[p][i]` flattened row-major, `p` in `0..table_len`,
    /// `i` in `0..dim_head/2`.
    cos: Vec<f32>,
    sin: Vec<f32>,
    table_len: usize,
}

impl RotaryEmbedding {
    pub fn new(dim_head: usize, base: f64) -> Self {
        let mut rope = Self {
            dim_head,
            base,
            cos: Vec::new(),
            sin: Vec::new(),
            table_len: 0,
        };
        // A zero-length table is valid; first real use calls
        // `precompute_tables` with the table size the caller needs.
        rope.precompute_tables(0);
        rope
    }

    /// Size the rotation tables to cover positions `0..length`. Callers
    /// typically size this to `n_local + exc_block_size + 1`.
    pub fn precompute_tables(&mut self, length: usize) {
        let half = self.dim_head / 2;
        let mut cos = Vec::with_capacity(length * half);
        let mut sin = Vec::with_capacity(length * half);
        for p in 0..length {
            for i in 0..half {
                let theta = (p as f64) / self.base.powf((2 * i) as f64 / self.dim_head as f64);
                cos.push(theta.cos() as f32);
                sin.push(theta.sin() as f32);
            }
        }
        self.cos = cos;
        self.sin = sin;
        self.table_len = length;
    }

    fn ensure_capacity(&mut self, position: usize) {
        if position >= self.table_len {
            self.precompute_tables(position + 1);
        }
    }

    fn rotate_rows(&self, t: &DeviceTensor, position_of_row: impl Fn(usize) -> usize) -> ManagerResult<DeviceTensor> {
        let rank = t.rank();
        if t.dim(rank - 1) != self.dim_head {
            return Err(ManagerError::ShapeMismatch {
                context: "RotaryEmbedding::rotate_rows",
                detail: format!("last axis {} != dim_head {}", t.dim(rank - 1), self.dim_head),
            });
        }
        let half = self.dim_head / 2;
        let l = t.dim(rank - 2);
        let rows: usize = t.shape()[..rank - 1].iter().product::<usize>() / l;

        let mut out = t.clone();
        let data_in = t.data();
        let data_out = out.data_mut();

        for r in 0..rows {
            for row in 0..l {
                let position = position_of_row(row);
                let base_idx = (r * l + row) * self.dim_head;
                let table_idx = position * half;
                for i in 0..half {
                    let x0 = data_in[base_idx + 2 * i];
                    let x1 = data_in[base_idx + 2 * i + 1];
                    let c = self.cos[table_idx + i];
                    let s = self.sin[table_idx + i];
                    data_out[base_idx + 2 * i] = x0 * c - x1 * s;
                    data_out[base_idx + 2 * i + 1] = x0 * s + x1 * c;
                }
            }
        }
        Ok(out)
    }

    /// Apply rotary rotation to `q` and `k` consistent with each row's
    /// position being its index along the second-to-last axis.
    pub fn apply_pair(&mut self, q: &DeviceTensor, k: &DeviceTensor) -> ManagerResult<(DeviceTensor, DeviceTensor)> {
        self.apply_pair_with_offsets(q, k, 0, 0)
    }

    /// Like [`Self::apply_pair`], but `q`'s and `k`'s rows are positioned
    /// starting at `q_offset`/`k_offset` instead of `0`. Needed when a
    /// query slice and its key window don't start at the same absolute
    /// position (e.g. a local-attention chunk whose key window reaches
    /// back further than the chunk's own query rows) — rotary dot
    /// products only encode the true relative distance if both operands
    /// are rotated by their real position, not a locally reset index.
    pub fn apply_pair_with_offsets(
        &mut self,
        q: &DeviceTensor,
        k: &DeviceTensor,
        q_offset: usize,
        k_offset: usize,
    ) -> ManagerResult<(DeviceTensor, DeviceTensor)> {
        let max_pos = (q_offset + q.dim(q.rank() - 2)).max(k_offset + k.dim(k.rank() - 2));
        self.ensure_capacity(max_pos.saturating_sub(1));
        let rq = self.rotate_rows(q, |row| row + q_offset)?;
        let rk = self.rotate_rows(k, |row| row + k_offset)?;
        Ok((rq, rk))
    }

    /// Apply a single fixed rotation at absolute position `offset` to
    /// every row of `q`. Used so the global-stage query is pre-rotated as
    /// if it sat `offset` positions past the unrotated block keys it
    /// attends to.
    pub fn apply_one_angle(&mut self, q: &DeviceTensor, offset: usize) -> ManagerResult<DeviceTensor> {
        self.ensure_capacity(offset);
        self.rotate_rows(q, |_row| offset)
    }
}
