//! Materialises the assembled global K/V buffer.
//!
//! Named after `get_global_hidden_and_mask`-style assembly. Block-map
//! reuse is tracked with a plain `prev_map`/`new_map` swap instead of a
//! deep copy.
//!
//! Tensors here keep the leading `num_units` axis pinned at length 1 (a
//! slice, not a reshape) — the same convention `BlockStore` uses for its
//! per-unit block storage, so writing a block into the buffer never needs
//! to add or drop an axis.

use std::collections::HashSet;

use crate::cache::block_store::BlockStore;
use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

/// Output of one `Assembler::build` call.
pub struct AssembledGlobal {
    /// `(1, unit_size, total_len, dim_head)` per unit, concatenated over
    /// units along axis 0 by the caller if a full batch view is needed.
    pub k: Vec<DeviceTensor>,
    pub v: Vec<DeviceTensor>,
    /// The global stage must restrict each query row to keys within the
    /// last `sliding_window` positions of the assembled key space — the
    /// remainder, when appended, is always assembled at the tail (§4.5
    /// step 4), so "the last `n_local` positions of the rightmost
    /// stretch" is exactly a trailing window over the whole buffer; no
    /// separate offset is needed (simplified from the source's
    /// `(remainder_full_len + rmd_offset, n_local)` pair, which only
    /// ever resolves to a trailing window once the remainder is the
    /// rightmost stretch). `None` when the remainder was not appended
    /// this call (empty, or dropped by `ignore_remainder`) — the source
    /// only sets a window when the remainder is appended
    /// (`context_manager.py:443`); otherwise the global stage attends
    /// to the whole assembled `[blocks ‖ init]` region unmasked.
    pub sliding_window: Option<usize>,
    /// Per unit, `slot -> block id` (`None` for an unused trailing slot).
    pub block_map: Vec<Vec<Option<usize>>>,
    pub block_num: usize,
}

pub struct Assembler {
    num_units: usize,
    unit_size: usize,
    dim_head: usize,
    block_size: usize,
    n_init: usize,
    n_local: usize,
    max_calc_block: usize,
    use_buffer: bool,
    b_max: usize,
    k_buffer: Option<Vec<DeviceTensor>>,
    v_buffer: Option<Vec<DeviceTensor>>,
    prev_block_map: Vec<Vec<Option<usize>>>,
}

impl Assembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_units: usize,
        unit_size: usize,
        dim_head: usize,
        block_size: usize,
        n_init: usize,
        n_local: usize,
        max_calc_block: usize,
        exc_block_size: usize,
        ignore_remainder: bool,
        use_buffer: bool,
    ) -> Self {
        let mut b_max = max_calc_block * block_size + exc_block_size + block_size + n_init;
        if ignore_remainder {
            b_max = b_max.saturating_sub(exc_block_size + block_size);
        }
        let b_max = b_max.max(1);

        let (k_buffer, v_buffer) = if use_buffer {
            let template = [1, unit_size, b_max, dim_head];
            (
                Some((0..num_units).map(|_| DeviceTensor::zeros(&template)).collect()),
                Some((0..num_units).map(|_| DeviceTensor::zeros(&template)).collect()),
            )
        } else {
            (None, None)
        };

        Self {
            num_units,
            unit_size,
            dim_head,
            block_size,
            n_init,
            n_local,
            max_calc_block,
            use_buffer,
            b_max,
            k_buffer,
            v_buffer,
            prev_block_map: (0..num_units).map(|_| Vec::new()).collect(),
        }
    }

    /// Build the assembled global K/V for this chunk.
    ///
    /// `selected`: per-unit forced-include block ids (this chunk's
    /// top-k). `init_kv`/`remainder_kv`: per-unit `(k, v)` slices of
    /// shape `(1, unit_size, len, dim_head)`, or `None` if empty.
    pub async fn build(
        &mut self,
        block_store: &mut BlockStore,
        selected: &[Vec<usize>],
        init_kv: &[Option<(DeviceTensor, DeviceTensor)>],
        remainder_kv: &[Option<(DeviceTensor, DeviceTensor)>],
    ) -> ManagerResult<AssembledGlobal> {
        let mut block_num = None;
        let mut per_unit_candidates = Vec::with_capacity(self.num_units);

        for u in 0..self.num_units {
            let selected_set: HashSet<usize> = selected[u].iter().copied().collect();
            let mut candidates: Vec<(f64, usize)> = block_store
                .resident_ids(u)
                .into_iter()
                .map(|id| {
                    let value = if selected_set.contains(&id) {
                        f64::INFINITY
                    } else {
                        block_store.score(u, id).min(1e8)
                    };
                    (value, id)
                })
                .collect();
            candidates.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });
            candidates.truncate(self.max_calc_block);
            let ids: Vec<usize> = candidates.into_iter().map(|(_, id)| id).collect();

            match block_num {
                None => block_num = Some(ids.len()),
                Some(n) => {
                    if n != ids.len() {
                        return Err(ManagerError::invariant(format!(
                            "assembler: block_num differs across units ({n} vs {})",
                            ids.len()
                        )));
                    }
                }
            }
            per_unit_candidates.push(ids);
        }
        let block_num = block_num.unwrap_or(0);

        let mut new_block_map = vec![vec![None; block_num]; self.num_units];

        for u in 0..self.num_units {
            let candidate_set: HashSet<usize> = per_unit_candidates[u].iter().copied().collect();
            let mut placed: HashSet<usize> = HashSet::new();

            if let Some(old_map) = self.prev_block_map.get(u) {
                for (slot, old_id) in old_map.iter().enumerate() {
                    if slot >= block_num {
                        break;
                    }
                    if let Some(id) = old_id {
                        if candidate_set.contains(id) {
                            new_block_map[u][slot] = Some(*id);
                            placed.insert(*id);
                        }
                    }
                }
            }

            let mut free_slots = (0..block_num).filter(|s| new_block_map[u][*s].is_none());
            for &id in &per_unit_candidates[u] {
                if placed.contains(&id) {
                    continue;
                }
                let slot = free_slots.next().ok_or_else(|| {
                    ManagerError::invariant("assembler: ran out of free slots for candidates".to_string())
                })?;
                new_block_map[u][slot] = Some(id);

                if self.use_buffer {
                    let (k, v) = block_store.resident_kv(u, id).await?;
                    let offset = slot * self.block_size;
                    self.k_buffer.as_mut().unwrap()[u].write_axis(2, offset, &k)?;
                    self.v_buffer.as_mut().unwrap()[u].write_axis(2, offset, &v)?;
                }
            }
        }

        let mut k_out = Vec::with_capacity(self.num_units);
        let mut v_out = Vec::with_capacity(self.num_units);
        let blocks_len = block_num * self.block_size;

        for u in 0..self.num_units {
            let (blocks_k, blocks_v) = if self.use_buffer {
                (
                    self.k_buffer.as_ref().unwrap()[u].slice_axis(2, 0..blocks_len),
                    self.v_buffer.as_ref().unwrap()[u].slice_axis(2, 0..blocks_len),
                )
            } else {
                // No persistent buffer: rebuild the block region fresh
                // from resident storage every call.
                self.concat_blocks(block_store, u, &new_block_map[u]).await?
            };

            let mut parts_k = vec![blocks_k];
            let mut parts_v = vec![blocks_v];

            if let Some((ik, iv)) = &init_kv[u] {
                parts_k.push(ik.clone());
                parts_v.push(iv.clone());
            }
            if let Some((rk, rv)) = &remainder_kv[u] {
                parts_k.push(rk.clone());
                parts_v.push(rv.clone());
            }

            let refs_k: Vec<&DeviceTensor> = parts_k.iter().collect();
            let refs_v: Vec<&DeviceTensor> = parts_v.iter().collect();
            k_out.push(DeviceTensor::concat_axis(&refs_k, 2)?);
            v_out.push(DeviceTensor::concat_axis(&refs_v, 2)?);
        }

        self.prev_block_map = new_block_map.clone();

        // When the remainder was actually appended this call, it's
        // always the rightmost stretch of the assembled array, so "last
        // n_local positions of the rightmost stretch" is exactly a
        // trailing window over the whole thing. When it wasn't (empty,
        // or dropped by ignore_remainder), there is no window to apply:
        // the rightmost stretch is init/blocks, not local-window
        // content, and the source leaves the global stage unmasked.
        let remainder_appended = remainder_kv.iter().any(|r| r.is_some());
        let sliding_window = if remainder_appended {
            let total_len = k_out.first().map(|k| k.dim(2)).unwrap_or(0);
            Some(self.n_local.min(total_len))
        } else {
            None
        };

        Ok(AssembledGlobal {
            k: k_out,
            v: v_out,
            sliding_window,
            block_map: new_block_map,
            block_num,
        })
    }

    /// Rebuild unit `u`'s block region by reading every slot's resident
    /// K and V fresh, used only when `use_buffer = false`.
    async fn concat_blocks(
        &self,
        block_store: &mut BlockStore,
        u: usize,
        map: &[Option<usize>],
    ) -> ManagerResult<(DeviceTensor, DeviceTensor)> {
        if map.is_empty() {
            let empty_shape = [1, self.unit_size, 0, self.dim_head];
            return Ok((DeviceTensor::zeros(&empty_shape), DeviceTensor::zeros(&empty_shape)));
        }
        let mut ks = Vec::with_capacity(map.len());
        let mut vs = Vec::with_capacity(map.len());
        for slot in map {
            let id = slot.ok_or_else(|| {
                ManagerError::invariant("concat_blocks: unfilled slot in block_map".to_string())
            })?;
            let (k, v) = block_store.resident_kv(u, id).await?;
            ks.push(k);
            vs.push(v);
        }
        let k_refs: Vec<&DeviceTensor> = ks.iter().collect();
        let v_refs: Vec<&DeviceTensor> = vs.iter().collect();
        Ok((
            DeviceTensor::concat_axis(&k_refs, 2)?,
            DeviceTensor::concat_axis(&v_refs, 2)?,
        ))
    }

    pub fn block_capacity(&self) -> usize {
        self.b_max
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheStrategy;

    fn block(val: f32) -> DeviceTensor {
        DeviceTensor::from_data(&[1, 1, 1, 2], vec![val, val]).unwrap()
    }

    #[tokio::test]
    async fn test_build_forces_selected_blocks_resident_and_computes_sliding_window() {
        let mut store = BlockStore::new(1, 4, CacheStrategy::Lru);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();

        let mut assembler = Assembler::new(1, 1, 2, 1, 0, 4, 4, 2, false, true);
        let selected = vec![vec![id0, id1]];
        let init_kv: Vec<Option<(DeviceTensor, DeviceTensor)>> = vec![None];
        let remainder = Some((block(9.0), block(9.0)));
        let remainder_kv = vec![remainder];

        let out = assembler
            .build(&mut store, &selected, &init_kv, &remainder_kv)
            .await
            .unwrap();

        assert_eq!(out.block_num, 2);
        assert_eq!(out.block_map[0].len(), 2);
        assert!(out.block_map[0].contains(&Some(id0)));
        assert!(out.block_map[0].contains(&Some(id1)));
        // total assembled length 2 blocks * 1 + 0 init + 1 remainder = 3,
        // n_local = 4 > 3 so the window clamps to the whole thing.
        assert_eq!(out.sliding_window, Some(3));
    }

    #[tokio::test]
    async fn test_build_omits_sliding_window_when_remainder_not_appended() {
        let mut store = BlockStore::new(1, 4, CacheStrategy::Lru);
        let id0 = store.commit(0, block(0.0), block(0.0));
        store.load(0, id0, 1).await.unwrap();

        let mut assembler = Assembler::new(1, 1, 2, 1, 0, 4, 4, 2, false, true);
        let selected = vec![vec![id0]];
        let init_kv: Vec<Option<(DeviceTensor, DeviceTensor)>> = vec![None];
        let remainder_kv: Vec<Option<(DeviceTensor, DeviceTensor)>> = vec![None];

        let out = assembler
            .build(&mut store, &selected, &init_kv, &remainder_kv)
            .await
            .unwrap();

        assert_eq!(out.sliding_window, None);
    }

    #[tokio::test]
    async fn test_build_reuses_previous_slot_for_unchanged_block() {
        let mut store = BlockStore::new(1, 4, CacheStrategy::Lru);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        let id2 = store.commit(0, block(2.0), block(2.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();
        store.load(0, id2, 3).await.unwrap();

        let mut assembler = Assembler::new(1, 1, 2, 1, 0, 4, 4, 2, false, true);
        let empty_init: Vec<Option<(DeviceTensor, DeviceTensor)>> = vec![None];
        let empty_rmd: Vec<Option<(DeviceTensor, DeviceTensor)>> = vec![None];

        let first = assembler
            .build(&mut store, &[vec![id0, id1]], &empty_init, &empty_rmd)
            .await
            .unwrap();
        let slot_of_id0 = first.block_map[0]
            .iter()
            .position(|x| *x == Some(id0))
            .unwrap();

        let second = assembler
            .build(&mut store, &[vec![id0, id2]], &empty_init, &empty_rmd)
            .await
            .unwrap();
        let slot_of_id0_again = second.block_map[0]
            .iter()
            .position(|x| *x == Some(id0))
            .unwrap();

        assert_eq!(slot_of_id0, slot_of_id0_again);
    }
}
