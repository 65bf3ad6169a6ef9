//! The streaming attention context manager itself.
//!
//! Named after `init`/`append`/`_append`/`append_global`/
//! `update_block_score`-style entry points. One struct owns every piece of
//! mutable state — the local sliding window, the not-yet-committed
//! remainder, the initial prefix, the block store, the representative
//! index, the selector, the assembler, the attention primitive and the
//! rotary tables — and drives them through one `append` call per chunk of
//! incoming tokens, in the same one-struct/`&mut self`-async-methods shape
//! as `cache::pager::Pager`.

use std::cmp::Ordering;

use crate::attn::{MultiStageAttention, ReferenceAttention, RotaryEmbedding, SlidingWindow};
use crate::cache::{Assembler, BlockStore, RepresentativeIndex, Selector};
use crate::config::{CacheStrategy, ManagerConfig};
use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

/// Drives the full streaming attention pipeline across repeated calls to
/// [`Self::append`]. One instance per independent stream of tokens.
pub struct Orchestrator {
    config: ManagerConfig,

    num_units: usize,
    unit_size: usize,
    num_heads: usize,
    dim_head: usize,

    /// Total tokens appended so far.
    length: usize,
    initialized: bool,
    /// Whether the initial prefix (`init_k`/`init_v`) has reached `n_init`.
    init_exc: bool,
    /// Monotone ticket source handed to `BlockStore::load`.
    load_count: u64,

    /// Front/back of the currently-active remainder window, indices into
    /// `remainder_k`/`remainder_v`/`remainder_local_score`. `remainder_st`
    /// advances as tokens are absorbed into the init prefix or committed
    /// to blocks; `remainder_ed` advances as each execution chunk's
    /// contribution becomes eligible for those operations.
    remainder_st: usize,
    remainder_ed: usize,

    /// Trailing `n_local` (or fewer, early on) raw K/V, extended every
    /// call and truncated back down to `n_local` at the end of it.
    local_k: DeviceTensor,
    local_v: DeviceTensor,
    /// Not-yet-committed raw K/V, extended every call and truncated down
    /// to `[remainder_st, remainder_ed)`'s unconsumed suffix at the end.
    remainder_k: DeviceTensor,
    remainder_v: DeviceTensor,
    /// Accumulated local-stage attention received, one column per
    /// remainder position, used to pick each block's representative.
    remainder_local_score: DeviceTensor,
    /// Initial-prefix K/V, filled once from the head of the remainder and
    /// then held fixed (until `init_exc` flips, it keeps absorbing).
    init_k: DeviceTensor,
    init_v: DeviceTensor,

    block_store: BlockStore,
    repr_index: RepresentativeIndex,
    selector: Selector,
    assembler: Assembler,
    rotary: RotaryEmbedding,
}

impl Orchestrator {
    pub fn new(config: ManagerConfig) -> Self {
        let dim_head = config.dim_head;
        Self {
            num_units: 0,
            unit_size: 0,
            num_heads: 0,
            dim_head,
            length: 0,
            initialized: false,
            init_exc: false,
            load_count: 0,
            remainder_st: 0,
            remainder_ed: 0,
            local_k: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            local_v: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            remainder_k: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            remainder_v: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            remainder_local_score: DeviceTensor::zeros(&[0, 0, 0]),
            init_k: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            init_v: DeviceTensor::zeros(&[0, 0, 0, dim_head.max(1)]),
            block_store: BlockStore::new(0, config.max_cached_block, config.cache_strategy),
            repr_index: RepresentativeIndex::new(0, 0, dim_head.max(1), 1),
            selector: Selector::new(config.topk),
            assembler: Assembler::new(
                0,
                0,
                dim_head.max(1),
                config.block_size,
                config.n_init,
                config.n_local,
                config.max_calc_block,
                config.exc_block_size,
                config.ignore_remainder,
                config.use_buffer,
            ),
            rotary: RotaryEmbedding::new(dim_head.max(1), 10000.0),
            config,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn resident_blocks(&self, u: usize) -> usize {
        self.block_store.resident_count(u)
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    /// Number of committed blocks for unit `u` (equal to the
    /// representative index's length for that unit).
    pub fn num_committed_blocks(&self, u: usize) -> usize {
        self.block_store.num_blocks(u)
    }

    /// Current local-window length, always `<= n_local`.
    pub fn local_window_len(&self) -> usize {
        self.local_k.dim(2)
    }

    /// Current initial-prefix length, always `<= n_init`.
    pub fn init_len(&self) -> usize {
        self.init_k.dim(2)
    }

    /// Current (uncommitted) remainder length.
    pub fn remainder_len(&self) -> usize {
        self.remainder_k.dim(2)
    }

    /// Attention heads (or single head, in per-head mode) grouped per unit.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Representative-index length, which must track `num_committed_blocks`
    /// 1:1 for every unit.
    pub fn representative_count(&self) -> usize {
        self.repr_index.len()
    }

    /// Currently-resident block ids for unit `u`. Every id here is
    /// `< num_committed_blocks(u)`.
    pub fn resident_ids(&self, u: usize) -> Vec<usize> {
        self.block_store.resident_ids(u)
    }

    /// Lazily initialize per-unit shapes and every owned component from
    /// the first call's tensor shapes.
    fn init_from_shapes(&mut self, local_q: &DeviceTensor, local_k: &DeviceTensor) -> ManagerResult<()> {
        let dim_head = local_q.dim(3);
        if dim_head != self.config.dim_head {
            return Err(ManagerError::ShapeMismatch {
                context: "Orchestrator::init_from_shapes",
                detail: format!("input dim_head {dim_head} != configured {}", self.config.dim_head),
            });
        }
        let batch_size = local_q.dim(0);
        let num_heads = local_q.dim(1);
        let num_heads_kv = local_k.dim(1);
        if num_heads_kv == 0 || num_heads % num_heads_kv != 0 {
            return Err(ManagerError::invariant(format!(
                "query head count {num_heads} not a multiple of kv head count {num_heads_kv}"
            )));
        }

        let (num_units, unit_size) = if self.config.perhead {
            (batch_size * num_heads, 1)
        } else {
            (batch_size, num_heads)
        };

        self.num_units = num_units;
        self.unit_size = unit_size;
        self.num_heads = num_heads;
        self.dim_head = dim_head;

        self.local_k = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);
        self.local_v = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);
        self.remainder_k = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);
        self.remainder_v = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);
        self.remainder_local_score = DeviceTensor::zeros(&[num_units, unit_size, 0]);
        self.init_k = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);
        self.init_v = DeviceTensor::zeros(&[num_units, unit_size, 0, dim_head]);

        self.block_store = BlockStore::new(num_units, self.config.max_cached_block, self.config.cache_strategy);
        self.repr_index = RepresentativeIndex::new(num_units, unit_size, dim_head, 1);
        self.selector = Selector::new(self.config.topk);
        self.assembler = Assembler::new(
            num_units,
            unit_size,
            dim_head,
            self.config.block_size,
            self.config.n_init,
            self.config.n_local,
            self.config.max_calc_block,
            self.config.exc_block_size,
            self.config.ignore_remainder,
            self.config.use_buffer,
        );
        self.rotary = RotaryEmbedding::new(dim_head, 10000.0);
        self.rotary.precompute_tables(self.config.n_local + self.config.exc_block_size + 1);

        self.initialized = true;
        Ok(())
    }

    /// Flatten `(batch, H, L, D)` to per-unit form and broadcast K/V
    /// across GQA groups so K/V carry `num_heads` (not `num_heads_kv`)
    /// before the reshape.
    fn to_units(
        &self,
        q: &DeviceTensor,
        k: &DeviceTensor,
        v: &DeviceTensor,
    ) -> ManagerResult<(DeviceTensor, DeviceTensor, DeviceTensor)> {
        let h_q = q.dim(1);
        let h_kv = k.dim(1);
        if h_kv == 0 || h_q % h_kv != 0 {
            return Err(ManagerError::invariant(format!(
                "query head count {h_q} not a multiple of kv head count {h_kv}"
            )));
        }
        let groups = h_q / h_kv;
        let k_b = k.repeat_interleave_axis(1, groups);
        let v_b = v.repeat_interleave_axis(1, groups);

        if self.config.perhead {
            let (b, h, l, d) = (q.dim(0), q.dim(1), q.dim(2), q.dim(3));
            Ok((
                q.reshape(&[b * h, 1, l, d])?,
                k_b.reshape(&[b * h, 1, l, d])?,
                v_b.reshape(&[b * h, 1, l, d])?,
            ))
        } else {
            Ok((q.clone(), k_b, v_b))
        }
    }

    fn from_units(&self, t: &DeviceTensor, batch_size: usize) -> ManagerResult<DeviceTensor> {
        if self.config.perhead {
            let l = t.dim(2);
            t.reshape(&[batch_size, self.num_heads, l, self.dim_head])
        } else {
            Ok(t.clone())
        }
    }

    fn concat_into(existing: &mut DeviceTensor, new: DeviceTensor, axis: usize) -> ManagerResult<()> {
        if existing.dim(axis) == 0 {
            *existing = new;
            return Ok(());
        }
        if new.dim(axis) == 0 {
            return Ok(());
        }
        let combined = DeviceTensor::concat_axis(&[&*existing, &new], axis)?;
        *existing = combined;
        Ok(())
    }

    /// Submit one chunk of `local_q/local_k/local_v/global_q/global_k/global_v`
    /// and get back the corresponding chunk of output, advancing every
    /// piece of streaming state through its seven-step pipeline.
    pub async fn append(
        &mut self,
        local_q: DeviceTensor,
        local_k: DeviceTensor,
        local_v: DeviceTensor,
        global_q: DeviceTensor,
        global_k: DeviceTensor,
        global_v: DeviceTensor,
    ) -> ManagerResult<DeviceTensor> {
        if !self.initialized {
            self.init_from_shapes(&local_q, &local_k)?;
        }
        let batch_size = local_q.dim(0);
        let l_in = local_q.dim(2);
        if l_in == 0 {
            return self.from_units(&DeviceTensor::zeros(&[self.num_units, self.unit_size, 0, self.dim_head]), batch_size);
        }

        // Step 1: flatten to units, broadcast GQA groups.
        let (u_local_q, u_local_k, u_local_v) = self.to_units(&local_q, &local_k, &local_v)?;
        let (u_global_q, u_global_k, u_global_v) = self.to_units(&global_q, &global_k, &global_v)?;

        // Step 2: extend local window and remainder by this call's tokens.
        Self::concat_into(&mut self.local_k, u_local_k, 2)?;
        Self::concat_into(&mut self.local_v, u_local_v, 2)?;

        let remainder_base = self.remainder_k.dim(2);
        Self::concat_into(&mut self.remainder_k, u_global_k, 2)?;
        Self::concat_into(&mut self.remainder_v, u_global_v, 2)?;
        let pad = DeviceTensor::zeros(&[self.num_units, self.unit_size, l_in]);
        Self::concat_into(&mut self.remainder_local_score, pad, 2)?;
        self.remainder_st = 0;
        self.remainder_ed = remainder_base;

        // Step 3: the global query is rotated once, as if it sat n_local
        // positions past the (unrotated) blocks it attends to.
        let u_global_q = self.rotary.apply_one_angle(&u_global_q, self.config.n_local)?;

        // Step 4: optional batched top-k over super-chunk-sized windows,
        // to cut the number of host/device sync points. Our reference
        // selector already windows by exc_block_size; chunk_topk_calc's
        // extra grouping only affects how many host reads a real backend
        // would need, not the data computed, so it's a pure read-batching
        // hint here.
        let batched_topk = if self.config.chunk_topk_calc.is_some() && l_in > 1 {
            Some(self.selector.select_batched(&u_global_q, &self.repr_index.get_data(), self.config.exc_block_size)?)
        } else {
            None
        };

        let kv_length_total = self.local_k.dim(2);
        let mut outputs: Vec<DeviceTensor> = Vec::new();
        let mut st = 0;
        let mut chunk_idx = 0usize;
        while st < l_in {
            let ed = (st + self.config.exc_block_size).min(l_in);
            let kv_ed = kv_length_total + ed - l_in;
            let kv_st = kv_ed.saturating_sub(ed - st + self.config.n_local);

            let local_q_slice = u_local_q.slice_axis(2, st..ed);
            let local_k_slice = self.local_k.slice_axis(2, kv_st..kv_ed);
            let local_v_slice = self.local_v.slice_axis(2, kv_st..kv_ed);
            let global_q_slice = u_global_q.slice_axis(2, st..ed);

            let topk: Vec<Vec<usize>> = if let Some(batched) = &batched_topk {
                batched[chunk_idx].clone()
            } else {
                self.selector.select_single(&global_q_slice, &self.repr_index.get_data())?
            };

            let q_offset = kv_ed - (ed - st);
            let (chunk_out, local_score) = self
                .append_chunk(local_q_slice, local_k_slice, local_v_slice, global_q_slice, topk, q_offset, kv_st)
                .await?;
            outputs.push(chunk_out);

            let exc_length = ed - st;
            let kv_length = kv_ed - kv_st;
            self.append_global(exc_length, kv_length, local_score).await?;

            st = ed;
            chunk_idx += 1;
        }

        // Step 6: drop the consumed prefix of the local window and the
        // remainder (everything before `remainder_st` has either been
        // absorbed into the init prefix or committed to a block by now).
        let cur_local_len = self.local_k.dim(2);
        let trunc_start = cur_local_len.saturating_sub(self.config.n_local);
        self.local_k = self.local_k.slice_axis(2, trunc_start..cur_local_len);
        self.local_v = self.local_v.slice_axis(2, trunc_start..cur_local_len);

        let remainder_total = self.remainder_k.dim(2);
        self.remainder_k = self.remainder_k.slice_axis(2, self.remainder_st..remainder_total);
        self.remainder_v = self.remainder_v.slice_axis(2, self.remainder_st..remainder_total);
        self.remainder_local_score = self.remainder_local_score.slice_axis(2, self.remainder_st..remainder_total);

        // Step 7: concatenate chunk outputs and un-flatten units.
        let refs: Vec<&DeviceTensor> = outputs.iter().collect();
        let unit_output = DeviceTensor::concat_axis(&refs, 2)?;
        let output = self.from_units(&unit_output, batch_size)?;
        self.length += l_in;
        Ok(output)
    }

    /// One execution chunk's two-stream pipeline. The compute stream
    /// (local attention) and the global stream (top-k block load +
    /// assembly) run concurrently via `tokio::join!` — they
    /// touch disjoint state (a fresh `ReferenceAttention` vs. `self`'s
    /// cache components), so there is no shared-state hazard to guard.
    #[allow(clippy::too_many_arguments)]
    async fn append_chunk(
        &mut self,
        local_q: DeviceTensor,
        local_k: DeviceTensor,
        local_v: DeviceTensor,
        global_q: DeviceTensor,
        topk: Vec<Vec<usize>>,
        q_offset: usize,
        k_offset: usize,
    ) -> ManagerResult<(DeviceTensor, DeviceTensor)> {
        let (h_q, h_k) = self.rotary.apply_pair_with_offsets(&local_q, &local_k, q_offset, k_offset)?;
        let h_v = local_v;

        let mut attn = ReferenceAttention::new(self.dim_head);
        let n_local = self.config.n_local;

        // `async_global_stream = false` forces the local-attention push
        // and the global stream's topk+paging+assembly onto one
        // sequential path — same two computations, no overlap between
        // the compute and global streams.
        let assembled = if self.config.async_global_stream {
            let local_fut = async {
                attn.push(&h_q, &h_k, &h_v, Some(SlidingWindow::Trailing(n_local)), false, true, false)
            };
            let global_fut = self.global_stream_prepare(&topk);
            let (local_res, global_res) = tokio::join!(local_fut, global_fut);
            local_res?;
            global_res?
        } else {
            attn.push(&h_q, &h_k, &h_v, Some(SlidingWindow::Trailing(n_local)), false, true, false)?;
            self.global_stream_prepare(&topk).await?
        };

        let k_refs: Vec<&DeviceTensor> = assembled.k.iter().collect();
        let v_refs: Vec<&DeviceTensor> = assembled.v.iter().collect();
        let g_k = DeviceTensor::concat_axis(&k_refs, 0)?;
        let g_v = DeviceTensor::concat_axis(&v_refs, 0)?;

        // When the remainder wasn't appended this call (empty, or
        // dropped by ignore_remainder), there is no sliding window to
        // complement against — attend to the whole assembled
        // [blocks ‖ init] region unmasked instead of wrongly masking
        // its trailing n_local keys.
        let global_window = assembled.sliding_window.map(SlidingWindow::Trailing);
        let complement = global_window.is_some();
        attn.push(
            &global_q,
            &g_k,
            &g_v,
            global_window,
            complement,
            self.config.calc_block_score,
            true,
        )?;
        let (output, mut stage_scores) = attn.result()?;
        let global_score_raw = stage_scores.pop().flatten();
        let local_score_raw = stage_scores
            .pop()
            .flatten()
            .ok_or_else(|| ManagerError::invariant("local stage score missing"))?;
        let local_score = local_score_raw.sum_axis(2, false);

        if self.config.cache_strategy != CacheStrategy::LruS {
            for u in 0..self.num_units {
                self.block_store.evict(u).await?;
            }
        }
        if self.config.calc_block_score {
            if let Some(global_score_raw) = global_score_raw {
                self.update_scores(&global_score_raw, &assembled.block_map, assembled.block_num)?;
            }
        }
        if self.config.cache_strategy == CacheStrategy::LruS {
            for u in 0..self.num_units {
                self.block_store.evict(u).await?;
            }
        }

        Ok((output, local_score))
    }

    /// Global stream: load this chunk's selected blocks, then assemble
    /// the global K/V buffer (init prefix ‖ blocks ‖ active remainder).
    /// Takes no borrow of anything outside `self`, so it can run
    /// concurrently with the compute stream's local-attention push.
    async fn global_stream_prepare(&mut self, topk: &[Vec<usize>]) -> ManagerResult<crate::cache::AssembledGlobal> {
        let mut ticket = self.load_count;
        for (u, ids) in topk.iter().enumerate() {
            for &id in ids {
                ticket += 1;
                self.block_store.load(u, id, ticket).await?;
            }
        }
        self.load_count = ticket;

        let init_kv: Vec<Option<(DeviceTensor, DeviceTensor)>> = (0..self.num_units)
            .map(|u| {
                let ik = self.init_k.slice_axis(0, u..u + 1);
                if ik.dim(2) == 0 {
                    None
                } else {
                    let iv = self.init_v.slice_axis(0, u..u + 1);
                    Some((ik, iv))
                }
            })
            .collect();

        // §4.5 step 4: once the initial prefix is full, `ignore_remainder`
        // trades recall for throughput by dropping the remainder out of
        // the global stage's assembled buffer entirely. Local attention
        // still sees every token via `local_k`/`local_v`, which this flag
        // never touches.
        let omit_remainder = self.config.ignore_remainder && self.init_exc;
        let remainder_kv: Vec<Option<(DeviceTensor, DeviceTensor)>> = (0..self.num_units)
            .map(|u| {
                let len = self.remainder_ed.saturating_sub(self.remainder_st);
                if len == 0 || omit_remainder {
                    None
                } else {
                    let rk = self
                        .remainder_k
                        .slice_axis(0, u..u + 1)
                        .slice_axis(2, self.remainder_st..self.remainder_ed);
                    let rv = self
                        .remainder_v
                        .slice_axis(0, u..u + 1)
                        .slice_axis(2, self.remainder_st..self.remainder_ed);
                    Some((rk, rv))
                }
            })
            .collect();

        self.assembler.build(&mut self.block_store, topk, &init_kv, &remainder_kv).await
    }

    /// Absorb this chunk's contribution into the remainder accounting,
    /// grow the initial prefix, and commit any blocks that have aged far
    /// enough past the sliding window.
    async fn append_global(&mut self, exc_length: usize, kv_length: usize, local_score: DeviceTensor) -> ManagerResult<()> {
        // Step 1: this chunk's tokens become part of the active remainder
        // window for subsequent chunks/calls.
        self.remainder_ed += exc_length;

        // Step 2: fold the local-stage's received-attention tally for the
        // trailing exc_length + n_local positions into remainder_local_score,
        // at the slot these positions actually occupy.
        let l_score = (exc_length + self.config.n_local).min(kv_length).min(local_score.dim(2));
        if l_score > 0 {
            let score_len = local_score.dim(2);
            let score_tail = local_score.slice_axis(2, score_len - l_score..score_len);

            let buf_len = self.remainder_local_score.dim(2);
            let write_end = self.remainder_ed.min(buf_len);
            let write_start = write_end.saturating_sub(l_score);
            let actual_len = write_end - write_start;
            let score_tail = if actual_len < l_score {
                score_tail.slice_axis(2, l_score - actual_len..l_score)
            } else {
                score_tail
            };

            if actual_len > 0 {
                let existing = self.remainder_local_score.slice_axis(2, write_start..write_end);
                let summed_data: Vec<f32> = existing.data().iter().zip(score_tail.data()).map(|(a, b)| a + b).collect();
                let summed = DeviceTensor::from_data(existing.shape(), summed_data)?;
                self.remainder_local_score.write_axis(2, write_start, &summed)?;
            }
        }

        // Step 3: absorb up to n_init tokens from the head of the
        // remainder into the init prefix, once it's grown past n_local.
        if !self.init_exc {
            let remainder_len = self.remainder_ed.saturating_sub(self.remainder_st);
            if remainder_len > self.config.n_local {
                let cur_init_len = self.init_k.dim(2);
                let move_amt = self
                    .config
                    .n_init
                    .saturating_sub(cur_init_len)
                    .min(remainder_len - self.config.n_local);
                if move_amt > 0 {
                    let k_move = self.remainder_k.slice_axis(2, self.remainder_st..self.remainder_st + move_amt);
                    let v_move = self.remainder_v.slice_axis(2, self.remainder_st..self.remainder_st + move_amt);
                    Self::concat_into(&mut self.init_k, k_move, 2)?;
                    Self::concat_into(&mut self.init_v, v_move, 2)?;
                    self.remainder_st += move_amt;
                    if self.init_k.dim(2) >= self.config.n_init {
                        self.init_exc = true;
                    }
                }
            }
        }
        // Open question: ignore_remainder's interaction with lru-s
        // scoring exactly as init_exc flips mid-call is left
        // unspecified by the source; no special-casing added here.

        // Step 4: commit every block that has aged at least n_local past
        // the end of the active remainder window.
        loop {
            let remainder_len = self.remainder_ed.saturating_sub(self.remainder_st);
            if remainder_len < self.config.block_size + self.config.n_local {
                break;
            }
            let block_st = self.remainder_st;
            let block_ed = block_st + self.config.block_size;

            let k_slice = self.remainder_k.slice_axis(2, block_st..block_ed);
            let v_slice = self.remainder_v.slice_axis(2, block_st..block_ed);
            let score_slice = self.remainder_local_score.slice_axis(2, block_st..block_ed);

            let repr_k = representative_from_block(&k_slice, &score_slice, self.config.repr_topk)?;

            for u in 0..self.num_units {
                let k_u = k_slice.slice_axis(0, u..u + 1);
                let v_u = v_slice.slice_axis(0, u..u + 1);
                self.block_store.commit(u, k_u, v_u);
            }
            self.repr_index.append(&repr_k)?;
            self.remainder_st += self.config.block_size;
        }

        Ok(())
    }

    /// Reduce the global stage's raw per-key score into one value per
    /// resident block and fold it into `BlockStore`.
    fn update_scores(&mut self, global_score_raw: &DeviceTensor, block_map: &[Vec<Option<usize>>], block_num: usize) -> ManagerResult<()> {
        if block_num == 0 {
            return Ok(());
        }
        let total_keys = global_score_raw.dim(3);
        let restrict_len = (block_num * self.config.block_size).min(total_keys);
        let restricted = global_score_raw.slice_axis(3, 0..restrict_len);

        let mean_lq = restricted.mean_axis(2, false); // (num_units, unit_size, restrict_len)
        let reshaped = mean_lq.reshape(&[self.num_units, self.unit_size, block_num, self.config.block_size])?;
        let summed_bs = reshaped.sum_axis(3, true); // (num_units, unit_size, block_num, 1)
        let summed_units = summed_bs.sum_axis(1, true); // (num_units, 1, block_num, 1)
        let new_score = summed_units.reshape(&[self.num_units, block_num])?;

        for (u, map_u) in block_map.iter().enumerate() {
            let row = &new_score.data()[u * block_num..(u + 1) * block_num];
            let row_f64: Vec<f64> = row.iter().map(|&x| x as f64).collect();
            self.block_store.update_scores(u, self.config.score_decay, map_u, &row_f64);
        }
        Ok(())
    }
}

/// One committed block's representative key: the mean of the `repr_topk`
/// highest-scoring positions' K rows, per `(unit, head)`. Plain free
/// function — it needs only the two slices, not `Orchestrator`'s other
/// state.
fn representative_from_block(k_block: &DeviceTensor, score_block: &DeviceTensor, repr_topk: usize) -> ManagerResult<DeviceTensor> {
    let num_units = k_block.dim(0);
    let unit_size = k_block.dim(1);
    let block_size = k_block.dim(2);
    let dim_head = k_block.dim(3);
    let topk = repr_topk.clamp(1, block_size.max(1));

    let k_data = k_block.data();
    let s_data = score_block.data();
    let mut out = vec![0.0f32; num_units * unit_size * dim_head];

    for u in 0..num_units {
        for h in 0..unit_size {
            let s_base = (u * unit_size + h) * block_size;
            let mut idx: Vec<usize> = (0..block_size).collect();
            idx.sort_by(|&a, &b| {
                s_data[s_base + b]
                    .partial_cmp(&s_data[s_base + a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            idx.truncate(topk);

            let k_base = (u * unit_size + h) * block_size * dim_head;
            let out_base = (u * unit_size + h) * dim_head;
            for &i in &idx {
                for d in 0..dim_head {
                    out[out_base + d] += k_data[k_base + i * dim_head + d];
                }
            }
            let n = idx.len().max(1) as f32;
            for d in 0..dim_head {
                out[out_base + d] /= n;
            }
        }
    }

    DeviceTensor::from_data(&[num_units, unit_size, 1, dim_head], out)
}
