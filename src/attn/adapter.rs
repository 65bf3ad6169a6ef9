//! Multi-stage attention contract and its CPU reference implementation.
//!
//! The attention primitive is treated as opaque external plumbing — a real
//! deployment slots in a kernel behind [`MultiStageAttention`].
//! `ReferenceAttention` is the concrete implementation that makes this
//! crate compile and test on its own: a real, numerically faithful
//! scaled dot-product softmax, online-combined across stages via the
//! standard running-max log-sum-exp accumulator. Single-threaded, `f32`,
//! not a performance target.

use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;

/// Restriction on which keys of a stage a query row may attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingWindow {
    /// Keep only the trailing `width` keys of the stage's key axis.
    Trailing(usize),
    /// Keep only `[offset, offset + width)` of the stage's key axis.
    Range(usize, usize),
}

/// A multi-stage, online-combined attention primitive. Each call to
/// [`Self::push`] submits one stage (one partition of the key space);
/// [`Self::result`] finalises after the stage marked `end = true`.
pub trait MultiStageAttention {
    fn push(
        &mut self,
        q: &DeviceTensor,
        k: &DeviceTensor,
        v: &DeviceTensor,
        sliding_window: Option<SlidingWindow>,
        complement_sliding_window: bool,
        request_scores: bool,
        end: bool,
    ) -> ManagerResult<()>;

    /// Finalise the online-combined output plus one raw, un-reduced
    /// attention-weight tensor per stage that requested scores (`None`
    /// for stages that didn't). Shape `(num_units, unit_size, Lq, Lk)`
    /// per stage — reduction (sum for local-stage usage scoring, mean
    /// for global-stage block scoring) is the caller's job, not this
    /// primitive's.
    fn result(&mut self) -> ManagerResult<(DeviceTensor, Vec<Option<DeviceTensor>>)>;
}

struct StageState {
    /// Running max per query row, `(num_units, unit_size, Lq)`.
    max: Vec<f32>,
    /// Running softmax denominator per query row, same shape as `max`.
    sum: Vec<f32>,
    /// Running weighted value accumulator, `(num_units, unit_size, Lq, dim_head)`.
    output: Vec<f32>,
}

pub struct ReferenceAttention {
    dim_head: usize,
    shape: Option<[usize; 3]>, // (num_units, unit_size, Lq), fixed by the first push
    state: Option<StageState>,
    scores: Vec<Option<DeviceTensor>>,
    finished: bool,
}

impl ReferenceAttention {
    pub fn new(dim_head: usize) -> Self {
        Self {
            dim_head,
            shape: None,
            state: None,
            scores: Vec::new(),
            finished: false,
        }
    }

    fn mask_for(lk: usize, sliding_window: Option<SlidingWindow>, complement: bool) -> ManagerResult<Option<Vec<bool>>> {
        let window = match sliding_window {
            Some(w) => w,
            None => {
                if complement {
                    return Err(ManagerError::invariant(
                        "complement_sliding_window requires a sliding_window to negate",
                    ));
                }
                return Ok(None);
            }
        };
        let (start, width) = match window {
            SlidingWindow::Trailing(w) => (lk.saturating_sub(w), w.min(lk)),
            SlidingWindow::Range(offset, width) => {
                let start = offset.min(lk);
                let end = (offset + width).min(lk);
                (start, end - start)
            }
        };
        let mut keep = vec![false; lk];
        for col in keep.iter_mut().skip(start).take(width) {
            *col = true;
        }
        if complement {
            for col in keep.iter_mut() {
                *col = !*col;
            }
        }
        Ok(Some(keep))
    }
}

impl MultiStageAttention for ReferenceAttention {
    fn push(
        &mut self,
        q: &DeviceTensor,
        k: &DeviceTensor,
        v: &DeviceTensor,
        sliding_window: Option<SlidingWindow>,
        complement_sliding_window: bool,
        request_scores: bool,
        end: bool,
    ) -> ManagerResult<()> {
        if self.finished {
            return Err(ManagerError::invariant("push called after result()"));
        }
        if q.dim(q.rank() - 1) != self.dim_head {
            return Err(ManagerError::ShapeMismatch {
                context: "ReferenceAttention::push",
                detail: format!("q last axis {} != dim_head {}", q.dim(q.rank() - 1), self.dim_head),
            });
        }

        let num_units = q.dim(0);
        let h_q = q.dim(1);
        let lq = q.dim(2);
        let h_kv = k.dim(1);
        let lk = k.dim(2);

        if h_kv == 0 || h_q % h_kv != 0 {
            return Err(ManagerError::invariant(format!(
                "query head count {h_q} not a multiple of kv head count {h_kv}"
            )));
        }
        let groups = h_q / h_kv;
        let k_b = k.repeat_interleave_axis(1, groups);
        let v_b = v.repeat_interleave_axis(1, groups);

        match self.shape {
            None => self.shape = Some([num_units, h_q, lq]),
            Some(shape) => {
                if shape != [num_units, h_q, lq] {
                    return Err(ManagerError::ShapeMismatch {
                        context: "ReferenceAttention::push",
                        detail: "query shape changed between stages".to_string(),
                    });
                }
            }
        }

        let scale = 1.0 / (self.dim_head as f32).sqrt();
        let raw = q.batched_dot_last(&k_b)?; // (num_units, h_q, Lq, Lk)
        let mask = Self::mask_for(lk, sliding_window, complement_sliding_window)?;

        let mut masked = raw.data().to_vec();
        // `chunks`/`chunks_mut` panic on a zero chunk size even over an
        // empty slice, and lk == 0 is a legitimate state (e.g. the very
        // first chunk of the very first call has no blocks, init prefix,
        // or remainder yet to form a global key space). Every row
        // trivially has no keys in that case, so skip straight to the
        // all-`NEG_INFINITY` stage_max below instead of chunking by 0.
        if lk > 0 {
            if let Some(keep) = &mask {
                for row in masked.chunks_mut(lk) {
                    for (col, m) in row.iter_mut().zip(keep.iter()) {
                        if !*m {
                            *col = f32::NEG_INFINITY;
                        }
                    }
                }
            }
        }
        for v in masked.iter_mut() {
            *v *= scale;
        }

        let rows = num_units * h_q * lq;
        let mut stage_max = vec![f32::NEG_INFINITY; rows];
        if lk > 0 {
            for (r, row) in masked.chunks(lk).enumerate() {
                stage_max[r] = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            }
        }

        let mut exp_scores = vec![0.0f32; rows * lk];
        let mut stage_sum = vec![0.0f32; rows];
        for r in 0..rows {
            let m = stage_max[r];
            if m.is_finite() {
                for c in 0..lk {
                    let e = (masked[r * lk + c] - m).exp();
                    exp_scores[r * lk + c] = e;
                    stage_sum[r] += e;
                }
            }
            // m == -inf: every key masked out for this row; this stage
            // contributes nothing, exp_scores/stage_sum stay zero.
        }

        if request_scores {
            self.scores.push(Some(DeviceTensor::from_data(&[num_units, h_q, lq, lk], exp_scores.clone())?));
        } else {
            self.scores.push(None);
        }

        let exp_t = DeviceTensor::from_data(&[num_units, h_q, lq, lk], exp_scores)?;
        let stage_output = exp_t.batched_matmul(&v_b)?; // (num_units, h_q, Lq, dim_head)

        match self.state.take() {
            None => {
                self.state = Some(StageState {
                    max: stage_max,
                    sum: stage_sum,
                    output: stage_output.data().to_vec(),
                });
            }
            Some(prev) => {
                let mut new_max = vec![0.0f32; rows];
                let mut scale_old = vec![0.0f32; rows];
                let mut scale_new = vec![0.0f32; rows];
                for r in 0..rows {
                    let nm = prev.max[r].max(stage_max[r]);
                    new_max[r] = nm;
                    scale_old[r] = if nm.is_finite() { (prev.max[r] - nm).exp() } else { 0.0 };
                    scale_new[r] = if nm.is_finite() { (stage_max[r] - nm).exp() } else { 0.0 };
                }
                let mut sum = vec![0.0f32; rows];
                for r in 0..rows {
                    sum[r] = prev.sum[r] * scale_old[r] + stage_sum[r] * scale_new[r];
                }
                let stage_data = stage_output.data();
                let mut output = vec![0.0f32; rows * self.dim_head];
                for r in 0..rows {
                    for d in 0..self.dim_head {
                        output[r * self.dim_head + d] = prev.output[r * self.dim_head + d] * scale_old[r]
                            + stage_data[r * self.dim_head + d] * scale_new[r];
                    }
                }
                self.state = Some(StageState {
                    max: new_max,
                    sum,
                    output,
                });
            }
        }

        if end {
            self.finished = true;
        }
        Ok(())
    }

    fn result(&mut self) -> ManagerResult<(DeviceTensor, Vec<Option<DeviceTensor>>)> {
        if !self.finished {
            return Err(ManagerError::invariant("result() called before an end=true stage"));
        }
        let [num_units, h_q, lq] = self.shape.ok_or_else(|| ManagerError::invariant("result() called with no stages pushed"))?;
        let state = self.state.as_ref().expect("finished implies at least one stage pushed");

        let mut output = state.output.clone();
        for r in 0..num_units * h_q * lq {
            let denom = state.sum[r];
            if denom > 0.0 {
                for d in 0..self.dim_head {
                    output[r * self.dim_head + d] /= denom;
                }
            }
        }
        let output = DeviceTensor::from_data(&[num_units, h_q, lq, self.dim_head], output)?;
        Ok((output, std::mem::take(&mut self.scores)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_stage_matches_plain_softmax_attention() {
        let mut attn = ReferenceAttention::new(2);
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let v = DeviceTensor::from_data(&[1, 1, 2, 2], vec![10.0, 0.0, 0.0, 20.0]).unwrap();
        attn.push(&q, &k, &v, None, false, false, true).unwrap();
        let (out, scores) = attn.result().unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 2]);
        assert_eq!(scores.len(), 1);
        assert!(scores[0].is_none());
        // q·k0 = 1/sqrt(2), q·k1 = 0 -> softmax favors v0 but not all the way.
        assert!(out.data()[0] > out.data()[1]);
    }

    #[test]
    fn test_two_stage_union_equals_single_stage_over_concatenated_keys() {
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![0.3, 0.7]).unwrap();
        let k1 = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let v1 = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 1.0]).unwrap();
        let k2 = DeviceTensor::from_data(&[1, 1, 1, 2], vec![0.0, 1.0]).unwrap();
        let v2 = DeviceTensor::from_data(&[1, 1, 1, 2], vec![2.0, 2.0]).unwrap();

        let mut staged = ReferenceAttention::new(2);
        staged.push(&q, &k1, &v1, None, false, false, false).unwrap();
        staged.push(&q, &k2, &v2, None, false, false, true).unwrap();
        let (staged_out, _) = staged.result().unwrap();

        let k_all = DeviceTensor::concat_axis(&[&k1, &k2], 2).unwrap();
        let v_all = DeviceTensor::concat_axis(&[&v1, &v2], 2).unwrap();
        let mut single = ReferenceAttention::new(2);
        single.push(&q, &k_all, &v_all, None, false, false, true).unwrap();
        let (single_out, _) = single.result().unwrap();

        for (a, b) in staged_out.data().iter().zip(single_out.data()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_sliding_window_restricts_to_trailing_keys() {
        let mut attn = ReferenceAttention::new(2);
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 1, 3, 2], vec![5.0, 5.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
        let v = DeviceTensor::from_data(&[1, 1, 3, 2], vec![100.0, 100.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
        attn.push(&q, &k, &v, Some(SlidingWindow::Trailing(2)), false, false, true).unwrap();
        let (out, _) = attn.result().unwrap();
        // trailing window excludes column 0 (the huge key/value), output
        // must stay within the [0,1] range the remaining two values span.
        assert!(out.data()[0] < 2.0);
    }

    #[test]
    fn test_complement_sliding_window_covers_disjoint_keys() {
        let mut attn = ReferenceAttention::new(2);
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 1, 3, 2], vec![5.0, 5.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
        let v = DeviceTensor::from_data(&[1, 1, 3, 2], vec![100.0, 100.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
        attn.push(&q, &k, &v, Some(SlidingWindow::Trailing(2)), true, false, true).unwrap();
        let (out, _) = attn.result().unwrap();
        // complement of the trailing 2 keeps only column 0, so the huge
        // value must now dominate the output.
        assert!(out.data()[0] > 50.0);
    }

    #[test]
    fn test_gqa_broadcasts_kv_heads_across_query_groups() {
        let mut attn = ReferenceAttention::new(2);
        // 4 query heads, 2 kv heads -> groups = 2
        let q = DeviceTensor::from_data(&[1, 4, 1, 2], vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 2, 1, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let v = DeviceTensor::from_data(&[1, 2, 1, 2], vec![9.0, 9.0, 4.0, 4.0]).unwrap();
        attn.push(&q, &k, &v, None, false, false, true).unwrap();
        let (out, _) = attn.result().unwrap();
        assert_eq!(out.shape(), &[1, 4, 1, 2]);
        // heads 0,1 share kv head 0; heads 2,3 share kv head 1 -> pairwise equal.
        assert_eq!(&out.data()[0..2], &out.data()[2..4]);
        assert_eq!(&out.data()[4..6], &out.data()[6..8]);
    }

    #[test]
    fn test_request_scores_returns_full_weight_matrix_per_stage() {
        let mut attn = ReferenceAttention::new(2);
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let k = DeviceTensor::from_data(&[1, 1, 3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let v = k.clone();
        attn.push(&q, &k, &v, None, false, true, true).unwrap();
        let (_, scores) = attn.result().unwrap();
        let s = scores[0].as_ref().unwrap();
        assert_eq!(s.shape(), &[1, 1, 1, 3]);
    }
}
