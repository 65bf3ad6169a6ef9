//! Top-k global block selection.
//!
//! Named after `calc_block_topk` (single-query mode) and
//! `get_batched_topk` (batched chunk mode) style selection routines.

use crate::error::ManagerResult;
use crate::tensor::DeviceTensor;

pub struct Selector {
    topk: usize,
}

impl Selector {
    pub fn new(topk: usize) -> Self {
        Self { topk }
    }

    /// Single-query mode: mean-pool `global_q` over its sequence axis,
    /// score against every representative key, head-average, and return
    /// the top-k block ids for each unit. Naturally degenerates to "all
    /// block ids" when `num_global_block <= topk`, since
    /// `DeviceTensor::topk_indices_last` clamps `k` to the available
    /// column count.
    pub fn select_single(
        &self,
        global_q: &DeviceTensor,
        representatives: &DeviceTensor,
    ) -> ManagerResult<Vec<Vec<usize>>> {
        self.select_window(global_q, representatives)
    }

    /// Batched chunk mode: split the sequence axis of `global_q` into
    /// consecutive windows of `exc_block_size` (the last window may be
    /// shorter), and run `select_single`'s scoring independently per
    /// window. Returns one top-k list per `(window, unit)`.
    pub fn select_batched(
        &self,
        global_q: &DeviceTensor,
        representatives: &DeviceTensor,
        exc_block_size: usize,
    ) -> ManagerResult<Vec<Vec<Vec<usize>>>> {
        let l = global_q.dim(2);
        let mut windows = Vec::new();
        let mut start = 0;
        while start < l {
            let end = (start + exc_block_size).min(l);
            let window_q = global_q.slice_axis(2, start..end);
            windows.push(self.select_window(&window_q, representatives)?);
            start = end;
        }
        Ok(windows)
    }

    fn select_window(
        &self,
        q: &DeviceTensor,
        representatives: &DeviceTensor,
    ) -> ManagerResult<Vec<Vec<usize>>> {
        let q_mean = q.mean_axis(2, true); // (num_units, unit_size, 1, dim_head)
        let score = q_mean.batched_dot_last(representatives)?; // (num_units, unit_size, 1, num_global_block)
        let head_avg = score.mean_axis(1, false); // (num_units, 1, num_global_block)
        Ok(head_avg.topk_indices_last(self.topk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reprs() -> DeviceTensor {
        // num_units=1, unit_size=1, num_global_block=3, dim_head=2
        DeviceTensor::from_data(
            &[1, 1, 3, 2],
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_select_single_picks_highest_scoring_block() {
        let selector = Selector::new(1);
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let picks = selector.select_single(&q, &reprs()).unwrap();
        assert_eq!(picks, vec![vec![0]]);
    }

    #[test]
    fn test_select_single_degenerates_to_all_blocks() {
        let selector = Selector::new(10); // topk > num_global_block
        let q = DeviceTensor::from_data(&[1, 1, 1, 2], vec![1.0, 0.0]).unwrap();
        let picks = selector.select_single(&q, &reprs()).unwrap();
        assert_eq!(picks[0].len(), 3);
    }

    #[test]
    fn test_select_batched_produces_one_list_per_window() {
        let selector = Selector::new(1);
        // L = 5, exc_block_size = 2 -> windows of size 2, 2, 1
        let q = DeviceTensor::from_data(
            &[1, 1, 5, 2],
            vec![
                1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0,
            ],
        )
        .unwrap();
        let windows = selector.select_batched(&q, &reprs(), 2).unwrap();
        assert_eq!(windows.len(), 3);
        for w in &windows {
            assert_eq!(w.len(), 1); // one unit
            assert_eq!(w[0].len(), 1); // topk = 1
        }
    }
}
