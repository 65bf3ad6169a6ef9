//! Per-unit paged store of committed (K, V) blocks.
//!
//! Named after `load_block`/`offload_block`/`remove_lru_blocks`-style
//! tiered-cache management, restructured so `resident[u]` is a dense
//! `recency[]`/`score[]` pair plus a residency bitset, with a min-heap
//! (lazily invalidated, the same `BinaryHeap`-by-value idiom
//! `cache::evictor::EvictionCandidate` used) keyed by the active policy's
//! value, instead of a dict sorted on every call.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::CacheStrategy;
use crate::error::{ManagerError, ManagerResult};
use crate::tensor::DeviceTensor;
use crate::transfer::{GpuTransferEngine, TransferDirection, TransferHandle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOutcome {
    AlreadyResident,
    Loaded,
}

/// An orderable `f64` using `total_cmp`, local to the eviction heap so we
/// don't pull in an `ordered-float`-style dependency for one comparator.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapValue(f64);

impl Eq for HeapValue {}
impl PartialOrd for HeapValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct UnitState {
    /// `(k, v)` transfer handle pairs, indexed by block id.
    blocks: Vec<(TransferHandle, TransferHandle)>,
    resident: Vec<bool>,
    /// Assigned on load; FIFO uses the load-time value, LRU refreshes it
    /// on every subsequent load of an already-resident block.
    recency: Vec<u64>,
    /// Accumulated attention score, used only by the `lru-s` policy.
    score: Vec<f64>,
    /// Lazily-invalidated min-heap of `(value, id)`; validity is checked
    /// against `recency`/`score` at pop time.
    heap: BinaryHeap<Reverse<(HeapValue, usize)>>,
}

impl UnitState {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            resident: Vec::new(),
            recency: Vec::new(),
            score: Vec::new(),
            heap: BinaryHeap::new(),
        }
    }

    fn resident_count(&self) -> usize {
        self.resident.iter().filter(|&&r| r).count()
    }

    fn heap_value(&self, strategy: CacheStrategy, id: usize) -> f64 {
        match strategy {
            CacheStrategy::LruS => self.score[id],
            CacheStrategy::Lru | CacheStrategy::Fifo => self.recency[id] as f64,
        }
    }

    fn push_heap(&mut self, strategy: CacheStrategy, id: usize) {
        let v = self.heap_value(strategy, id);
        self.heap.push(Reverse((HeapValue(v), id)));
    }
}

/// Per-unit, append-only, paged store of committed blocks.
pub struct BlockStore {
    units: Vec<UnitState>,
    max_cached_block: usize,
    strategy: CacheStrategy,
    engine: Arc<Mutex<GpuTransferEngine>>,
}

impl BlockStore {
    pub fn new(num_units: usize, max_cached_block: usize, strategy: CacheStrategy) -> Self {
        Self {
            units: (0..num_units).map(|_| UnitState::new()).collect(),
            max_cached_block,
            strategy,
            engine: Arc::new(Mutex::new(GpuTransferEngine::new())),
        }
    }

    pub fn num_blocks(&self, u: usize) -> usize {
        self.units[u].blocks.len()
    }

    pub fn resident_count(&self, u: usize) -> usize {
        self.units[u].resident_count()
    }

    pub fn is_resident(&self, u: usize, id: usize) -> bool {
        self.units[u].resident.get(id).copied().unwrap_or(false)
    }

    /// All currently-resident block ids of unit `u`, used by `Assembler`
    /// to build its candidate list.
    pub fn resident_ids(&self, u: usize) -> Vec<usize> {
        self.units[u]
            .resident
            .iter()
            .enumerate()
            .filter_map(|(id, &r)| r.then_some(id))
            .collect()
    }

    /// Load block `id` of unit `u` into residency. `ticket` is the
    /// monotone ticket source owned by `Orchestrator`. Awaits completion
    /// of any transfer the block's handle was already mid-flight on
    /// before spawning the host→device copy.
    pub async fn load(&mut self, u: usize, id: usize, ticket: u64) -> ManagerResult<LoadOutcome> {
        if id >= self.units[u].blocks.len() {
            return Err(ManagerError::invariant(format!(
                "load: block {id} does not exist in unit {u}"
            )));
        }

        if self.units[u].resident[id] {
            if self.strategy == CacheStrategy::Lru {
                self.units[u].recency[id] = ticket;
                self.units[u].push_heap(self.strategy, id);
            }
            return Ok(LoadOutcome::AlreadyResident);
        }

        let (k_host, v_host) = {
            let (k, v) = &mut self.units[u].blocks[id];
            let k_tensor = k.resolve().await?.clone();
            let v_tensor = v.resolve().await?.clone();
            (k_tensor, v_tensor)
        };

        let unit = &mut self.units[u];
        unit.blocks[id] = (
            TransferHandle::spawn(self.engine.clone(), TransferDirection::HostToDevice, k_host),
            TransferHandle::spawn(self.engine.clone(), TransferDirection::HostToDevice, v_host),
        );
        unit.resident[id] = true;
        match self.strategy {
            CacheStrategy::Lru | CacheStrategy::Fifo => {
                unit.recency[id] = ticket;
            }
            CacheStrategy::LruS => {
                unit.score[id] = 0.0;
            }
        }
        unit.push_heap(self.strategy, id);
        Ok(LoadOutcome::Loaded)
    }

    /// Offload block `id` of unit `u` out of residency. No-op if already
    /// evicted.
    pub async fn offload(&mut self, u: usize, id: usize) -> ManagerResult<()> {
        if id >= self.units[u].blocks.len() || !self.units[u].resident[id] {
            return Ok(());
        }

        let (k_device, v_device) = {
            let (k, v) = &mut self.units[u].blocks[id];
            (k.resolve().await?.clone(), v.resolve().await?.clone())
        };

        let unit = &mut self.units[u];
        unit.blocks[id] = (
            TransferHandle::spawn(self.engine.clone(), TransferDirection::DeviceToHost, k_device),
            TransferHandle::spawn(self.engine.clone(), TransferDirection::DeviceToHost, v_device),
        );
        unit.resident[id] = false;
        Ok(())
    }

    /// Evict resident blocks of unit `u` until `resident_count(u) <=
    /// max_cached_block`. Smallest heap value first, tie-broken by lower
    /// id via the heap's tuple ordering.
    pub async fn evict(&mut self, u: usize) -> ManagerResult<Vec<usize>> {
        let mut evicted = Vec::new();
        loop {
            let over = self.units[u].resident_count().saturating_sub(self.max_cached_block);
            if over == 0 {
                break;
            }
            let victim = loop {
                let Reverse((value, id)) = match self.units[u].heap.pop() {
                    Some(entry) => entry,
                    None => {
                        return Err(ManagerError::invariant(format!(
                            "evict: unit {u} has no valid heap entries but residency exceeds max_cached_block"
                        )))
                    }
                };
                if !self.units[u].resident[id] {
                    continue;
                }
                let current = self.units[u].heap_value(self.strategy, id);
                if current != value.0 {
                    // Stale entry from a superseded score/recency update.
                    continue;
                }
                break id;
            };
            self.offload(u, victim).await?;
            evicted.push(victim);
        }
        Ok(evicted)
    }

    /// Append a new, not-yet-resident block. Returns its id.
    pub fn commit(&mut self, u: usize, k_block: DeviceTensor, v_block: DeviceTensor) -> usize {
        let unit = &mut self.units[u];
        let id = unit.blocks.len();
        unit.blocks.push((
            TransferHandle::spawn(self.engine.clone(), TransferDirection::DeviceToHost, k_block),
            TransferHandle::spawn(self.engine.clone(), TransferDirection::DeviceToHost, v_block),
        ));
        unit.resident.push(false);
        unit.recency.push(0);
        unit.score.push(0.0);
        id
    }

    /// Resolve and clone the resident K/V for block `id` of unit `u`.
    /// Errors with `InvariantViolation` if the block is not resident —
    /// every selected block must stay resident for the duration of the
    /// call.
    pub async fn resident_kv(&mut self, u: usize, id: usize) -> ManagerResult<(DeviceTensor, DeviceTensor)> {
        let unit = &mut self.units[u];
        if !unit.resident.get(id).copied().unwrap_or(false) {
            return Err(ManagerError::invariant(format!(
                "resident_kv: block {id} of unit {u} is not resident"
            )));
        }
        let (k, v) = &mut unit.blocks[id];
        let k_tensor = k.resolve().await?.clone();
        let v_tensor = v.resolve().await?.clone();
        Ok((k_tensor, v_tensor))
    }

    /// Decay every resident score in unit `u` by `decay`, then add
    /// `new_score[slot]` for each `(slot, id)` pair in `block_map`.
    pub fn update_scores(&mut self, u: usize, decay: f64, block_map: &[Option<usize>], new_score: &[f64]) {
        let unit = &mut self.units[u];
        for id in 0..unit.score.len() {
            if unit.resident[id] {
                unit.score[id] *= decay;
            }
        }
        for (slot, id) in block_map.iter().enumerate() {
            if let Some(id) = id {
                if *id < unit.score.len() {
                    unit.score[*id] += new_score.get(slot).copied().unwrap_or(0.0);
                    if unit.resident[*id] {
                        unit.push_heap(self.strategy, *id);
                    }
                }
            }
        }
    }

    pub fn score(&self, u: usize, id: usize) -> f64 {
        self.units[u].score[id]
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(val: f32) -> DeviceTensor {
        DeviceTensor::from_data(&[1, 1, 1, 2], vec![val, val]).unwrap()
    }

    #[tokio::test]
    async fn test_commit_then_load_then_resident_kv() {
        let mut store = BlockStore::new(1, 2, CacheStrategy::Lru);
        let id = store.commit(0, block(1.0), block(1.0));
        assert!(!store.is_resident(0, id));
        store.load(0, id, 1).await.unwrap();
        assert!(store.is_resident(0, id));
        let (k, _v) = store.resident_kv(0, id).await.unwrap();
        assert_eq!(k.data(), &[1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_evict_respects_max_cached_block() {
        let mut store = BlockStore::new(1, 1, CacheStrategy::Lru);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();
        assert_eq!(store.resident_count(0), 2);
        let evicted = store.evict(0).await.unwrap();
        assert_eq!(store.resident_count(0), 1);
        assert_eq!(evicted, vec![id0]);
        assert!(store.is_resident(0, id1));
    }

    #[tokio::test]
    async fn test_lru_refreshes_recency_on_reaccess() {
        let mut store = BlockStore::new(1, 1, CacheStrategy::Lru);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();
        // Re-access id0, making id1 the least-recently-used.
        store.load(0, id0, 3).await.unwrap();
        let evicted = store.evict(0).await.unwrap();
        assert_eq!(evicted, vec![id1]);
    }

    #[tokio::test]
    async fn test_fifo_ignores_reaccess() {
        let mut store = BlockStore::new(1, 1, CacheStrategy::Fifo);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();
        // FIFO does not refresh on reaccess.
        store.load(0, id0, 3).await.unwrap();
        let evicted = store.evict(0).await.unwrap();
        assert_eq!(evicted, vec![id0]);
    }

    #[tokio::test]
    async fn test_lru_s_evicts_lowest_score() {
        let mut store = BlockStore::new(1, 1, CacheStrategy::LruS);
        let id0 = store.commit(0, block(0.0), block(0.0));
        let id1 = store.commit(0, block(1.0), block(1.0));
        store.load(0, id0, 1).await.unwrap();
        store.load(0, id1, 2).await.unwrap();
        store.update_scores(0, 1.0, &[Some(id0), Some(id1)], &[5.0, 1.0]);
        let evicted = store.evict(0).await.unwrap();
        assert_eq!(evicted, vec![id1]);
    }
}
