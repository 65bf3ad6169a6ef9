//! Scenario 5 (§8): grouped-query broadcasting. `num_heads=8,
//! num_heads_kv=2` inputs with K/V shape `(batch, 2, L, dim)` must
//! produce output shape `(batch, 8, L, dim)`, and the broadcast must
//! actually widen the manager's internal per-unit K/V storage to
//! `unit_size = 8` rather than leaving it at the raw `num_heads_kv = 2`.

use streaming_attn_ctx::config::{CacheStrategy, ManagerConfig};
use streaming_attn_ctx::tensor::DeviceTensor;
use streaming_attn_ctx::Orchestrator;

const DIM: usize = 4;
const BATCH: usize = 1;
const NUM_HEADS: usize = 8;
const NUM_HEADS_KV: usize = 2;

fn gqa_cfg() -> ManagerConfig {
    ManagerConfig {
        n_init: 2,
        n_local: 4,
        block_size: 2,
        max_cached_block: 4,
        topk: 1,
        max_calc_block: 4,
        exc_block_size: 2,
        perhead: false,
        score_decay: 0.9,
        repr_topk: 2,
        use_buffer: true,
        cache_strategy: CacheStrategy::Lru,
        calc_block_score: true,
        ignore_remainder: false,
        chunk_topk_calc: None,
        async_global_stream: true,
        dim_head: DIM,
    }
}

fn qkv(heads: usize, len: usize, seed: f32) -> DeviceTensor {
    let n = BATCH * heads * len * DIM;
    let data: Vec<f32> = (0..n).map(|i| seed + i as f32 * 0.01).collect();
    DeviceTensor::from_data(&[BATCH, heads, len, DIM], data).unwrap()
}

#[tokio::test]
async fn grouped_query_broadcast_widens_output_and_internal_unit_size() {
    let mut orch = Orchestrator::new(gqa_cfg());

    let q = qkv(NUM_HEADS, 3, 0.0);
    let k = qkv(NUM_HEADS_KV, 3, 10.0);
    let v = qkv(NUM_HEADS_KV, 3, 20.0);

    let out = orch
        .append(q.clone(), k.clone(), v.clone(), q, k, v)
        .await
        .unwrap();

    // Output shape carries the query head count, not the kv head count.
    assert_eq!(out.shape(), &[BATCH, NUM_HEADS, 3, DIM]);

    // §3: in non-perhead mode num_units = batch_size, unit_size =
    // num_heads. Because K/V are broadcast to num_heads before the
    // reshape (§4.7.2 step 1), unit_size must come out at the query head
    // count (8), not the raw kv head count (2) the caller supplied.
    assert_eq!(orch.num_units(), BATCH);
    assert_eq!(orch.unit_size(), NUM_HEADS);
}

#[tokio::test]
async fn grouped_query_broadcast_holds_across_repeated_calls() {
    let mut orch = Orchestrator::new(gqa_cfg());

    for i in 0..5 {
        let fill = i as f32 * 0.3;
        let q = qkv(NUM_HEADS, 2, fill);
        let k = qkv(NUM_HEADS_KV, 2, fill + 1.0);
        let v = qkv(NUM_HEADS_KV, 2, fill + 2.0);
        let out = orch.append(q.clone(), k.clone(), v.clone(), q, k, v).await.unwrap();
        assert_eq!(out.shape(), &[BATCH, NUM_HEADS, 2, DIM]);
    }

    assert_eq!(orch.unit_size(), NUM_HEADS);
    assert_eq!(orch.length(), 10);
    // Committed blocks form per unit under the broadcast unit_size, not
    // the raw kv head count.
    assert!(orch.num_committed_blocks(0) > 0);
}
