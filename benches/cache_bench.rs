//! Benchmarks for the streaming attention context manager's cache core.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use streaming_attn_ctx::cache::{BlockStore, Selector};
use streaming_attn_ctx::config::CacheStrategy;
use streaming_attn_ctx::tensor::DeviceTensor;

const DIM_HEAD: usize = 128;

fn block(fill: f32) -> DeviceTensor {
    DeviceTensor::from_data(&[1, 1, 1, DIM_HEAD], vec![fill; DIM_HEAD]).unwrap()
}

fn bench_block_store_evict(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("block_store_evict_1k_to_32", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let mut store = BlockStore::new(1, 32, CacheStrategy::Lru);
                    for i in 0..1_000 {
                        let id = store.commit(0, block(i as f32), block(i as f32));
                        store.load(0, id, i as u64).await.unwrap();
                    }
                    store
                })
            },
            |mut store| {
                rt.block_on(async {
                    let evicted = store.evict(black_box(0)).await.unwrap();
                    black_box(evicted);
                })
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_selector_single_query(c: &mut Criterion) {
    // num_units=1, unit_size=8, num_global_block=4096, dim_head=128
    let reprs = DeviceTensor::zeros(&[1, 8, 4096, DIM_HEAD]);
    let q = DeviceTensor::zeros(&[1, 8, 1, DIM_HEAD]);
    let selector = Selector::new(32);

    c.bench_function("selector_single_query_4096_blocks", |b| {
        b.iter(|| {
            let picks = selector.select_single(black_box(&q), black_box(&reprs)).unwrap();
            black_box(picks);
        })
    });
}

fn bench_selector_batched_chunk(c: &mut Criterion) {
    let reprs = DeviceTensor::zeros(&[1, 8, 4096, DIM_HEAD]);
    let q = DeviceTensor::zeros(&[1, 8, 512, DIM_HEAD]);
    let selector = Selector::new(32);

    c.bench_function("selector_batched_512_tokens", |b| {
        b.iter(|| {
            let picks = selector.select_batched(black_box(&q), black_box(&reprs), 64).unwrap();
            black_box(picks);
        })
    });
}

criterion_group!(
    benches,
    bench_block_store_evict,
    bench_selector_single_query,
    bench_selector_batched_chunk,
);
criterion_main!(benches);
