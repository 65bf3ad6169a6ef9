//! Integration tests for the standalone HTTP harness, driven with a real
//! client over a real loopback socket (mirrors the teacher's
//! full-pipeline integration test, here exercised through the manager's
//! actual `/v1/append` surface instead of a direct engine call).

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::RwLock;

use streaming_attn_ctx::config::{CacheStrategy, Config, ManagerConfig};
use streaming_attn_ctx::server::{build_router, http::TensorJson, AppState};
use streaming_attn_ctx::Orchestrator;

const DIM: usize = 4;

fn test_manager_config() -> ManagerConfig {
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

async fn spawn_server() -> String {
    let mut config = Config::default();
    config.manager = test_manager_config();
    let config = Arc::new(config);

    let state = Arc::new(AppState {
        orchestrator: RwLock::new(Orchestrator::new(config.manager.clone())),
        config,
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn tensor(shape: &[usize], fill: f32) -> TensorJson {
    let n: usize = shape.iter().product();
    TensorJson {
        shape: shape.to_vec(),
        data: vec![fill; n],
    }
}

#[tokio::test]
async fn health_reports_zero_length_before_any_append() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["length"], 0);
}

#[tokio::test]
async fn append_round_trip_advances_length_and_returns_matching_shape() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "local_q": tensor(&[1, 1, 3, DIM], 0.1),
        "local_k": tensor(&[1, 1, 3, DIM], 0.2),
        "local_v": tensor(&[1, 1, 3, DIM], 0.3),
        "global_q": tensor(&[1, 1, 3, DIM], 0.1),
        "global_k": tensor(&[1, 1, 3, DIM], 0.2),
        "global_v": tensor(&[1, 1, 3, DIM], 0.3),
    });

    let resp = client
        .post(format!("{base}/v1/append"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let parsed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(parsed["length"], 3);
    assert_eq!(parsed["output"]["shape"], serde_json::json!([1, 1, 3, DIM]));

    let stats = client
        .get(format!("{base}/v1/cache/stats"))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(stats["length"], 3);
}

#[tokio::test]
async fn malformed_tensor_shape_yields_bad_request() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    // shape implies 8 elements, data has 2 -> ShapeMismatch -> 400.
    let body = serde_json::json!({
        "local_q": {"shape": [1, 1, 2, DIM], "data": [0.0, 0.0]},
        "local_k": tensor(&[1, 1, 2, DIM], 0.0),
        "local_v": tensor(&[1, 1, 2, DIM], 0.0),
        "global_q": tensor(&[1, 1, 2, DIM], 0.0),
        "global_k": tensor(&[1, 1, 2, DIM], 0.0),
        "global_v": tensor(&[1, 1, 2, DIM], 0.0),
    });

    let resp = client
        .post(format!("{base}/v1/append"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}
