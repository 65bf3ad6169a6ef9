//! HTTP harness for driving the manager standalone.
//!
//! Narrowed from an OpenAI-compatible chat/completions surface down to
//! the manager's actual API: there is no tokenizer, no sampler, no chat
//! template — a caller submits the six already-embedded Q/K/V tensors
//! for one call
//! to [`Orchestrator::append`] and gets the attention output back. No SSE
//! streaming either: `append` is one request/response round trip per
//! chunk of tokens, not token-by-token generation.
//!
//! - `POST /v1/append`: submit one `append` call.
//! - `GET /health`: liveness + a small cache summary.
//! - `GET /v1/cache/stats`: per-unit residency detail.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::error::ManagerError;
use crate::orchestrator::Orchestrator;
use crate::tensor::DeviceTensor;

/// Application state shared across handlers.
pub struct AppState {
    pub orchestrator: RwLock<Orchestrator>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/append", post(append))
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .with_state(state)
}

/// A shaped `f32` tensor as JSON, row-major, matching [`DeviceTensor`].
#[derive(Debug, Serialize, Deserialize)]
pub struct TensorJson {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TryFrom<TensorJson> for DeviceTensor {
    type Error = ManagerError;

    fn try_from(t: TensorJson) -> Result<Self, Self::Error> {
        DeviceTensor::from_data(&t.shape, t.data)
    }
}

impl From<&DeviceTensor> for TensorJson {
    fn from(t: &DeviceTensor) -> Self {
        Self {
            shape: t.shape().to_vec(),
            data: t.data().to_vec(),
        }
    }
}

/// `POST /v1/append` request body: one call's worth of local and global
/// Q/K/V tensors.
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub local_q: TensorJson,
    pub local_k: TensorJson,
    pub local_v: TensorJson,
    pub global_q: TensorJson,
    pub global_k: TensorJson,
    pub global_v: TensorJson,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    pub output: TensorJson,
    pub length: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub length: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub length: usize,
    pub resident_blocks_per_unit: Vec<usize>,
}

/// A thin wrapper so `ManagerError` can be returned directly from a
/// handler via `?`. Shape/config/invariant problems are the caller's
/// fault (400); transfer/primitive failures are ours (500).
struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ManagerError::ShapeMismatch { .. } | ManagerError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            ManagerError::InvariantViolation(_) | ManagerError::TransferFailed(_) | ManagerError::PrimitiveFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.0.to_string()).into_response()
    }
}

async fn append(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, ApiError> {
    let local_q = DeviceTensor::try_from(req.local_q)?;
    let local_k = DeviceTensor::try_from(req.local_k)?;
    let local_v = DeviceTensor::try_from(req.local_v)?;
    let global_q = DeviceTensor::try_from(req.global_q)?;
    let global_k = DeviceTensor::try_from(req.global_k)?;
    let global_v = DeviceTensor::try_from(req.global_v)?;

    info!(l_in = local_q.dim(2), "append request");

    let mut orch = state.orchestrator.write().await;
    let output = orch
        .append(local_q, local_k, local_v, global_q, global_k, global_v)
        .await?;

    Ok(Json(AppendResponse {
        output: TensorJson::from(&output),
        length: orch.length(),
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let orch = state.orchestrator.read().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        length: orch.length(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let orch = state.orchestrator.read().await;
    let resident = (0..orch.num_units()).map(|u| orch.resident_blocks(u)).collect();

    Json(CacheStatsResponse {
        length: orch.length(),
        resident_blocks_per_unit: resident,
    })
}
