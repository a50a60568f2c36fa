//! HTTP API
//!
//! - GET /health - Liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status - Watermarks, queue depths, pending payouts, quorum settings
//! - GET /receipts/{hash} - Quorum state of one receipt
//! - POST /collect - Submit a validator signature for a receipt

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, B256};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bridge_core::{
    BridgeError, Chain, Collection, QuorumEngine, QuorumState, Receipt, RecoverableSignature,
};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::metrics;
use crate::queue::RelayQueue;
use crate::watchers::WatermarkStore;
use crate::writers::PayoutStore;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuorumEngine>,
    /// Address of this operator's validator key
    pub operator: Address,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub queue: Arc<dyn RelayQueue>,
    pub queue_names: Vec<String>,
    pub payouts: Arc<dyn PayoutStore>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub operator: Address,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub operator: Address,
    pub uptime_seconds: u64,
    pub quorum: QuorumStatus,
    pub watermarks: WatermarkStatus,
    pub queues: Vec<QueueStatus>,
    pub pending_payouts: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumStatus {
    pub policy: String,
    pub threshold: usize,
    pub validators: Vec<Address>,
}

#[derive(Debug, Serialize)]
pub struct WatermarkStatus {
    pub evm: Option<u64>,
    pub ckb: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub name: String,
    /// None when the queue could not be reached
    pub depth: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    pub receipt_hash: B256,
    pub state: QuorumState,
    pub receipt: Option<Receipt>,
    pub signers: Vec<Address>,
    pub threshold: usize,
    /// False while an executed receipt's ledger effect is still pending
    pub effect_applied: bool,
}

#[derive(Debug, Deserialize)]
pub struct CollectRequest {
    pub receipt: Receipt,
    pub signature: RecoverableSignature,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectResponse {
    pub outcome: &'static str,
    pub receipt_hash: B256,
    pub signer: Address,
    pub state: QuorumState,
}

impl From<Collection> for CollectResponse {
    fn from(collection: Collection) -> Self {
        Self {
            outcome: if collection.quorum_reached() {
                "quorumReached"
            } else {
                "collected"
            },
            receipt_hash: collection.receipt_hash,
            signer: collection.signer,
            state: collection.state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

/// Quorum engine error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::NotAValidator(_) => StatusCode::FORBIDDEN,
            e if e.is_benign() => StatusCode::CONFLICT,
            BridgeError::InvalidSignature(_) | BridgeError::Codec(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        operator: state.operator,
    })
}

async fn read_watermark(state: &AppState, chain: Chain, degraded: &mut bool) -> Option<u64> {
    match state.watermarks.get(chain).await {
        Ok(height) => height,
        Err(e) => {
            warn!(chain = %chain, error = %e, "Failed to read watermark");
            *degraded = true;
            None
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let mut degraded = false;
    let evm = read_watermark(&state, Chain::Evm, &mut degraded).await;
    let ckb = read_watermark(&state, Chain::Ckb, &mut degraded).await;

    let mut queues = Vec::with_capacity(state.queue_names.len());
    for name in &state.queue_names {
        let depth = match state.queue.depth(name).await {
            Ok(depth) => {
                metrics::set_queue_depth(name, depth);
                Some(depth)
            }
            Err(e) => {
                warn!(queue = %name, error = %e, "Failed to read queue depth");
                degraded = true;
                None
            }
        };
        queues.push(QueueStatus {
            name: name.clone(),
            depth,
        });
    }

    let pending_payouts = match state.payouts.pending_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "Failed to count pending payouts");
            degraded = true;
            None
        }
    };

    Json(StatusResponse {
        status: if degraded { "degraded" } else { "ok" },
        operator: state.operator,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        quorum: QuorumStatus {
            policy: state.engine.policy().to_string(),
            threshold: state.engine.threshold(),
            validators: state.engine.validators().members().to_vec(),
        },
        watermarks: WatermarkStatus { evm, ckb },
        queues,
        pending_payouts,
    })
}

async fn receipt(
    State(state): State<AppState>,
    Path(hash): Path<B256>,
) -> Result<Json<ReceiptResponse>, ApiError> {
    let record = state.engine.record(&hash).await.map_err(ApiError)?;
    let state_now = state.engine.state(&hash).await.map_err(ApiError)?;
    Ok(Json(ReceiptResponse {
        receipt_hash: hash,
        state: state_now,
        receipt: record.as_ref().map(|r| r.receipt),
        effect_applied: record.as_ref().is_some_and(|r| r.effect_applied),
        signers: record.map(|r| r.signers()).unwrap_or_default(),
        threshold: state.engine.threshold(),
    }))
}

async fn collect(
    State(state): State<AppState>,
    Json(request): Json<CollectRequest>,
) -> Result<Json<CollectResponse>, ApiError> {
    let direction = request.receipt.direction;
    let collection = state
        .engine
        .collect(&request.receipt, &request.signature)
        .await
        .map_err(|e| {
            if !e.is_benign() {
                metrics::record_error("api_collect", e.kind());
            }
            ApiError(e)
        })?;

    metrics::record_signature_collected(direction.as_str());
    if collection.quorum_reached() {
        metrics::record_quorum_reached(direction.as_str());
    }
    info!(
        receipt_hash = %collection.receipt_hash,
        signer = %collection.signer,
        state = ?collection.state,
        "Signature collected over HTTP"
    );
    Ok(Json(collection.into()))
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .route("/receipts/{hash}", get(receipt))
        .route("/collect", post(collect))
        .with_state(state)
}

/// Serve the API until `stop` flips
pub async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    metrics::UP.set(0.0);
    info!("API server stopped");
    Ok(())
}
