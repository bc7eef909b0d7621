//! Consumer HTTP surface.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/proof` | POST | Whole or chunked proof intake |
//! | `/price/latest` | GET | Latest published (or aggregated) price |
//! | `/price/history` | GET | Newest-first consensus window |
//! | `/adapters` | GET | Per-petal roster and aggregate adapter set |
//! | `/health` | GET | Liveness |
//! | `/status` | GET | Uptime, counters, cursor |
//!
//! CORS is open; JSON bodies are limited to 1 MB. Rejections are 400s
//! with a short, stable `error` string.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use flora_common::ConsensusEntry;

use crate::core::{Consumer, CounterSnapshot};
use crate::intake::IntakeOutcome;
use crate::roster::PetalState;

const BODY_LIMIT_BYTES: usize = 1024 * 1024;
const HISTORY_LIMIT_MAX: usize = 200;
const HISTORY_LIMIT_DEFAULT: usize = 50;

pub fn router(consumer: Arc<Consumer>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/proof", post(post_proof))
        .route("/price/latest", get(price_latest))
        .route("/price/history", get(price_history))
        .route("/adapters", get(adapters))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(consumer)
}

// ════════════════════════════════════════════════════════════════════════════
// RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    epoch: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks_received: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks_total: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    total: usize,
    offset: usize,
    limit: usize,
    items: Vec<ConsensusEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdaptersResponse {
    petals: Vec<PetalState>,
    adapters: BTreeSet<String>,
    fingerprints: BTreeMap<String, String>,
    topics: TopicsView,
    metadata: MetadataView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicsView {
    state: String,
    coordination: String,
    transaction: String,
    registry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    discovery: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataView {
    registry: String,
    network: String,
    flora_account_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    uptime_secs: u64,
    counters: CounterSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_epoch: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_published_epoch: Option<i64>,
    tail_cursor: String,
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn post_proof(
    State(consumer): State<Arc<Consumer>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    match consumer.submit_proof(&body).await {
        Ok(IntakeOutcome::Accepted(proof)) => (
            StatusCode::OK,
            Json(ProofResponse {
                status: "accepted",
                epoch: Some(proof.epoch),
                chunks_received: None,
                chunks_total: None,
            }),
        )
            .into_response(),
        Ok(IntakeOutcome::Duplicate) => (
            StatusCode::OK,
            Json(ProofResponse {
                status: "duplicate",
                epoch: None,
                chunks_received: None,
                chunks_total: None,
            }),
        )
            .into_response(),
        Ok(IntakeOutcome::ChunkBuffered { received, total }) => (
            StatusCode::OK,
            Json(ProofResponse {
                status: "chunk_buffered",
                epoch: None,
                chunks_received: Some(received),
                chunks_total: Some(total),
            }),
        )
            .into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: err.reason().to_string(),
                detail: Some(err.to_string()),
            }),
        )
            .into_response(),
    }
}

async fn price_latest(State(consumer): State<Arc<Consumer>>) -> Response {
    match consumer.latest_entry() {
        Some(entry) => (StatusCode::OK, Json(entry)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody { error: "no_consensus_yet".to_string(), detail: None }),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn price_history(
    State(consumer): State<Arc<Consumer>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(HISTORY_LIMIT_DEFAULT).clamp(1, HISTORY_LIMIT_MAX);
    let (total, items) = consumer.history_window(offset, limit);
    (StatusCode::OK, Json(HistoryResponse { total, offset, limit, items })).into_response()
}

async fn adapters(State(consumer): State<Arc<Consumer>>) -> Response {
    let mut petals = consumer.roster_snapshot();
    for petal in &mut petals {
        match consumer.account_key(&petal.account_id).await {
            Ok(info) => {
                petal.public_key = Some(info.key);
                petal.key_type = Some(info.key_type);
            }
            Err(err) => {
                warn!(account = %petal.account_id, error = %err, "account key lookup failed");
            }
        }
    }
    let (adapters, fingerprints) = consumer.aggregate_adapters();
    let config = &consumer.config;
    let body = AdaptersResponse {
        petals,
        adapters,
        fingerprints,
        topics: TopicsView {
            state: config.state_topic_id.clone(),
            coordination: config.coord_topic_id.clone(),
            transaction: config.txn_topic_id.clone(),
            registry: config.registry_topic_id.clone(),
            discovery: config.discovery_topic_id.clone(),
        },
        metadata: MetadataView {
            registry: format!("hcs://2/{}", config.registry_topic_id),
            network: config.network.clone(),
            flora_account_id: config.flora_account_id.clone(),
        },
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn health() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

async fn status(State(consumer): State<Arc<Consumer>>) -> Response {
    let (_, newest) = consumer.history_window(0, 1);
    let body = StatusResponse {
        uptime_secs: consumer.uptime_secs(),
        counters: consumer.counters.snapshot(),
        latest_epoch: newest.first().map(|e| e.epoch),
        latest_published_epoch: consumer.latest_entry().map(|e| e.epoch),
        tail_cursor: consumer.tail_cursor(),
    };
    (StatusCode::OK, Json(body)).into_response()
}
