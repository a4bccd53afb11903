use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::broadcast::SignalBroadcaster;
use crate::data::messages::SignalPayload;
use crate::hub::Hub;
use crate::link::LinkSnapshot;
use crate::relay::{CrossProcessRelay, RelayCounters};
use crate::upstream::UpstreamSubscriptionState;
use crate::websocket::registry::ConnectionSummary;

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<Hub>,
    pub signals: SignalBroadcaster,
    pub relay: Option<Arc<CrossProcessRelay>>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(hub: Arc<Hub>, relay: Option<Arc<CrossProcessRelay>>) -> Self {
        Self {
            signals: SignalBroadcaster::new(hub.clone()),
            hub,
            relay,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UpstreamStatus {
    #[serde(flatten)]
    pub link: LinkSnapshot,
    pub instruments: BTreeMap<String, UpstreamSubscriptionState>,
}

#[derive(Debug, Serialize)]
pub struct RelayStatus {
    #[serde(flatten)]
    pub link: LinkSnapshot,
    #[serde(flatten)]
    pub counters: RelayCounters,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connections: usize,
    pub topics: BTreeMap<String, usize>,
    pub upstream: UpstreamStatus,
    pub relay: Option<RelayStatus>,
    pub uptime_secs: u64,
    pub timestamp: String,
}

// GET /api/health
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let timestamp = Utc::now().to_rfc3339();
    if state.hub.bridge().is_degraded() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "reason": "upstream retry budget exhausted",
                "timestamp": timestamp,
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "market_hub",
            "timestamp": timestamp,
        })),
    )
}

// GET /api/status - built from the live tables on every call
pub async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let bridge = state.hub.bridge();

    Json(StatusResponse {
        connections: state.hub.registry().connection_count(),
        topics: state.hub.table().topic_counts(),
        upstream: UpstreamStatus {
            link: bridge.link().snapshot(),
            instruments: bridge.demand().snapshot(),
        },
        relay: state.relay.as_ref().map(|relay| RelayStatus {
            link: relay.link().snapshot(),
            counters: relay.counters(),
        }),
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

// GET /api/connections
pub async fn connections(State(state): State<ApiState>) -> Json<Vec<ConnectionSummary>> {
    Json(state.hub.registry().summaries(Instant::now()))
}

// POST /api/signals/:kind - hook for the scan-result producer
pub async fn publish_signals(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(signals): Json<Vec<SignalPayload>>,
) -> (StatusCode, Json<Value>) {
    match state.signals.publish(&kind, &signals) {
        Ok(report) => {
            info!("Signal batch '{}' accepted via API ({} signals)", kind, signals.len());
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "kind": kind.to_ascii_lowercase(),
                    "count": signals.len(),
                    "delivered": report.delivered,
                })),
            )
        }
        Err(e) => {
            warn!("Rejected signal batch for '{}': {}", kind, e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "message": e.to_string(),
                })),
            )
        }
    }
}

pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/connections", get(connections))
        .route("/signals/:kind", post(publish_signals))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}
