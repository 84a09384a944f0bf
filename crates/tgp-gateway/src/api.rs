//! HTTP API server for the gateway.
//!
//! Delivery-layer callbacks, transaction submission and read-only views of
//! routes and transactions.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tgp_core::{Asset, DomainId, Transaction, TransactionId};
use tokio::sync::oneshot;

use crate::commands::{NodeCommand, Reply, SubmitResponse};
use crate::delivery::PendingDelivery;
use crate::error::GatewayError;
use crate::gateway::TransactionView;
use crate::state::NodeState;

// --- Request / response types ---

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub gateway_id: String,
    pub domain: String,
    pub peer_count: usize,
    pub peers: Vec<String>,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct RouteEntry {
    pub destination: String,
    pub path: Vec<String>,
    pub cost: u64,
    /// Peer the route was learned from; absent for the local domain.
    pub next_hop: Option<String>,
    pub seq: u64,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub payee: String,
    pub amount: u64,
    pub asset: String,
    #[serde(default)]
    pub service: String,
    /// Absolute deadline; `timeout_secs` from now when absent.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_secs: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct FailureRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct AckResponse {
    pub transaction_id: TransactionId,
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::NoRoute(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::PolicyRejection { .. } => StatusCode::FORBIDDEN,
        GatewayError::CapacityExhausted(_) => StatusCode::PAYMENT_REQUIRED,
        GatewayError::Timeout(_) => StatusCode::GONE,
        GatewayError::Protocol(_) | GatewayError::CancellationForbidden { .. } => {
            StatusCode::CONFLICT
        }
        GatewayError::SettlementInconsistency { .. }
        | GatewayError::Storage(_)
        | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_id(raw: &str) -> Result<TransactionId, ApiError> {
    TransactionId::parse(raw)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Send a command to the event loop and wait for its answer.
async fn call<T>(
    state: &NodeState,
    build: impl FnOnce(Reply<T>) -> NodeCommand,
) -> Result<T, ApiError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state.command_tx.send(build(reply_tx)).await.map_err(|_| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "gateway event loop not running")
    })?;
    match reply_rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(api_error(status_for(&e), e.to_string())),
        Err(_) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "event loop dropped the reply channel",
        )),
    }
}

// --- Handlers ---

async fn handle_status(State(state): State<Arc<NodeState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        gateway_id: state.core.gateway_id().to_string(),
        domain: state.core.domain_id().to_string(),
        peer_count: state.peer_count(),
        peers: state.connected_peers().iter().map(|p| p.to_string()).collect(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn handle_routes(State(state): State<Arc<NodeState>>) -> Json<Vec<RouteEntry>> {
    let routes = state
        .core
        .routes()
        .into_iter()
        .map(|(dest, route)| RouteEntry {
            destination: dest.to_string(),
            path: route.advert.path.iter().map(|d| d.to_string()).collect(),
            cost: route.advert.cost,
            next_hop: route.peer().map(|p| p.to_string()),
            seq: route.advert.seq,
        })
        .collect();
    Json(routes)
}

async fn handle_deliveries(State(state): State<Arc<NodeState>>) -> Json<Vec<PendingDelivery>> {
    Json(state.delivery.pending())
}

async fn handle_get_transaction(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionView>, ApiError> {
    let id = parse_id(&id)?;
    state
        .core
        .transaction(id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("transaction not found: {}", id)))
}

async fn handle_submit(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let deadline = req
        .deadline
        .unwrap_or_else(|| Utc::now() + Duration::seconds(req.timeout_secs.unwrap_or(120)));
    let transaction = Transaction::new(
        state.core.gateway_id().clone(),
        DomainId::new(req.payee),
        req.amount,
        Asset::new(req.asset),
        req.service,
        deadline,
    );
    let resp = call(&state, |reply| NodeCommand::Submit { transaction, reply }).await?;
    Ok(Json(resp))
}

async fn handle_cancel(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    let transaction_id = parse_id(&id)?;
    call(&state, |reply| NodeCommand::Cancel {
        transaction_id,
        reply,
    })
    .await?;
    Ok(Json(AckResponse {
        transaction_id,
        status: "cancelled".into(),
    }))
}

async fn handle_delivered(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    let transaction_id = parse_id(&id)?;
    call(&state, |reply| NodeCommand::ConfirmDelivery {
        transaction_id,
        reply,
    })
    .await?;
    Ok(Json(AckResponse {
        transaction_id,
        status: "revealed".into(),
    }))
}

async fn handle_failed(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<AckResponse>, ApiError> {
    let transaction_id = parse_id(&id)?;
    // The body is optional.
    let req: FailureRequest = if body.is_empty() {
        FailureRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
    };
    let reason = req.reason.unwrap_or_else(|| "delivery failed".into());
    call(&state, |reply| NodeCommand::DeliveryFailed {
        transaction_id,
        reason,
        reply,
    })
    .await?;
    Ok(Json(AckResponse {
        transaction_id,
        status: "aborted".into(),
    }))
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/v1/status", get(handle_status))
        .route("/v1/routes", get(handle_routes))
        .route("/v1/deliveries", get(handle_deliveries))
        .route("/v1/transactions", post(handle_submit))
        .route("/v1/transactions/{id}", get(handle_get_transaction))
        .route("/v1/transactions/{id}/cancel", post(handle_cancel))
        .route("/v1/transactions/{id}/delivered", post(handle_delivered))
        .route("/v1/transactions/{id}/failed", post(handle_failed))
        .with_state(state)
}

pub async fn start_api_server(listen_addr: SocketAddr, state: Arc<NodeState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
