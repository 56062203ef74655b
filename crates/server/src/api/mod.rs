use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, put},
    Json, Router,
};
use bridge_core::LocalRouting;
use serde::{Deserialize, Serialize};
use shared::{
    error::{ApiError, ErrorCode},
    local::LocalEvent,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, warn};

use crate::app_state::AppState;

const MAX_TRANSACTION_BYTES: usize = 4 * 1024 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<LocalEvent>,
}

#[derive(Debug, Default, Serialize)]
struct TransactionAck {}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/transactions/:txn_id", put(push_transaction))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_TRANSACTION_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.bridge.storage().health_check().await.map_err(|e| {
        error!("api: storage health check failed: {e}");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if !state.local_chat_token.is_empty() && token == state.local_chat_token => {
            Ok(())
        }
        _ => Err((
            StatusCode::FORBIDDEN,
            Json(ApiError::new(ErrorCode::Forbidden, "bad token supplied")),
        )),
    }
}

async fn push_transaction(
    State(state): State<Arc<AppState>>,
    Path(txn_id): Path<String>,
    headers: HeaderMap,
    Json(txn): Json<Transaction>,
) -> ApiResult<Json<TransactionAck>> {
    authorize(&state, &headers)?;
    debug!(%txn_id, events = txn.events.len(), "api: transaction received");

    for event in txn.events {
        let event_id = event.event_id.clone();
        match state.bridge.handle_local_event(event).await {
            Ok(LocalRouting::Queued) => {}
            Ok(LocalRouting::Ignored | LocalRouting::UnknownRoom) => {
                debug!(%txn_id, %event_id, "api: event not routed");
            }
            Err(err) => warn!(%txn_id, %event_id, "api: failed to route event: {err}"),
        }
    }
    Ok(Json(TransactionAck::default()))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
