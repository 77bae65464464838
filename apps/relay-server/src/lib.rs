//! HTTP façade for the relay pipeline.
//!
//! Hosts the three client-facing endpoints and the two worker runners in a
//! single process, wired over the in-process bus. Client-visible failures
//! are confined to this edge: `400` for validation, `404` for a missing
//! conversation, `409` for conversation reuse, `500` for everything else.
//! Downstream failures are observable only through the conversation
//! document.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use relay_api::{ApiError, ErrorCode, HealthResponse, IngressService, SubmitOutcome};
use relay_config::RelayConfig;
use relay_runtime::RuntimeApp;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Clone)]
struct AppState {
    ingress: Arc<IngressService>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Assemble the runtime, spawn the workers, and serve until shutdown.
pub async fn run_server(config: RelayConfig, listen: SocketAddr) -> anyhow::Result<()> {
    let app = RuntimeApp::from_config(config)
        .await
        .context("bootstrap runtime failed")?;
    let workers = app.spawn_default_workers();

    let ingress = Arc::new(IngressService::new(
        app.conversations.clone(),
        app.dedup.clone(),
        app.message_bus(),
        app.config.topics.reasoning.clone(),
    ));
    let state = AppState { ingress };

    let router = Router::new()
        .route("/messages", post(submit_message))
        .route("/conversations/{id}", get(get_conversation))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %listen, "relay-server listening");
    let served = axum::serve(listener, router)
        .await
        .context("server terminated with error");

    for worker in workers {
        worker.abort();
    }
    served
}

async fn submit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.trim().is_empty());

    let outcome = state
        .ingress
        .submit_message(&body, idempotency_key)
        .await
        .map_err(map_api_error)?;

    let response = match outcome {
        SubmitOutcome::Accepted {
            message_id,
            conversation_id,
            event_id,
            state,
        } => (
            StatusCode::CREATED,
            Json(json!({
                "messageId": message_id,
                "conversationId": conversation_id,
                "eventId": event_id,
                "state": state,
            })),
        ),
        SubmitOutcome::Duplicate { message_id } => (
            StatusCode::OK,
            Json(json!({
                "messageId": message_id,
                "duplicate": true,
                "message": "Message already processed",
            })),
        ),
    };
    Ok(response)
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let view = state
        .ingress
        .get_conversation(&id)
        .await
        .map_err(map_api_error)?;
    Ok(Json(view))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

fn map_api_error(err: ApiError) -> (StatusCode, Json<ErrorBody>) {
    let status = match err.code() {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}
