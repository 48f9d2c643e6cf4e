use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    completion::{ChatRequest, CompletionResponse},
    error::ServiceError,
    model::{ModelMetadata, ModelRegistry},
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
}

pub fn build_router(registry: Arc<ModelRegistry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn metadata(State(state): State<AppState>) -> Json<ModelMetadata> {
    Json(state.registry.metadata())
}

async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ServiceError> {
    let Json(request) = payload?;
    let messages = request.messages.as_ref().map_or(0, Vec::len);
    info!(messages, "chat completion request");
    let response = state.registry.completions(request).await?;
    Ok(Json(response))
}
