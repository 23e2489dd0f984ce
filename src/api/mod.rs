/// HTTP API Layer
///
/// Thin axum adapter over the engine and the trigger manager:
/// - Funnel activation and deactivation
/// - Execution inspection, manual starts and cancellation
/// - Trigger activation and webhook intake

// Funnel and execution endpoints
pub mod funnels;

// Trigger and webhook endpoints
pub mod webhooks;

use crate::error::TriggerError;
use crate::metrics::InMemoryMetrics;
use crate::runtime::engine::ExecutionEngine;
use crate::trigger::TriggerManager;
use axum::{http::StatusCode, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;

pub use funnels::create_funnel_routes;
pub use webhooks::create_webhook_routes;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub triggers: Arc<TriggerManager>,
    pub metrics: Arc<InMemoryMetrics>,
}

/// Error half of every handler result: status plus `{ "error": ... }`
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// 404 for unknown triggers, 400 for rejections, 500 otherwise
pub(crate) fn trigger_error(error: TriggerError) -> ApiError {
    let status = match &error {
        TriggerError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_rejection() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ Trigger request failed: {}", error);
    } else {
        tracing::warn!("⚠️ Trigger request refused: {}", error);
    }
    api_error(status, error.to_string())
}
