/// Trigger and webhook endpoints
///
/// `/api/triggers/{id}/webhook` starts an execution synchronously and returns
/// it. `/webhook/{*path}` resolves the trigger bound to the path and only
/// queues the payload, answering 202 with the job id.

use crate::api::{api_error, trigger_error, ApiError, AppState};
use crate::funnel::WebhookPayload;
use crate::runtime::context::ExecutionContext;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{any, get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/api/triggers", get(list_triggers))
        .route("/api/triggers/{id}/activate", post(activate_trigger))
        .route("/api/triggers/{id}/deactivate", post(deactivate_trigger))
        .route("/api/triggers/{id}/webhook", post(trigger_webhook))
        .route("/webhook/{*path}", any(path_webhook))
}

/// GET /api/triggers
async fn list_triggers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "triggers": state.triggers.list_triggers().await }))
}

/// POST /api/triggers/{id}/activate
async fn activate_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.triggers.activate_trigger(&id).await.map_err(trigger_error)?;
    Ok(Json(json!({ "id": id, "active": true })))
}

/// POST /api/triggers/{id}/deactivate
async fn deactivate_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.triggers.deactivate_trigger(&id).await.map_err(trigger_error)?;
    Ok(Json(json!({ "id": id, "active": false })))
}

/// Fire a trigger and return the new execution
///
/// POST /api/triggers/{id}/webhook
/// Body: any JSON, or a full `{ "event", "data", ... }` envelope
async fn trigger_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ExecutionContext>), ApiError> {
    tracing::info!("📥 Webhook request received for trigger {}", id);
    let payload = parse_payload(&id, &headers, &body)?;
    let context = state
        .triggers
        .handle_webhook(&id, payload)
        .await
        .map_err(trigger_error)?;
    Ok((StatusCode::ACCEPTED, Json(context)))
}

/// Queue a webhook for the trigger bound to `path`
///
/// ANY /webhook/{*path}
async fn path_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    tracing::info!("📥 Webhook request received: /{}", path);
    let trigger_id = state.triggers.resolve_webhook_path(&path).await.ok_or_else(|| {
        tracing::warn!("❌ No active webhook trigger bound to /{}", path);
        api_error(StatusCode::NOT_FOUND, format!("no webhook bound to /{}", path))
    })?;

    let payload = parse_payload(&path, &headers, &body)?;
    let job_id = state
        .triggers
        .enqueue_webhook(&trigger_id, payload)
        .await
        .map_err(trigger_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "trigger_id": trigger_id, "job_id": job_id })),
    ))
}

/// Build a payload from a raw request body
///
/// Bodies that already look like an envelope (an object with `data`) are
/// taken as is; anything else becomes the envelope's `data`.
fn parse_payload(event: &str, headers: &HeaderMap, body: &str) -> Result<WebhookPayload, ApiError> {
    let data: Value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON webhook payload for {}: {}", event, e);
            api_error(StatusCode::BAD_REQUEST, format!("invalid JSON payload: {}", e))
        })?
    };

    let mut payload = match &data {
        Value::Object(map) if map.contains_key("data") => serde_json::from_value(data.clone())
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid webhook envelope: {}", e)))?,
        _ => WebhookPayload::new(event, data),
    };
    if payload.source.is_none() {
        payload.source = Some("webhook".to_string());
    }
    payload.headers.extend(headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|value| (name.as_str().to_string(), value.to_string()))
    }));
    Ok(payload)
}
