/// Funnel and execution REST endpoints
///
/// Activation compiles and publishes a funnel snapshot and registers its
/// triggers; running executions keep the snapshot they started on.

use crate::api::{api_error, trigger_error, ApiError, AppState};
use crate::error::ActivationError;
use crate::funnel::Funnel;
use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::ExecutionOptions;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Response for funnel activation
#[derive(Debug, Serialize)]
pub struct ActivateFunnelResponse {
    pub id: String,
    pub version: u32,
    pub warnings: Vec<String>,
    pub active_triggers: Vec<String>,
}

/// Request body for a direct execution start
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteFunnelRequest {
    /// Defaults to the funnel's first trigger
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
}

pub fn create_funnel_routes() -> Router<AppState> {
    Router::new()
        .route("/api/funnels", post(activate_funnel))
        .route("/api/funnels", get(list_funnels))
        .route("/api/funnels/{id}", delete(deactivate_funnel))
        .route("/api/funnels/{id}/execute", post(execute_funnel))
        .route("/api/executions", get(list_active_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
}

/// Activate (or hot-swap) a funnel
///
/// POST /api/funnels
/// Body: the funnel definition
///
/// Trigger configuration is checked before the snapshot is published, so a
/// refused request leaves the previously active version serving.
async fn activate_funnel(
    State(state): State<AppState>,
    Json(funnel): Json<Funnel>,
) -> Result<Json<ActivateFunnelResponse>, ApiError> {
    state
        .triggers
        .validate_funnel_triggers(&funnel)
        .await
        .map_err(trigger_error)?;

    let report = state.engine.funnels().activate(funnel.clone()).map_err(|e| {
        tracing::warn!("❌ Activation of funnel '{}' refused: {}", funnel.id, e);
        match e {
            ActivationError::Validation { errors, .. } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation failed", "details": errors })),
            ),
            structural => api_error(StatusCode::BAD_REQUEST, structural.to_string()),
        }
    })?;

    let active_triggers = match state.triggers.register_funnel_triggers(&funnel).await {
        Ok(active_triggers) => active_triggers,
        Err(e) => {
            tracing::warn!("↩️ Rolling back funnel '{}': trigger registration failed", funnel.id);
            state.engine.funnels().deactivate(&funnel.id);
            if let Err(cleanup) = state.triggers.unregister_funnel_triggers(&funnel.id).await {
                tracing::error!("❌ Could not unregister triggers of '{}': {}", funnel.id, cleanup);
            }
            return Err(trigger_error(e));
        }
    };

    Ok(Json(ActivateFunnelResponse {
        id: report.funnel_id,
        version: report.version,
        warnings: report.warnings,
        active_triggers,
    }))
}

/// GET /api/funnels
async fn list_funnels(State(state): State<AppState>) -> Json<Value> {
    let funnels: Vec<Value> = state
        .engine
        .funnels()
        .list()
        .iter()
        .map(|compiled| {
            json!({
                "id": compiled.id(),
                "name": compiled.funnel.name,
                "version": compiled.version(),
                "active": compiled.funnel.active,
                "nodes": compiled.funnel.nodes.len(),
            })
        })
        .collect();
    Json(json!({ "funnels": funnels }))
}

/// Deactivate a funnel and its triggers; running executions continue
///
/// DELETE /api/funnels/{id}
async fn deactivate_funnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.engine.funnels().deactivate(&id) {
        return Err(api_error(StatusCode::NOT_FOUND, format!("funnel not found: {}", id)));
    }
    state
        .triggers
        .unregister_funnel_triggers(&id)
        .await
        .map_err(trigger_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start an execution directly
///
/// POST /api/funnels/{id}/execute
/// Body: { "trigger_id": "...", "variables": { ... } }
async fn execute_funnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteFunnelRequest>>,
) -> Result<(StatusCode, Json<ExecutionContext>), ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let compiled = state
        .engine
        .funnels()
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("funnel not found: {}", id)))?;
    if !compiled.funnel.active {
        return Err(api_error(StatusCode::BAD_REQUEST, format!("funnel {} is not active", id)));
    }

    let trigger_id = request
        .trigger_id
        .or_else(|| compiled.funnel.triggers.first().map(|t| t.id.clone()))
        .unwrap_or_else(|| "manual".to_string());
    let options = ExecutionOptions {
        parent_execution_id: request.parent_execution_id,
        ..ExecutionOptions::from_source("api")
    };

    let context = state
        .engine
        .execute_funnel_with(&compiled.funnel, &trigger_id, request.variables, options)
        .await
        .map_err(|e| {
            tracing::error!("❌ Failed to start funnel {}: {}", id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok((StatusCode::ACCEPTED, Json(context)))
}

/// GET /api/executions
async fn list_active_executions(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let executions = state
        .engine
        .get_active_executions()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "executions": executions })))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionContext>, ApiError> {
    match state.engine.get_execution_context(&id).await {
        Ok(Some(context)) => Ok(Json(context)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("execution not found: {}", id))),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// POST /api/executions/{id}/cancel
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state
        .engine
        .cancel_execution(&id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}
