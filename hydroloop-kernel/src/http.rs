/**
 * API STATUT HYDROLOOP - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose l'état du kernel aux opérateurs : santé, état du circuit breaker,
 * suivi d'une commande, et une voie de secours pour remonter un statut device
 * quand le MQTT n'est pas disponible.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /commands/{cmd_id}, /commands/{cmd_id}/status,
 *   /zones/{zone_id}/commands (commande manuelle via le CommandBus)
 * - Sérialisation JSON automatique des réponses
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - HYDROLOOP_API_KEY absent = accès refusé (fail-closed)
 */

use crate::bus::CommandBus;
use crate::error::DeliveryError;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Command, CommandRecord, CommandStatus, DecisionContext};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<CommandBus>,
    pub health: HealthTracker,
    pub api_key: Option<String>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        tracing::warn!(path, "HYDROLOOP_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        tracing::warn!(path, "rejected request with missing or wrong api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/commands/{cmd_id}", get(get_command))
        .route("/commands/{cmd_id}/status", post(post_command_status))
        .route("/zones/{zone_id}/commands", post(post_zone_command))
        .with_state(app_state.clone())
        .layer(middleware::from_fn_with_state(app_state, require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(app.bus.tracker(), app.bus.breaker().map(|b| b.as_ref())))
}

// GET /commands/{cmd_id}
async fn get_command(
    State(app): State<AppState>,
    Path(cmd_id): Path<String>,
) -> Result<Json<CommandRecord>, StatusCode> {
    match app.bus.tracker().get_record(&cmd_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::warn!(cmd_id = %cmd_id, error = %e, "command lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    status: String,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

// POST /commands/{cmd_id}/status
async fn post_command_status(
    State(app): State<AppState>,
    Path(cmd_id): Path<String>,
    Json(report): Json<StatusReport>,
) -> (StatusCode, Json<Value>) {
    let Some(status) = CommandStatus::parse(&report.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "msg": format!("unknown status '{}'", report.status) })),
        );
    };

    let applied = app
        .bus
        .tracker()
        .apply_device_status(&cmd_id, status, report.details, report.error)
        .await;
    if applied {
        (StatusCode::OK, Json(json!({ "ok": true, "cmd_id": cmd_id, "status": status.as_str() })))
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "ok": false, "msg": "command unknown or already finished" })),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ManualCommand {
    command: Command,
    #[serde(default)]
    closed_loop: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn delivery_status(err: &DeliveryError) -> StatusCode {
    match err {
        DeliveryError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DeliveryError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DeliveryError::ZoneNodeMismatch { .. } => StatusCode::CONFLICT,
        DeliveryError::NodeLookup(_) => StatusCode::SERVICE_UNAVAILABLE,
        DeliveryError::Transport(_) | DeliveryError::HttpStatus { .. } | DeliveryError::InvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn delivery_failure(err: &DeliveryError) -> (StatusCode, Json<Value>) {
    (
        delivery_status(err),
        Json(json!({ "ok": false, "error_code": err.code(), "msg": err.to_string() })),
    )
}

// POST /zones/{zone_id}/commands (commande opérateur)
async fn post_zone_command(
    State(app): State<AppState>,
    Path(zone_id): Path<i64>,
    Json(req): Json<ManualCommand>,
) -> (StatusCode, Json<Value>) {
    let context = DecisionContext::with_reason(req.reason.unwrap_or_else(|| "manual command".to_string()));
    tracing::info!(zone_id, cmd = req.command.cmd(), node_uid = %req.command.node_uid, closed_loop = req.closed_loop, "manual command");

    if req.closed_loop {
        match app
            .bus
            .publish_controller_command_closed_loop(zone_id, &req.command, &context, None)
            .await
        {
            Ok(outcome) => (StatusCode::OK, Json(json!({ "ok": outcome.command_effect_confirmed, "outcome": outcome }))),
            Err(e) => delivery_failure(&e),
        }
    } else {
        match app.bus.publish_controller_command(zone_id, &req.command, &context).await {
            Ok(receipt) => (StatusCode::OK, Json(json!({ "ok": true, "receipt": receipt }))),
            Err(e) => delivery_failure(&e),
        }
    }
}
