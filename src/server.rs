//! HTTP surface: health check, the scheduled-trigger endpoint and the signed
//! match webhook.
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config;
use crate::db::Pool;
use crate::error::ScoutError;
use crate::kv::KvStore;
use crate::notify::NotificationDispatcher;
use crate::scan::ScanCoordinator;
use crate::webhook::{self, MatchEvent, SIGNATURE_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub coordinator: Arc<ScanCoordinator>,
    pub dispatcher: NotificationDispatcher,
    pub kv: Arc<dyn KvStore>,
    pub app: config::App,
    pub server: config::Server,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/cron/scan", get(cron_scan).post(cron_scan))
        .route("/api/webhooks/match", post(match_webhook))
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind = state.server.bind.clone();
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left = left.as_bytes();
    let right = right.as_bytes();
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= *a ^ *b;
    }
    diff == 0
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    if raw.len() < 7 || !raw[..7].eq_ignore_ascii_case("bearer ") {
        return None;
    }
    Some(raw[7..].trim()).filter(|t| !t.is_empty())
}

async fn healthz() -> Response {
    json_response(StatusCode::OK, json!({ "ok": true }))
}

async fn cron_scan(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorized = bearer_token(&headers)
        .map(|token| constant_time_eq(token, &state.server.cron_secret))
        .unwrap_or(false);
    if !authorized {
        warn!("cron trigger rejected: bad or missing bearer token");
        return json_response(StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" }));
    }

    match state.coordinator.run_cycle().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => {
            error!(?err, "scan cycle failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            )
        }
    }
}

fn validation_response(errors: Vec<String>) -> Response {
    json_response(StatusCode::UNPROCESSABLE_ENTITY, json!({ "errors": errors }))
}

async fn match_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if !webhook::verify_signature(&state.server.webhook_secret, &body, signature) {
        warn!("webhook rejected: bad signature");
        return json_response(StatusCode::UNAUTHORIZED, json!({ "error": "invalid signature" }));
    }

    let event: MatchEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => return validation_response(vec![format!("invalid json body: {}", err)]),
    };
    let valid = match event.validate() {
        Ok(valid) => valid,
        Err(errors) => return validation_response(errors),
    };

    let replay_key = format!("webhook:{}", webhook::delivery_id(&body));
    let ttl = Duration::from_secs(state.server.replay_ttl_secs);
    match state.kv.put_if_absent(&replay_key, &valid.item.id, ttl).await {
        Ok(true) => {}
        Ok(false) => {
            info!(item_id = %valid.item.id, "webhook replay rejected");
            return json_response(StatusCode::CONFLICT, json!({ "error": "duplicate delivery" }));
        }
        Err(err) => {
            error!(?err, "replay guard unavailable");
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "replay guard unavailable" }),
            );
        }
    }

    match webhook::process_match(&state.pool, &state.dispatcher, &state.app, &valid).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(ScoutError::Validation(errors)) => {
            forget_delivery(&state, &replay_key).await;
            validation_response(errors)
        }
        Err(err) => {
            error!(?err, "webhook processing failed");
            forget_delivery(&state, &replay_key).await;
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.to_string() }),
            )
        }
    }
}

/// Let a delivery that was not processed be retried.
async fn forget_delivery(state: &AppState, replay_key: &str) {
    if let Err(err) = state.kv.delete(replay_key).await {
        warn!(?err, "failed to clear replay key");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret2"));
    }
}
