//! Operator-facing routes: rate-limit snapshot and health probes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use tianji_core::AppState;
use tianji_storage::HealthCheckRow;

pub fn observability_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/ratelimit", get(ratelimit_snapshot))
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/health/services", get(services))
        .with_state(state)
}

/// One `provider/provider_model` entry; `-1` means the vendor never
/// reported that counter, reset times are RFC3339 UTC.
#[derive(Debug, Serialize)]
struct RateLimitEntry {
    tokens_limit: i64,
    tokens_remaining: i64,
    tokens_reset: Option<String>,
    requests_limit: i64,
    requests_remaining: i64,
    requests_reset: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct RateLimitSnapshot {
    providers: BTreeMap<String, RateLimitEntry>,
}

async fn ratelimit_snapshot(State(state): State<Arc<AppState>>) -> Response {
    let providers = state
        .ratelimit
        .snapshot()
        .into_iter()
        .map(|(key, entry)| {
            (
                key,
                RateLimitEntry {
                    tokens_limit: entry.tokens_limit,
                    tokens_remaining: entry.tokens_remaining,
                    tokens_reset: fmt_rfc3339(entry.tokens_reset),
                    requests_limit: entry.requests_limit,
                    requests_remaining: entry.requests_remaining,
                    requests_reset: fmt_rfc3339(entry.requests_reset),
                    updated_at: fmt_rfc3339(Some(entry.updated_at)),
                },
            )
        })
        .collect();
    Json(RateLimitSnapshot { providers }).into_response()
}

async fn liveness() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let ping = state.storage.ping().await;
    let healthy = ping.is_ok();
    let message = ping.as_ref().err().map(|e| e.to_string());

    let record = state
        .storage
        .insert_health_check(HealthCheckRow {
            service: "storage".to_string(),
            healthy,
            message: message.clone(),
            checked_at: OffsetDateTime::now_utc(),
        })
        .await;
    if let Err(err) = record {
        warn!("health check write failed: {err}");
    }

    if healthy {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "error": message,
            })),
        )
            .into_response()
    }
}

async fn services(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "model_groups": state.table.group_names(),
        "providers": state.registry.names(),
    }))
    .into_response()
}

fn fmt_rfc3339(at: Option<OffsetDateTime>) -> Option<String> {
    at.and_then(|t| t.format(&Rfc3339).ok())
}
