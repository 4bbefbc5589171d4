//! Admin HTTP listener: `/healthz` and `/metrics`.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::metrics::MetricsRegistry;
use crate::ssh::HostKeySource;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub host_key: HostKeySource,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub identity_store: CheckResult,
    pub approval_gate: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub identity_users: usize,
    pub host_key: HostKeySource,
    pub approval_url: String,
    pub http_client: reqwest::Client,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_identity_store(users: usize) -> CheckResult {
    if users == 0 {
        CheckResult::unhealthy("identity store has no users; every login will be refused")
    } else {
        CheckResult::healthy(format!("{users} users loaded"))
    }
}

/// Any HTTP answer counts as reachable; the gate only has to accept POSTs.
async fn check_approval_gate(client: &reqwest::Client, url: &str) -> CheckResult {
    match client.head(url).send().await {
        Ok(resp) => CheckResult::healthy(format!("HEAD {url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {url} failed: {e}")),
    }
}

/// An unreachable gate fails every command closed, so it is fatal.  A
/// missing user table or an ephemeral host key still lets the process run.
fn aggregate_status(checks: &HealthChecks, host_key: &HostKeySource) -> HealthStatus {
    if !checks.approval_gate.ok {
        HealthStatus::Unhealthy
    } else if !checks.identity_store.ok || *host_key == HostKeySource::Ephemeral {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let checks = HealthChecks {
        identity_store: check_identity_store(state.identity_users),
        approval_gate: check_approval_gate(&state.http_client, &state.approval_url).await,
    };
    let status = aggregate_status(&checks, &state.host_key);
    let body = HealthResponse {
        status,
        host_key: state.host_key.clone(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}

/// `GET /metrics`
async fn metrics_handler(State(state): State<HealthState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn admin_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
