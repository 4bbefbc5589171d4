//! Push/pull approval.
//!
//! Every command is described to an external approval pipeline before any
//! byte reaches the upstream host.  The pipeline answers with
//! `{error?, blocked?}`; absence of both means the command may proceed.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, instrument, warn};

use crate::auth::UserIdentity;
use crate::relay::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    /// Fetch/clone; carries no pack.
    Get,
    /// Push; carries the captured pack.
    Post,
}

/// Synthetic description of one command.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub method: RequestMethod,
    /// `host/path.git`.
    pub repository: String,
    pub protocol: &'static str,
    pub identity: UserIdentity,
    /// Raw pack bytes, base64-encoded on the wire; `null` for pulls.
    #[serde(serialize_with = "serialize_pack")]
    pub pack: Option<Bytes>,
}

impl ApprovalRequest {
    pub fn pull(repository: String, identity: UserIdentity) -> Self {
        Self {
            method: RequestMethod::Get,
            repository,
            protocol: "ssh",
            identity,
            pack: None,
        }
    }

    pub fn push(repository: String, identity: UserIdentity, pack: Bytes) -> Self {
        Self {
            method: RequestMethod::Post,
            repository,
            protocol: "ssh",
            identity,
            pack: Some(pack),
        }
    }
}

fn serialize_pack<S: Serializer>(pack: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match pack {
        Some(bytes) => {
            serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApprovalVerdict {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub blocked: Option<String>,
}

impl ApprovalVerdict {
    pub fn allow() -> Self {
        Self::default()
    }

    /// The reason the command was refused, if it was.  `blocked` wins when
    /// both are present.
    pub fn denial(&self) -> Option<&str> {
        self.blocked.as_deref().or(self.error.as_deref())
    }

    /// `Ok` when allowed, otherwise the `Access denied` error to show the
    /// client.
    pub fn into_result(self) -> Result<(), GatewayError> {
        match self.blocked.or(self.error) {
            Some(reason) => Err(GatewayError::ApprovalRejected(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn evaluate(&self, request: ApprovalRequest) -> Result<ApprovalVerdict, GatewayError>;
}

// ---------------------------------------------------------------------------
// HTTP gate
// ---------------------------------------------------------------------------

/// Posts each request as JSON to a policy endpoint.  Anything other than a
/// 2xx response with a parseable verdict fails closed.
pub struct HttpApprovalGate {
    client: reqwest::Client,
    url: String,
}

impl HttpApprovalGate {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build approval HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ApprovalGate for HttpApprovalGate {
    #[instrument(skip_all, fields(method = ?request.method, repository = %request.repository))]
    async fn evaluate(&self, request: ApprovalRequest) -> Result<ApprovalVerdict, GatewayError> {
        let unavailable = |detail: String| {
            warn!(url = %self.url, %detail, "approval gate unavailable");
            GatewayError::ApprovalUnavailable(detail)
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(unavailable(format!("gate returned {status}")));
        }

        let verdict: ApprovalVerdict = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("unreadable verdict: {e}")))?;
        debug!(denied = verdict.denial().is_some(), "approval verdict received");
        Ok(verdict)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    fn alice() -> UserIdentity {
        UserIdentity {
            username: "alice".into(),
            email: "alice@example.com".into(),
            account: "alice-gh".into(),
        }
    }

    #[derive(Clone)]
    struct GateState {
        reply: (StatusCode, Value),
        seen: Arc<Mutex<Vec<Value>>>,
    }

    async fn gate_handler(
        State(state): State<GateState>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        state.seen.lock().unwrap().push(body);
        (state.reply.0, Json(state.reply.1.clone()))
    }

    async fn spawn_gate(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/approve", post(gate_handler))
            .with_state(GateState {
                reply: (status, reply),
                seen: Arc::clone(&seen),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/approve"), seen)
    }

    fn gate(url: String) -> HttpApprovalGate {
        HttpApprovalGate::new(url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_request_serialisation() {
        let push = ApprovalRequest::push(
            "github.com/acme/widgets.git".into(),
            alice(),
            Bytes::from_static(b"PACK"),
        );
        let value = serde_json::to_value(&push).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["protocol"], "ssh");
        assert_eq!(value["repository"], "github.com/acme/widgets.git");
        assert_eq!(value["identity"]["username"], "alice");
        assert_eq!(value["pack"], "UEFDSw==");

        let pull = ApprovalRequest::pull("github.com/acme/widgets.git".into(), alice());
        let value = serde_json::to_value(&pull).unwrap();
        assert_eq!(value["method"], "GET");
        assert!(value["pack"].is_null());
    }

    #[test]
    fn test_verdict_precedence() {
        let verdict: ApprovalVerdict = serde_json::from_value(json!({})).unwrap();
        assert!(verdict.into_result().is_ok());

        let verdict: ApprovalVerdict =
            serde_json::from_value(json!({"error": "scan failed", "blocked": "secret found"}))
                .unwrap();
        assert_eq!(verdict.denial(), Some("secret found"));
        assert_eq!(
            verdict.into_result().unwrap_err().to_string(),
            "Access denied: secret found"
        );

        let verdict: ApprovalVerdict =
            serde_json::from_value(json!({"error": "scan failed", "blocked": null})).unwrap();
        assert_eq!(
            verdict.into_result().unwrap_err().to_string(),
            "Access denied: scan failed"
        );
    }

    #[tokio::test]
    async fn test_http_gate_allows_and_sees_request() {
        let (url, seen) = spawn_gate(StatusCode::OK, json!({})).await;
        let verdict = gate(url)
            .evaluate(ApprovalRequest::push(
                "github.com/acme/widgets.git".into(),
                alice(),
                Bytes::from_static(b"PACK"),
            ))
            .await
            .unwrap();
        assert_eq!(verdict, ApprovalVerdict::allow());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["method"], "POST");
        assert_eq!(seen[0]["pack"], "UEFDSw==");
    }

    #[tokio::test]
    async fn test_http_gate_blocked() {
        let (url, _) = spawn_gate(StatusCode::OK, json!({"blocked": "commit email"})).await;
        let verdict = gate(url)
            .evaluate(ApprovalRequest::pull("github.com/a/b.git".into(), alice()))
            .await
            .unwrap();
        assert_eq!(verdict.blocked.as_deref(), Some("commit email"));
    }

    #[tokio::test]
    async fn test_http_gate_fails_closed() {
        let (url, _) = spawn_gate(StatusCode::INTERNAL_SERVER_ERROR, json!({})).await;
        let err = gate(url)
            .evaluate(ApprovalRequest::pull("github.com/a/b.git".into(), alice()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalUnavailable(_)), "{err}");

        let (url, _) = spawn_gate(StatusCode::OK, json!("not a verdict")).await;
        let err = gate(url)
            .evaluate(ApprovalRequest::pull("github.com/a/b.git".into(), alice()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalUnavailable(_)), "{err}");

        // Nothing listening.
        let err = gate("http://127.0.0.1:9/approve".into())
            .evaluate(ApprovalRequest::pull("github.com/a/b.git".into(), alice()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalUnavailable(_)), "{err}");
    }
}
