//! Per-command relay between an inbound exec channel and the upstream host.
//!
//! The relay is written against three narrow seams so it can be driven
//! without a network: [`ClientSink`] (output towards the developer),
//! [`UpstreamConnector`]/[`UpstreamExec`] (the outbound exec stream) and
//! [`ApprovalGate`](crate::approval::ApprovalGate).  Client input arrives on
//! an mpsc channel fed by the SSH session handler.
//!
//! - [`capabilities`]: read the upstream advertisement up to its flush.
//! - [`push`]: capture, bound, approve and forward a push.
//! - [`pull`]: approve, then pipe a fetch both ways.
//! - [`dispatch`]: parse the exec string and route to push or pull.

pub mod capabilities;
pub mod dispatch;
pub mod pull;
pub mod push;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, OnDemandAgentClient};
use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::auth::UserIdentity;
use crate::config::Config;
use crate::git::{ExecCommand, RepoTarget};
use crate::metrics::{MetricsRegistry, Verdict};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal failure of one command.  The `Display` text is written to the
/// client's stderr and the exec stream exits with status 1.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    CommandValidation(String),
    #[error("protocol error: {0}")]
    ProtocolFraming(String),
    #[error("{0}")]
    ResourceLimit(String),
    #[error("{0}")]
    Timeout(String),
    #[error("Access denied: {0}")]
    ApprovalRejected(String),
    #[error("approval service unavailable: {0}")]
    ApprovalUnavailable(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("client disconnected")]
    ClientDisconnected,
}

impl GatewayError {
    pub fn exit_status(&self) -> u32 {
        1
    }

    /// Line written to the client's error stream.
    pub fn client_message(&self) -> String {
        format!("{self}\n")
    }
}

impl From<crate::git::CommandError> for GatewayError {
    fn from(e: crate::git::CommandError) -> Self {
        Self::CommandValidation(e.to_string())
    }
}

impl From<crate::git::pktline::PktLineError> for GatewayError {
    fn from(e: crate::git::pktline::PktLineError) -> Self {
        Self::ProtocolFraming(e.to_string())
    }
}

impl From<AgentError> for GatewayError {
    fn from(e: AgentError) -> Self {
        Self::Upstream(format!("forwarded agent: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// What the client sends on its exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Data(Bytes),
    Eof,
}

/// Output side of the inbound exec channel.
#[async_trait]
pub trait ClientSink: Send {
    async fn data(&mut self, data: &[u8]) -> Result<(), GatewayError>;
    async fn stderr(&mut self, data: &[u8]) -> Result<(), GatewayError>;
    /// Send the exit status, EOF and close.  Called exactly once.
    async fn finish(&mut self, exit_status: u32);
}

/// Something the upstream exec channel produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Data(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    Eof,
}

/// An open exec stream on the upstream host.
#[async_trait]
pub trait UpstreamExec: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), GatewayError>;
    async fn send_eof(&mut self) -> Result<(), GatewayError>;
    /// Next event; `Ok(None)` once the channel has closed cleanly.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, GatewayError>;
    async fn close(&mut self);
}

/// Everything needed to open one upstream exec stream.
pub struct UpstreamRequest {
    pub target: RepoTarget,
    /// Full command line, e.g. `git-receive-pack 'org/repo.git'`.
    pub command: String,
    pub agent: Option<Arc<OnDemandAgentClient>>,
    /// Value of the client's `GIT_PROTOCOL` environment variable.
    pub git_protocol: Option<String>,
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(&self, request: UpstreamRequest) -> Result<Box<dyn UpstreamExec>, GatewayError>;
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Per-session facts a command needs.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: UserIdentity,
    /// Present when the client negotiated agent forwarding.
    pub agent: Option<Arc<OnDemandAgentClient>>,
    pub git_protocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayLimits {
    pub max_pack_bytes: u64,
    pub max_pack_chunks: usize,
    pub capability_prefetch_timeout: Duration,
    pub push_capture_timeout: Duration,
    pub upstream_connect_timeout: Duration,
}

impl RelayLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_pack_bytes: config.limits.max_pack_size_bytes,
            max_pack_chunks: config.limits.max_pack_chunks,
            capability_prefetch_timeout: config.timeouts.capability_prefetch(),
            push_capture_timeout: config.timeouts.push_capture(),
            upstream_connect_timeout: config.timeouts.upstream_connect(),
        }
    }
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_pack_bytes: 1024 * 1024 * 1024,
            max_pack_chunks: 10_000,
            capability_prefetch_timeout: Duration::from_secs(30),
            push_capture_timeout: Duration::from_secs(300),
            upstream_connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared by every session; holds the collaborators each command uses.
pub struct Relay {
    connector: Arc<dyn UpstreamConnector>,
    gate: Arc<dyn ApprovalGate>,
    limits: RelayLimits,
    metrics: MetricsRegistry,
}

impl Relay {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        gate: Arc<dyn ApprovalGate>,
        limits: RelayLimits,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            connector,
            gate,
            limits,
            metrics,
        }
    }

    /// Ask the gate about `request`; anything but an explicit allow is an
    /// error.
    pub(crate) async fn approve(&self, request: ApprovalRequest) -> Result<(), GatewayError> {
        let repository = request.repository.clone();
        let outcome = match self.gate.evaluate(request).await {
            Ok(verdict) => verdict.into_result(),
            Err(e) => {
                self.metrics.record_verdict(Verdict::Unavailable);
                return Err(e);
            }
        };
        match &outcome {
            Ok(()) => {
                self.metrics.record_verdict(Verdict::Allowed);
                debug!(%repository, "approval granted");
            }
            Err(e) => {
                self.metrics.record_verdict(Verdict::Blocked);
                info!(%repository, reason = %e, "approval denied");
            }
        }
        outcome
    }

    /// Open the upstream exec stream for `exec` under the connect timeout.
    pub(crate) async fn connect_upstream(
        &self,
        exec: &ExecCommand,
        session: &SessionContext,
    ) -> Result<Box<dyn UpstreamExec>, GatewayError> {
        let request = UpstreamRequest {
            target: exec.target.clone(),
            command: exec.upstream_command(),
            agent: session.agent.clone(),
            git_protocol: session.git_protocol.clone(),
        };
        let timeout = self.limits.upstream_connect_timeout;
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.connector.open(request)).await;
        self.metrics.observe_upstream_connect(started.elapsed());

        match result {
            Ok(Ok(upstream)) => {
                info!(
                    host = %exec.target.host,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upstream exec stream open"
                );
                Ok(upstream)
            }
            Ok(Err(e)) => {
                warn!(host = %exec.target.host, error = %e, "upstream connection failed");
                Err(e)
            }
            Err(_) => {
                warn!(host = %exec.target.host, "upstream connection timed out");
                Err(GatewayError::Timeout(format!(
                    "timed out connecting to {} after {}s",
                    exec.target.host,
                    timeout.as_secs()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test doubles shared by the relay tests
// ---------------------------------------------------------------------------
