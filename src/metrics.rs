use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::git::GitCommand;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CommandKind {
    UploadPack,
    ReceivePack,
    Rejected,
}

impl From<GitCommand> for CommandKind {
    fn from(command: GitCommand) -> Self {
        match command {
            GitCommand::UploadPack => Self::UploadPack,
            GitCommand::ReceivePack => Self::ReceivePack,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Verdict {
    Allowed,
    Blocked,
    Unavailable,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: CommandKind,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerdictLabels {
    pub verdict: Verdict,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AgentOperationLabels {
    pub operation: String,
    pub outcome: Outcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
///
/// Counters are registered without the `_total` suffix; the encoder adds it.
pub struct Metrics {
    // -- sessions --
    pub sessions_total: Counter,
    pub active_sessions: Gauge,
    pub auth_attempts: Family<OutcomeLabels, Counter>,

    // -- commands --
    pub commands_total: Family<CommandLabels, Counter>,
    pub push_bytes: Counter,
    pub approval_verdicts: Family<VerdictLabels, Counter>,

    // -- agent / upstream --
    pub agent_operations: Family<AgentOperationLabels, Counter>,
    pub upstream_connect_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sessions_total = Counter::default();
        registry.register(
            "gitgate_sessions",
            "Inbound SSH connections accepted",
            sessions_total.clone(),
        );

        let active_sessions: Gauge = Gauge::default();
        registry.register(
            "gitgate_active_sessions",
            "Inbound SSH sessions currently open",
            active_sessions.clone(),
        );

        let auth_attempts = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "gitgate_auth_attempts",
            "Public key authentication attempts by outcome",
            auth_attempts.clone(),
        );

        let commands_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "gitgate_commands",
            "Exec commands handled by command and outcome",
            commands_total.clone(),
        );

        let push_bytes = Counter::default();
        registry.register(
            "gitgate_push_bytes",
            "Pack bytes captured from pushes",
            push_bytes.clone(),
        );

        let approval_verdicts = Family::<VerdictLabels, Counter>::default();
        registry.register(
            "gitgate_approval_verdicts",
            "Approval gate verdicts",
            approval_verdicts.clone(),
        );

        let agent_operations = Family::<AgentOperationLabels, Counter>::default();
        registry.register(
            "gitgate_agent_operations",
            "Forwarded agent operations by operation and outcome",
            agent_operations.clone(),
        );

        let upstream_connect_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 10));
        registry.register(
            "gitgate_upstream_connect_duration_seconds",
            "Time to connect and authenticate to the upstream host",
            upstream_connect_duration_seconds.clone(),
        );

        Self {
            sessions_total,
            active_sessions,
            auth_attempts,
            commands_total,
            push_bytes,
            approval_verdicts,
            agent_operations,
            upstream_connect_duration_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    pub fn record_auth_attempt(&self, accepted: bool) {
        self.metrics
            .auth_attempts
            .get_or_create(&OutcomeLabels {
                outcome: accepted.into(),
            })
            .inc();
    }

    pub fn record_command(&self, command: CommandKind, ok: bool) {
        self.metrics
            .commands_total
            .get_or_create(&CommandLabels {
                command,
                outcome: ok.into(),
            })
            .inc();
    }

    pub fn record_verdict(&self, verdict: Verdict) {
        self.metrics
            .approval_verdicts
            .get_or_create(&VerdictLabels { verdict })
            .inc();
    }

    pub fn record_agent_operation(&self, operation: &str, ok: bool) {
        self.metrics
            .agent_operations
            .get_or_create(&AgentOperationLabels {
                operation: operation.to_string(),
                outcome: ok.into(),
            })
            .inc();
    }

    pub fn observe_upstream_connect(&self, elapsed: Duration) {
        self.metrics
            .upstream_connect_duration_seconds
            .observe(elapsed.as_secs_f64());
    }
}

/// Tracks one open session in the active-sessions gauge for as long as it
/// lives.
pub struct SessionGuard {
    metrics: MetricsRegistry,
}

impl SessionGuard {
    pub fn new(metrics: &MetricsRegistry) -> Self {
        metrics.metrics.sessions_total.inc();
        metrics.metrics.active_sessions.inc();
        Self {
            metrics: metrics.clone(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.metrics.active_sessions.dec();
    }
}
