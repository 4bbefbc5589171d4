use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub host_key: HostKeyConfig,
    pub identity_store: IdentityStoreConfig,
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Per-host fingerprint lists that replace the built-in table entry for
    /// that host.
    #[serde(default)]
    pub known_hosts: HashMap<String, Vec<String>>,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address the SSH server listens on.
    #[serde(default = "default_ssh_listen")]
    pub ssh_listen: SocketAddr,
    /// Address serving `/healthz` and `/metrics`.
    #[serde(default = "default_admin_listen")]
    pub admin_listen: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ssh_listen: default_ssh_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

fn default_ssh_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2222))
}

fn default_admin_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HostKeyConfig {
    /// Private key file (OpenSSH or PEM).  Takes precedence over the keyring.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Description of the key in the kernel user keyring.
    #[serde(default = "default_keyring_name")]
    pub keyring_name: String,
}

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self {
            path: None,
            keyring_name: default_keyring_name(),
        }
    }
}

fn default_keyring_name() -> String {
    "gitgate:ssh_host_key".to_string()
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityStoreConfig {
    /// YAML file mapping users to their public keys.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Endpoint that receives approval requests as JSON.
    pub url: String,
    /// Seconds to wait for a verdict.
    #[serde(default = "default_approval_timeout")]
    pub timeout: u64,
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn default_approval_timeout() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_pack_size_bytes")]
    pub max_pack_size_bytes: u64,
    #[serde(default = "default_max_pack_chunks")]
    pub max_pack_chunks: usize,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pack_size_bytes: default_max_pack_size_bytes(),
            max_pack_chunks: default_max_pack_chunks(),
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

fn default_max_pack_size_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_pack_chunks() -> usize {
    10_000
}

fn default_max_auth_attempts() -> usize {
    6
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// All values in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle timeout, and the deadline for completing authentication.
    #[serde(default = "default_session_timeout")]
    pub session: u64,
    #[serde(default = "default_agent_request_timeout")]
    pub agent_request: u64,
    #[serde(default = "default_agent_channel_open_timeout")]
    pub agent_channel_open: u64,
    #[serde(default = "default_capability_prefetch_timeout")]
    pub capability_prefetch: u64,
    #[serde(default = "default_push_capture_timeout")]
    pub push_capture: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            session: default_session_timeout(),
            agent_request: default_agent_request_timeout(),
            agent_channel_open: default_agent_channel_open_timeout(),
            capability_prefetch: default_capability_prefetch_timeout(),
            push_capture: default_push_capture_timeout(),
            upstream_connect: default_upstream_connect_timeout(),
        }
    }
}

impl TimeoutsConfig {
    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session)
    }

    pub fn agent_request(&self) -> Duration {
        Duration::from_secs(self.agent_request)
    }

    pub fn agent_channel_open(&self) -> Duration {
        Duration::from_secs(self.agent_channel_open)
    }

    pub fn capability_prefetch(&self) -> Duration {
        Duration::from_secs(self.capability_prefetch)
    }

    pub fn push_capture(&self) -> Duration {
        Duration::from_secs(self.push_capture)
    }

    pub fn upstream_connect(&self) -> Duration {
        Duration::from_secs(self.upstream_connect)
    }
}

fn default_session_timeout() -> u64 {
    600
}

fn default_agent_request_timeout() -> u64 {
    10
}

fn default_agent_channel_open_timeout() -> u64 {
    5
}

fn default_capability_prefetch_timeout() -> u64 {
    30
}

fn default_push_capture_timeout() -> u64 {
    300
}

fn default_upstream_connect_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    /// SSH user for upstream connections.
    #[serde(default = "default_upstream_user")]
    pub user: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            user: default_upstream_user(),
        }
    }
}

fn default_upstream_port() -> u16 {
    22
}

fn default_upstream_user() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.approval.url.is_empty(),
        "approval.url must not be empty"
    );
    anyhow::ensure!(config.approval.timeout > 0, "approval.timeout must be > 0");

    let limits = &config.limits;
    anyhow::ensure!(
        limits.max_pack_size_bytes > 0,
        "limits.max_pack_size_bytes must be > 0"
    );
    anyhow::ensure!(limits.max_pack_chunks > 0, "limits.max_pack_chunks must be > 0");
    anyhow::ensure!(
        limits.max_auth_attempts > 0,
        "limits.max_auth_attempts must be > 0"
    );

    let t = &config.timeouts;
    for (name, value) in [
        ("session", t.session),
        ("agent_request", t.agent_request),
        ("agent_channel_open", t.agent_channel_open),
        ("capability_prefetch", t.capability_prefetch),
        ("push_capture", t.push_capture),
        ("upstream_connect", t.upstream_connect),
    ] {
        anyhow::ensure!(value > 0, "timeouts.{name} must be > 0");
    }

    anyhow::ensure!(config.upstream.port > 0, "upstream.port must be > 0");
    anyhow::ensure!(
        !config.upstream.user.is_empty(),
        "upstream.user must not be empty"
    );

    for (host, fingerprints) in &config.known_hosts {
        anyhow::ensure!(
            !fingerprints.is_empty(),
            "known_hosts.{host} must list at least one fingerprint"
        );
        for fp in fingerprints {
            anyhow::ensure!(
                fp.strip_prefix("SHA256:").is_some_and(|rest| !rest.is_empty()),
                "known_hosts.{host}: fingerprint {fp:?} must start with SHA256:"
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
