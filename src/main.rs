mod agent;
mod approval;
mod auth;
mod config;
mod git;
mod health;
mod metrics;
mod relay;
mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::approval::HttpApprovalGate;
use crate::auth::{FileIdentityStore, IdentityStore, KnownHosts};
use crate::config::Config;
use crate::health::HealthState;
use crate::metrics::MetricsRegistry;
use crate::relay::{Relay, RelayLimits};
use crate::ssh::RusshConnector;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Git-over-SSH approval gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every SSH session.
pub struct AppState {
    pub config: Arc<Config>,
    pub identities: Arc<dyn IdentityStore>,
    pub relay: Arc<Relay>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

async fn run_admin_server(state: HealthState, config: &Config, shutdown: Shutdown) -> Result<()> {
    let listen_addr = config.proxy.admin_listen;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "admin server listening");

    axum::serve(listener, health::admin_router(state))
        .with_graceful_shutdown(shutdown.wait())
        .await
        .context("admin server error")?;

    Ok(())
}

async fn run_ssh_server(
    state: Arc<AppState>,
    host_key: russh_keys::key::KeyPair,
    shutdown: Shutdown,
) -> Result<()> {
    let listen_addr = state.config.proxy.ssh_listen;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;
    ssh::start_ssh_server(state, listener, host_key, shutdown.wait()).await
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Fans a single shutdown signal out to every listener.
#[derive(Clone)]
struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    async fn wait(mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Collaborators ----
    let identities = FileIdentityStore::load(&config.identity_store.path)?;
    let identity_users = identities.user_count();
    let known_hosts = Arc::new(KnownHosts::new(&config.known_hosts));
    let gate = HttpApprovalGate::new(config.approval.url.clone(), config.approval.timeout())?;
    let (host_key, host_key_source) = ssh::load_host_key(&config.host_key)?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Relay ----
    let connector = RusshConnector::new(known_hosts, &config);
    let relay = Relay::new(
        Arc::new(connector),
        Arc::new(gate),
        RelayLimits::from_config(&config),
        metrics.clone(),
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        identities: Arc::new(identities),
        relay: Arc::new(relay),
        metrics: metrics.clone(),
    });

    let health_state = HealthState {
        identity_users,
        host_key: host_key_source,
        approval_url: config.approval.url.clone(),
        http_client: reqwest::Client::builder()
            .user_agent("gitgate/0.1")
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("failed to build reqwest client")?,
        metrics,
    };

    // ---- Spawn services ----
    let (stop_tx, stop_rx) = watch::channel(false);

    let admin_handle = tokio::spawn({
        let config = Arc::clone(&config);
        let shutdown = Shutdown(stop_rx.clone());
        async move {
            if let Err(e) = run_admin_server(health_state, &config, shutdown).await {
                tracing::error!(error = %e, "admin server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let shutdown = Shutdown(stop_rx);
        async move {
            if let Err(e) = run_ssh_server(state, host_key, shutdown).await {
                tracing::error!(error = %e, "SSH server failed");
            }
        }
    });

    // ---- Await shutdown ----
    shutdown_signal().await;
    let _ = stop_tx.send(true);
    let _ = tokio::try_join!(admin_handle, ssh_handle);

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
