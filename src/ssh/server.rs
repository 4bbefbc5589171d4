//! SSH server bootstrap: host key loading and the accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Config as RusshConfig};
use russh::{Disconnect, MethodSet};
use russh_keys::key::KeyPair;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use super::session::GatewaySession;
use crate::config::HostKeyConfig;
use crate::AppState;

// ---------------------------------------------------------------------------
// Host key loading
// ---------------------------------------------------------------------------

/// Where the SSH host key came from, reported by `/healthz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum HostKeySource {
    File { path: PathBuf },
    Keyring { name: String },
    Ephemeral,
}

/// Load the host key from the configured file, else from the kernel
/// keyring, else generate an ephemeral Ed25519 key.
///
/// A configured file that cannot be read is an error rather than a reason to
/// fall back: clients would otherwise see the host key change silently.
pub fn load_host_key(config: &HostKeyConfig) -> Result<(KeyPair, HostKeySource)> {
    if let Some(path) = &config.path {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key from {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key from file");
        return Ok((key, HostKeySource::File { path: path.clone() }));
    }

    match load_host_key_from_keyring(&config.keyring_name) {
        Ok(key) => {
            info!(name = %config.keyring_name, "loaded SSH host key from kernel keyring");
            Ok((
                key,
                HostKeySource::Keyring {
                    name: config.keyring_name.clone(),
                },
            ))
        }
        Err(e) => {
            warn!(
                error = %e,
                "no SSH host key configured; generating ephemeral Ed25519 key",
            );
            Ok((KeyPair::generate_ed25519(), HostKeySource::Ephemeral))
        }
    }
}

/// Read a PEM-encoded private key stored in the user keyring under `name`.
fn load_host_key_from_keyring(name: &str) -> Result<KeyPair> {
    use linux_keyutils::{KeyRing, KeyRingIdentifier};

    let ring = KeyRing::from_special_id(KeyRingIdentifier::User, false)
        .map_err(|e| anyhow::anyhow!("failed to open user keyring: {e:?}"))?;

    let key = ring
        .search(name)
        .map_err(|e| anyhow::anyhow!("SSH host key {name:?} not found in kernel keyring: {e:?}"))?;

    let buf = key
        .read_to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read SSH host key payload from keyring: {e:?}"))?;

    let pem = std::str::from_utf8(&buf).context("SSH host key payload is not valid UTF-8")?;

    russh_keys::decode_secret_key(pem, None)
        .context("failed to decode SSH host key from keyring payload")
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

fn russh_config(state: &AppState, host_key: KeyPair) -> RusshConfig {
    RusshConfig {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: Some(state.config.timeouts.session()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: state.config.limits.max_auth_attempts,
        ..Default::default()
    }
}

/// Serve SSH on `listener` until `shutdown` resolves.  Sessions already
/// running are left to finish on their own tasks.
pub async fn start_ssh_server(
    state: Arc<AppState>,
    listener: TcpListener,
    host_key: KeyPair,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let config = Arc::new(russh_config(&state, host_key));
    let local = listener.local_addr().context("SSH listener has no address")?;
    info!(address = %local, "SSH server listening");

    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept SSH connection");
                    continue;
                }
            },
            () = &mut shutdown => {
                info!("SSH server shutting down");
                return Ok(());
            }
        };
        tokio::spawn(serve_connection(
            Arc::clone(&state),
            Arc::clone(&config),
            stream,
            peer,
        ));
    }
}

/// Run one connection, disconnecting it if it has not authenticated within
/// the session timeout.
#[instrument(skip_all, fields(peer = %peer))]
async fn serve_connection(
    state: Arc<AppState>,
    config: Arc<RusshConfig>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let deadline = state.config.timeouts.session();
    let authenticated = Arc::new(AtomicBool::new(false));
    let handler = GatewaySession::new(state, Some(peer), Arc::clone(&authenticated));

    let running = match server::run_stream(config, stream, handler).await {
        Ok(running) => running,
        Err(e) => {
            debug!(peer = %peer, error = %e, "SSH handshake failed");
            return;
        }
    };
    let handle = running.handle();
    let disconnect = async move {
        let _ = handle
            .disconnect(
                Disconnect::ByApplication,
                "authentication timed out".into(),
                "en".into(),
            )
            .await;
    };
    let result = with_auth_deadline(running, deadline, &authenticated, disconnect).await;
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "SSH session ended with error");
    }
}

/// Drive `running` to completion, running `disconnect` once if the
/// connection is still unauthenticated when `deadline` passes.
async fn with_auth_deadline<F, D>(
    running: F,
    deadline: Duration,
    authenticated: &AtomicBool,
    disconnect: D,
) -> F::Output
where
    F: Future,
    D: Future<Output = ()>,
{
    tokio::pin!(running);
    tokio::select! {
        result = &mut running => return result,
        () = tokio::time::sleep(deadline) => {}
    }
    if !authenticated.load(Ordering::SeqCst) {
        warn!("authentication deadline passed; disconnecting");
        disconnect.await;
    }
    running.await
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use russh_keys::PublicKeyBase64;
    use tokio::sync::oneshot;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_connection_disconnected_at_deadline() {
        let (tx, rx) = oneshot::channel::<()>();
        let authenticated = AtomicBool::new(false);
        let started = tokio::time::Instant::now();

        // The session only ends once the disconnect goes out.
        let result = with_auth_deadline(rx, DEADLINE, &authenticated, async move {
            let _ = tx.send(());
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= DEADLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_connection_outlives_deadline() {
        let authenticated = AtomicBool::new(true);
        let disconnected = AtomicBool::new(false);
        let started = tokio::time::Instant::now();

        let result = with_auth_deadline(
            async {
                tokio::time::sleep(DEADLINE * 2).await;
                "finished"
            },
            DEADLINE,
            &authenticated,
            async { disconnected.store(true, Ordering::SeqCst) },
        )
        .await;

        assert_eq!(result, "finished");
        assert!(!disconnected.load(Ordering::SeqCst));
        assert!(started.elapsed() >= DEADLINE * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_ending_early_skips_deadline() {
        let authenticated = AtomicBool::new(false);
        let disconnected = AtomicBool::new(false);
        let started = tokio::time::Instant::now();

        let result = with_auth_deadline(
            async { 7 },
            DEADLINE,
            &authenticated,
            async { disconnected.store(true, Ordering::SeqCst) },
        )
        .await;

        assert_eq!(result, 7);
        assert!(!disconnected.load(Ordering::SeqCst));
        assert!(started.elapsed() < DEADLINE);
    }

    #[test]
    fn host_key_loaded_from_file() {
        let key = KeyPair::generate_ed25519();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem).unwrap();
        file.write_all(&pem).unwrap();

        let config = HostKeyConfig {
            path: Some(file.path().to_path_buf()),
            keyring_name: "unused".into(),
        };
        let (loaded, source) = load_host_key(&config).unwrap();
        assert_eq!(
            source,
            HostKeySource::File {
                path: file.path().to_path_buf()
            }
        );
        assert_eq!(
            loaded.clone_public_key().unwrap().public_key_bytes(),
            key.clone_public_key().unwrap().public_key_bytes()
        );
    }

    #[test]
    fn unreadable_key_file_is_an_error() {
        let config = HostKeyConfig {
            path: Some("/nonexistent/gitgate/host_key".into()),
            keyring_name: "unused".into(),
        };
        let err = load_host_key(&config).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/gitgate/host_key"));
    }

    #[test]
    fn missing_keyring_entry_falls_back_to_ephemeral() {
        let config = HostKeyConfig {
            path: None,
            keyring_name: "gitgate-test:no-such-key".into(),
        };
        let (_, source) = load_host_key(&config).unwrap();
        assert_eq!(source, HostKeySource::Ephemeral);
    }
}
