//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`GatewaySession`].
//! The handler authenticates the developer against the identity store,
//! records agent-forwarding and `GIT_PROTOCOL` requests, and hands every
//! exec request to the [`Relay`](crate::relay::Relay) on its own task.
//! Client bytes reach that task through a per-channel mpsc queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channel::{ChannelSink, SessionAgentOpener};
use crate::agent::OnDemandAgentClient;
use crate::auth::{fingerprint_of, wire_format, IdentityStore, UserIdentity};
use crate::metrics::SessionGuard;
use crate::relay::{ClientInput, SessionContext};
use crate::AppState;

/// Client chunks buffered per exec channel before `data` applies
/// backpressure to the connection.
const CLIENT_INPUT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct GatewaySession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    identity: Option<UserIdentity>,
    /// Shared with the accept loop, which enforces the authentication
    /// deadline.
    authenticated: Arc<AtomicBool>,
    agent: Option<Arc<OnDemandAgentClient>>,
    git_protocol: Option<String>,
    inputs: HashMap<ChannelId, mpsc::Sender<ClientInput>>,
    _guard: SessionGuard,
}

impl GatewaySession {
    pub fn new(
        state: Arc<AppState>,
        peer_addr: Option<SocketAddr>,
        authenticated: Arc<AtomicBool>,
    ) -> Self {
        info!(peer = ?peer_addr, phase = "Connected", "SSH connection accepted");
        let guard = SessionGuard::new(&state.metrics);
        Self {
            state,
            peer_addr,
            identity: None,
            authenticated,
            agent: None,
            git_protocol: None,
            inputs: HashMap::new(),
            _guard: guard,
        }
    }

    fn reject(&self, reason: &str, text: &str, channel: ChannelId, session: &mut Session) {
        warn!(peer = ?self.peer_addr, reason, "refusing request");
        session.extended_data(channel, 1, CryptoVec::from_slice(text.as_bytes()));
        session.exit_status_request(channel, 1);
        session.eof(channel);
        session.close(channel);
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        info!(
            peer = ?self.peer_addr,
            user = self.identity.as_ref().map(|i| i.username.as_str()),
            phase = "Closed",
            "SSH session closed"
        );
    }
}

/// Look up the developer who owns `key`.
pub fn resolve_identity(store: &dyn IdentityStore, key: &PublicKey) -> Option<UserIdentity> {
    match wire_format(&key.public_key_bytes()) {
        Ok(wire) => store.find_user_by_public_key(&wire),
        Err(e) => {
            debug!(error = %e, "offered key has no usable wire form");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for GatewaySession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = fingerprint_of(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            %fingerprint,
            phase = "Authenticating",
            "SSH public-key auth attempt"
        );

        let found = resolve_identity(self.state.identities.as_ref(), key);
        self.state.metrics.record_auth_attempt(found.is_some());
        match found {
            Some(identity) => {
                info!(
                    username = %identity.username,
                    account = %identity.account,
                    phase = "Ready",
                    "SSH key resolved"
                );
                self.identity = Some(identity);
                self.authenticated.store(true, Ordering::SeqCst);
                Ok(Auth::Accept)
            }
            None => {
                warn!(%fingerprint, "SSH key not associated with any user");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.identity.is_some())
    }

    /// Port forwarding is never offered.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = ?self.peer_addr, address, port = *port, "rejecting tcpip-forward");
        Ok(false)
    }

    /// The client asked for agent forwarding.  Agent channels are opened
    /// lazily, one per operation, when the gateway authenticates upstream.
    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.agent.is_none() {
            let timeouts = &self.state.config.timeouts;
            let opener = Arc::new(SessionAgentOpener::new(session.handle()));
            let client = OnDemandAgentClient::new(
                opener,
                timeouts.agent_channel_open(),
                timeouts.agent_request(),
            )
            .with_metrics(self.state.metrics.clone());
            self.agent = Some(Arc::new(client));
            debug!(peer = ?self.peer_addr, "agent forwarding enabled");
        }
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here before the exec.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        let Some(identity) = self.identity.clone() else {
            self.reject("unauthenticated", "not authenticated\n", channel, session);
            return Ok(());
        };
        if self.inputs.contains_key(&channel) {
            self.reject(
                "second exec on channel",
                "only one command per channel\n",
                channel,
                session,
            );
            return Ok(());
        }
        info!(
            peer = ?self.peer_addr,
            username = %identity.username,
            command = %raw,
            "SSH exec request"
        );
        session.channel_success(channel);

        let (tx, mut rx) = mpsc::channel(CLIENT_INPUT_BUFFER);
        self.inputs.insert(channel, tx);

        let context = SessionContext {
            identity,
            agent: self.agent.clone(),
            git_protocol: self.git_protocol.clone(),
        };
        let relay = Arc::clone(&self.state.relay);
        let mut sink = ChannelSink::new(session.handle(), channel);
        tokio::spawn(async move {
            relay.run_command(&raw, &context, &mut rx, &mut sink).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.inputs.get(&channel) {
            if tx
                .send(ClientInput::Data(Bytes::copy_from_slice(data)))
                .await
                .is_err()
            {
                debug!(?channel, "command already finished; dropping client data");
                self.inputs.remove(&channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.inputs.get(&channel) {
            let _ = tx.send(ClientInput::Eof).await;
        }
        Ok(())
    }

    /// Dropping the sender tells a still-running command that the client
    /// went away.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "channel closed by client");
        self.inputs.remove(&channel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use russh_keys::key::KeyPair;

    use super::*;
    use crate::auth::FileIdentityStore;

    fn store_with(key: &PublicKey) -> FileIdentityStore {
        let wire = wire_format(&key.public_key_bytes()).unwrap();
        FileIdentityStore::from_yaml(&format!(
            "users:\n  - username: alice\n    email: alice@example.com\n    account: alice-gh\n    public_keys:\n      - {wire} alice@laptop\n"
        ))
        .unwrap()
    }

    #[test]
    fn known_key_resolves_to_identity() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let store = store_with(&key);
        let identity = resolve_identity(&store, &key).unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.account, "alice-gh");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let known = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let stranger = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let store = store_with(&known);
        assert!(resolve_identity(&store, &stranger).is_none());
    }
}
