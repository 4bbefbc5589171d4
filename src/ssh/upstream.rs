//! Outbound SSH exec streams to the upstream forge.
//!
//! The gateway authenticates upstream with the developer's own keys: every
//! public-key attempt is signed by the client's forwarded agent through the
//! session's [`OnDemandAgentClient`].  Host keys are pinned by
//! [`KnownHosts`]; an unpinned host is refused before any connection is made.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, CryptoVec, Disconnect, Signer};
use russh_keys::key::{PublicKey, SignatureHash};
use tracing::{debug, info, instrument, warn};

use crate::agent::codec::SSH_AGENT_RSA_SHA2_256;
use crate::agent::{AgentError, Identity, KeyMaterial, OnDemandAgentClient};
use crate::auth::known_hosts::{fingerprint_of, KnownHosts};
use crate::config::Config;
use crate::relay::{GatewayError, UpstreamConnector, UpstreamEvent, UpstreamExec, UpstreamRequest};

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct RusshConnector {
    known_hosts: Arc<KnownHosts>,
    client_config: Arc<client::Config>,
    port: u16,
    user: String,
}

impl RusshConnector {
    pub fn new(known_hosts: Arc<KnownHosts>, config: &Config) -> Self {
        let client_config = client::Config {
            inactivity_timeout: Some(config.timeouts.session()),
            ..Default::default()
        };
        Self {
            known_hosts,
            client_config: Arc::new(client_config),
            port: config.upstream.port,
            user: config.upstream.user.clone(),
        }
    }
}

#[async_trait]
impl UpstreamConnector for RusshConnector {
    #[instrument(skip_all, fields(host = %request.target.host, port = self.port))]
    async fn open(&self, request: UpstreamRequest) -> Result<Box<dyn UpstreamExec>, GatewayError> {
        let host = request.target.host.clone();
        if !self.known_hosts.is_known(&host) {
            return Err(GatewayError::Upstream(format!(
                "no pinned host key for {host}; refusing to connect"
            )));
        }
        let agent = request.agent.ok_or_else(|| {
            GatewayError::Upstream(format!(
                "agent forwarding is required to authenticate to {host}; \
                 reconnect with `ssh -A` or set `ForwardAgent yes`"
            ))
        })?;

        let verifier = HostKeyVerifier {
            host: host.clone(),
            known_hosts: Arc::clone(&self.known_hosts),
        };
        let mut handle = client::connect(
            Arc::clone(&self.client_config),
            (host.as_str(), self.port),
            verifier,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                GatewayError::Upstream(format!("host key mismatch for {host}"))
            }
            other => GatewayError::Upstream(format!("could not connect to {host}: {other}")),
        })?;

        authenticate(&mut handle, &self.user, &host, &agent).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Upstream(format!("could not open session on {host}: {e}")))?;
        if let Some(protocol) = request.git_protocol {
            channel
                .set_env(false, "GIT_PROTOCOL", protocol)
                .await
                .map_err(|e| GatewayError::Upstream(format!("set GIT_PROTOCOL failed: {e}")))?;
        }
        channel
            .exec(true, request.command.as_str())
            .await
            .map_err(|e| GatewayError::Upstream(format!("exec on {host} failed: {e}")))?;

        debug!(command = %request.command, "upstream exec started");
        Ok(Box::new(RusshExec {
            channel,
            handle,
            exit_seen: false,
        }))
    }
}

/// Try each forwarded identity in the order the agent lists them.
async fn authenticate(
    handle: &mut Handle<HostKeyVerifier>,
    user: &str,
    host: &str,
    agent: &Arc<OnDemandAgentClient>,
) -> Result<(), GatewayError> {
    let identities = agent.list_identities().await?;
    if identities.is_empty() {
        return Err(GatewayError::Upstream(
            "forwarded agent holds no keys; add one with `ssh-add`".into(),
        ));
    }

    for identity in &identities {
        let (key, flags) = match parse_identity(identity) {
            Some(parsed) => parsed,
            None => {
                debug!(algorithm = %identity.algorithm, "skipping unsupported agent key");
                continue;
            }
        };
        let signer = AgentSigner {
            agent: Arc::clone(agent),
            flags,
        };
        let (_, outcome) = handle.authenticate_future(user, key, signer).await;
        match outcome {
            Ok(true) => {
                info!(host, user, comment = %identity.comment_lossy(), "authenticated upstream");
                return Ok(());
            }
            Ok(false) => debug!(comment = %identity.comment_lossy(), "upstream rejected key"),
            Err(SignerError::Agent(e)) => return Err(e.into()),
            Err(SignerError::Transport) => {
                return Err(GatewayError::Upstream(format!(
                    "{host} closed the connection during authentication"
                )))
            }
        }
    }

    warn!(host, user, tried = identities.len(), "no forwarded key accepted upstream");
    Err(GatewayError::Upstream(format!(
        "{host} rejected all {} forwarded keys for user {user}",
        identities.len()
    )))
}

/// RSA keys are offered as `rsa-sha2-256` and signed with the matching agent
/// flag.
fn parse_identity(identity: &Identity) -> Option<(PublicKey, u32)> {
    let (hash, flags) = if identity.algorithm == "ssh-rsa" {
        (Some(SignatureHash::SHA2_256), SSH_AGENT_RSA_SHA2_256)
    } else {
        (None, 0)
    };
    let key = russh_keys::key::parse_public_key(&identity.key_blob, hash).ok()?;
    Some((key, flags))
}

// ---------------------------------------------------------------------------
// russh client plumbing
// ---------------------------------------------------------------------------

struct HostKeyVerifier {
    host: String,
    known_hosts: Arc<KnownHosts>,
}

#[async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint_of(key);
        let accepted = self.known_hosts.verify(&self.host, &fingerprint);
        if !accepted {
            warn!(host = %self.host, %fingerprint, "upstream host key not pinned");
        }
        Ok(accepted)
    }
}

#[derive(Debug)]
enum SignerError {
    Agent(AgentError),
    Transport,
}

impl From<russh::SendError> for SignerError {
    fn from(_: russh::SendError) -> Self {
        Self::Transport
    }
}

/// Signs userauth requests with the forwarded agent.
struct AgentSigner {
    agent: Arc<OnDemandAgentClient>,
    flags: u32,
}

impl AgentSigner {
    /// russh expects the signed payload back with the signature blob
    /// appended as an SSH string.
    async fn sign_payload(
        &self,
        key: &PublicKey,
        mut to_sign: CryptoVec,
    ) -> Result<CryptoVec, SignerError> {
        let signature = self
            .agent
            .sign(KeyMaterial::Structured(key), &to_sign, self.flags)
            .await
            .map_err(SignerError::Agent)?;
        let blob = signature.to_blob();
        to_sign.push_u32_be(blob.len() as u32);
        to_sign.extend(&blob);
        Ok(to_sign)
    }
}

type SignFuture =
    Pin<Box<dyn Future<Output = (AgentSigner, Result<CryptoVec, SignerError>)> + Send>>;

impl Signer for AgentSigner {
    type Error = SignerError;
    type Future = SignFuture;

    fn auth_publickey_sign(self, key: &PublicKey, to_sign: CryptoVec) -> Self::Future {
        let key = key.clone();
        Box::pin(async move {
            let result = self.sign_payload(&key, to_sign).await;
            (self, result)
        })
    }
}

// ---------------------------------------------------------------------------
// Exec stream
// ---------------------------------------------------------------------------

struct RusshExec {
    channel: Channel<client::Msg>,
    handle: Handle<HostKeyVerifier>,
    exit_seen: bool,
}

#[async_trait]
impl UpstreamExec for RusshExec {
    async fn send(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| GatewayError::Upstream(format!("write to upstream failed: {e}")))
    }

    async fn send_eof(&mut self) -> Result<(), GatewayError> {
        self.channel
            .eof()
            .await
            .map_err(|e| GatewayError::Upstream(format!("unexpected disconnect: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, GatewayError> {
        loop {
            let Some(message) = self.channel.wait().await else {
                if self.exit_seen {
                    return Ok(None);
                }
                return Err(GatewayError::Upstream(
                    "unexpected disconnect before exit status".into(),
                ));
            };
            match message {
                ChannelMsg::Data { data } => {
                    return Ok(Some(UpstreamEvent::Data(Bytes::copy_from_slice(&data))))
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Ok(Some(UpstreamEvent::Stderr(Bytes::copy_from_slice(&data))))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    self.exit_seen = true;
                    return Ok(Some(UpstreamEvent::ExitStatus(exit_status)));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Err(GatewayError::Upstream(format!(
                        "upstream command terminated by signal {signal_name:?}"
                    )))
                }
                ChannelMsg::Failure => {
                    return Err(GatewayError::Upstream(
                        "upstream refused the exec request".into(),
                    ))
                }
                ChannelMsg::Eof => return Ok(Some(UpstreamEvent::Eof)),
                ChannelMsg::Close => return Ok(None),
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
