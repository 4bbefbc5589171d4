//! On-demand signing oracle backed by the client's forwarded agent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

use super::codec::{key_algorithm, Identity, Signature};
use super::proxy::AgentChannelProxy;
use super::{AgentChannelOpener, AgentError};
use crate::metrics::MetricsRegistry;

/// Anything that can produce its own wire-format public key blob.
pub trait PublicKeyBlob: Send + Sync {
    fn public_key_blob(&self) -> Vec<u8>;
}

impl PublicKeyBlob for Identity {
    fn public_key_blob(&self) -> Vec<u8> {
        self.key_blob.to_vec()
    }
}

impl PublicKeyBlob for russh_keys::key::PublicKey {
    fn public_key_blob(&self) -> Vec<u8> {
        use russh_keys::PublicKeyBase64;
        self.public_key_bytes()
    }
}

/// The key a signature is requested for.
pub enum KeyMaterial<'a> {
    /// A parsed key that knows how to serialise itself.
    Structured(&'a dyn PublicKeyBlob),
    /// A wire-format key blob.
    Raw(&'a [u8]),
}

impl KeyMaterial<'_> {
    /// Resolve to a wire-format blob, rejecting anything that does not start
    /// with a key algorithm name.
    pub fn resolve(&self) -> Result<Bytes, AgentError> {
        let blob = match self {
            Self::Structured(key) => Bytes::from(key.public_key_blob()),
            Self::Raw(blob) => Bytes::copy_from_slice(blob),
        };
        if blob.is_empty() {
            return Err(AgentError::UnsupportedKey("empty key blob".into()));
        }
        key_algorithm(&blob).map_err(|e| AgentError::UnsupportedKey(e.to_string()))?;
        Ok(blob)
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    ListIdentities,
    Sign,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::ListIdentities => "list_identities",
            Self::Sign => "sign",
        }
    }
}

/// Presents `list_identities` / `sign` as plain async calls while opening one
/// throwaway agent channel per call.
///
/// All operations on one inbound session go through a single-permit FIFO
/// queue: operation N+1 opens its channel only after operation N has closed
/// its own, so channel identifiers on the shared transport never collide.
pub struct OnDemandAgentClient {
    opener: Arc<dyn AgentChannelOpener>,
    queue: Semaphore,
    open_timeout: Duration,
    request_timeout: Duration,
    metrics: Option<MetricsRegistry>,
}

impl OnDemandAgentClient {
    pub fn new(
        opener: Arc<dyn AgentChannelOpener>,
        open_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            opener,
            queue: Semaphore::new(1),
            open_timeout,
            request_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// List the identities held by the client's agent.
    #[instrument(skip(self))]
    pub async fn list_identities(&self) -> Result<Vec<Identity>, AgentError> {
        let _permit = self.acquire().await?;
        let result = match self.open().await {
            Ok(mut proxy) => {
                let result = proxy.get_identities().await;
                proxy.close().await;
                result
            }
            Err(e) => Err(e),
        };
        self.record(Operation::ListIdentities, &result);
        result
    }

    /// Have the client's agent sign `data` with `key`.
    #[instrument(skip_all, fields(len = data.len(), flags = flags))]
    pub async fn sign(
        &self,
        key: KeyMaterial<'_>,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, AgentError> {
        let key_blob = key.resolve()?;
        let data = Bytes::copy_from_slice(data);

        let _permit = self.acquire().await?;
        let result = match self.open().await {
            Ok(mut proxy) => {
                let result = proxy.sign(key_blob, data, flags).await;
                proxy.close().await;
                result
            }
            Err(e) => Err(e),
        };
        self.record(Operation::Sign, &result);
        result
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, AgentError> {
        self.queue
            .acquire()
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }

    async fn open(&self) -> Result<AgentChannelProxy, AgentError> {
        match tokio::time::timeout(self.open_timeout, self.opener.open_agent_channel()).await {
            Err(_) => Err(AgentError::OpenTimeout(self.open_timeout)),
            Ok(None) => Err(AgentError::ChannelUnavailable),
            Ok(Some(channel)) => Ok(AgentChannelProxy::new(channel, self.request_timeout)),
        }
    }

    fn record<T>(&self, op: Operation, result: &Result<T, AgentError>) {
        match result {
            Ok(_) => debug!(operation = op.as_str(), "agent operation complete"),
            Err(e) => warn!(operation = op.as_str(), error = %e, "agent operation failed"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_agent_operation(op.as_str(), result.is_ok());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
