//! Forwarded SSH agent access.
//!
//! The gateway never holds a developer's private key.  When it needs to
//! authenticate upstream it opens a throwaway `auth-agent@openssh.com`
//! channel back through the developer's own connection and asks their agent
//! to list keys or sign.
//!
//! - [`codec`]: agent wire format, independent of any channel.
//! - [`proxy`]: one request/response exchange bound to one agent channel.
//! - [`client`]: the on-demand signing oracle that opens a fresh channel per
//!   operation and serialises callers.

pub mod client;
pub mod codec;
pub mod proxy;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use client::{KeyMaterial, OnDemandAgentClient, PublicKeyBlob};
pub use codec::{Identity, Signature};

/// Failures of agent operations.  Each one rejects exactly the
/// `list_identities`/`sign` call that produced it.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("malformed agent message: {0}")]
    Malformed(String),
    #[error("agent refused the request")]
    Failure,
    #[error("unexpected agent message type {0}")]
    UnexpectedOpcode(u8),
    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),
    #[error("timed out opening agent channel after {0:?}")]
    OpenTimeout(Duration),
    #[error("could not open agent channel")]
    ChannelUnavailable,
    #[error("agent channel closed")]
    ChannelClosed,
    #[error("agent channel error: {0}")]
    Channel(String),
    #[error("unsupported key material: {0}")]
    UnsupportedKey(String),
}

/// One forwarded-agent channel, used for a single request/response exchange.
#[async_trait]
pub trait AgentChannel: Send {
    /// Write raw bytes to the agent.
    async fn send(&mut self, data: &[u8]) -> Result<(), AgentError>;

    /// Next chunk of bytes from the agent, `None` once the channel has ended.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<Bytes>;

    /// Tear the channel down.  Called at most once by [`proxy::AgentChannelProxy`].
    async fn close(&mut self);
}

/// Opens ephemeral agent channels over an inbound session's transport.
#[async_trait]
pub trait AgentChannelOpener: Send + Sync {
    /// `None` when the client refuses or the transport is gone.
    async fn open_agent_channel(&self) -> Option<Box<dyn AgentChannel>>;
}
