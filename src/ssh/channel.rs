//! Adapters between russh server channels and the relay/agent seams.

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tracing::debug;

use crate::agent::{AgentChannel, AgentChannelOpener, AgentError};
use crate::relay::{ClientSink, GatewayError};

// ---------------------------------------------------------------------------
// Exec channel output
// ---------------------------------------------------------------------------

/// Output side of an inbound exec channel, usable from a spawned task.
pub struct ChannelSink {
    handle: Handle,
    id: ChannelId,
}

impl ChannelSink {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn data(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| GatewayError::ClientDisconnected)
    }

    async fn stderr(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        self.handle
            .extended_data(self.id, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| GatewayError::ClientDisconnected)
    }

    /// Exit status, EOF, then close.  Git's SSH transport expects all three;
    /// without the exit status the client reports "the remote end hung up
    /// unexpectedly".
    async fn finish(&mut self, exit_status: u32) {
        if self
            .handle
            .exit_status_request(self.id, exit_status)
            .await
            .is_err()
        {
            debug!(channel = ?self.id, "client gone before exit status was sent");
            return;
        }
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

// ---------------------------------------------------------------------------
// Forwarded agent channels
// ---------------------------------------------------------------------------

/// One `auth-agent@openssh.com` channel opened back towards the client.
pub struct ForwardedAgentChannel {
    channel: Channel<Msg>,
}

impl ForwardedAgentChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl AgentChannel for ForwardedAgentChannel {
    async fn send(&mut self, data: &[u8]) -> Result<(), AgentError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| AgentError::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(Bytes::copy_from_slice(&data)),
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

/// Opens agent channels over the inbound connection a session arrived on.
pub struct SessionAgentOpener {
    handle: Handle,
}

impl SessionAgentOpener {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl AgentChannelOpener for SessionAgentOpener {
    async fn open_agent_channel(&self) -> Option<Box<dyn AgentChannel>> {
        match self.handle.channel_open_agent().await {
            Ok(channel) => {
                debug!(channel = ?channel.id(), "opened forwarded agent channel");
                Some(Box::new(ForwardedAgentChannel::new(channel)))
            }
            Err(e) => {
                debug!(error = %e, "client refused agent channel");
                None
            }
        }
    }
}
