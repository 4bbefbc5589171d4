//! Request/response exchange over a single forwarded-agent channel.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::codec::{
    split_frame, AgentRequest, AgentResponse, Identity, Signature, SSH2_AGENT_IDENTITIES_ANSWER,
    SSH2_AGENT_SIGN_RESPONSE,
};
use super::{AgentChannel, AgentError};

/// Binds the agent codec to one agent channel.
///
/// Incoming chunks accumulate in a byte buffer until a complete
/// length-prefixed message can be sliced off the front.  Requests take
/// `&mut self`, so at most one is ever outstanding on the channel.
pub struct AgentChannelProxy {
    channel: Option<Box<dyn AgentChannel>>,
    buffer: BytesMut,
    request_timeout: Duration,
}

impl AgentChannelProxy {
    pub fn new(channel: Box<dyn AgentChannel>, request_timeout: Duration) -> Self {
        Self {
            channel: Some(channel),
            buffer: BytesMut::new(),
            request_timeout,
        }
    }

    /// Ask the agent for the public keys it holds.
    pub async fn get_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        match self.round_trip(AgentRequest::RequestIdentities).await? {
            AgentResponse::Identities(identities) => Ok(identities),
            AgentResponse::Failure => Err(AgentError::Failure),
            AgentResponse::Signature(_) => {
                Err(AgentError::UnexpectedOpcode(SSH2_AGENT_SIGN_RESPONSE))
            }
        }
    }

    /// Ask the agent to sign `data` with the key identified by `key_blob`.
    pub async fn sign(
        &mut self,
        key_blob: Bytes,
        data: Bytes,
        flags: u32,
    ) -> Result<Signature, AgentError> {
        let request = AgentRequest::Sign {
            key_blob,
            data,
            flags,
        };
        match self.round_trip(request).await? {
            AgentResponse::Signature(signature) => Ok(signature),
            AgentResponse::Failure => Err(AgentError::Failure),
            AgentResponse::Identities(_) => {
                Err(AgentError::UnexpectedOpcode(SSH2_AGENT_IDENTITIES_ANSWER))
            }
        }
    }

    /// Close the channel.  Safe to call repeatedly; later requests fail with
    /// [`AgentError::ChannelClosed`].
    pub async fn close(&mut self) {
        self.buffer.clear();
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    async fn round_trip(&mut self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let Self {
            channel,
            buffer,
            request_timeout,
        } = self;
        let channel = channel.as_mut().ok_or(AgentError::ChannelClosed)?;

        if !buffer.is_empty() {
            debug!(bytes = buffer.len(), "discarding unsolicited agent data");
            buffer.clear();
        }

        let timeout = *request_timeout;
        let exchange = async {
            channel.send(&request.encode()).await?;
            read_response(&mut **channel, buffer).await
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }
}

/// A proxy dropped mid-request (its caller's deadline fired) still owns an
/// open channel; close it on a detached task.
impl Drop for AgentChannelProxy {
    fn drop(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("closing agent channel abandoned mid-request");
                runtime.spawn(async move { channel.close().await });
            }
            Err(_) => debug!("no runtime left to close abandoned agent channel"),
        }
    }
}

async fn read_response(
    channel: &mut dyn AgentChannel,
    buffer: &mut BytesMut,
) -> Result<AgentResponse, AgentError> {
    loop {
        if let Some(payload) = split_frame(buffer)? {
            trace!(len = payload.len(), "agent message received");
            return AgentResponse::decode(&payload);
        }
        match channel.recv().await {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => return Err(AgentError::ChannelClosed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
