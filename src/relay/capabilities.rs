//! Upstream capability prefetch and response de-duplication.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument};

use super::{ClientSink, GatewayError, UpstreamEvent, UpstreamExec};
use crate::git::pktline::{advertisement_end, decode_pkt_lines};

/// Upstream output read before any client data was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefetched {
    /// Everything received, advertisement first.
    pub buffer: Bytes,
    /// Length of the advertisement, up to and including its flush packet.
    pub advertisement_len: usize,
}

impl Prefetched {
    pub fn advertisement(&self) -> Bytes {
        self.buffer.slice(..self.advertisement_len)
    }
}

/// Read upstream output until the capability advertisement's flush packet
/// has arrived.  Upstream stderr is passed to the client as it comes.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub async fn prefetch_capabilities(
    upstream: &mut dyn UpstreamExec,
    sink: &mut dyn ClientSink,
    timeout: Duration,
) -> Result<Prefetched, GatewayError> {
    let mut buffer = BytesMut::new();
    let end = match tokio::time::timeout(timeout, read_until_flush(upstream, sink, &mut buffer))
        .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(GatewayError::Timeout(format!(
                "timed out after {}s waiting for upstream capabilities",
                timeout.as_secs()
            )))
        }
    };

    let buffer = buffer.freeze();
    let packets = decode_pkt_lines(&buffer[..end]).map(|p| p.len()).unwrap_or(0);
    debug!(
        advertisement_bytes = end,
        extra_bytes = buffer.len() - end,
        packets,
        "capability advertisement received"
    );
    Ok(Prefetched {
        buffer,
        advertisement_len: end,
    })
}

async fn read_until_flush(
    upstream: &mut dyn UpstreamExec,
    sink: &mut dyn ClientSink,
    buffer: &mut BytesMut,
) -> Result<usize, GatewayError> {
    loop {
        match upstream.recv().await? {
            Some(UpstreamEvent::Data(chunk)) => {
                buffer.extend_from_slice(&chunk);
                if let Some(end) = advertisement_end(&buffer[..])? {
                    return Ok(end);
                }
            }
            Some(UpstreamEvent::Stderr(chunk)) => sink.stderr(&chunk).await?,
            Some(UpstreamEvent::ExitStatus(_)) | Some(UpstreamEvent::Eof) | None => {
                return Err(GatewayError::Upstream(
                    "upstream closed before advertising capabilities".into(),
                ));
            }
        }
    }
}

/// Drops the first `skip` bytes of a byte stream, however they are chunked.
///
/// The upstream response is replayed from the start of the prefetch buffer,
/// so the advertisement the client has already seen must not be sent again.
#[derive(Debug)]
pub struct ResponseDedup {
    remaining: usize,
}

impl ResponseDedup {
    pub fn new(skip: usize) -> Self {
        Self { remaining: skip }
    }

    /// The part of `chunk` that should reach the client.
    pub fn filter<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let skipped = self.remaining.min(chunk.len());
        self.remaining -= skipped;
        &chunk[skipped..]
    }
}
