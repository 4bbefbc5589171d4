//! Push flow: prefetch capabilities, capture the pack under bounds, get it
//! approved, then forward it.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::capabilities::{prefetch_capabilities, ResponseDedup};
use super::{
    ClientInput, ClientSink, GatewayError, Relay, SessionContext, UpstreamEvent, UpstreamExec,
};
use crate::approval::ApprovalRequest;
use crate::git::pktline::is_flush_only;
use crate::git::ExecCommand;

// ---------------------------------------------------------------------------
// Pack buffer
// ---------------------------------------------------------------------------

/// Bounded accumulator for a push payload.
#[derive(Debug)]
pub struct PackBuffer {
    chunks: Vec<Bytes>,
    total: u64,
    max_bytes: u64,
    max_chunks: usize,
}

impl PackBuffer {
    pub fn new(max_bytes: u64, max_chunks: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total: 0,
            max_bytes,
            max_chunks,
        }
    }

    /// Accept one chunk, or discard everything captured so far when either
    /// limit would be exceeded.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), GatewayError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.chunks.len() >= self.max_chunks {
            self.discard();
            return Err(GatewayError::ResourceLimit(format!(
                "push rejected: more than {} chunks received",
                self.max_chunks
            )));
        }
        let total = self.total + chunk.len() as u64;
        if total > self.max_bytes {
            self.discard();
            return Err(GatewayError::ResourceLimit(format!(
                "push rejected: pack exceeds maximum size of {} bytes",
                self.max_bytes
            )));
        }
        self.total = total;
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the captured chunks, checking the result against the
    /// running total.
    pub fn into_pack(self) -> Result<Bytes, GatewayError> {
        let mut pack = BytesMut::with_capacity(self.total as usize);
        for chunk in &self.chunks {
            pack.extend_from_slice(chunk);
        }
        if pack.len() as u64 != self.total {
            return Err(GatewayError::DataIntegrity(format!(
                "captured {} bytes but tracked {}",
                pack.len(),
                self.total
            )));
        }
        Ok(pack.freeze())
    }

    fn discard(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}

/// Read the client's stream into a [`PackBuffer`] until EOF.
pub async fn capture_pack(
    input: &mut mpsc::Receiver<ClientInput>,
    mut buffer: PackBuffer,
    timeout: Duration,
) -> Result<Bytes, GatewayError> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, input.recv()).await {
            Err(_) => {
                return Err(GatewayError::Timeout(format!(
                    "push rejected: pack not received within {}s",
                    timeout.as_secs()
                )))
            }
            Ok(None) => return Err(GatewayError::ClientDisconnected),
            Ok(Some(ClientInput::Eof)) => break,
            Ok(Some(ClientInput::Data(chunk))) => buffer.push(chunk)?,
        }
    }
    debug!(
        bytes = buffer.len(),
        chunks = buffer.chunk_count(),
        "push payload captured"
    );
    buffer.into_pack()
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

impl Relay {
    #[instrument(skip_all, fields(phase = "PushFlow", repository = %exec.target.repository()))]
    pub(crate) async fn run_push(
        &self,
        exec: &ExecCommand,
        session: &SessionContext,
        input: &mut mpsc::Receiver<ClientInput>,
        sink: &mut dyn ClientSink,
    ) -> Result<u32, GatewayError> {
        let mut upstream = self.connect_upstream(exec, session).await?;
        let result = self
            .push_over(&mut *upstream, exec, session, input, sink)
            .await;
        upstream.close().await;
        result
    }

    async fn push_over(
        &self,
        upstream: &mut dyn UpstreamExec,
        exec: &ExecCommand,
        session: &SessionContext,
        input: &mut mpsc::Receiver<ClientInput>,
        sink: &mut dyn ClientSink,
    ) -> Result<u32, GatewayError> {
        let prefetched =
            prefetch_capabilities(upstream, sink, self.limits.capability_prefetch_timeout).await?;
        sink.data(&prefetched.advertisement()).await?;

        let buffer = PackBuffer::new(self.limits.max_pack_bytes, self.limits.max_pack_chunks);
        let pack = capture_pack(input, buffer, self.limits.push_capture_timeout).await?;
        self.metrics.metrics.push_bytes.inc_by(pack.len() as u64);

        if pack.is_empty() || is_flush_only(&pack) {
            info!("empty push, nothing to approve");
            return Ok(0);
        }

        let request = ApprovalRequest::push(
            exec.target.repository(),
            session.identity.clone(),
            pack.clone(),
        );
        self.approve(request).await?;

        info!(bytes = pack.len(), "push approved, forwarding upstream");
        upstream.send(&pack).await?;
        upstream.send_eof().await?;

        let mut dedup = ResponseDedup::new(prefetched.advertisement_len);
        let replay = dedup.filter(&prefetched.buffer);
        if !replay.is_empty() {
            sink.data(replay).await?;
        }
        relay_upstream_output(upstream, sink, &mut dedup).await
    }
}

/// Pass upstream output to the client until the upstream channel closes.
/// Returns the upstream exit status.
async fn relay_upstream_output(
    upstream: &mut dyn UpstreamExec,
    sink: &mut dyn ClientSink,
    dedup: &mut ResponseDedup,
) -> Result<u32, GatewayError> {
    let mut exit = None;
    while let Some(event) = upstream.recv().await? {
        match event {
            UpstreamEvent::Data(chunk) => {
                let chunk = dedup.filter(&chunk);
                if !chunk.is_empty() {
                    sink.data(chunk).await?;
                }
            }
            UpstreamEvent::Stderr(chunk) => sink.stderr(&chunk).await?,
            UpstreamEvent::ExitStatus(status) => exit = Some(status),
            UpstreamEvent::Eof => {}
        }
    }
    Ok(exit.unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
