//! SSH agent wire protocol framing.
//!
//! Every agent message is a `u32` big-endian length followed by that many
//! payload bytes.  The first payload byte is the message opcode.  Only the
//! subset needed to act as a signing oracle is modelled here:
//!
//! - `11` request identities / `12` identities answer
//! - `13` sign request / `14` sign response
//! - `5` failure
//!
//! Decoding never panics on hostile input: every length field is checked
//! against the bytes actually available and reported as
//! [`AgentError::Malformed`] when inconsistent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::AgentError;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH2_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH2_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH2_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH2_AGENT_SIGN_RESPONSE: u8 = 14;

/// Sign-request flag asking the agent for an `rsa-sha2-256` signature.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 2;
/// Sign-request flag asking the agent for an `rsa-sha2-512` signature.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 4;

/// Upper bound on a single agent message, matching OpenSSH's `AGENT_MAX_LEN`.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// A public key held by the remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Key algorithm, read from the first string of the key blob
    /// (e.g. `ssh-ed25519`).
    pub algorithm: String,
    /// Wire-format public key blob.
    pub key_blob: Bytes,
    /// Comment bytes exactly as the agent sent them; not necessarily UTF-8.
    pub comment: Bytes,
}

impl Identity {
    /// The comment for logs, with invalid UTF-8 replaced.
    pub fn comment_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.comment)
    }
}

/// A signature returned by the agent, split out of its wire wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signature algorithm (e.g. `ssh-ed25519`, `rsa-sha2-256`).
    pub algorithm: String,
    /// Raw signature bytes with the algorithm wrapper stripped.
    pub bytes: Bytes,
}

impl Signature {
    /// Re-encode as the SSH signature blob `string algorithm || string sig`.
    pub fn to_blob(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.algorithm.len() + self.bytes.len());
        put_string(&mut buf, self.algorithm.as_bytes());
        put_string(&mut buf, &self.bytes);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    RequestIdentities,
    Sign {
        key_blob: Bytes,
        data: Bytes,
        flags: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Failure,
    Identities(Vec<Identity>),
    Signature(Signature),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Prefix `payload` with its `u32` length.
fn frame(payload: BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(&payload);
    out.freeze()
}

impl AgentRequest {
    /// Encode as a complete length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Self::RequestIdentities => payload.put_u8(SSH2_AGENTC_REQUEST_IDENTITIES),
            Self::Sign {
                key_blob,
                data,
                flags,
            } => {
                payload.put_u8(SSH2_AGENTC_SIGN_REQUEST);
                put_string(&mut payload, key_blob);
                put_string(&mut payload, data);
                payload.put_u32(*flags);
            }
        }
        frame(payload)
    }

    /// Decode a frame payload (length prefix already removed).
    pub fn decode(payload: &[u8]) -> Result<Self, AgentError> {
        let mut reader = WireReader::new(payload);
        match reader.read_u8("request opcode")? {
            SSH2_AGENTC_REQUEST_IDENTITIES => Ok(Self::RequestIdentities),
            SSH2_AGENTC_SIGN_REQUEST => {
                let key_blob = Bytes::copy_from_slice(reader.read_string("sign key blob")?);
                let data = Bytes::copy_from_slice(reader.read_string("sign data")?);
                let flags = reader.read_u32("sign flags")?;
                Ok(Self::Sign {
                    key_blob,
                    data,
                    flags,
                })
            }
            other => Err(AgentError::UnexpectedOpcode(other)),
        }
    }
}

impl AgentResponse {
    /// Encode as a complete length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Self::Failure => payload.put_u8(SSH_AGENT_FAILURE),
            Self::Identities(identities) => {
                payload.put_u8(SSH2_AGENT_IDENTITIES_ANSWER);
                payload.put_u32(identities.len() as u32);
                for identity in identities {
                    put_string(&mut payload, &identity.key_blob);
                    put_string(&mut payload, &identity.comment);
                }
            }
            Self::Signature(signature) => {
                payload.put_u8(SSH2_AGENT_SIGN_RESPONSE);
                put_string(&mut payload, &signature.to_blob());
            }
        }
        frame(payload)
    }

    /// Decode a frame payload (length prefix already removed).
    pub fn decode(payload: &[u8]) -> Result<Self, AgentError> {
        let mut reader = WireReader::new(payload);
        let response = match reader.read_u8("response opcode")? {
            SSH_AGENT_FAILURE => Self::Failure,
            SSH2_AGENT_IDENTITIES_ANSWER => {
                let count = reader.read_u32("identity count")? as usize;
                // Each identity needs at least two length fields.
                if count > reader.remaining() / 8 {
                    return Err(AgentError::Malformed(format!(
                        "identity count {count} exceeds what {} remaining bytes can hold",
                        reader.remaining()
                    )));
                }
                let mut identities = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_blob = Bytes::copy_from_slice(reader.read_string("identity key blob")?);
                    let comment = Bytes::copy_from_slice(reader.read_string("identity comment")?);
                    identities.push(Identity {
                        algorithm: key_algorithm(&key_blob)?,
                        key_blob,
                        comment,
                    });
                }
                Self::Identities(identities)
            }
            SSH2_AGENT_SIGN_RESPONSE => {
                let blob = reader.read_string("signature blob")?;
                let mut inner = WireReader::new(blob);
                let algorithm = inner.read_utf8("signature algorithm")?;
                let bytes = Bytes::copy_from_slice(inner.read_string("signature bytes")?);
                Self::Signature(Signature { algorithm, bytes })
            }
            other => return Err(AgentError::UnexpectedOpcode(other)),
        };
        if reader.remaining() != 0 {
            return Err(AgentError::Malformed(format!(
                "{} trailing bytes after agent response",
                reader.remaining()
            )));
        }
        Ok(response)
    }
}

/// Read the algorithm name that opens every wire-format public key blob.
pub fn key_algorithm(key_blob: &[u8]) -> Result<String, AgentError> {
    let algorithm = WireReader::new(key_blob).read_utf8("key blob algorithm")?;
    if algorithm.is_empty() {
        return Err(AgentError::Malformed("key blob has an empty algorithm name".into()));
    }
    Ok(algorithm)
}

// ---------------------------------------------------------------------------
// Frame splitting
// ---------------------------------------------------------------------------

/// Slice one complete message payload off the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed.  A declared length above
/// [`MAX_MESSAGE_LEN`] or of zero is rejected outright.
pub fn split_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>, AgentError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if declared == 0 {
        return Err(AgentError::Malformed("zero-length agent message".into()));
    }
    if declared > MAX_MESSAGE_LEN {
        return Err(AgentError::Malformed(format!(
            "agent message of {declared} bytes exceeds the {MAX_MESSAGE_LEN} byte limit"
        )));
    }
    if buffer.len() < 4 + declared {
        return Ok(None);
    }
    buffer.advance(4);
    Ok(Some(buffer.split_to(declared).freeze()))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over an agent payload.
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], AgentError> {
        if self.remaining() < n {
            return Err(AgentError::Malformed(format!(
                "truncated {what} at offset {}: need {n} bytes, {} available",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8, AgentError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, AgentError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_string(&mut self, what: &str) -> Result<&'a [u8], AgentError> {
        let len = self.read_u32(what)? as usize;
        self.take(len, what)
    }

    fn read_utf8(&mut self, what: &str) -> Result<String, AgentError> {
        let raw = self.read_string(what)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| AgentError::Malformed(format!("{what} is not valid UTF-8")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
