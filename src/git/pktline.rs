//! Git pkt-line framing.
//!
//! Each packet is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet
//!
//! The relay is byte-transparent; it only needs to find where the upstream's
//! capability advertisement ends.

use tracing::trace;

/// A single decoded packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Vec<u8>),
    Flush,
    Delimiter,
    ResponseEnd,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PktLineError {
    #[error("invalid pkt-line length prefix {prefix:?} at offset {offset}")]
    InvalidLength { offset: usize, prefix: String },
}

/// Result of looking at the front of a buffer.
enum Frame {
    /// A complete packet spanning `len` bytes.
    Complete(PktLine, usize),
    /// Need more bytes.
    Partial,
}

fn next_frame(data: &[u8], offset: usize) -> Result<Frame, PktLineError> {
    let rest = &data[offset..];
    if rest.len() < 4 {
        return Ok(Frame::Partial);
    }
    let prefix = &rest[..4];
    let invalid = || PktLineError::InvalidLength {
        offset,
        prefix: String::from_utf8_lossy(prefix).into_owned(),
    };
    let len_hex = std::str::from_utf8(prefix).map_err(|_| invalid())?;
    if !len_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let pkt_len = usize::from_str_radix(len_hex, 16).map_err(|_| invalid())?;

    let frame = match pkt_len {
        0 => Frame::Complete(PktLine::Flush, 4),
        1 => Frame::Complete(PktLine::Delimiter, 4),
        2 => Frame::Complete(PktLine::ResponseEnd, 4),
        3 => return Err(invalid()),
        n if n > rest.len() => Frame::Partial,
        n => Frame::Complete(PktLine::Data(rest[4..n].to_vec()), n),
    };
    Ok(frame)
}

/// Decode every complete packet in `data`.  Trailing partial packets are
/// ignored; malformed framing is an error.
pub fn decode_pkt_lines(data: &[u8]) -> Result<Vec<PktLine>, PktLineError> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while let Frame::Complete(pkt, len) = next_frame(data, pos)? {
        trace!(offset = pos, len, "pkt-line");
        packets.push(pkt);
        pos += len;
    }
    Ok(packets)
}

/// Offset just past the first flush packet in `data`, i.e. the length of the
/// capability advertisement.  `Ok(None)` means the flush has not arrived yet.
pub fn advertisement_end(data: &[u8]) -> Result<Option<usize>, PktLineError> {
    let mut pos = 0;
    loop {
        match next_frame(data, pos)? {
            Frame::Partial => return Ok(None),
            Frame::Complete(PktLine::Flush, len) => return Ok(Some(pos + len)),
            Frame::Complete(_, len) => pos += len,
        }
    }
}

/// True when `data` is nothing but a single flush packet, which is what a
/// client sends to `git-receive-pack` when it has no ref updates.
pub fn is_flush_only(data: &[u8]) -> bool {
    data == b"0000"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode one data packet.
    pub(crate) fn pkt(data: &[u8]) -> Vec<u8> {
        let mut buf = format!("{:04x}", data.len() + 4).into_bytes();
        buf.extend_from_slice(data);
        buf
    }

    /// A receive-pack style advertisement: two ref lines and a flush.
    pub(crate) fn sample_advertisement() -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend(pkt(
            b"1111111111111111111111111111111111111111 refs/heads/main\0report-status delete-refs side-band-64k\n",
        ));
        wire.extend(pkt(
            b"2222222222222222222222222222222222222222 refs/tags/v1.0\n",
        ));
        wire.extend_from_slice(b"0000");
        wire
    }

    #[test]
    fn test_pkt_helper() {
        assert_eq!(pkt(b"hello\n"), b"000ahello\n");
        assert_eq!(pkt(b""), b"0004");
    }

    #[test]
    fn test_decode_special_packets() {
        assert_eq!(
            decode_pkt_lines(b"000000010002").unwrap(),
            vec![PktLine::Flush, PktLine::Delimiter, PktLine::ResponseEnd]
        );
    }

    #[test]
    fn test_decode_multiple_packets() {
        let mut wire = Vec::new();
        wire.extend(pkt(b"version 2\n"));
        wire.extend(pkt(b"agent=git/2.43\n"));
        wire.extend(pkt(b"ls-refs\n"));
        wire.extend_from_slice(b"0000");

        let packets = decode_pkt_lines(&wire).unwrap();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0], PktLine::Data(b"version 2\n".to_vec()));
        assert_eq!(packets[3], PktLine::Flush);
    }

    #[test]
    fn test_decode_ignores_trailing_partial() {
        let mut wire = pkt(b"abc\n");
        wire.extend_from_slice(b"00ff");
        assert_eq!(
            decode_pkt_lines(&wire).unwrap(),
            vec![PktLine::Data(b"abc\n".to_vec())]
        );
    }

    #[test]
    fn test_advertisement_end_at_flush() {
        let adv = sample_advertisement();
        let mut stream = adv.clone();
        stream.extend_from_slice(b"PACK....");
        assert_eq!(advertisement_end(&stream).unwrap(), Some(adv.len()));
    }

    #[test]
    fn test_advertisement_end_incomplete() {
        let adv = sample_advertisement();
        for cut in [0, 3, 10, adv.len() - 1] {
            assert_eq!(advertisement_end(&adv[..cut]).unwrap(), None, "cut {cut}");
        }
    }

    #[test]
    fn test_advertisement_skips_delimiters() {
        let mut wire = pkt(b"version 2\n");
        wire.extend_from_slice(b"0001");
        wire.extend(pkt(b"x\n"));
        wire.extend_from_slice(b"0000");
        assert_eq!(advertisement_end(&wire).unwrap(), Some(wire.len()));
    }

    #[test]
    fn test_invalid_prefix_is_error() {
        assert!(matches!(
            advertisement_end(b"zz12data"),
            Err(PktLineError::InvalidLength { offset: 0, .. })
        ));
        assert!(advertisement_end(b"0003").is_err());
        assert!(advertisement_end(b"+0a0").is_err());

        let mut wire = pkt(b"ok\n");
        wire.extend_from_slice(b"g000");
        assert!(matches!(
            decode_pkt_lines(&wire),
            Err(PktLineError::InvalidLength { offset: 7, .. })
        ));
    }

    #[test]
    fn test_flush_only() {
        assert!(is_flush_only(b"0000"));
        assert!(!is_flush_only(b""));
        assert!(!is_flush_only(b"00000000"));
    }
}
