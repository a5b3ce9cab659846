//! LSP-style `Content-Length` framing for the downstream stdio channel.
//!
//! Wire format: `Content-Length: <N>\r\n\r\n<N bytes of UTF-8 JSON>`. The
//! decoder is a header-length state machine over a byte buffer; on malformed
//! headers the buffered bytes are discarded and an id is scavenged from the
//! partial body so the caller can synthesize a parse-error response.

use bytes::{BufMut, BytesMut};
use mcpmux_protocol::RequestId;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::traits::TransportError;

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";
const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;
const MAX_HEADER_BLOCK: usize = 8 * 1024;

/// One decoded item from the framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LspFrame {
    /// A complete frame body (UTF-8 JSON, unparsed).
    Message(String),
    /// The framing broke. `id` is whatever request id could be scavenged
    /// from the discarded bytes, for synthesizing a parse-error response.
    Malformed {
        /// Scavenged request id, if any.
        id: Option<RequestId>,
    },
}

/// `Content-Length` codec for [`tokio_util::codec::FramedRead`]/`FramedWrite`.
#[derive(Debug, Clone)]
pub struct LspCodec {
    max_frame: usize,
}

impl Default for LspCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LspCodec {
    /// Codec with the default 16 MiB frame cap.
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Codec with a custom frame cap.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    fn parse_content_length(headers: &[u8]) -> Option<usize> {
        let text = std::str::from_utf8(headers).ok()?;
        for line in text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().ok();
            }
        }
        None
    }

    /// Best-effort id recovery from discarded bytes. The bytes are junk by
    /// definition; anything that fails to parse yields `None`.
    fn scavenge_id(bytes: &[u8]) -> Option<RequestId> {
        let start = bytes.iter().position(|b| *b == b'{')?;
        let value: serde_json::Value = serde_json::from_slice(&bytes[start..]).ok()?;
        value.get("id").and_then(RequestId::from_value)
    }

    fn discard_as_malformed(src: &mut BytesMut, reason: &str) -> LspFrame {
        warn!(bytes = src.len(), reason, "discarding unframeable stdio input");
        let discarded = src.split_to(src.len());
        LspFrame::Malformed {
            id: Self::scavenge_id(&discarded),
        }
    }
}

impl Decoder for LspCodec {
    type Item = LspFrame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(delim) = src
            .windows(HEADER_DELIMITER.len())
            .position(|w| w == HEADER_DELIMITER)
        else {
            if src.len() > MAX_HEADER_BLOCK {
                return Ok(Some(Self::discard_as_malformed(src, "oversized header block")));
            }
            return Ok(None);
        };

        let Some(length) = Self::parse_content_length(&src[..delim]) else {
            return Ok(Some(Self::discard_as_malformed(src, "missing content-length")));
        };

        if length > self.max_frame {
            return Ok(Some(Self::discard_as_malformed(src, "frame exceeds size cap")));
        }

        let body_start = delim + HEADER_DELIMITER.len();
        let total = body_start + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        match std::str::from_utf8(&frame[body_start..]) {
            Ok(body) => Ok(Some(LspFrame::Message(body.to_string()))),
            Err(_) => Ok(Some(LspFrame::Malformed {
                id: Self::scavenge_id(&frame[body_start..]),
            })),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Trailing bytes at EOF can never complete a frame.
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LspCodec {
    type Error = TransportError;

    fn encode(&mut self, body: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(body.as_bytes());
        Ok(())
    }
}
