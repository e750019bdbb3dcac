//! Text-line framing with optional length-delimited payloads.
//!
//! Every frame is one CRLF-terminated header line. Commands whose contract
//! declares a payload end the header with the payload byte length, and that
//! many opaque bytes follow the CRLF:
//!
//! ```text
//! +---------+--------+----------+-------+------+-----------------+
//! | COMMAND | [TRID] | [PARAMS] | [LEN] | CRLF | [LEN raw bytes] |
//! +---------+--------+----------+-------+------+-----------------+
//! ```
//!
//! The payload length is authoritative. Payload bytes are never scanned for
//! CR/LF, so binary data and nested frames pass through untouched.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::MAX_PAYLOAD_SIZE;
use crate::commands::{TridRule, spec_for};
use crate::error::{ProtocolError, ProtocolResult};

const CRLF: &[u8] = b"\r\n";

/// Longest header line the streaming decoder buffers while waiting for CRLF.
const MAX_HEADER_LEN: usize = 16 * 1024;

/// Delivery mode of an `MSG` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// `N`: no acknowledgement, no failure report.
    None,
    /// `U`: unacknowledged.
    Unacknowledged,
    /// `A`: acknowledged with `ACK`/`NAK`.
    Acknowledged,
    /// `D`: data (P2P) messages.
    Data,
}

impl AckMode {
    pub fn flag(self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Unacknowledged => "U",
            Self::Acknowledged => "A",
            Self::Data => "D",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "N" => Some(Self::None),
            "U" => Some(Self::Unacknowledged),
            "A" => Some(Self::Acknowledged),
            "D" => Some(Self::Data),
            _ => None,
        }
    }
}

/// One protocol frame.
///
/// The payload length never appears in `params`: [`encode`] appends it and
/// [`decode`] strips it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub trid: Option<u32>,
    pub params: Vec<String>,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            trid: None,
            params: Vec::new(),
            payload: None,
        }
    }

    /// Builds an `MSG` frame carrying `body` with the given delivery mode.
    pub fn message(ack: AckMode, body: impl Into<Bytes>) -> Self {
        Self::new("MSG").with_param(ack.flag()).with_payload(body)
    }

    #[must_use]
    pub fn with_trid(mut self, trid: u32) -> Self {
        self.trid = Some(trid);
        self
    }

    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    #[must_use]
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Numeric error code, if this frame is a server error.
    pub fn error_code(&self) -> Option<u16> {
        if crate::commands::is_error_code(&self.command) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Payload bytes, or an empty slice.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    fn write_header(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str(&self.command)?;
        if let Some(trid) = self.trid {
            write!(f, " {trid}")?;
        }
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " {}", payload.len())?;
        }
        Ok(())
    }
}

impl fmt::Display for Frame {
    /// Header line without the CRLF.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_header(f)
    }
}

/// Encodes a frame to its wire form.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut header = String::with_capacity(64);
    // Writing to a String cannot fail.
    let _ = frame.write_header(&mut header);

    let payload = frame.payload_bytes();
    let mut buffer = Vec::with_capacity(header.len() + 2 + payload.len());
    buffer.extend_from_slice(header.as_bytes());
    buffer.extend_from_slice(CRLF);
    buffer.extend_from_slice(payload);
    buffer
}

/// Decodes one complete frame from the start of `data`.
///
/// Returns the frame and the number of bytes consumed, including any stray
/// CR/LF bytes skipped before the header. Incomplete input is an error; use
/// [`try_decode`] when reading from a stream.
pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
    match try_decode(data)? {
        Some(decoded) => Ok(decoded),
        None => Err(ProtocolError::malformed(format!(
            "incomplete frame ({} bytes)",
            data.len()
        ))),
    }
}

/// Like [`decode`] but returns `Ok(None)` when more bytes are needed.
pub fn try_decode(data: &[u8]) -> ProtocolResult<Option<(Frame, usize)>> {
    let start = skip_line_breaks(data);
    let Some(header_len) = find_crlf(&data[start..]) else {
        return Ok(None);
    };
    let header_end = start + header_len;
    let body_start = header_end + CRLF.len();

    let header = std::str::from_utf8(&data[start..header_end])
        .map_err(|_| ProtocolError::malformed("header is not valid UTF-8"))?;
    let mut tokens: Vec<&str> = header.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.is_empty() {
        return Err(ProtocolError::malformed("empty command"));
    }
    let command = tokens.remove(0).to_string();
    let spec = spec_for(&command);

    let trid = match spec.trid {
        TridRule::Never => None,
        TridRule::Always => {
            let first = tokens
                .first()
                .ok_or_else(|| ProtocolError::malformed(format!("{command} without trid")))?;
            let trid = first.parse::<u32>().map_err(|_| {
                ProtocolError::malformed(format!("{command} has non-numeric trid {first:?}"))
            })?;
            tokens.remove(0);
            Some(trid)
        }
        TridRule::IfNumeric => {
            // A lone numeric token on a payload command is the length.
            let leaves_length = !spec.payload || tokens.len() > 1;
            match tokens.first().map(|t| t.parse::<u32>()) {
                Some(Ok(trid)) if leaves_length => {
                    tokens.remove(0);
                    Some(trid)
                }
                _ => None,
            }
        }
    };

    let payload_len = if spec.payload {
        tokens.last().and_then(|t| t.parse::<usize>().ok())
    } else {
        None
    };

    let (payload, consumed) = match payload_len {
        Some(len) => {
            if len > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::MessageTooLarge {
                    size: len,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            tokens.pop();
            if data.len() < body_start + len {
                return Ok(None);
            }
            (
                Some(Bytes::copy_from_slice(&data[body_start..body_start + len])),
                body_start + len,
            )
        }
        None => (None, body_start),
    };

    let frame = Frame {
        command,
        trid,
        params: tokens.into_iter().map(str::to_string).collect(),
        payload,
    };
    Ok(Some((frame, consumed)))
}

fn skip_line_breaks(data: &[u8]) -> usize {
    data.iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .unwrap_or(data.len())
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(CRLF.len()).position(|w| w == CRLF)
}

/// Streaming codec for use with `FramedRead`/`FramedWrite`.
///
/// Malformed header lines are logged and skipped; the connection keeps going.
/// An oversized payload declaration is returned as an error since the stream
/// cannot be resynchronized past it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match try_decode(&src[..]) {
                Ok(Some((frame, consumed))) => {
                    src.advance(consumed);
                    trace!(command = %frame.command, trid = ?frame.trid, "decoded frame");
                    return Ok(Some(frame));
                }
                Ok(None) => {
                    if src.len() > MAX_HEADER_LEN && find_crlf(&src[..]).is_none() {
                        warn!(buffered = src.len(), "discarding unterminated header");
                        src.clear();
                    }
                    return Ok(None);
                }
                Err(ProtocolError::MalformedFrame { reason }) => {
                    warn!(%reason, "dropping malformed frame");
                    match find_crlf(&src[..]) {
                        Some(pos) => src.advance(pos + CRLF.len()),
                        None => src.clear(),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.payload.as_ref().map_or(0, Bytes::len);
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let bytes = encode(&frame);
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: &Frame) -> String {
        format!("{:?}", String::from_utf8_lossy(&encode(frame)))
    }

    #[test]
    fn encode_request() {
        let frame = Frame::new("USR")
            .with_trid(3)
            .with_params(["SSO", "I", "bob@example.com"]);
        insta::assert_snapshot!(wire(&frame), @r#""USR 3 SSO I bob@example.com\r\n""#);
    }

    #[test]
    fn encode_message_appends_flag_and_length() {
        let frame = Frame::message(AckMode::Acknowledged, "hello").with_trid(7);
        insta::assert_snapshot!(wire(&frame), @r#""MSG 7 A 5\r\nhello""#);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::message(AckMode::Unacknowledged, "MIME-Version: 1.0\r\n\r\nhi")
            .with_trid(12);
        let bytes = encode(&frame);
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn payload_length_is_authoritative() {
        let body = b"line one\r\n\r\nMSG 9 A 3\r\nxyz\r\n";
        let frame = Frame::message(AckMode::Data, body.to_vec()).with_trid(1);
        let mut bytes = encode(&frame);
        bytes.extend_from_slice(b"PNG\r\n");

        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded.payload_bytes(), body);
        let (next, _) = decode(&bytes[consumed..]).unwrap();
        assert_eq!(next.command, "PNG");
    }

    #[test]
    fn server_message_without_trid() {
        let (frame, _) = decode(b"MSG bob@example.com Bob 2\r\nhi").unwrap();
        assert_eq!(frame.trid, None);
        assert_eq!(frame.params, vec!["bob@example.com", "Bob"]);
        assert_eq!(frame.payload_bytes(), b"hi");
    }

    #[test]
    fn lone_numeric_token_is_length() {
        let (frame, _) = decode(b"MSG 2\r\nhi").unwrap();
        assert_eq!(frame.trid, None);
        assert!(frame.params.is_empty());
        assert_eq!(frame.payload_bytes(), b"hi");
    }

    #[test]
    fn notification_trid_rule() {
        let (frame, _) = decode(b"RNG 11752013 10.0.0.1:1863 CKI 849102 bob@example.com Bob\r\n").unwrap();
        assert_eq!(frame.trid, None);
        assert_eq!(frame.param(0), Some("11752013"));
    }

    #[test]
    fn reply_without_payload_keeps_status() {
        let (frame, _) = decode(b"ADL 6 OK\r\n").unwrap();
        assert_eq!(frame.trid, Some(6));
        assert_eq!(frame.params, vec!["OK"]);
        assert!(frame.payload.is_none());
    }

    #[test]
    fn error_frame() {
        let (frame, _) = decode(b"911 4\r\n").unwrap();
        assert_eq!(frame.trid, Some(4));
        assert_eq!(frame.error_code(), Some(911));
        assert_eq!(Frame::new("USR").error_code(), None);
    }

    #[test]
    fn stray_line_breaks_are_consumed() {
        let (frame, consumed) = decode(b"\r\n\r\nOUT\r\n").unwrap();
        assert_eq!(frame.command, "OUT");
        assert_eq!(consumed, 9);
    }

    #[test]
    fn decode_without_crlf() {
        assert!(matches!(
            decode(b"VER 1 MSNP18"),
            Err(ProtocolError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn decode_incomplete_payload() {
        assert!(matches!(
            decode(b"MSG 1 A 100\r\nshort"),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert!(try_decode(b"MSG 1 A 100\r\nshort").unwrap().is_none());
    }

    #[test]
    fn decode_missing_trid() {
        assert!(matches!(
            decode(b"USR OK\r\n"),
            Err(ProtocolError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn message_too_large() {
        let header = format!("MSG 1 A {}\r\n", MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(
            decode(header.as_bytes()),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn display_is_header_line() {
        let frame = Frame::message(AckMode::None, "abc").with_trid(2);
        assert_eq!(frame.to_string(), "MSG 2 N 3");
    }

    #[test]
    fn codec_handles_split_input() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"MSG 1 A 5\r\nhe"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lloCHG 2 NLN 0\r\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload_bytes(), b"hello");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, "CHG");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_skips_malformed_lines() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"USR nope\r\nQNG 50\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, "QNG");
        assert_eq!(frame.params, vec!["50"]);
    }

    #[test]
    fn codec_encode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new("PNG"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PNG\r\n");
    }

    #[test]
    fn ack_flags() {
        for mode in [AckMode::None, AckMode::Unacknowledged, AckMode::Acknowledged, AckMode::Data] {
            assert_eq!(AckMode::from_flag(mode.flag()), Some(mode));
        }
        assert_eq!(AckMode::from_flag("X"), None);
    }
}
