//! MIME-style message bodies carried by `MSG` frames.
//!
//! A body is a block of `Name: value` header lines, a blank line, then the
//! content. The `Content-Type` header says what the content is; P2P messages
//! carry a complete inner [`Frame`] as their content, which is why the body is
//! a [`Payload`] rather than plain bytes.

use bytes::{BufMut, Bytes, BytesMut};
use msnp_core::ContentDescriptor;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::{Frame, decode, encode};

pub const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
pub const CONTROL: &str = "text/x-msmsgscontrol";
pub const DATACAST: &str = "text/x-msnmsgr-datacast";
pub const EMOTICON: &str = "text/x-mms-emoticon";
pub const P2P: &str = "application/x-msnmsgrp2p";

/// Datacast id of a nudge.
pub const NUDGE_ID: u32 = 1;

/// Default text format: Segoe UI, black, no effects.
pub const DEFAULT_FORMAT: &str = "FN=Segoe%20UI; EF=; CO=0; CS=1; PF=0";

/// Message content: either raw bytes or a nested frame.
#[derive(Debug, Clone)]
pub enum Payload {
    Opaque(Bytes),
    Nested(Box<Frame>),
}

impl Payload {
    /// Returns the nested frame, decoding opaque bytes on demand.
    pub fn nested(&self) -> ProtocolResult<Frame> {
        match self {
            Self::Nested(frame) => Ok((**frame).clone()),
            Self::Opaque(bytes) => {
                let (frame, consumed) = decode(bytes)?;
                if consumed != bytes.len() {
                    return Err(ProtocolError::invalid_body(format!(
                        "{} trailing bytes after nested frame",
                        bytes.len() - consumed
                    )));
                }
                Ok(frame)
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Opaque(bytes) => bytes.clone(),
            Self::Nested(frame) => Bytes::from(encode(frame)),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Payload {}

/// A MIME-style message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeMessage {
    headers: Vec<(String, String)>,
    pub body: Payload,
}

impl MimeMessage {
    pub fn new(content_type: &str, body: Payload) -> Self {
        Self {
            headers: vec![
                ("MIME-Version".to_string(), "1.0".to_string()),
                ("Content-Type".to_string(), content_type.to_string()),
            ],
            body,
        }
    }

    /// A plain text message; `format` defaults to [`DEFAULT_FORMAT`].
    pub fn text(text: &str, format: Option<&str>) -> Self {
        Self::new(TEXT_PLAIN, Payload::Opaque(Bytes::copy_from_slice(text.as_bytes())))
            .with_header("X-MMS-IM-Format", format.unwrap_or(DEFAULT_FORMAT))
    }

    pub fn typing(account: &str) -> Self {
        Self::new(CONTROL, Payload::Opaque(Bytes::new())).with_header("TypingUser", account)
    }

    pub fn nudge() -> Self {
        Self::new(
            DATACAST,
            Payload::Opaque(Bytes::from(format!("ID: {NUDGE_ID}\r\n\r\n"))),
        )
    }

    /// Custom emoticon definitions: `shortcut<TAB>descriptor<TAB>` pairs.
    pub fn emoticons(definitions: &[(String, ContentDescriptor)]) -> Self {
        let mut body = String::new();
        for (shortcut, descriptor) in definitions {
            body.push_str(shortcut);
            body.push('\t');
            body.push_str(&descriptor.to_xml());
            body.push('\t');
        }
        Self::new(EMOTICON, Payload::Opaque(Bytes::from(body)))
    }

    /// Wraps a P2P inner frame addressed to `destination`.
    pub fn p2p(destination: &str, frame: Frame) -> Self {
        Self::new(P2P, Payload::Nested(Box::new(frame))).with_header("P2P-Dest", destination)
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Sets a header, replacing an existing one with the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Media type without parameters, lower-cased.
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
    }

    pub fn to_bytes(&self) -> Bytes {
        let body = self.body.to_bytes();
        let mut buf = BytesMut::with_capacity(128 + body.len());
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Parses a message body. The content is kept opaque.
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let split = data
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| ProtocolError::invalid_body("no blank line after headers"))?;
        let head = std::str::from_utf8(&data[..split])
            .map_err(|_| ProtocolError::invalid_body("headers are not valid UTF-8"))?;

        let mut headers = Vec::new();
        for line in head.split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::invalid_body(format!("bad header line {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            headers,
            body: Payload::Opaque(Bytes::copy_from_slice(&data[split + 4..])),
        })
    }

    /// Interprets the message according to its content type.
    pub fn content(&self) -> ProtocolResult<ImContent> {
        let content_type = self.content_type().unwrap_or_default();
        match content_type.as_str() {
            "text/plain" => {
                let bytes = self.body.to_bytes();
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| ProtocolError::invalid_body("text is not valid UTF-8"))?;
                Ok(ImContent::Text {
                    text,
                    format: self.header("X-MMS-IM-Format").map(str::to_string),
                })
            }
            CONTROL => match self.header("TypingUser") {
                Some(user) => Ok(ImContent::Typing {
                    account: user.to_string(),
                }),
                None => Ok(ImContent::Other { content_type }),
            },
            DATACAST => {
                let body = self.body.to_bytes();
                let id = String::from_utf8_lossy(&body)
                    .lines()
                    .find_map(|l| l.strip_prefix("ID:").map(|v| v.trim().parse::<u32>()))
                    .and_then(Result::ok);
                match id {
                    Some(NUDGE_ID) => Ok(ImContent::Nudge),
                    Some(id) => Ok(ImContent::Datacast { id }),
                    None => Err(ProtocolError::invalid_body("datacast without ID")),
                }
            }
            EMOTICON => {
                let body = self.body.to_bytes();
                let text = String::from_utf8_lossy(&body);
                let fields: Vec<&str> = text.split('\t').collect();
                let mut definitions = Vec::new();
                for pair in fields.chunks(2) {
                    if let [shortcut, xml] = pair {
                        if !shortcut.is_empty() {
                            definitions
                                .push((shortcut.to_string(), ContentDescriptor::parse(xml)?));
                        }
                    }
                }
                Ok(ImContent::Emoticons(definitions))
            }
            P2P => Ok(ImContent::P2p {
                destination: self.header("P2P-Dest").unwrap_or_default().to_string(),
                frame: self.body.nested()?,
            }),
            _ => Ok(ImContent::Other { content_type }),
        }
    }
}

/// Typed view of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImContent {
    Text { text: String, format: Option<String> },
    Typing { account: String },
    Nudge,
    Datacast { id: u32 },
    Emoticons(Vec<(String, ContentDescriptor)>),
    P2p { destination: String, frame: Frame },
    /// Anything else (profiles, initial emails, ...), ignored by the engine.
    Other { content_type: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::ObjectKind;

    fn roundtrip(message: &MimeMessage) -> MimeMessage {
        MimeMessage::parse(&message.to_bytes()).unwrap()
    }

    #[test]
    fn text_message_wire_form() {
        let message = MimeMessage::text("hi there", Some("FN=Arial"));
        let wire = String::from_utf8(message.to_bytes().to_vec()).unwrap();
        insta::assert_snapshot!(format!("{wire:?}"), @r#""MIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\nX-MMS-IM-Format: FN=Arial\r\n\r\nhi there""#);
    }

    #[test]
    fn text_roundtrip() {
        let parsed = roundtrip(&MimeMessage::text("line 1\r\n\r\nline 2", None));
        assert_eq!(parsed.content_type().as_deref(), Some("text/plain"));
        assert_eq!(
            parsed.content().unwrap(),
            ImContent::Text {
                text: "line 1\r\n\r\nline 2".to_string(),
                format: Some(DEFAULT_FORMAT.to_string()),
            }
        );
    }

    #[test]
    fn typing_and_nudge() {
        assert_eq!(
            roundtrip(&MimeMessage::typing("bob@example.com")).content().unwrap(),
            ImContent::Typing {
                account: "bob@example.com".to_string()
            }
        );
        assert_eq!(roundtrip(&MimeMessage::nudge()).content().unwrap(), ImContent::Nudge);
    }

    #[test]
    fn other_datacast_ids() {
        let message = MimeMessage::new(DATACAST, Payload::Opaque(Bytes::from_static(b"ID: 4\r\n\r\n")));
        assert_eq!(roundtrip(&message).content().unwrap(), ImContent::Datacast { id: 4 });
    }

    #[test]
    fn emoticon_definitions() {
        let smile = ContentDescriptor::for_content("bob@example.com", ObjectKind::Emoticon, ":cat:", b"gif");
        let message = MimeMessage::emoticons(&[(":cat:".to_string(), smile.clone())]);
        match roundtrip(&message).content().unwrap() {
            ImContent::Emoticons(defs) => {
                assert_eq!(defs.len(), 1);
                assert_eq!(defs[0].0, ":cat:");
                assert_eq!(defs[0].1, smile);
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn p2p_body_is_nested_lazily() {
        let inner = Frame::new("DAT")
            .with_params(["7", "0", "4"])
            .with_payload(Bytes::from_static(b"\r\n\r\n"));
        let message = MimeMessage::p2p("bob@example.com", inner.clone());
        let parsed = roundtrip(&message);

        assert!(matches!(parsed.body, Payload::Opaque(_)));
        assert_eq!(parsed.body.nested().unwrap(), inner);
        assert_eq!(parsed.header("p2p-dest"), Some("bob@example.com"));
        assert_eq!(parsed, message);
    }

    #[test]
    fn unknown_content_type() {
        let message = MimeMessage::new("text/x-msmsgsprofile; charset=UTF-8", Payload::Opaque(Bytes::new()));
        assert_eq!(
            message.content().unwrap(),
            ImContent::Other {
                content_type: "text/x-msmsgsprofile".to_string()
            }
        );
    }

    #[test]
    fn parse_requires_blank_line() {
        assert!(matches!(
            MimeMessage::parse(b"Content-Type: text/plain\r\n"),
            Err(ProtocolError::InvalidBody(_))
        ));
    }

    #[test]
    fn set_header_replaces() {
        let mut message = MimeMessage::typing("a@example.com");
        message.set_header("typinguser", "b@example.com");
        assert_eq!(message.header("TypingUser"), Some("b@example.com"));
        assert_eq!(message.headers().count(), 3);
    }
}
