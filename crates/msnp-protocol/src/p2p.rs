//! Peer-to-peer inner frames.
//!
//! P2P traffic rides inside `application/x-msnmsgrp2p` message bodies sent
//! with ack flag `D`. Each body is one inner frame without a trid:
//!
//! ```text
//! INV sid descriptor          offer to push an object
//! REQ sid descriptor          ask the owner to push an object
//! ACC sid offset              accepted, data starts at offset
//! DEC sid                     declined
//! DAT sid offset total LEN    one chunk, LEN raw bytes follow
//! DAK sid offset              every byte below offset received
//! RSM sid offset              sender resumes after a route change
//! CLS sid                     complete
//! ABT sid reason              aborted
//! ```

use std::fmt;

use bytes::Bytes;
use msnp_core::ContentDescriptor;

use crate::error::{ProtocolError, ProtocolResult};
use crate::framing::Frame;

/// Identifier of a transfer session, chosen by the side that opens it.
pub type SessionId = u32;

/// A typed P2P inner frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pMessage {
    Invite {
        session: SessionId,
        descriptor: ContentDescriptor,
    },
    Request {
        session: SessionId,
        descriptor: ContentDescriptor,
    },
    Accept {
        session: SessionId,
        offset: u64,
    },
    Decline {
        session: SessionId,
    },
    Data {
        session: SessionId,
        offset: u64,
        total: u64,
        data: Bytes,
    },
    Ack {
        session: SessionId,
        offset: u64,
    },
    Resume {
        session: SessionId,
        offset: u64,
    },
    Close {
        session: SessionId,
    },
    Abort {
        session: SessionId,
        reason: String,
    },
}

impl P2pMessage {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Invite { session, .. }
            | Self::Request { session, .. }
            | Self::Accept { session, .. }
            | Self::Decline { session }
            | Self::Data { session, .. }
            | Self::Ack { session, .. }
            | Self::Resume { session, .. }
            | Self::Close { session }
            | Self::Abort { session, .. } => *session,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "INV",
            Self::Request { .. } => "REQ",
            Self::Accept { .. } => "ACC",
            Self::Decline { .. } => "DEC",
            Self::Data { .. } => "DAT",
            Self::Ack { .. } => "DAK",
            Self::Resume { .. } => "RSM",
            Self::Close { .. } => "CLS",
            Self::Abort { .. } => "ABT",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let frame = Frame::new(self.command()).with_param(self.session().to_string());
        match self {
            Self::Invite { descriptor, .. } | Self::Request { descriptor, .. } => {
                frame.with_param(descriptor.to_param())
            }
            Self::Accept { offset, .. } | Self::Ack { offset, .. } | Self::Resume { offset, .. } => {
                frame.with_param(offset.to_string())
            }
            Self::Decline { .. } | Self::Close { .. } => frame,
            Self::Data {
                offset,
                total,
                data,
                ..
            } => frame
                .with_params([offset.to_string(), total.to_string()])
                .with_payload(data.clone()),
            Self::Abort { reason, .. } => frame.with_param(urlencoding::encode(reason).into_owned()),
        }
    }

    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        let session = number::<SessionId>(frame, 0, "session id")?;
        let message = match frame.command.as_str() {
            "INV" => Self::Invite {
                session,
                descriptor: ContentDescriptor::from_param(param(frame, 1, "descriptor")?)?,
            },
            "REQ" => Self::Request {
                session,
                descriptor: ContentDescriptor::from_param(param(frame, 1, "descriptor")?)?,
            },
            "ACC" => Self::Accept {
                session,
                offset: number(frame, 1, "offset")?,
            },
            "DEC" => Self::Decline { session },
            "DAT" => Self::Data {
                session,
                offset: number(frame, 1, "offset")?,
                total: number(frame, 2, "total")?,
                data: frame.payload.clone().unwrap_or_default(),
            },
            "DAK" => Self::Ack {
                session,
                offset: number(frame, 1, "offset")?,
            },
            "RSM" => Self::Resume {
                session,
                offset: number(frame, 1, "offset")?,
            },
            "CLS" => Self::Close { session },
            "ABT" => Self::Abort {
                session,
                reason: frame
                    .param(1)
                    .map(|r| urlencoding::decode(r).map(|d| d.into_owned()).unwrap_or_else(|_| r.to_string()))
                    .unwrap_or_default(),
            },
            other => {
                return Err(ProtocolError::invalid_body(format!(
                    "unknown P2P command {other}"
                )));
            }
        };
        Ok(message)
    }
}

impl fmt::Display for P2pMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data {
                session,
                offset,
                total,
                data,
            } => write!(f, "DAT {session} {offset}+{}/{total}", data.len()),
            other => write!(f, "{}", other.to_frame()),
        }
    }
}

fn param<'a>(frame: &'a Frame, index: usize, what: &str) -> ProtocolResult<&'a str> {
    frame
        .param(index)
        .ok_or_else(|| ProtocolError::invalid_body(format!("{} without {what}", frame.command)))
}

fn number<T: std::str::FromStr>(frame: &Frame, index: usize, what: &str) -> ProtocolResult<T> {
    let value = param(frame, index, what)?;
    value.parse().map_err(|_| {
        ProtocolError::invalid_body(format!("{} has invalid {what} {value:?}", frame.command))
    })
}
