//! Wire formats for the msnp messenger protocol.
//!
//! # Protocol Overview
//!
//! Client and servers exchange text frames terminated by CRLF. Some commands
//! end their header with a payload length, followed by that many raw bytes:
//!
//! ```text
//! VER 1 MSNP18 CVR0\r\n
//! MSG 5 A 70\r\n<70 bytes of MIME body>
//! ```
//!
//! Which token is the transaction id and which commands carry payloads is
//! decided per command by [`commands::spec_for`]. `MSG` payloads are
//! MIME-style bodies ([`MimeMessage`]); P2P bodies nest a whole inner frame
//! ([`P2pMessage`]).
//!
//! # Example
//!
//! ```rust
//! use msnp_protocol::{AckMode, Frame, MimeMessage, decode, encode};
//!
//! let body = MimeMessage::text("hello", None).to_bytes();
//! let frame = Frame::message(AckMode::Acknowledged, body).with_trid(5);
//! let bytes = encode(&frame);
//! let (decoded, consumed) = decode(&bytes).unwrap();
//! assert_eq!(decoded, frame);
//! assert_eq!(consumed, bytes.len());
//! ```

pub mod commands;
mod error;
mod framing;
pub mod mime;
pub mod p2p;

pub use commands::{CommandSpec, TridRule, spec_for};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{AckMode, Frame, FrameCodec, decode, encode, try_decode};
pub use mime::{ImContent, MimeMessage, Payload};
pub use p2p::{P2pMessage, SessionId};

/// Protocol version negotiated with the nameserver.
pub const PROTOCOL_VERSION: &str = "MSNP18";

/// Maximum payload size (1 MB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
