//! Session engine for the msnp messenger protocol.
//!
//! This crate drives a messenger account over the network:
//! - Framed transports with transaction-id correlation
//! - The nameserver session: login, contact list, presence
//! - Switchboards and the conversations bound to them
//! - Peer-to-peer object transfers that survive switchboard changes
//! - A hash-addressed object cache
//!
//! Start with [`Messenger`].

mod cache;
mod config;
mod conversation;
mod error;
mod events;
mod messenger;
mod nameserver;
mod p2p;
mod switchboard;
mod sync;
mod transport;

pub use cache::{CacheEntry, ObjectCache};
pub use config::{CachePolicy, DEFAULT_CAPABILITIES, DEFAULT_NAMESERVER, EngineConfig};
pub use conversation::{Conversation, ConversationId, Initiator};
pub use error::{EngineError, EngineResult, TicketError};
pub use events::{MessengerEvent, TransferOutcome};
pub use messenger::Messenger;
pub use nameserver::{NsState, StaticTicket, TicketFuture, TicketProvider};
pub use p2p::{Reassembler, TransferInfo, TransferRole, TransferState};
pub use switchboard::SwitchboardId;
pub use transport::{CloseReason, ConnectionKind, FrameHandler, Transport, TransportConfig};
