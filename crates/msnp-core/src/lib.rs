//! Core types: contacts, presence, content descriptors, tracing setup.
//!
//! Everything in this crate is plain data shared by the wire codec, the
//! session engine and the command-line client. Nothing here touches a socket.

pub mod contact;
pub mod object;
pub mod tracing;

pub use contact::{ClientType, Contact, ContactList, Group, ListMembership, PresenceStatus};
pub use object::{ContentDescriptor, ObjectError, ObjectHash, ObjectKind};
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
