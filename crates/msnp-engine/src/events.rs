//! Events delivered to the consumer of the engine.

use bytes::Bytes;
use msnp_core::{ContentDescriptor, ListMembership, PresenceStatus};
use msnp_protocol::SessionId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::conversation::{ConversationId, Initiator};

/// How a transfer session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Declined,
    Aborted(String),
}

/// Everything the engine reports upward.
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// Login, contact sync and initial presence are done.
    SignedIn { account: String },
    /// The server ended the session (`OUT`).
    SignedOut { reason: Option<String> },
    /// The nameserver connection is gone.
    Disconnected { reason: String },
    ContactListSynced { contacts: usize, groups: usize },
    PresenceChanged {
        account: String,
        status: PresenceStatus,
        display_name: String,
    },
    PersonalMessageChanged { account: String, message: String },
    ContactAdded { account: String, list: ListMembership },
    ContactRemoved { account: String, list: ListMembership },
    ConversationCreated {
        conversation: ConversationId,
        participants: Vec<String>,
        initiator: Initiator,
    },
    ContactJoined {
        conversation: ConversationId,
        account: String,
    },
    ContactLeft {
        conversation: ConversationId,
        account: String,
    },
    TextMessageReceived {
        conversation: ConversationId,
        from: String,
        text: String,
        format: Option<String>,
    },
    NudgeReceived {
        conversation: ConversationId,
        from: String,
    },
    TypingReceived {
        conversation: ConversationId,
        from: String,
    },
    EmoticonDefinitionsReceived {
        conversation: ConversationId,
        from: String,
        definitions: Vec<(String, ContentDescriptor)>,
    },
    /// An offer that needs [`Messenger::accept_transfer`](crate::Messenger::accept_transfer)
    /// or [`Messenger::decline_transfer`](crate::Messenger::decline_transfer).
    TransferInvitationReceived {
        session: SessionId,
        from: String,
        descriptor: ContentDescriptor,
    },
    TransferCompleted {
        session: SessionId,
        descriptor: ContentDescriptor,
        data: Bytes,
    },
    TransferClosed {
        session: SessionId,
        outcome: TransferOutcome,
    },
    SessionClosed { conversation: ConversationId },
    /// A numeric error nobody was waiting for.
    ServerError { code: u16 },
}

/// Sending half of the event channel, shared by every layer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<MessengerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits an event. Events are dropped once the receiver is gone.
    pub fn emit(&self, event: MessengerEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!(event = ?e.0, "event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(MessengerEvent::SessionClosed { conversation: 1 });
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(MessengerEvent::ServerError { code: 500 });
        sink.emit(MessengerEvent::SessionClosed { conversation: 3 });

        assert!(matches!(rx.recv().await, Some(MessengerEvent::ServerError { code: 500 })));
        assert!(matches!(
            rx.recv().await,
            Some(MessengerEvent::SessionClosed { conversation: 3 })
        ));
    }
}
