//! Conversation handles.

use std::fmt;
use std::sync::Arc;

use msnp_core::ContentDescriptor;
use msnp_protocol::{AckMode, Frame, MimeMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::switchboard::SwitchboardLayer;

/// Identifier of a logical conversation.
pub type ConversationId = u64;

/// Who started a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    /// Opened by the user.
    Local,
    /// Opened by a remote invitation.
    Remote,
    /// Grew out of a switchboard opened for a transfer.
    P2p,
}

/// Handle to an open conversation.
///
/// Handles are cheap to clone. Once the conversation has ended every send
/// fails with [`EngineError::ConversationEnded`].
#[derive(Clone)]
pub struct Conversation {
    id: ConversationId,
    layer: Arc<SwitchboardLayer>,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation").field("id", &self.id).finish()
    }
}

impl Conversation {
    pub(crate) fn new(id: ConversationId, layer: Arc<SwitchboardLayer>) -> Self {
        Self { id, layer }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Participants remembered by the conversation, whether joined right
    /// now or waiting to be re-invited.
    pub fn participants(&self) -> Vec<String> {
        self.layer.participants(self.id)
    }

    pub fn initiator(&self) -> Option<Initiator> {
        self.layer.initiator(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.layer.is_open(self.id)
    }

    /// Sends a text message and waits for the switchboard to confirm
    /// delivery.
    ///
    /// Messages from one conversation go out in call order. If no
    /// switchboard is bound, one is requested and the remembered
    /// participants are invited again; [`EngineError::NoRoute`] is returned
    /// if that takes longer than the binding timeout.
    #[tracing::instrument(skip(self, text), fields(conversation = self.id))]
    pub async fn send_text(&self, text: &str) -> EngineResult<()> {
        self.send_formatted(text, None).await
    }

    /// Like [`send_text`](Self::send_text) with an explicit `X-MMS-IM-Format`.
    pub async fn send_formatted(&self, text: &str, format: Option<&str>) -> EngineResult<()> {
        let lock = self.layer.send_lock(self.id)?;
        let _order = lock.lock().await;
        let transport = self.layer.wait_for_route(self.id).await?;

        let body = MimeMessage::text(text, format).to_bytes();
        let reply = transport
            .request_with(Frame::message(AckMode::Acknowledged, body), |f| {
                f.is("ACK") || f.is("NAK")
            })
            .await?;
        if reply.is("NAK") {
            debug!(conversation = self.id, "Message not delivered");
            return Err(EngineError::Undelivered);
        }
        trace!(conversation = self.id, trid = ?reply.trid, "Message delivered");
        Ok(())
    }

    /// Sends a typing notification. Routed like text, but not acknowledged.
    pub async fn send_typing(&self) -> EngineResult<()> {
        self.send_unacknowledged(MimeMessage::typing(&self.layer.account()))
            .await
    }

    pub async fn send_nudge(&self) -> EngineResult<()> {
        self.send_unacknowledged(MimeMessage::nudge()).await
    }

    /// Announces custom emoticons used in the next messages.
    pub async fn send_emoticon_definitions(
        &self,
        definitions: &[(String, ContentDescriptor)],
    ) -> EngineResult<()> {
        if definitions.is_empty() {
            return Ok(());
        }
        self.send_unacknowledged(MimeMessage::emoticons(definitions))
            .await
    }

    async fn send_unacknowledged(&self, message: MimeMessage) -> EngineResult<()> {
        let lock = self.layer.send_lock(self.id)?;
        let _order = lock.lock().await;
        let transport = self.layer.wait_for_route(self.id).await?;
        transport.send(Frame::message(AckMode::Unacknowledged, message.to_bytes()))?;
        Ok(())
    }

    /// Invites another contact into the conversation.
    pub async fn invite(&self, account: &str) -> EngineResult<()> {
        self.layer.invite(self.id, account).await
    }

    /// Leaves the conversation. Calling it again does nothing.
    pub fn close(&self) {
        self.layer.close_conversation(self.id);
    }
}
