//! Transfer session state.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use msnp_core::ContentDescriptor;
use msnp_protocol::SessionId;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::reassembly::Reassembler;
use crate::error::{EngineError, EngineResult};
use crate::switchboard::SwitchboardId;

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    InvitationSent,
    InvitationReceived,
    Accepted,
    Transferring,
    Closed,
    Declined,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Declined | Self::Aborted)
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_move_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Idle, InvitationSent | InvitationReceived) => true,
            (InvitationSent | InvitationReceived, Accepted) => true,
            (Accepted, Transferring) => true,
            // A cache hit or an already complete offset skips the data phase.
            (InvitationReceived | Accepted | Transferring, Closed) => true,
            (InvitationSent | InvitationReceived, Declined) => true,
            (from, Aborted) => from != Closed && !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::InvitationSent => "invitation-sent",
            Self::InvitationReceived => "invitation-received",
            Self::Accepted => "accepted",
            Self::Transferring => "transferring",
            Self::Closed => "closed",
            Self::Declined => "declined",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Which side of the transfer we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Snapshot of a transfer for display.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub session: SessionId,
    pub peer: String,
    pub role: TransferRole,
    pub state: TransferState,
    pub object: String,
    pub size: u64,
    /// Bytes acknowledged (sender) or received (receiver).
    pub progress: u64,
    pub started_at: DateTime<Utc>,
}

pub(crate) struct TransferSession {
    pub id: SessionId,
    pub peer: String,
    pub role: TransferRole,
    pub state: TransferState,
    pub descriptor: ContentDescriptor,
    /// Object bytes, sender side only.
    pub data: Bytes,
    /// Sender: next offset to send.
    pub sent: u64,
    /// Sender: every byte below this was acknowledged.
    pub acked: u64,
    /// Sender: waiting for the receiver's offset after a route change.
    pub resyncing: bool,
    pub reassembler: Option<Reassembler>,
    /// Pull requests wait here for the bytes.
    pub completion: Option<oneshot::Sender<EngineResult<Bytes>>>,
    pub route: Option<SwitchboardId>,
    pub abort_reason: Option<String>,
    /// Bumped on every route change, so stale timers can tell.
    pub epoch: u64,
    /// Last time the peer was heard from.
    pub last_activity: Instant,
    pub started_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn new(
        id: SessionId,
        peer: &str,
        role: TransferRole,
        descriptor: ContentDescriptor,
        data: Bytes,
    ) -> Self {
        Self {
            id,
            peer: peer.to_string(),
            role,
            state: TransferState::Idle,
            descriptor,
            data,
            sent: 0,
            acked: 0,
            resyncing: false,
            reassembler: None,
            completion: None,
            route: None,
            abort_reason: None,
            epoch: 0,
            last_activity: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn total(&self) -> u64 {
        self.descriptor.size
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: TransferState) -> EngineResult<()> {
        if !self.state.can_move_to(next) {
            return Err(EngineError::invalid_state(format!(
                "transfer {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        tracing::trace!(session = self.id, from = %self.state, to = %next, "Transfer state change");
        self.state = next;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once every byte was acknowledged by the receiver.
    pub fn fully_acked(&self) -> bool {
        self.role == TransferRole::Sender && self.acked >= self.total()
    }

    /// Fails a pending pull, if any.
    pub fn fail(&mut self, error: EngineError) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Err(error));
        }
    }

    pub fn info(&self) -> TransferInfo {
        let progress = match self.role {
            TransferRole::Sender => self.acked,
            TransferRole::Receiver => self
                .reassembler
                .as_ref()
                .map(Reassembler::received)
                .unwrap_or(0),
        };
        TransferInfo {
            session: self.id,
            peer: self.peer.clone(),
            role: self.role,
            state: self.state,
            object: self.descriptor.friendly.clone(),
            size: self.total(),
            progress,
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msnp_core::ObjectKind;

    fn session() -> TransferSession {
        let descriptor = ContentDescriptor::for_content("bob@example.com", ObjectKind::Avatar, "pic", b"data");
        TransferSession::new(7, "bob@example.com", TransferRole::Sender, descriptor, Bytes::from_static(b"data"))
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session();
        s.transition(TransferState::InvitationSent).unwrap();
        s.transition(TransferState::Accepted).unwrap();
        s.transition(TransferState::Transferring).unwrap();
        s.transition(TransferState::Closed).unwrap();
        assert!(s.state.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = session();
        s.transition(TransferState::InvitationSent).unwrap();
        s.transition(TransferState::Declined).unwrap();
        assert!(s.transition(TransferState::Aborted).is_err());
        assert!(s.transition(TransferState::Accepted).is_err());
    }

    #[test]
    fn abort_from_any_live_state() {
        for state in [
            TransferState::Idle,
            TransferState::InvitationSent,
            TransferState::InvitationReceived,
            TransferState::Accepted,
            TransferState::Transferring,
        ] {
            assert!(state.can_move_to(TransferState::Aborted), "{state}");
        }
        assert!(!TransferState::Closed.can_move_to(TransferState::Aborted));
    }

    #[test]
    fn cannot_skip_acceptance() {
        assert!(!TransferState::InvitationSent.can_move_to(TransferState::Transferring));
        assert!(!TransferState::Idle.can_move_to(TransferState::Accepted));
    }

    #[tokio::test]
    async fn fail_resolves_pending_pull() {
        let mut s = session();
        let (tx, rx) = oneshot::channel();
        s.completion = Some(tx);
        s.fail(EngineError::aborted(7, "gone"));
        assert!(matches!(rx.await.unwrap(), Err(EngineError::TransferAborted { session: 7, .. })));
    }
}
