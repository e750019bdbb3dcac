//! Peer-to-peer object transfers.
//!
//! Transfers ride on switchboards as `application/x-msnmsgrp2p` messages.
//! A session is routed over the newest switchboard on which the peer is
//! joined; when that switchboard goes away mid-transfer the sender asks for
//! a new one and resumes from the last acknowledged offset with `RSM`.
//!
//! Lock order is sessions, then the switchboard registry. The switchboard
//! layer never calls back into this module while holding its own lock.

mod reassembly;
mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use msnp_core::ContentDescriptor;
use msnp_protocol::{AckMode, Frame, MimeMessage, P2pMessage, SessionId, mime};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub use reassembly::Reassembler;
pub use session::{TransferInfo, TransferRole, TransferState};
use session::TransferSession;

use crate::cache::ObjectCache;
use crate::config::{CachePolicy, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, MessengerEvent, TransferOutcome};
use crate::switchboard::{SwitchboardHook, SwitchboardId, SwitchboardLayer};
use crate::sync::lock;
use crate::transport::{CloseReason, FrameHandler, Transport};

/// Owns every transfer session.
pub struct P2pManager {
    me: Weak<P2pManager>,
    config: EngineConfig,
    cache: Arc<ObjectCache>,
    switchboards: Arc<SwitchboardLayer>,
    events: EventSink,
    sessions: Mutex<HashMap<SessionId, TransferSession>>,
    next_session: AtomicU32,
}

impl P2pManager {
    pub(crate) fn new(
        config: EngineConfig,
        cache: Arc<ObjectCache>,
        switchboards: Arc<SwitchboardLayer>,
        events: EventSink,
    ) -> Arc<Self> {
        let seed = Utc::now().timestamp_subsec_nanos() % 0x4000_0000 + 1;
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            cache,
            switchboards: switchboards.clone(),
            events,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU32::new(seed),
        });
        let hook: Weak<dyn SwitchboardHook> = manager.me.clone();
        switchboards.set_hook(hook);
        manager
    }

    fn next_id(&self, sessions: &HashMap<SessionId, TransferSession>) -> SessionId {
        loop {
            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Snapshot of every live transfer.
    pub fn transfers(&self) -> Vec<TransferInfo> {
        let mut transfers: Vec<_> = lock(&self.sessions).values().map(TransferSession::info).collect();
        transfers.sort_by_key(|t| t.session);
        transfers
    }

    /// Offers `data` to `account` (push). Progress is reported through
    /// [`MessengerEvent::TransferClosed`].
    #[tracing::instrument(skip(self, descriptor, data), fields(object = %descriptor.hash))]
    pub async fn send_object(
        &self,
        account: &str,
        descriptor: ContentDescriptor,
        data: Bytes,
    ) -> EngineResult<SessionId> {
        if !descriptor.matches(&data) {
            return Err(EngineError::HashMismatch);
        }
        self.wait_for_peer(account).await?;

        let id = {
            let mut sessions = lock(&self.sessions);
            let id = self.next_id(&sessions);
            let mut session = TransferSession::new(id, account, TransferRole::Sender, descriptor.clone(), data);
            session.transition(TransferState::InvitationSent)?;
            if !self.send_to(&mut session, P2pMessage::Invite { session: id, descriptor }) {
                return Err(EngineError::no_route(account));
            }
            sessions.insert(id, session);
            id
        };
        info!(session = id, peer = account, "Offered object");
        self.arm_invitation_timeout(id);
        self.watch_idle(id);
        Ok(id)
    }

    /// Fetches an object from its owner (pull), answering from the cache
    /// when possible.
    #[tracing::instrument(skip(self, descriptor), fields(object = %descriptor.hash))]
    pub async fn request_object(&self, account: &str, descriptor: ContentDescriptor) -> EngineResult<Bytes> {
        if let Some(data) = self.cache.get(&descriptor.hash) {
            debug!("Object served from cache");
            return Ok(data);
        }
        if descriptor.size > self.config.max_object_size {
            return Err(EngineError::invalid_state(format!(
                "object of {} bytes exceeds the limit",
                descriptor.size
            )));
        }
        self.wait_for_peer(account).await?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut sessions = lock(&self.sessions);
            let id = self.next_id(&sessions);
            let mut session =
                TransferSession::new(id, account, TransferRole::Receiver, descriptor.clone(), Bytes::new());
            session.transition(TransferState::InvitationSent)?;
            session.completion = Some(tx);
            if !self.send_to(&mut session, P2pMessage::Request { session: id, descriptor }) {
                return Err(EngineError::no_route(account));
            }
            sessions.insert(id, session);
            id
        };
        info!(session = id, peer = account, "Requested object");
        self.arm_invitation_timeout(id);
        self.watch_idle(id);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::aborted(id, "transfer dropped")),
        }
    }

    /// Accepts an invitation surfaced as `TransferInvitationReceived`.
    pub fn accept(&self, id: SessionId) -> EngineResult<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(&id)
            .ok_or(EngineError::UnknownSession { session: id })?;
        if session.role != TransferRole::Receiver || session.state != TransferState::InvitationReceived {
            return Err(EngineError::invalid_state(format!(
                "transfer {id} is {} and cannot be accepted",
                session.state
            )));
        }
        self.accept_session(session)?;
        if session.total() == 0 {
            if let Some(session) = sessions.remove(&id) {
                self.finish(session, Step::Complete);
            }
        }
        Ok(())
    }

    /// Declines an invitation surfaced as `TransferInvitationReceived`.
    pub fn decline(&self, id: SessionId) -> EngineResult<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get(&id)
            .ok_or(EngineError::UnknownSession { session: id })?;
        if session.state != TransferState::InvitationReceived {
            return Err(EngineError::invalid_state(format!(
                "transfer {id} is {} and cannot be declined",
                session.state
            )));
        }
        if let Some(mut session) = sessions.remove(&id) {
            self.send_to(&mut session, P2pMessage::Decline { session: id });
            self.close(session, TransferState::Declined, TransferOutcome::Declined);
        }
        Ok(())
    }

    /// Aborts every transfer, e.g. when the nameserver session ends.
    pub(crate) fn abort_all(&self, reason: &str) {
        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason.to_string()));
        }
    }

    fn accept_session(&self, session: &mut TransferSession) -> EngineResult<()> {
        session.transition(TransferState::Accepted)?;
        session.touch();
        session.reassembler = Some(Reassembler::new(session.id, session.total()));
        let id = session.id;
        if !self.send_to(session, P2pMessage::Accept { session: id, offset: 0 }) {
            debug!(session = id, "No route for acceptance, waiting for the sender");
        }
        debug!(session = id, "Accepted transfer");
        Ok(())
    }

    async fn wait_for_peer(&self, account: &str) -> EngineResult<()> {
        let mut changes = self.switchboards.subscribe_changes();
        if self.switchboards.route_to(account).is_some() {
            return Ok(());
        }
        if !self.switchboards.is_online() {
            return Err(EngineError::NotSignedIn);
        }
        self.switchboards.request_p2p_route(account);
        let deadline = tokio::time::Instant::now() + self.config.binding_timeout;
        loop {
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {
                    if self.switchboards.route_to(account).is_some() {
                        return Ok(());
                    }
                }
                Ok(Err(_)) => return Err(EngineError::ConnectionClosed),
                Err(_) => return Err(EngineError::no_route(account)),
            }
        }
    }

    fn arm_invitation_timeout(&self, id: SessionId) {
        let manager = self.me.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = manager.upgrade() else { return };
            let mut sessions = lock(&manager.sessions);
            if sessions.get(&id).is_some_and(|s| s.state == TransferState::InvitationSent) {
                if let Some(mut session) = sessions.remove(&id) {
                    warn!(session = id, "Invitation was not answered");
                    let reason = "invitation timed out".to_string();
                    manager.send_to(&mut session, P2pMessage::Abort { session: id, reason: reason.clone() });
                    manager.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
                }
            }
        });
    }

    /// Gives up on a session once the peer has been silent for
    /// `transfer_idle_timeout`. Invitations waiting on the consumer are
    /// left alone.
    fn watch_idle(&self, id: SessionId) {
        let manager = self.me.clone();
        let idle = self.config.transfer_idle_timeout;
        tokio::spawn(async move {
            let mut deadline = Instant::now() + idle;
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(strong) = manager.upgrade() else { return };
                match strong.check_idle(id, idle) {
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        });
    }

    /// Closes `id` if it went idle; otherwise returns when to look again.
    fn check_idle(&self, id: SessionId, idle: Duration) -> Option<Instant> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        let session = sessions.get(&id)?;
        if session.state == TransferState::InvitationReceived {
            return Some(now + idle);
        }
        let due = session.last_activity + idle;
        if due > now {
            return Some(due);
        }
        let mut session = sessions.remove(&id)?;
        if session.state == TransferState::Transferring && session.fully_acked() {
            info!(session = id, "Peer never closed a fully acknowledged transfer");
            self.close(session, TransferState::Closed, TransferOutcome::Completed);
        } else {
            warn!(session = id, state = %session.state, "Transfer went idle");
            let reason = "transfer idle".to_string();
            self.send_to(&mut session, P2pMessage::Abort { session: id, reason: reason.clone() });
            self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
        }
        None
    }

    /// Sends one inner frame over the session's current route.
    fn send_to(&self, session: &mut TransferSession, message: P2pMessage) -> bool {
        let Some((route, transport)) = self.switchboards.route_to(&session.peer) else {
            return false;
        };
        if session.route != Some(route) {
            session.route = Some(route);
            session.epoch += 1;
        }
        self.send_message(&transport, &session.peer, &message)
    }

    fn send_message(&self, transport: &Transport, peer: &str, message: &P2pMessage) -> bool {
        trace!(peer, "P2P >> {}", message);
        let body = MimeMessage::p2p(peer, message.to_frame()).to_bytes();
        transport.send(Frame::message(AckMode::Data, body)).is_ok()
    }

    /// Finishes a session removed from the table.
    fn close(&self, mut session: TransferSession, state: TransferState, outcome: TransferOutcome) {
        if session.transition(state).is_err() {
            session.state = state;
        }
        let error = match &outcome {
            TransferOutcome::Completed => EngineError::aborted(session.id, "closed"),
            TransferOutcome::Declined => EngineError::aborted(session.id, "declined"),
            TransferOutcome::Aborted(reason) => EngineError::aborted(session.id, reason.clone()),
        };
        session.fail(error);
        if let Some(route) = session.route {
            self.switchboards.release_idle(route);
        }
        info!(session = session.id, peer = %session.peer, outcome = ?outcome, "Transfer closed");
        self.events.emit(MessengerEvent::TransferClosed {
            session: session.id,
            outcome,
        });
    }

    fn on_message(&self, switchboard: SwitchboardId, frame: &Frame) {
        let Ok(message) = MimeMessage::parse(frame.payload_bytes()) else {
            return;
        };
        if message.content_type().as_deref() != Some(mime::P2P) {
            return;
        }
        let destination = message.header("P2P-Dest").unwrap_or_default();
        if !destination.is_empty() && !destination.eq_ignore_ascii_case(&self.switchboards.account()) {
            trace!(destination, "P2P message for someone else");
            return;
        }
        let from = frame.param(0).unwrap_or_default();
        let inner = match message
            .body
            .nested()
            .and_then(|frame| P2pMessage::from_frame(&frame))
        {
            Ok(inner) => inner,
            Err(e) => {
                debug!(from, error = %e, "Dropping unreadable P2P message");
                return;
            }
        };
        trace!(from, "P2P << {}", inner);
        self.handle(switchboard, from, inner);
    }

    fn handle(&self, switchboard: SwitchboardId, from: &str, message: P2pMessage) {
        let id = message.session();
        let mut sessions = lock(&self.sessions);

        match message {
            P2pMessage::Invite { descriptor, .. } => {
                self.on_invite(&mut sessions, switchboard, from, id, descriptor);
                return;
            }
            P2pMessage::Request { descriptor, .. } => {
                self.on_request(&mut sessions, from, id, descriptor);
                return;
            }
            _ => {}
        }

        let Some(session) = sessions.get_mut(&id) else {
            debug!(session = id, from, "Message for unknown transfer");
            return;
        };
        if !session.peer.eq_ignore_ascii_case(from) {
            warn!(session = id, from, peer = %session.peer, "Transfer message from the wrong peer");
            return;
        }
        session.touch();
        if session.route != Some(switchboard) {
            session.route = Some(switchboard);
            session.epoch += 1;
        }

        match message {
            P2pMessage::Accept { offset, .. } => self.on_accept(session, offset),
            P2pMessage::Data {
                offset, total, data, ..
            } => self.on_data(session, offset, total, data),
            P2pMessage::Ack { offset, .. } => self.on_ack(session, offset),
            P2pMessage::Resume { offset, .. } => {
                let received = session.reassembler.as_ref().map(Reassembler::received).unwrap_or(0);
                info!(session = id, offset, received, "Sender resumed on a new switchboard");
                self.send_to(session, P2pMessage::Ack { session: id, offset: received });
            }
            P2pMessage::Decline { .. } => {
                if let Some(session) = sessions.remove(&id) {
                    self.close(session, TransferState::Declined, TransferOutcome::Declined);
                }
                return;
            }
            P2pMessage::Close { .. } => {
                if let Some(session) = sessions.remove(&id) {
                    let done = session.role == TransferRole::Sender
                        || session.reassembler.as_ref().is_some_and(Reassembler::is_complete);
                    if done {
                        self.close(session, TransferState::Closed, TransferOutcome::Completed);
                    } else {
                        let reason = "closed before completion".to_string();
                        self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
                    }
                }
                return;
            }
            P2pMessage::Abort { reason, .. } => {
                if let Some(session) = sessions.remove(&id) {
                    self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
                }
                return;
            }
            P2pMessage::Invite { .. } | P2pMessage::Request { .. } => return,
        }

        // Sessions that reached a terminal state above leave the table.
        let finished = sessions.get(&id).and_then(next_step);
        if let Some(step) = finished {
            if let Some(session) = sessions.remove(&id) {
                self.finish(session, step);
            }
        }
    }

    fn on_invite(
        &self,
        sessions: &mut HashMap<SessionId, TransferSession>,
        switchboard: SwitchboardId,
        from: &str,
        id: SessionId,
        descriptor: ContentDescriptor,
    ) {
        let mut session = TransferSession::new(id, from, TransferRole::Receiver, descriptor.clone(), Bytes::new());
        session.route = Some(switchboard);
        if sessions.contains_key(&id) || descriptor.size > self.config.max_object_size {
            info!(session = id, from, size = descriptor.size, "Declining invitation");
            self.send_to(&mut session, P2pMessage::Decline { session: id });
            return;
        }
        if session.transition(TransferState::InvitationReceived).is_err() {
            return;
        }

        if self.config.cache_policy == CachePolicy::TrustCache {
            if let Some(data) = self.cache.get(&descriptor.hash) {
                debug!(session = id, "Offered object already cached");
                self.send_to(&mut session, P2pMessage::Accept {
                    session: id,
                    offset: descriptor.size,
                });
                self.events.emit(MessengerEvent::TransferCompleted {
                    session: id,
                    descriptor,
                    data,
                });
                self.close(session, TransferState::Closed, TransferOutcome::Completed);
                return;
            }
        }

        if self.config.auto_accept.contains(&descriptor.kind) {
            if let Err(e) = self.accept_session(&mut session) {
                warn!(session = id, error = %e, "Could not accept transfer");
                return;
            }
            if session.total() == 0 {
                self.finish(session, Step::Complete);
                return;
            }
            sessions.insert(id, session);
            self.watch_idle(id);
        } else {
            sessions.insert(id, session);
            self.watch_idle(id);
            info!(session = id, from, object = %descriptor.friendly, "Transfer offered");
            self.events.emit(MessengerEvent::TransferInvitationReceived {
                session: id,
                from: from.to_string(),
                descriptor,
            });
        }
    }

    fn on_request(
        &self,
        sessions: &mut HashMap<SessionId, TransferSession>,
        from: &str,
        id: SessionId,
        descriptor: ContentDescriptor,
    ) {
        let published = self
            .cache
            .is_published(&descriptor.hash)
            .then(|| self.cache.get(&descriptor.hash).zip(self.cache.descriptor(&descriptor.hash)))
            .flatten();
        let Some((data, ours)) = published.filter(|_| !sessions.contains_key(&id)) else {
            info!(session = id, from, object = %descriptor.hash, "Declining request");
            let mut session = TransferSession::new(id, from, TransferRole::Sender, descriptor, Bytes::new());
            self.send_to(&mut session, P2pMessage::Decline { session: id });
            return;
        };

        let mut session = TransferSession::new(id, from, TransferRole::Sender, ours, data);
        let started = session
            .transition(TransferState::InvitationReceived)
            .and_then(|_| session.transition(TransferState::Accepted))
            .and_then(|_| session.transition(TransferState::Transferring));
        if started.is_err() {
            return;
        }
        if !self.send_to(&mut session, P2pMessage::Accept { session: id, offset: 0 }) {
            return;
        }
        info!(session = id, from, "Serving published object");
        self.pump(&mut session);
        sessions.insert(id, session);
        self.watch_idle(id);
    }

    fn on_accept(&self, session: &mut TransferSession, offset: u64) {
        if session.state != TransferState::InvitationSent {
            debug!(session = session.id, state = %session.state, "Unexpected acceptance");
            return;
        }
        if session.transition(TransferState::Accepted).is_err() {
            return;
        }
        match session.role {
            TransferRole::Sender if offset >= session.total() => {
                debug!(session = session.id, "Peer already has the object");
                let _ = session.transition(TransferState::Closed);
            }
            TransferRole::Sender => {
                session.sent = offset;
                session.acked = offset;
                if session.transition(TransferState::Transferring).is_ok() {
                    self.pump(session);
                }
            }
            TransferRole::Receiver => {
                session.reassembler = Some(Reassembler::new(session.id, session.total()));
            }
        }
    }

    fn on_data(&self, session: &mut TransferSession, offset: u64, total: u64, data: Bytes) {
        if session.role != TransferRole::Receiver {
            return;
        }
        if session.state == TransferState::Accepted && session.transition(TransferState::Transferring).is_err() {
            return;
        }
        if session.state != TransferState::Transferring {
            debug!(session = session.id, state = %session.state, "Data outside transfer");
            return;
        }
        let id = session.id;
        let Some(reassembler) = session.reassembler.as_mut() else {
            return;
        };
        match reassembler.accept(offset, total, &data) {
            Ok(received) => {
                self.send_to(session, P2pMessage::Ack {
                    session: id,
                    offset: received,
                });
            }
            Err(e) => {
                warn!(session = id, error = %e, "Rejecting chunk");
                let reason = e.to_string();
                self.send_to(session, P2pMessage::Abort {
                    session: id,
                    reason: reason.clone(),
                });
                session.fail(e);
                if session.transition(TransferState::Aborted).is_err() {
                    session.state = TransferState::Aborted;
                }
                session.abort_reason = Some(reason);
            }
        }
    }

    fn on_ack(&self, session: &mut TransferSession, offset: u64) {
        if session.role != TransferRole::Sender || session.state != TransferState::Transferring {
            return;
        }
        let offset = offset.min(session.total());
        if session.resyncing {
            info!(session = session.id, offset, "Resuming transfer");
            session.resyncing = false;
            session.sent = offset;
            session.acked = offset;
        } else if offset > session.acked && offset <= session.sent {
            session.acked = offset;
        }
        self.pump(session);
    }

    /// Sends chunks while the window allows.
    fn pump(&self, session: &mut TransferSession) {
        if session.resyncing || session.state != TransferState::Transferring {
            return;
        }
        let total = session.total();
        let window = self.config.window_bytes.max(1);
        while session.sent < total {
            let in_flight = session.sent - session.acked;
            if in_flight >= window {
                break;
            }
            let len = (self.config.chunk_size as u64)
                .min(window - in_flight)
                .min(total - session.sent);
            let (start, end) = (session.sent as usize, (session.sent + len) as usize);
            let chunk = P2pMessage::Data {
                session: session.id,
                offset: session.sent,
                total,
                data: session.data.slice(start..end),
            };
            if !self.send_to(session, chunk) {
                self.lose_route(session);
                break;
            }
            session.sent += len;
        }
    }

    /// Marks the session unrouted and starts the matching recovery.
    fn lose_route(&self, session: &mut TransferSession) {
        session.route = None;
        session.epoch += 1;
        let (id, epoch) = (session.id, session.epoch);
        let Some(manager) = self.me.upgrade() else { return };

        if session.role == TransferRole::Sender && session.state == TransferState::Transferring {
            session.resyncing = true;
            let peer = session.peer.clone();
            tokio::spawn(async move { manager.rebind(id, epoch, peer).await });
        } else {
            let timeout = self.config.rebind_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                manager.abort_stale(id, epoch, "switchboard lost");
            });
        }
    }

    /// Waits for a new switchboard with the peer and sends `RSM`.
    async fn rebind(&self, id: SessionId, epoch: u64, peer: String) {
        info!(session = id, peer = %peer, "Transfer lost its switchboard");
        let mut changes = self.switchboards.subscribe_changes();
        self.switchboards.request_p2p_route(&peer);
        let deadline = tokio::time::Instant::now() + self.config.rebind_timeout;
        loop {
            if self.switchboards.route_to(&peer).is_some() {
                let mut sessions = lock(&self.sessions);
                let Some(session) = sessions.get_mut(&id) else { return };
                if session.epoch != epoch || !session.resyncing {
                    return;
                }
                let acked = session.acked;
                if self.send_to(session, P2pMessage::Resume { session: id, offset: acked }) {
                    info!(session = id, offset = acked, "Asked peer to resume");
                    return;
                }
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        self.abort_stale(id, epoch, "no switchboard with peer");
    }

    /// Aborts a session that is still waiting on the route change `epoch`.
    fn abort_stale(&self, id: SessionId, epoch: u64, reason: &str) {
        let mut sessions = lock(&self.sessions);
        let stale = sessions
            .get(&id)
            .is_some_and(|s| s.route.is_none() && s.epoch == epoch);
        if stale {
            if let Some(session) = sessions.remove(&id) {
                warn!(session = id, reason, "Aborting transfer");
                self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason.to_string()));
            }
        }
    }

    fn route_lost(&self, switchboard: SwitchboardId, peer: Option<&str>) {
        if !self.switchboards.is_online() {
            return;
        }
        let mut sessions = lock(&self.sessions);
        for session in sessions.values_mut() {
            let affected = session.route == Some(switchboard)
                && !session.state.is_terminal()
                && peer.is_none_or(|p| p.eq_ignore_ascii_case(&session.peer));
            if affected {
                self.lose_route(session);
            }
        }
    }

    /// Completes or aborts a session that left the table.
    fn finish(&self, mut session: TransferSession, step: Step) {
        let id = session.id;
        match step {
            Step::Aborted(reason) => {
                self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
            }
            Step::Closed => {
                self.close(session, TransferState::Closed, TransferOutcome::Completed);
            }
            Step::Complete => {
                let data = session
                    .reassembler
                    .take()
                    .map(Reassembler::into_bytes)
                    .unwrap_or_default();
                if !session.descriptor.matches(&data) {
                    warn!(session = id, "Received object does not match its descriptor");
                    let reason = EngineError::HashMismatch.to_string();
                    self.send_to(&mut session, P2pMessage::Abort {
                        session: id,
                        reason: reason.clone(),
                    });
                    session.fail(EngineError::HashMismatch);
                    self.close(session, TransferState::Aborted, TransferOutcome::Aborted(reason));
                    return;
                }
                if let Err(e) = self.cache.put(session.descriptor.clone(), data.clone()) {
                    warn!(session = id, error = %e, "Could not cache object");
                }
                self.events.emit(MessengerEvent::TransferCompleted {
                    session: id,
                    descriptor: session.descriptor.clone(),
                    data: data.clone(),
                });
                self.send_to(&mut session, P2pMessage::Close { session: id });
                if let Some(completion) = session.completion.take() {
                    let _ = completion.send(Ok(data));
                }
                self.close(session, TransferState::Closed, TransferOutcome::Completed);
            }
        }
    }
}

/// How a session leaves the table after a protocol step.
#[derive(Debug)]
enum Step {
    /// Receiver holds every byte.
    Complete,
    /// Nothing left to do, e.g. the peer already had the object.
    Closed,
    Aborted(String),
}

fn next_step(session: &TransferSession) -> Option<Step> {
    match session.state {
        TransferState::Aborted => Some(Step::Aborted(
            session
                .abort_reason
                .clone()
                .unwrap_or_else(|| "aborted".to_string()),
        )),
        TransferState::Closed => Some(Step::Closed),
        TransferState::Accepted | TransferState::Transferring
            if session.role == TransferRole::Receiver
                && session.reassembler.as_ref().is_some_and(Reassembler::is_complete) =>
        {
            Some(Step::Complete)
        }
        _ => None,
    }
}

impl SwitchboardHook for P2pManager {
    fn attach(&self, switchboard: SwitchboardId, transport: &Transport) {
        transport.register_handler(Arc::new(P2pHandler {
            manager: self.me.clone(),
            switchboard,
        }));
    }

    fn uses_switchboard(&self, switchboard: SwitchboardId) -> bool {
        lock(&self.sessions)
            .values()
            .any(|s| s.route == Some(switchboard) && !s.state.is_terminal())
    }
}

/// Frame handler registered after the switchboard layer's own.
struct P2pHandler {
    manager: Weak<P2pManager>,
    switchboard: SwitchboardId,
}

impl FrameHandler for P2pHandler {
    fn handle_frame(&self, _transport: &Transport, frame: &Frame) {
        let Some(manager) = self.manager.upgrade() else { return };
        match frame.command.as_str() {
            "MSG" => manager.on_message(self.switchboard, frame),
            "BYE" => manager.route_lost(self.switchboard, frame.param(0)),
            _ => {}
        }
    }

    fn connection_closed(&self, _transport: &Transport, _reason: &CloseReason) {
        if let Some(manager) = self.manager.upgrade() {
            manager.route_lost(self.switchboard, None);
        }
    }
}
