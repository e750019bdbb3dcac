//! Switchboard connections and the conversations bound to them.
//!
//! A conversation is a logical chat with a set of participants; a
//! switchboard is one server connection carrying it. Conversations outlive
//! their switchboards: when the last one closes, a grace timer starts and a
//! new switchboard may be bound before it fires.
//!
//! All bookkeeping lives in one [`Registry`] behind a std `RwLock`. Critical
//! sections never await, and transports are never closed while the lock is
//! held since closing runs handlers that take it again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use msnp_protocol::{Frame, ImContent, MimeMessage};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::conversation::{ConversationId, Initiator};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, MessengerEvent};
use crate::nameserver::{NsLink, SharedAccount};
use crate::sync::{read, write};
use crate::transport::{CloseReason, ConnectionKind, FrameHandler, Transport, TransportConfig};

/// Identifier of one switchboard connection.
pub type SwitchboardId = u64;

/// Switchboard address and authentication cookie from `XFR SB`.
#[derive(Debug, Clone)]
pub(crate) struct SwitchboardTicket {
    pub address: String,
    pub ticket: String,
}

/// A remote invitation (`RNG`) relayed by the nameserver.
#[derive(Debug, Clone)]
pub(crate) struct RingInvitation {
    pub session: String,
    pub address: String,
    pub ticket: String,
    pub inviter: String,
}

/// Lets the transfer layer follow switchboard lifetimes.
pub(crate) trait SwitchboardHook: Send + Sync {
    /// Called once per switchboard, right after the layer's own handler is
    /// registered.
    fn attach(&self, switchboard: SwitchboardId, transport: &Transport);

    /// True while a transfer is routed over `switchboard`.
    fn uses_switchboard(&self, switchboard: SwitchboardId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Ready,
}

struct SwitchboardEntry {
    transport: Transport,
    phase: Phase,
    /// Joined participants, keyed by lower-cased account.
    participants: BTreeMap<String, String>,
    conversation: Option<ConversationId>,
    initiator: Initiator,
    /// Set while answering an `RNG`.
    inviter: Option<String>,
}

impl SwitchboardEntry {
    fn is_routable(&self) -> bool {
        self.phase == Phase::Ready && !self.participants.is_empty()
    }
}

struct ConversationEntry {
    /// Bound switchboards, oldest first.
    switchboards: Vec<SwitchboardId>,
    /// Participants remembered for re-invitation.
    known: BTreeMap<String, String>,
    initiator: Initiator,
    /// Bumped to cancel a running grace timer.
    grace: u64,
    send_lock: Arc<AsyncMutex<()>>,
    route_pending: bool,
}

#[derive(Default)]
struct Registry {
    switchboards: HashMap<SwitchboardId, SwitchboardEntry>,
    conversations: HashMap<ConversationId, ConversationEntry>,
    next_switchboard: SwitchboardId,
    next_conversation: ConversationId,
    /// Accounts with a switchboard being opened for a transfer.
    p2p_pending: HashSet<String>,
}

impl Registry {
    /// Newest bound switchboard with someone to talk to.
    fn route(&self, conversation: ConversationId) -> Option<(SwitchboardId, Transport)> {
        let entry = self.conversations.get(&conversation)?;
        entry
            .switchboards
            .iter()
            .rev()
            .filter_map(|id| self.switchboards.get(id).map(|sb| (*id, sb)))
            .find(|(_, sb)| sb.is_routable())
            .map(|(id, sb)| (id, sb.transport.clone()))
    }

    /// True if `key` is joined on another switchboard of the conversation.
    fn present_elsewhere(&self, conversation: ConversationId, except: SwitchboardId, key: &str) -> bool {
        self.conversations
            .get(&conversation)
            .into_iter()
            .flat_map(|c| c.switchboards.iter())
            .filter(|id| **id != except)
            .filter_map(|id| self.switchboards.get(id))
            .any(|sb| sb.participants.contains_key(key))
    }

    /// Open conversation whose remembered participants are exactly `keys`.
    fn find_conversation(&self, keys: &BTreeSet<&str>) -> Option<ConversationId> {
        let mut matching: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|(_, c)| c.known.len() == keys.len() && c.known.keys().all(|k| keys.contains(k.as_str())))
            .map(|(id, _)| *id)
            .collect();
        matching.sort_unstable();
        matching.first().copied()
    }

    fn insert_conversation(&mut self, known: BTreeMap<String, String>, initiator: Initiator) -> ConversationId {
        self.next_conversation += 1;
        let id = self.next_conversation;
        self.conversations.insert(
            id,
            ConversationEntry {
                switchboards: Vec::new(),
                known,
                initiator,
                grace: 0,
                send_lock: Arc::new(AsyncMutex::new(())),
                route_pending: false,
            },
        );
        id
    }

    /// Binds a ready switchboard by participant set, creating a
    /// conversation if none matches.
    fn bind(&mut self, switchboard: SwitchboardId) -> (Option<ConversationId>, Vec<MessengerEvent>) {
        let mut events = Vec::new();
        let Some(entry) = self.switchboards.get(&switchboard) else {
            return (None, events);
        };
        if let Some(conversation) = entry.conversation {
            return (Some(conversation), events);
        }
        let participants = entry.participants.clone();
        let initiator = entry.initiator;
        let keys: BTreeSet<&str> = participants.keys().map(String::as_str).collect();

        let conversation = match self.find_conversation(&keys) {
            Some(conversation) => {
                for (key, account) in &participants {
                    if !self.present_elsewhere(conversation, switchboard, key) {
                        events.push(MessengerEvent::ContactJoined {
                            conversation,
                            account: account.clone(),
                        });
                    }
                }
                if let Some(entry) = self.conversations.get_mut(&conversation) {
                    entry.switchboards.push(switchboard);
                    entry.grace += 1;
                }
                debug!(conversation, switchboard, "Bound switchboard to existing conversation");
                conversation
            }
            None => {
                let conversation = self.insert_conversation(participants.clone(), initiator);
                if let Some(entry) = self.conversations.get_mut(&conversation) {
                    entry.switchboards.push(switchboard);
                }
                events.push(MessengerEvent::ConversationCreated {
                    conversation,
                    participants: participants.values().cloned().collect(),
                    initiator,
                });
                events.extend(participants.values().map(|account| MessengerEvent::ContactJoined {
                    conversation,
                    account: account.clone(),
                }));
                debug!(conversation, switchboard, "Created conversation for switchboard");
                conversation
            }
        };
        if let Some(entry) = self.switchboards.get_mut(&switchboard) {
            entry.conversation = Some(conversation);
        }
        (Some(conversation), events)
    }
}

fn key(account: &str) -> String {
    account.to_ascii_lowercase()
}

/// Owns every switchboard connection and conversation.
pub(crate) struct SwitchboardLayer {
    me: Weak<SwitchboardLayer>,
    config: EngineConfig,
    account: SharedAccount,
    ns: NsLink,
    events: EventSink,
    registry: RwLock<Registry>,
    /// Bumped on every routing change.
    changes: watch::Sender<u64>,
    hook: OnceLock<Weak<dyn SwitchboardHook>>,
}

impl SwitchboardLayer {
    pub(crate) fn new(
        config: EngineConfig,
        account: SharedAccount,
        ns: NsLink,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            account,
            ns,
            events,
            registry: RwLock::new(Registry::default()),
            changes: watch::channel(0).0,
            hook: OnceLock::new(),
        })
    }

    pub(crate) fn set_hook(&self, hook: Weak<dyn SwitchboardHook>) {
        if self.hook.set(hook).is_err() {
            warn!("Switchboard hook already installed");
        }
    }

    fn hook(&self) -> Option<Arc<dyn SwitchboardHook>> {
        self.hook.get()?.upgrade()
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub(crate) fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub(crate) fn account(&self) -> String {
        read(&self.account).clone()
    }

    pub(crate) fn is_online(&self) -> bool {
        self.ns.is_ready()
    }

    fn emit_all(&self, events: Vec<MessengerEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.config.connect_timeout,
            request_timeout: self.config.request_timeout,
        }
    }

    /// Opens a conversation with `participants`, or returns the open one
    /// with exactly that set. The switchboard is requested in the background.
    pub(crate) fn open(&self, participants: &[String]) -> EngineResult<ConversationId> {
        if !self.is_online() {
            return Err(EngineError::NotSignedIn);
        }
        if participants.is_empty() {
            return Err(EngineError::invalid_state("a conversation needs a participant"));
        }
        let known: BTreeMap<String, String> = participants
            .iter()
            .map(|account| (key(account), account.clone()))
            .collect();

        let conversation = {
            let mut registry = write(&self.registry);
            let keys: BTreeSet<&str> = known.keys().map(String::as_str).collect();
            if let Some(existing) = registry.find_conversation(&keys) {
                debug!(conversation = existing, "Reusing open conversation");
                return Ok(existing);
            }
            registry.insert_conversation(known.clone(), Initiator::Local)
        };
        info!(conversation, participants = ?participants, "Opened conversation");
        self.events.emit(MessengerEvent::ConversationCreated {
            conversation,
            participants: known.into_values().collect(),
            initiator: Initiator::Local,
        });
        self.start_grace(conversation);
        self.request_route(conversation);
        Ok(conversation)
    }

    pub(crate) fn is_open(&self, conversation: ConversationId) -> bool {
        read(&self.registry).conversations.contains_key(&conversation)
    }

    pub(crate) fn conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = read(&self.registry).conversations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remembered participants of a conversation.
    pub(crate) fn participants(&self, conversation: ConversationId) -> Vec<String> {
        read(&self.registry)
            .conversations
            .get(&conversation)
            .map(|c| c.known.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn initiator(&self, conversation: ConversationId) -> Option<Initiator> {
        read(&self.registry)
            .conversations
            .get(&conversation)
            .map(|c| c.initiator)
    }

    pub(crate) fn send_lock(&self, conversation: ConversationId) -> EngineResult<Arc<AsyncMutex<()>>> {
        read(&self.registry)
            .conversations
            .get(&conversation)
            .map(|c| c.send_lock.clone())
            .ok_or(EngineError::ConversationEnded)
    }

    /// The switchboard to send on right now, if any.
    pub(crate) fn current_route(&self, conversation: ConversationId) -> EngineResult<Option<Transport>> {
        let registry = read(&self.registry);
        if !registry.conversations.contains_key(&conversation) {
            return Err(EngineError::ConversationEnded);
        }
        Ok(registry.route(conversation).map(|(_, transport)| transport))
    }

    /// Waits until the conversation has a switchboard with someone joined,
    /// requesting one if needed.
    pub(crate) async fn wait_for_route(&self, conversation: ConversationId) -> EngineResult<Transport> {
        let mut changes = self.changes.subscribe();
        let deadline = tokio::time::Instant::now() + self.config.binding_timeout;
        let mut requested = false;
        loop {
            if let Some(transport) = self.current_route(conversation)? {
                return Ok(transport);
            }
            if !requested {
                self.request_route(conversation);
                requested = true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(EngineError::ConnectionClosed),
                Err(_) => {
                    let participants = self.participants(conversation).join(", ");
                    debug!(conversation, "No switchboard bound in time");
                    return Err(EngineError::no_route(participants));
                }
            }
        }
    }

    /// Invites `account` into the conversation.
    pub(crate) async fn invite(&self, conversation: ConversationId, account: &str) -> EngineResult<()> {
        let route = {
            let mut registry = write(&self.registry);
            let entry = registry
                .conversations
                .get_mut(&conversation)
                .ok_or(EngineError::ConversationEnded)?;
            entry.known.insert(key(account), account.to_string());
            registry.route(conversation)
        };
        match route {
            Some((_, transport)) => {
                transport.request(Frame::new("CAL").with_param(account)).await?;
            }
            None => self.request_route(conversation),
        }
        Ok(())
    }

    fn request_route(&self, conversation: ConversationId) {
        {
            let mut registry = write(&self.registry);
            let Some(entry) = registry.conversations.get_mut(&conversation) else {
                return;
            };
            if entry.route_pending {
                return;
            }
            entry.route_pending = true;
        }
        let Some(layer) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            let result = layer.establish_route(conversation).await;
            if let Some(entry) = write(&layer.registry).conversations.get_mut(&conversation) {
                entry.route_pending = false;
            }
            if let Err(e) = result {
                warn!(conversation, error = %e, "Could not establish switchboard");
            }
            layer.bump();
        });
    }

    async fn establish_route(&self, conversation: ConversationId) -> EngineResult<()> {
        let (idle, invitees) = {
            let registry = read(&self.registry);
            let entry = registry
                .conversations
                .get(&conversation)
                .ok_or(EngineError::ConversationEnded)?;
            let idle = entry
                .switchboards
                .iter()
                .rev()
                .filter_map(|id| registry.switchboards.get(id))
                .find(|sb| sb.phase == Phase::Ready && sb.participants.is_empty())
                .map(|sb| sb.transport.clone());
            (idle, entry.known.values().cloned().collect::<Vec<_>>())
        };

        match idle {
            Some(transport) => {
                debug!(conversation, "Re-inviting participants on idle switchboard");
                self.call(&transport, &invitees).await
            }
            None => self
                .open_switchboard(invitees, Some(conversation), Initiator::Local)
                .await
                .map(|_| ()),
        }
    }

    /// Sends `CAL` for each invitee. Fails only if nobody could be called.
    async fn call(&self, transport: &Transport, invitees: &[String]) -> EngineResult<()> {
        let mut last_error = None;
        let mut called = 0;
        for invitee in invitees {
            match transport.request(Frame::new("CAL").with_param(invitee.as_str())).await {
                Ok(_) => called += 1,
                Err(e) => {
                    warn!(invitee = %invitee, error = %e, "Invitation failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if called == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Opens a switchboard through the nameserver and calls `invitees`.
    async fn open_switchboard(
        &self,
        invitees: Vec<String>,
        conversation: Option<ConversationId>,
        initiator: Initiator,
    ) -> EngineResult<SwitchboardId> {
        let ticket = self.ns.request_switchboard().await?;
        let (id, transport) = self.create_switchboard(initiator);
        debug!(switchboard = id, address = %ticket.address, "Opening switchboard");

        let result: EngineResult<()> = async {
            transport.connect(&ticket.address).await?;
            let reply = transport
                .request(Frame::new("USR").with_params([self.account(), ticket.ticket.clone()]))
                .await?;
            if reply.param(0) != Some("OK") {
                return Err(EngineError::auth(format!("switchboard refused ticket: {reply}")));
            }
            self.mark_ready(id, conversation)?;
            self.call(&transport, &invitees).await
        }
        .await;

        if let Err(e) = result {
            self.discard(id);
            transport.disconnect();
            return Err(e);
        }
        Ok(id)
    }

    fn create_switchboard(&self, initiator: Initiator) -> (SwitchboardId, Transport) {
        let transport = Transport::with_config(ConnectionKind::Switchboard, self.transport_config());
        let id = {
            let mut registry = write(&self.registry);
            registry.next_switchboard += 1;
            let id = registry.next_switchboard;
            registry.switchboards.insert(
                id,
                SwitchboardEntry {
                    transport: transport.clone(),
                    phase: Phase::Handshaking,
                    participants: BTreeMap::new(),
                    conversation: None,
                    initiator,
                    inviter: None,
                },
            );
            id
        };
        transport.register_handler(Arc::new(SbHandler {
            layer: self.me.clone(),
            switchboard: id,
        }));
        if let Some(hook) = self.hook() {
            hook.attach(id, &transport);
        }
        (id, transport)
    }

    fn mark_ready(&self, id: SwitchboardId, conversation: Option<ConversationId>) -> EngineResult<()> {
        {
            let mut registry = write(&self.registry);
            let registry = &mut *registry;
            let entry = registry
                .switchboards
                .get_mut(&id)
                .ok_or(EngineError::ConnectionClosed)?;
            entry.phase = Phase::Ready;
            if let Some(conversation) = conversation {
                let bound = registry
                    .conversations
                    .get_mut(&conversation)
                    .ok_or(EngineError::ConversationEnded)?;
                bound.switchboards.push(id);
                entry.conversation = Some(conversation);
            }
        }
        self.bump();
        Ok(())
    }

    fn discard(&self, id: SwitchboardId) {
        {
            let mut registry = write(&self.registry);
            if let Some(entry) = registry.switchboards.remove(&id) {
                if let Some(conversation) = entry.conversation {
                    if let Some(bound) = registry.conversations.get_mut(&conversation) {
                        bound.switchboards.retain(|sb| *sb != id);
                    }
                }
            }
        }
        self.bump();
    }

    /// Answers an `RNG` in the background.
    pub(crate) fn accept_invitation(&self, invitation: RingInvitation) {
        let Some(layer) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            layer.answer(invitation).await;
        });
    }

    async fn answer(&self, invitation: RingInvitation) {
        let (id, transport) = self.create_switchboard(Initiator::Remote);
        if let Some(entry) = write(&self.registry).switchboards.get_mut(&id) {
            entry.inviter = Some(invitation.inviter.clone());
        }
        let result: EngineResult<()> = async {
            transport.connect(&invitation.address).await?;
            let reply = transport
                .request_with(
                    Frame::new("ANS").with_params([
                        self.account(),
                        invitation.ticket.clone(),
                        invitation.session.clone(),
                    ]),
                    |f| f.is("ANS"),
                )
                .await?;
            if reply.param(0) != Some("OK") {
                return Err(EngineError::auth(format!("switchboard refused answer: {reply}")));
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(inviter = %invitation.inviter, error = %e, "Could not answer invitation");
            self.discard(id);
            transport.disconnect();
        }
    }

    /// `ANS trid OK` ends the roster. Binding happens here, in the reader
    /// task, so frames queued right behind it find the switchboard ready.
    fn on_answered(&self, id: SwitchboardId) {
        let inviter = read(&self.registry)
            .switchboards
            .get(&id)
            .filter(|sb| sb.phase == Phase::Handshaking)
            .and_then(|sb| sb.inviter.clone());
        if let Some(inviter) = inviter {
            self.bind_remote(id, &inviter);
        }
    }

    fn bind_remote(&self, id: SwitchboardId, inviter: &str) {
        let (conversation, events) = {
            let mut registry = write(&self.registry);
            let Some(entry) = registry.switchboards.get_mut(&id) else {
                return;
            };
            entry.phase = Phase::Ready;
            if entry.participants.is_empty() {
                entry.participants.insert(key(inviter), inviter.to_string());
            }
            registry.bind(id)
        };
        info!(switchboard = id, conversation = ?conversation, inviter, "Joined switchboard");
        self.emit_all(events);
        self.bump();
    }

    fn on_frame(&self, id: SwitchboardId, transport: &Transport, frame: &Frame) {
        match frame.command.as_str() {
            "JOI" => {
                if let Some(account) = frame.param(0) {
                    self.on_join(id, account);
                }
            }
            // IRO trid index count account name caps
            "IRO" => {
                if let Some(account) = frame.param(2) {
                    let mut registry = write(&self.registry);
                    if let Some(entry) = registry.switchboards.get_mut(&id) {
                        entry.participants.insert(key(account), account.to_string());
                    }
                }
            }
            "BYE" => {
                if let Some(account) = frame.param(0) {
                    self.on_bye(id, account);
                }
            }
            "MSG" => self.on_message(id, frame),
            "ANS" if frame.param(0) == Some("OK") => self.on_answered(id),
            "ACK" | "NAK" | "USR" | "ANS" | "CAL" => trace!(switchboard = id, "{}", frame),
            _ => {
                if let Some(code) = frame.error_code() {
                    if !frame.trid.is_some_and(|t| transport.has_waiter(t)) {
                        warn!(switchboard = id, code, "Unsolicited switchboard error");
                    }
                } else {
                    trace!(switchboard = id, command = %frame.command, "Ignoring switchboard frame");
                }
            }
        }
    }

    fn on_join(&self, id: SwitchboardId, account: &str) {
        let k = key(account);
        let mut events = Vec::new();
        {
            let mut registry = write(&self.registry);
            let conversation = match registry.switchboards.get_mut(&id) {
                Some(entry) => {
                    entry.participants.insert(k.clone(), account.to_string());
                    entry.conversation
                }
                None => return,
            };
            if let Some(conversation) = conversation {
                if !registry.present_elsewhere(conversation, id, &k) {
                    events.push(MessengerEvent::ContactJoined {
                        conversation,
                        account: account.to_string(),
                    });
                }
                if let Some(entry) = registry.conversations.get_mut(&conversation) {
                    entry.known.insert(k, account.to_string());
                    entry.grace += 1;
                }
            }
        }
        debug!(switchboard = id, account, "Participant joined");
        self.emit_all(events);
        self.bump();
    }

    fn on_bye(&self, id: SwitchboardId, account: &str) {
        let k = key(account);
        let mut events = Vec::new();
        let mut unrouted = None;
        {
            let mut registry = write(&self.registry);
            let conversation = match registry.switchboards.get_mut(&id) {
                Some(entry) => {
                    entry.participants.remove(&k);
                    entry.conversation
                }
                None => return,
            };
            if let Some(conversation) = conversation {
                if !registry.present_elsewhere(conversation, id, &k) {
                    events.push(MessengerEvent::ContactLeft {
                        conversation,
                        account: account.to_string(),
                    });
                }
                if let Some(entry) = registry.conversations.get_mut(&conversation) {
                    // The last participant is remembered for re-invitation.
                    if entry.known.len() > 1 {
                        entry.known.remove(&k);
                    }
                }
                if registry.route(conversation).is_none() {
                    unrouted = Some(conversation);
                }
            }
        }
        debug!(switchboard = id, account, "Participant left");
        self.emit_all(events);
        if let Some(conversation) = unrouted {
            self.start_grace(conversation);
        }
        self.bump();
    }

    fn on_closed(&self, id: SwitchboardId, reason: &CloseReason) {
        let mut unrouted = None;
        {
            let mut registry = write(&self.registry);
            let Some(entry) = registry.switchboards.remove(&id) else {
                return;
            };
            if let Some(conversation) = entry.conversation {
                if let Some(bound) = registry.conversations.get_mut(&conversation) {
                    bound.switchboards.retain(|sb| *sb != id);
                }
                if registry.conversations.contains_key(&conversation) && registry.route(conversation).is_none() {
                    unrouted = Some(conversation);
                }
            }
        }
        debug!(switchboard = id, %reason, "Switchboard closed");
        if let Some(conversation) = unrouted {
            self.start_grace(conversation);
        }
        self.bump();
    }

    fn on_message(&self, id: SwitchboardId, frame: &Frame) {
        let from = frame.param(0).unwrap_or_default().to_string();
        let content = match MimeMessage::parse(frame.payload_bytes()).and_then(|m| m.content()) {
            Ok(content) => content,
            Err(e) => {
                debug!(switchboard = id, error = %e, "Dropping unreadable message");
                return;
            }
        };

        let event = match content {
            ImContent::Text { text, format } => self.ensure_bound(id).map(|conversation| {
                MessengerEvent::TextMessageReceived {
                    conversation,
                    from,
                    text,
                    format,
                }
            }),
            ImContent::Nudge => self
                .ensure_bound(id)
                .map(|conversation| MessengerEvent::NudgeReceived { conversation, from }),
            ImContent::Typing { .. } => self
                .bound(id)
                .map(|conversation| MessengerEvent::TypingReceived { conversation, from }),
            ImContent::Emoticons(definitions) => self.bound(id).map(|conversation| {
                MessengerEvent::EmoticonDefinitionsReceived {
                    conversation,
                    from,
                    definitions,
                }
            }),
            ImContent::P2p { .. } => None,
            ImContent::Datacast { id: datacast } => {
                debug!(switchboard = id, datacast, "Ignoring datacast");
                None
            }
            ImContent::Other { content_type } => {
                trace!(switchboard = id, %content_type, "Ignoring message");
                None
            }
        };
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    fn bound(&self, id: SwitchboardId) -> Option<ConversationId> {
        read(&self.registry).switchboards.get(&id)?.conversation
    }

    /// The switchboard's conversation, binding it first if it has none.
    fn ensure_bound(&self, id: SwitchboardId) -> Option<ConversationId> {
        if let Some(conversation) = self.bound(id) {
            return Some(conversation);
        }
        let (conversation, events) = {
            let mut registry = write(&self.registry);
            match registry.switchboards.get(&id) {
                Some(entry) if entry.phase == Phase::Ready => registry.bind(id),
                _ => return None,
            }
        };
        self.emit_all(events);
        self.bump();
        conversation
    }

    fn start_grace(&self, conversation: ConversationId) {
        let generation = {
            let mut registry = write(&self.registry);
            let Some(entry) = registry.conversations.get_mut(&conversation) else {
                return;
            };
            entry.grace += 1;
            entry.grace
        };
        let layer = self.me.clone();
        let grace = self.config.empty_conversation_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(layer) = layer.upgrade() {
                if layer.end_conversation(conversation, Some(generation)) {
                    info!(conversation, "Conversation ended after grace period");
                }
            }
        });
    }

    /// Ends a conversation. Idempotent.
    pub(crate) fn close_conversation(&self, conversation: ConversationId) {
        if self.end_conversation(conversation, None) {
            info!(conversation, "Conversation closed");
        }
    }

    fn end_conversation(&self, conversation: ConversationId, grace: Option<u64>) -> bool {
        let switchboards = {
            let mut registry = write(&self.registry);
            let Some(entry) = registry.conversations.get(&conversation) else {
                return false;
            };
            if let Some(generation) = grace {
                if entry.grace != generation || registry.route(conversation).is_some() {
                    return false;
                }
            }
            let Some(entry) = registry.conversations.remove(&conversation) else {
                return false;
            };
            entry
                .switchboards
                .iter()
                .filter_map(|id| {
                    let sb = registry.switchboards.get_mut(id)?;
                    sb.conversation = None;
                    Some((*id, sb.transport.clone()))
                })
                .collect::<Vec<_>>()
        };

        let hook = self.hook();
        for (id, transport) in switchboards {
            if hook.as_ref().is_some_and(|h| h.uses_switchboard(id)) {
                debug!(switchboard = id, "Keeping switchboard for a transfer");
                continue;
            }
            let _ = transport.send(Frame::new("OUT"));
            transport.disconnect();
        }
        self.events
            .emit(MessengerEvent::SessionClosed { conversation });
        self.bump();
        true
    }

    /// Closes every switchboard and ends every conversation.
    pub(crate) fn close_all(&self) {
        let (transports, conversations) = {
            let mut registry = write(&self.registry);
            let transports: Vec<Transport> = registry
                .switchboards
                .drain()
                .map(|(_, sb)| sb.transport)
                .collect();
            let mut conversations: Vec<ConversationId> =
                registry.conversations.drain().map(|(id, _)| id).collect();
            conversations.sort_unstable();
            registry.p2p_pending.clear();
            (transports, conversations)
        };
        for transport in transports {
            let _ = transport.send(Frame::new("OUT"));
            transport.disconnect();
        }
        for conversation in conversations {
            self.events
                .emit(MessengerEvent::SessionClosed { conversation });
        }
        self.bump();
    }

    /// Closes `switchboard` after the grace period unless it carries a
    /// conversation or a transfer by then.
    pub(crate) fn release_idle(&self, switchboard: SwitchboardId) {
        let layer = self.me.clone();
        let grace = self.config.empty_conversation_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(layer) = layer.upgrade() {
                layer.close_if_unused(switchboard);
            }
        });
    }

    fn close_if_unused(&self, switchboard: SwitchboardId) -> bool {
        let transport = {
            let registry = read(&self.registry);
            match registry.switchboards.get(&switchboard) {
                Some(sb) if sb.conversation.is_none() => sb.transport.clone(),
                _ => return false,
            }
        };
        if self.hook().is_some_and(|h| h.uses_switchboard(switchboard)) {
            return false;
        }
        debug!(switchboard, "Closing unused transfer switchboard");
        let _ = transport.send(Frame::new("OUT"));
        transport.disconnect();
        true
    }

    /// Newest ready switchboard on which `account` is joined.
    pub(crate) fn route_to(&self, account: &str) -> Option<(SwitchboardId, Transport)> {
        let k = key(account);
        read(&self.registry)
            .switchboards
            .iter()
            .filter(|(_, sb)| sb.phase == Phase::Ready && sb.participants.contains_key(&k))
            .max_by_key(|(id, _)| **id)
            .map(|(id, sb)| (*id, sb.transport.clone()))
    }

    /// Makes sure a switchboard with `account` joined is on its way.
    pub(crate) fn request_p2p_route(&self, account: &str) {
        if self.route_to(account).is_some() || !self.is_online() {
            return;
        }
        let k = key(account);
        let conversation = {
            let mut registry = write(&self.registry);
            let keys = BTreeSet::from([k.as_str()]);
            match registry.find_conversation(&keys) {
                Some(conversation) => Some(conversation),
                None if registry.p2p_pending.contains(&k) => return,
                None => {
                    registry.p2p_pending.insert(k.clone());
                    None
                }
            }
        };
        if let Some(conversation) = conversation {
            self.request_route(conversation);
            return;
        }

        let Some(layer) = self.me.upgrade() else { return };
        let account = account.to_string();
        tokio::spawn(async move {
            debug!(account = %account, "Opening switchboard for transfer");
            let result = layer
                .open_switchboard(vec![account.clone()], None, Initiator::P2p)
                .await;
            write(&layer.registry).p2p_pending.remove(&key(&account));
            if let Err(e) = result {
                warn!(account = %account, error = %e, "Could not open transfer switchboard");
            }
            layer.bump();
        });
    }
}

#[cfg(test)]
impl SwitchboardLayer {
    pub(crate) fn switchboard_count(&self) -> usize {
        read(&self.registry).switchboards.len()
    }

    /// Attaches a ready switchboard over `stream` with `peer` joined.
    pub(crate) fn attach_test_switchboard<S>(&self, stream: S, peer: &str) -> SwitchboardId
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (id, transport) = self.create_switchboard(Initiator::P2p);
        transport.connect_stream(stream).expect("fresh transport");
        self.mark_ready(id, None).expect("switchboard registered");
        self.on_join(id, peer);
        id
    }
}

/// Frame handler registered first on every switchboard transport.
struct SbHandler {
    layer: Weak<SwitchboardLayer>,
    switchboard: SwitchboardId,
}

impl FrameHandler for SbHandler {
    fn handle_frame(&self, transport: &Transport, frame: &Frame) {
        if let Some(layer) = self.layer.upgrade() {
            layer.on_frame(self.switchboard, transport, frame);
        }
    }

    fn connection_closed(&self, _transport: &Transport, reason: &CloseReason) {
        if let Some(layer) = self.layer.upgrade() {
            layer.on_closed(self.switchboard, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn layer() -> (Arc<SwitchboardLayer>, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (events, rx) = EventSink::channel();
        let config = EngineConfig::default().with_empty_conversation_grace(Duration::from_secs(5));
        let account = Arc::new(RwLock::new("alice@example.com".to_string()));
        (SwitchboardLayer::new(config, account, NsLink::default(), events), rx)
    }

    /// Registers a switchboard as if `ANS` had completed with `roster`.
    fn answered(layer: &SwitchboardLayer, roster: &[&str]) -> SwitchboardId {
        let (id, transport) = layer.create_switchboard(Initiator::Remote);
        for (i, account) in roster.iter().enumerate() {
            let iro = Frame::new("IRO")
                .with_trid(1)
                .with_params([(i + 1).to_string(), roster.len().to_string(), account.to_string()]);
            layer.on_frame(id, &transport, &iro);
        }
        layer.bind_remote(id, roster[0]);
        id
    }

    /// `MSG bob@example.com Bob <len>` as the switchboard relays it.
    fn incoming(message: MimeMessage) -> Frame {
        Frame::new("MSG")
            .with_params(["bob@example.com", "Bob"])
            .with_payload(message.to_bytes())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MessengerEvent>) -> Vec<MessengerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn invitations_for_same_participants_share_a_conversation() {
        let (layer, mut rx) = layer();
        let first = answered(&layer, &["bob@example.com"]);
        let second = answered(&layer, &["Bob@Example.com"]);

        assert_ne!(first, second);
        assert_eq!(layer.bound(first), layer.bound(second));
        assert_eq!(layer.conversations().len(), 1);

        let created = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MessengerEvent::ConversationCreated { .. }))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn different_participant_sets_get_different_conversations() {
        let (layer, _rx) = layer();
        let one = answered(&layer, &["bob@example.com"]);
        let group = answered(&layer, &["bob@example.com", "carol@example.com"]);
        assert_ne!(layer.bound(one), layer.bound(group));
        assert_eq!(layer.conversations().len(), 2);
    }

    #[tokio::test]
    async fn newest_switchboard_is_the_route() {
        let (layer, _rx) = layer();
        let _first = answered(&layer, &["bob@example.com"]);
        let second = answered(&layer, &["bob@example.com"]);
        let (route, _) = layer.route_to("BOB@example.com").unwrap();
        assert_eq!(route, second);
    }

    #[tokio::test]
    async fn text_on_unbound_switchboard_binds_it() {
        let (layer, mut rx) = layer();
        let (id, transport) = layer.create_switchboard(Initiator::P2p);
        layer.mark_ready(id, None).unwrap();
        layer.on_join(id, "bob@example.com");
        assert_eq!(layer.bound(id), None);

        let msg = incoming(MimeMessage::text("hi", None));
        layer.on_frame(id, &transport, &msg);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [
                MessengerEvent::ConversationCreated { initiator: Initiator::P2p, .. },
                MessengerEvent::ContactJoined { .. },
                MessengerEvent::TextMessageReceived { text, .. },
            ] if text == "hi"
        ));
        assert!(layer.bound(id).is_some());
    }

    #[tokio::test]
    async fn typing_on_unbound_switchboard_is_ignored() {
        let (layer, mut rx) = layer();
        let (id, transport) = layer.create_switchboard(Initiator::P2p);
        layer.mark_ready(id, None).unwrap();
        layer.on_join(id, "bob@example.com");

        let msg = incoming(MimeMessage::typing("bob@example.com"));
        layer.on_frame(id, &transport, &msg);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(layer.bound(id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_conversation_ends_after_grace() {
        let (layer, mut rx) = layer();
        let id = answered(&layer, &["bob@example.com"]);
        let conversation = layer.bound(id).unwrap();
        let transport = read(&layer.registry).switchboards[&id].transport.clone();
        layer.on_frame(id, &transport, &Frame::new("BYE").with_param("bob@example.com"));

        assert!(layer.is_open(conversation));
        assert_eq!(layer.participants(conversation), vec!["bob@example.com"]);

        let mut closed = false;
        while let Some(event) = rx.recv().await {
            if let MessengerEvent::SessionClosed { conversation: c } = event {
                assert_eq!(c, conversation);
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(!layer.is_open(conversation));
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_cancels_grace() {
        let (layer, mut rx) = layer();
        let id = answered(&layer, &["bob@example.com"]);
        let conversation = layer.bound(id).unwrap();
        let transport = read(&layer.registry).switchboards[&id].transport.clone();
        layer.on_frame(id, &transport, &Frame::new("BYE").with_param("bob@example.com"));
        layer.on_frame(id, &transport, &Frame::new("JOI").with_params(["bob@example.com", "Bob", "0"]));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(layer.is_open(conversation));
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, MessengerEvent::SessionClosed { .. }))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (layer, mut rx) = layer();
        let id = answered(&layer, &["bob@example.com"]);
        let conversation = layer.bound(id).unwrap();
        drain(&mut rx);

        layer.close_conversation(conversation);
        layer.close_conversation(conversation);

        assert!(!layer.is_open(conversation));
        assert!(matches!(layer.send_lock(conversation), Err(EngineError::ConversationEnded)));
        let closed = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MessengerEvent::SessionClosed { .. }))
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn leaving_participant_is_forgotten_in_group() {
        let (layer, _rx) = layer();
        let id = answered(&layer, &["bob@example.com", "carol@example.com"]);
        let conversation = layer.bound(id).unwrap();
        let transport = read(&layer.registry).switchboards[&id].transport.clone();
        layer.on_frame(id, &transport, &Frame::new("BYE").with_param("carol@example.com"));
        assert_eq!(layer.participants(conversation), vec!["bob@example.com"]);
    }

    #[tokio::test]
    async fn message_queued_behind_answer_is_delivered() {
        let (layer, mut rx) = layer();
        let (id, transport) = layer.create_switchboard(Initiator::Remote);
        if let Some(entry) = write(&layer.registry).switchboards.get_mut(&id) {
            entry.inviter = Some("bob@example.com".to_string());
        }

        // Dispatched back to back, as the reader does with one buffered read.
        let iro = Frame::new("IRO")
            .with_trid(1)
            .with_params(["1", "1", "bob@example.com", "Bob"]);
        layer.on_frame(id, &transport, &iro);
        layer.on_frame(id, &transport, &Frame::new("ANS").with_trid(1).with_param("OK"));
        layer.on_frame(id, &transport, &incoming(MimeMessage::text("first line", None)));

        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [
                MessengerEvent::ConversationCreated { initiator: Initiator::Remote, .. },
                MessengerEvent::ContactJoined { .. },
                MessengerEvent::TextMessageReceived { text, .. },
            ] if text == "first line"
        ));
        assert!(layer.route_to("bob@example.com").is_some());
    }

    #[tokio::test]
    async fn refused_answer_leaves_switchboard_unbound() {
        let (layer, mut rx) = layer();
        let (id, transport) = layer.create_switchboard(Initiator::Remote);
        if let Some(entry) = write(&layer.registry).switchboards.get_mut(&id) {
            entry.inviter = Some("bob@example.com".to_string());
        }
        layer.on_frame(id, &transport, &Frame::new("911").with_trid(1));
        layer.on_frame(id, &transport, &incoming(MimeMessage::text("hi", None)));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(layer.bound(id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transfer_switchboard_is_closed_after_grace() {
        let (layer, _rx) = layer();
        let (local, _remote) = tokio::io::duplex(1024);
        let id = layer.attach_test_switchboard(local, "bob@example.com");

        layer.release_idle(id);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(layer.switchboard_count(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(layer.switchboard_count(), 0);
        assert!(layer.route_to("bob@example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn released_switchboard_with_conversation_stays_open() {
        let (layer, _rx) = layer();
        let id = answered(&layer, &["bob@example.com"]);

        layer.release_idle(id);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(layer.switchboard_count(), 1);
        assert!(layer.bound(id).is_some());
    }
}
