//! Nameserver session: login, contact list, presence, switchboard tickets.
//!
//! One [`Nameserver`] drives one connection through
//! `Disconnected → Connecting → Authenticating → SignedIn`. Frames are
//! handled synchronously by [`NsHandler`]; list edits mutate the shared
//! [`ContactList`] whether they are replies to our own requests or server
//! notifications, so outbound operations only wait for the reply.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use msnp_core::{
    ClientType, Contact, ContactList, ContentDescriptor, Group, ListMembership, PresenceStatus,
};
use msnp_protocol::{Frame, PROTOCOL_VERSION, ProtocolError};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, TicketError};
use crate::events::{EventSink, MessengerEvent};
use crate::p2p::P2pManager;
use crate::switchboard::{RingInvitation, SwitchboardLayer, SwitchboardTicket};
use crate::sync::{lock, read, write};
use crate::transport::{CloseReason, ConnectionKind, FrameHandler, Transport, TransportConfig};

/// Account shared by every layer; set when login starts.
pub(crate) type SharedAccount = Arc<RwLock<String>>;

/// Future returned by a [`TicketProvider`].
pub type TicketFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TicketError>> + Send + 'a>>;

/// Obtains the single sign-on ticket for the second `USR` step.
///
/// Talking to the authentication web service is out of scope for the
/// engine; callers plug in whatever produces a ticket.
pub trait TicketProvider: Send + Sync {
    fn ticket<'a>(&'a self, account: &'a str, policy: &'a str, nonce: &'a str) -> TicketFuture<'a>;
}

/// A ticket known up front.
#[derive(Debug, Clone)]
pub struct StaticTicket(pub String);

impl TicketProvider for StaticTicket {
    fn ticket<'a>(&'a self, _account: &'a str, _policy: &'a str, _nonce: &'a str) -> TicketFuture<'a> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Nameserver connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsState {
    Disconnected,
    Connecting,
    Authenticating,
    SignedIn,
}

/// The nameserver connection as seen by the switchboard layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct NsLink {
    slot: Arc<RwLock<Option<Transport>>>,
    ready: Arc<AtomicBool>,
}

impl NsLink {
    pub(crate) fn current(&self) -> Option<Transport> {
        read(&self.slot).clone()
    }

    fn set(&self, transport: Transport) {
        *write(&self.slot) = Some(transport);
    }

    fn take(&self) -> Option<Transport> {
        self.ready.store(false, Ordering::Release);
        write(&self.slot).take()
    }

    fn is_current(&self, transport: &Transport) -> bool {
        read(&self.slot)
            .as_ref()
            .is_some_and(|t| t.id() == transport.id())
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Asks the nameserver for a fresh switchboard (`XFR SB`).
    pub(crate) async fn request_switchboard(&self) -> EngineResult<SwitchboardTicket> {
        if !self.is_ready() {
            return Err(EngineError::NotSignedIn);
        }
        let transport = self.current().ok_or(EngineError::NotSignedIn)?;
        let reply = transport.request(Frame::new("XFR").with_param("SB")).await?;
        // XFR trid SB address CKI ticket
        match (reply.param(0), reply.param(1), reply.param(3)) {
            (Some("SB"), Some(address), Some(ticket)) => Ok(SwitchboardTicket {
                address: address.to_string(),
                ticket: ticket.to_string(),
            }),
            _ => Err(ProtocolError::malformed(format!("unexpected switchboard referral: {reply}")).into()),
        }
    }
}

#[derive(Default)]
struct SyncProgress {
    expected: Option<(usize, usize)>,
    contacts: usize,
    groups: usize,
    done: Option<oneshot::Sender<()>>,
}

impl SyncProgress {
    fn check(&mut self) {
        if let Some((contacts, groups)) = self.expected {
            if self.contacts >= contacts && self.groups >= groups {
                if let Some(done) = self.done.take() {
                    let _ = done.send(());
                }
            }
        }
    }
}

/// What the user advertises about themselves.
#[derive(Debug, Clone)]
struct Profile {
    status: PresenceStatus,
    display_name: String,
    personal_message: String,
    display_picture: Option<ContentDescriptor>,
}

/// Nameserver session.
pub struct Nameserver {
    config: EngineConfig,
    account: SharedAccount,
    state: RwLock<NsState>,
    link: NsLink,
    contacts: Arc<RwLock<ContactList>>,
    switchboards: Arc<SwitchboardLayer>,
    p2p: Arc<P2pManager>,
    tickets: Arc<dyn TicketProvider>,
    events: EventSink,
    sync: Mutex<SyncProgress>,
    profile: Mutex<Profile>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Nameserver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        account: SharedAccount,
        link: NsLink,
        contacts: Arc<RwLock<ContactList>>,
        switchboards: Arc<SwitchboardLayer>,
        p2p: Arc<P2pManager>,
        tickets: Arc<dyn TicketProvider>,
        events: EventSink,
    ) -> Self {
        let profile = Profile {
            status: config.initial_status,
            display_name: String::new(),
            personal_message: String::new(),
            display_picture: None,
        };
        Self {
            config,
            account,
            state: RwLock::new(NsState::Disconnected),
            link,
            contacts,
            switchboards,
            p2p,
            tickets,
            events,
            sync: Mutex::new(SyncProgress::default()),
            profile: Mutex::new(profile),
            keepalive: Mutex::new(None),
        }
    }

    pub fn state(&self) -> NsState {
        *read(&self.state)
    }

    /// True once login, both synchronizations and initial presence are done.
    pub fn is_ready(&self) -> bool {
        self.link.is_ready()
    }

    fn set_state(&self, state: NsState) {
        let mut current = write(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Nameserver state change");
            *current = state;
        }
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.config.connect_timeout,
            request_timeout: self.config.request_timeout,
        }
    }

    /// Runs the full login sequence.
    #[tracing::instrument(skip(self))]
    pub async fn login(self: &Arc<Self>, account: &str) -> EngineResult<()> {
        {
            let mut state = write(&self.state);
            if *state != NsState::Disconnected {
                return Err(EngineError::invalid_state("login already in progress or signed in"));
            }
            *state = NsState::Connecting;
        }
        *write(&self.account) = account.to_string();

        match self.run_login(account).await {
            Ok(()) => {
                info!("Signed in");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.teardown(&format!("login failed: {e}"));
                Err(e)
            }
        }
    }

    async fn run_login(self: &Arc<Self>, account: &str) -> EngineResult<()> {
        let mut endpoint = self.config.nameserver.clone();
        let mut redirects = 0;

        let (transport, challenge) = loop {
            self.set_state(NsState::Connecting);
            let transport = Transport::with_config(ConnectionKind::Nameserver, self.transport_config());
            transport.register_handler(Arc::new(NsHandler {
                ns: Arc::downgrade(self),
            }));
            self.link.set(transport.clone());
            transport.connect(&endpoint).await?;

            let reply = transport
                .request(Frame::new("VER").with_params([PROTOCOL_VERSION, "CVR0"]))
                .await?;
            if !reply.params.iter().any(|v| v == PROTOCOL_VERSION) {
                return Err(EngineError::ProtocolVersion {
                    offered: reply.params.join(" "),
                });
            }

            self.set_state(NsState::Authenticating);
            let reply = transport
                .request_with(
                    Frame::new("USR").with_params(["SSO", "I", account]),
                    |f| f.is("USR") || f.is("XFR"),
                )
                .await?;

            if reply.is("XFR") {
                redirects += 1;
                if redirects > self.config.max_redirects {
                    return Err(EngineError::invalid_state("too many nameserver redirects"));
                }
                endpoint = match (reply.param(0), reply.param(1)) {
                    (Some("NS"), Some(next)) => next.to_string(),
                    _ => return Err(ProtocolError::malformed(format!("bad redirect: {reply}")).into()),
                };
                info!(endpoint = %endpoint, "Redirected to another nameserver");
                self.link.take();
                transport.disconnect();
                continue;
            }
            break (transport, reply);
        };

        // USR trid SSO S policy nonce
        let (policy, nonce) = match (challenge.param(1), challenge.param(2), challenge.param(3)) {
            (Some("S"), Some(policy), Some(nonce)) => (policy.to_string(), nonce.to_string()),
            _ => return Err(ProtocolError::malformed(format!("bad SSO challenge: {challenge}")).into()),
        };
        let ticket = self
            .tickets
            .ticket(account, &policy, &nonce)
            .await
            .map_err(|e| EngineError::auth(e.to_string()))?;

        let reply = match transport
            .request(Frame::new("USR").with_params(["SSO", "S", ticket.as_str()]))
            .await
        {
            Ok(reply) => reply,
            Err(EngineError::Server { code: 911, .. }) => {
                return Err(EngineError::auth("credentials rejected (911)"));
            }
            Err(e) => return Err(e),
        };
        if reply.param(0) != Some("OK") {
            return Err(EngineError::auth(format!("unexpected reply {reply}")));
        }
        self.set_state(NsState::SignedIn);

        self.synchronize(&transport).await?;
        self.send_membership(&transport).await?;

        let status = lock(&self.profile).status;
        transport.request(self.presence_frame(status)).await?;

        self.link.ready.store(true, Ordering::Release);
        self.start_keepalive(&transport);
        self.events.emit(MessengerEvent::SignedIn {
            account: account.to_string(),
        });
        Ok(())
    }

    async fn synchronize(&self, transport: &Transport) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.sync) = SyncProgress {
            done: Some(tx),
            ..SyncProgress::default()
        };
        transport.request(Frame::new("SYN").with_params(["0", "0"])).await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(EngineError::ConnectionClosed),
            Err(_) => return Err(EngineError::timeout("contact list synchronization")),
        }

        let (contacts, groups) = {
            let list = read(&self.contacts);
            (list.len(), list.group_count())
        };
        debug!(contacts, groups, "Contact list synchronized");
        self.events
            .emit(MessengerEvent::ContactListSynced { contacts, groups });
        Ok(())
    }

    async fn send_membership(&self, transport: &Transport) -> EngineResult<()> {
        let xml = membership_xml(&read(&self.contacts));
        trace!(%xml, "Sending membership list");
        transport.request(Frame::new("ADL").with_payload(xml)).await?;
        Ok(())
    }

    fn presence_frame(&self, status: PresenceStatus) -> Frame {
        let profile = lock(&self.profile);
        let mut frame = Frame::new("CHG").with_params([
            status.code().to_string(),
            self.config.capabilities.to_string(),
        ]);
        if let Some(descriptor) = &profile.display_picture {
            frame = frame.with_param(descriptor.to_param());
        }
        frame
    }

    fn start_keepalive(&self, transport: &Transport) {
        let transport = transport.clone();
        let interval = self.config.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if transport.send(Frame::new("PNG")).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = lock(&self.keepalive).replace(task) {
            old.abort();
        }
    }

    fn signed_in(&self) -> EngineResult<Transport> {
        if !self.is_ready() {
            return Err(EngineError::NotSignedIn);
        }
        self.link.current().ok_or(EngineError::NotSignedIn)
    }

    /// Adds `account` to one list (`FL`, `AL`, `BL`).
    pub async fn add_contact(&self, account: &str, list: ListMembership) -> EngineResult<()> {
        let transport = self.signed_in()?;
        let code = list
            .code()
            .ok_or_else(|| EngineError::invalid_state("exactly one list must be given"))?;
        let mut frame = Frame::new("ADC").with_params([code.to_string(), format!("N={account}")]);
        if list == ListMembership::FORWARD {
            frame = frame.with_param(format!("F={}", urlencoding::encode(account)));
        }
        transport.request(frame).await?;
        Ok(())
    }

    /// Removes `account` from one list.
    pub async fn remove_contact(&self, account: &str, list: ListMembership) -> EngineResult<()> {
        let transport = self.signed_in()?;
        let code = list
            .code()
            .ok_or_else(|| EngineError::invalid_state("exactly one list must be given"))?;
        // The forward list is keyed by contact guid.
        let target = if list == ListMembership::FORWARD {
            read(&self.contacts)
                .get(account)
                .and_then(|c| c.guid.clone())
                .unwrap_or_else(|| account.to_string())
        } else {
            account.to_string()
        };
        transport
            .request(Frame::new("REM").with_params([code.to_string(), target]))
            .await?;
        Ok(())
    }

    /// Creates a group and returns its id.
    pub async fn add_group(&self, name: &str) -> EngineResult<String> {
        let transport = self.signed_in()?;
        let reply = transport
            .request(Frame::new("ADG").with_param(urlencoding::encode(name).into_owned()))
            .await?;
        reply
            .param(1)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::malformed(format!("ADG reply without id: {reply}")).into())
    }

    pub async fn remove_group(&self, id: &str) -> EngineResult<()> {
        let transport = self.signed_in()?;
        transport.request(Frame::new("RMG").with_param(id)).await?;
        Ok(())
    }

    pub async fn rename_group(&self, id: &str, name: &str) -> EngineResult<()> {
        let transport = self.signed_in()?;
        transport
            .request(Frame::new("REG").with_params([id.to_string(), urlencoding::encode(name).into_owned()]))
            .await?;
        Ok(())
    }

    /// Changes the advertised presence.
    pub async fn set_status(&self, status: PresenceStatus) -> EngineResult<()> {
        if status == PresenceStatus::Offline {
            return Err(EngineError::invalid_state("use sign_out to go offline"));
        }
        let transport = self.signed_in()?;
        transport.request(self.presence_frame(status)).await?;
        Ok(())
    }

    pub async fn set_display_name(&self, name: &str) -> EngineResult<()> {
        let transport = self.signed_in()?;
        transport
            .request(Frame::new("PRP").with_params(["MFN".to_string(), urlencoding::encode(name).into_owned()]))
            .await?;
        Ok(())
    }

    pub async fn set_personal_message(&self, message: &str) -> EngineResult<()> {
        let transport = self.signed_in()?;
        let xml = format!(
            "<Data><PSM>{}</PSM><CurrentMedia></CurrentMedia></Data>",
            escape(message)
        );
        transport.request(Frame::new("UUX").with_payload(xml)).await?;
        lock(&self.profile).personal_message = message.to_string();
        Ok(())
    }

    /// Announces a new display picture with the current status.
    pub async fn set_display_picture(&self, descriptor: Option<ContentDescriptor>) -> EngineResult<()> {
        let transport = self.signed_in()?;
        let status = {
            let mut profile = lock(&self.profile);
            profile.display_picture = descriptor;
            profile.status
        };
        transport.request(self.presence_frame(status)).await?;
        Ok(())
    }

    /// Our own status as last confirmed by the server.
    pub fn status(&self) -> PresenceStatus {
        lock(&self.profile).status
    }

    pub fn display_name(&self) -> String {
        lock(&self.profile).display_name.clone()
    }

    /// Sends `OUT` and closes the connection.
    pub fn sign_out(&self) {
        if let Some(transport) = self.link.current() {
            let _ = transport.send(Frame::new("OUT"));
            transport.disconnect();
        }
    }

    /// Resets every layer after the connection is gone. Idempotent.
    fn teardown(&self, reason: &str) {
        let transport = self.link.take();
        if let Some(transport) = &transport {
            transport.disconnect();
        }
        if let Some(task) = lock(&self.keepalive).take() {
            task.abort();
        }
        *lock(&self.sync) = SyncProgress::default();
        let was = std::mem::replace(&mut *write(&self.state), NsState::Disconnected);

        write(&self.contacts).clear();
        self.switchboards.close_all();
        self.p2p.abort_all(reason);

        if transport.is_some() || was != NsState::Disconnected {
            info!(%reason, "Nameserver disconnected");
            self.events.emit(MessengerEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn handle_frame(&self, transport: &Transport, frame: &Frame) {
        match frame.command.as_str() {
            "SYN" => self.on_sync_header(frame),
            "LSG" => self.on_group_line(frame),
            "LST" => self.on_contact_line(frame),
            "ILN" | "NLN" => self.on_presence(frame),
            "FLN" => self.on_offline(frame),
            "UBX" => self.on_personal_message(frame),
            "ADC" => self.on_list_add(frame),
            "REM" => self.on_list_remove(frame),
            "ADG" => self.on_group_added(frame),
            "RMG" => self.on_group_removed(frame),
            "REG" => self.on_group_renamed(frame),
            "CHG" => {
                if let Some(status) = frame.param(0).and_then(PresenceStatus::from_code) {
                    lock(&self.profile).status = status;
                }
            }
            "PRP" => {
                if let (Some("MFN"), Some(name)) = (frame.param(0), frame.param(1)) {
                    lock(&self.profile).display_name = decode_name(name);
                }
            }
            "RNG" => self.on_ring(frame),
            "OUT" => {
                let reason = frame.param(0).map(str::to_string);
                info!(reason = ?reason, "Server ended the session");
                self.events.emit(MessengerEvent::SignedOut { reason });
                transport.disconnect();
            }
            "QNG" => trace!(next = ?frame.param(0), "Keepalive acknowledged"),
            "XFR" => trace!(trid = ?frame.trid, "Switchboard referral"),
            _ => {
                if let Some(code) = frame.error_code() {
                    let pending = frame.trid.is_some_and(|t| transport.has_waiter(t));
                    if !pending {
                        warn!(code, trid = ?frame.trid, "Unsolicited server error");
                        self.events.emit(MessengerEvent::ServerError { code });
                    }
                } else {
                    trace!(command = %frame.command, "Ignoring nameserver frame");
                }
            }
        }
    }

    fn on_sync_header(&self, frame: &Frame) {
        // SYN trid version version contacts groups
        let contacts = frame.param(2).and_then(|v| v.parse().ok()).unwrap_or(0);
        let groups = frame.param(3).and_then(|v| v.parse().ok()).unwrap_or(0);
        let mut sync = lock(&self.sync);
        sync.expected = Some((contacts, groups));
        sync.check();
    }

    fn on_group_line(&self, frame: &Frame) {
        // LSG name id
        if let (Some(name), Some(id)) = (frame.param(0), frame.param(1)) {
            write(&self.contacts).add_group(Group {
                id: id.to_string(),
                name: decode_name(name),
            });
        }
        let mut sync = lock(&self.sync);
        sync.groups += 1;
        sync.check();
    }

    fn on_contact_line(&self, frame: &Frame) {
        let fields = ListFields::parse(&frame.params);
        if let Some(account) = &fields.account {
            let mut contact = Contact::new(account.as_str());
            contact.display_name = fields.name.clone().unwrap_or_else(|| account.clone());
            contact.guid = fields.guid.clone();
            contact.lists = ListMembership::from_bits(fields.lists.unwrap_or(0));
            contact.groups = fields.groups.clone();
            if let Some(client_type) = fields.network.and_then(ClientType::from_network_id) {
                contact.client_type = client_type;
            }
            write(&self.contacts).upsert(contact);
        } else {
            debug!(line = %frame, "Contact line without account");
        }
        let mut sync = lock(&self.sync);
        sync.contacts += 1;
        sync.check();
    }

    fn on_presence(&self, frame: &Frame) {
        // ILN trid status account network name caps [object]
        // NLN status account network name caps [object]
        let Some(status) = frame.param(0).and_then(PresenceStatus::from_code) else {
            debug!(line = %frame, "Presence with unknown status");
            return;
        };
        let Some(account) = frame.param(1) else { return };
        let (network, rest) = match frame.param(2).and_then(|n| n.parse::<u32>().ok()) {
            Some(network) if frame.params.len() > 3 => (Some(network), 3),
            _ => (None, 2),
        };
        let name = frame.param(rest).map(decode_name);
        let capabilities = frame.param(rest + 1).and_then(|c| c.parse::<u64>().ok());
        let picture = frame
            .param(rest + 2)
            .and_then(|p| ContentDescriptor::from_param(p).ok());

        let display_name = {
            let mut contacts = write(&self.contacts);
            let contact = contacts.entry(account);
            contact.status = status;
            if let Some(name) = name {
                contact.display_name = name;
            }
            if let Some(capabilities) = capabilities {
                contact.capabilities = capabilities;
            }
            if let Some(client_type) = network.and_then(ClientType::from_network_id) {
                contact.client_type = client_type;
            }
            contact.display_image = picture;
            contact.display_name.clone()
        };
        debug!(account, %status, "Presence changed");
        self.events.emit(MessengerEvent::PresenceChanged {
            account: account.to_string(),
            status,
            display_name,
        });
    }

    fn on_offline(&self, frame: &Frame) {
        let Some(account) = frame.param(0) else { return };
        let display_name = {
            let mut contacts = write(&self.contacts);
            let contact = contacts.entry(account);
            contact.status = PresenceStatus::Offline;
            contact.display_name.clone()
        };
        debug!(account, "Contact went offline");
        self.events.emit(MessengerEvent::PresenceChanged {
            account: account.to_string(),
            status: PresenceStatus::Offline,
            display_name,
        });
    }

    fn on_personal_message(&self, frame: &Frame) {
        let Some(account) = frame.param(0) else { return };
        let message = personal_message(frame.payload_bytes()).unwrap_or_default();
        write(&self.contacts).entry(account).personal_message = message.clone();
        self.events.emit(MessengerEvent::PersonalMessageChanged {
            account: account.to_string(),
            message,
        });
    }

    fn on_list_add(&self, frame: &Frame) {
        // ADC trid list N=account [F=name] [C=guid] | ADC trid FL C=guid group
        let Some(list) = frame.param(0).and_then(ListMembership::from_code) else {
            return;
        };
        let fields = ListFields::parse(&frame.params[1..]);
        let mut contacts = write(&self.contacts);

        if let Some(account) = &fields.account {
            let contact = contacts.entry(account);
            contact.lists.insert(list);
            if let Some(name) = &fields.name {
                contact.display_name = name.clone();
            }
            if fields.guid.is_some() {
                contact.guid = fields.guid.clone();
            }
            drop(contacts);
            info!(account = %account, list = ?list.code(), "Contact added to list");
            self.events.emit(MessengerEvent::ContactAdded {
                account: account.clone(),
                list,
            });
        } else if let (Some(guid), Some(group)) = (&fields.guid, fields.groups.first()) {
            let contact = contacts
                .contacts()
                .find(|c| c.guid.as_deref() == Some(guid.as_str()))
                .map(|c| c.account.clone());
            if let Some(account) = contact {
                if let Some(contact) = contacts.get_mut(&account) {
                    if !contact.groups.contains(group) {
                        contact.groups.push(group.clone());
                    }
                }
            }
        }
    }

    fn on_list_remove(&self, frame: &Frame) {
        // REM trid list account|guid [group]
        let (Some(list), Some(target)) = (
            frame.param(0).and_then(ListMembership::from_code),
            frame.param(1),
        ) else {
            return;
        };
        let mut contacts = write(&self.contacts);
        let account = contacts
            .contacts()
            .find(|c| c.guid.as_deref() == Some(target) || c.account.eq_ignore_ascii_case(target))
            .map(|c| c.account.clone());
        let Some(account) = account else { return };

        if let Some(group) = frame.param(2) {
            if let Some(contact) = contacts.get_mut(&account) {
                contact.groups.retain(|g| g != group);
            }
            return;
        }

        let now_empty = match contacts.get_mut(&account) {
            Some(contact) => {
                contact.lists.remove(list);
                contact.lists.is_empty()
            }
            None => false,
        };
        if now_empty {
            contacts.remove(&account);
        }
        drop(contacts);
        info!(account = %account, list = ?list.code(), "Contact removed from list");
        self.events
            .emit(MessengerEvent::ContactRemoved { account, list });
    }

    fn on_group_added(&self, frame: &Frame) {
        // ADG trid name id
        if let (Some(name), Some(id)) = (frame.param(0), frame.param(1)) {
            write(&self.contacts).add_group(Group {
                id: id.to_string(),
                name: decode_name(name),
            });
        }
    }

    fn on_group_removed(&self, frame: &Frame) {
        if let Some(id) = frame.param(0) {
            write(&self.contacts).remove_group(id);
        }
    }

    fn on_group_renamed(&self, frame: &Frame) {
        if let (Some(id), Some(name)) = (frame.param(0), frame.param(1)) {
            write(&self.contacts).rename_group(id, decode_name(name));
        }
    }

    fn on_ring(&self, frame: &Frame) {
        // RNG session address CKI ticket inviter name
        match (frame.param(0), frame.param(1), frame.param(3), frame.param(4)) {
            (Some(session), Some(address), Some(ticket), Some(inviter)) => {
                info!(inviter, address, "Switchboard invitation");
                self.switchboards.accept_invitation(RingInvitation {
                    session: session.to_string(),
                    address: address.to_string(),
                    ticket: ticket.to_string(),
                    inviter: inviter.to_string(),
                });
            }
            _ => warn!(line = %frame, "Malformed switchboard invitation"),
        }
    }
}

/// Frame handler registered on the nameserver transport.
struct NsHandler {
    ns: Weak<Nameserver>,
}

impl FrameHandler for NsHandler {
    fn handle_frame(&self, transport: &Transport, frame: &Frame) {
        if let Some(ns) = self.ns.upgrade() {
            ns.handle_frame(transport, frame);
        }
    }

    fn connection_closed(&self, transport: &Transport, reason: &CloseReason) {
        let Some(ns) = self.ns.upgrade() else { return };
        // Redirected or replaced transports are not the session's connection.
        if ns.link.is_current(transport) {
            ns.teardown(&reason.to_string());
        }
    }
}

/// `N=`, `F=`, `C=` fields followed by list bits, network and groups.
#[derive(Debug, Default, PartialEq, Eq)]
struct ListFields {
    account: Option<String>,
    name: Option<String>,
    guid: Option<String>,
    lists: Option<u8>,
    network: Option<u32>,
    groups: Vec<String>,
}

impl ListFields {
    fn parse(params: &[String]) -> Self {
        let mut fields = Self::default();
        for param in params {
            if let Some(account) = param.strip_prefix("N=") {
                fields.account = Some(account.to_string());
            } else if let Some(name) = param.strip_prefix("F=") {
                fields.name = Some(decode_name(name));
            } else if let Some(guid) = param.strip_prefix("C=") {
                fields.guid = Some(guid.to_string());
            } else if let Ok(number) = param.parse::<u32>() {
                if fields.lists.is_none() {
                    fields.lists = u8::try_from(number).ok();
                } else {
                    fields.network = Some(number);
                }
            } else {
                fields
                    .groups
                    .extend(param.split(',').filter(|g| !g.is_empty()).map(str::to_string));
            }
        }
        fields
    }
}

fn decode_name(name: &str) -> String {
    urlencoding::decode(name)
        .map(|n| n.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

/// Builds the `<ml>` membership document sent with `ADL`.
fn membership_xml(contacts: &ContactList) -> String {
    let relevant = ListMembership::FORWARD | ListMembership::ALLOW | ListMembership::BLOCK;
    let mut domains: BTreeMap<String, Vec<(String, u8, u32)>> = BTreeMap::new();
    for contact in contacts.contacts() {
        let lists = contact.lists.bits() & relevant.bits();
        if lists == 0 {
            continue;
        }
        let Some((user, domain)) = contact.account.split_once('@') else {
            continue;
        };
        domains.entry(domain.to_ascii_lowercase()).or_default().push((
            user.to_string(),
            lists,
            contact.client_type.network_id(),
        ));
    }

    let mut xml = String::from(r#"<ml l="1">"#);
    for (domain, users) in &domains {
        xml.push_str(&format!(r#"<d n="{}">"#, escape(domain.as_str())));
        for (user, lists, network) in users {
            xml.push_str(&format!(
                r#"<c n="{}" l="{}" t="{}"/>"#,
                escape(user.as_str()),
                lists,
                network
            ));
        }
        xml.push_str("</d>");
    }
    xml.push_str("</ml>");
    xml
}

/// Extracts the `<PSM>` text from a `UBX` payload.
fn personal_message(payload: &[u8]) -> Option<String> {
    let xml = std::str::from_utf8(payload).ok()?;
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"PSM" => inside = true,
            Ok(Event::Text(text)) if inside => {
                return Some(text.unescape().unwrap_or_default().into_owned());
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"PSM" => return Some(String::new()),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"PSM" => return Some(String::new()),
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(line: &str) -> Vec<String> {
        line.split(' ').map(str::to_string).collect()
    }

    #[test]
    fn list_fields_from_contact_line() {
        let fields = ListFields::parse(&params(
            "N=bob@example.com F=Bob%20Smith C=5f3a-77 11 1 g1,g2",
        ));
        assert_eq!(fields.account.as_deref(), Some("bob@example.com"));
        assert_eq!(fields.name.as_deref(), Some("Bob Smith"));
        assert_eq!(fields.guid.as_deref(), Some("5f3a-77"));
        assert_eq!(fields.lists, Some(11));
        assert_eq!(fields.network, Some(1));
        assert_eq!(fields.groups, vec!["g1", "g2"]);
    }

    #[test]
    fn list_fields_group_membership() {
        let fields = ListFields::parse(&params("C=5f3a-77 d6d4-group"));
        assert_eq!(fields.account, None);
        assert_eq!(fields.groups, vec!["d6d4-group"]);
    }

    #[test]
    fn membership_document_groups_by_domain() {
        let mut contacts = ContactList::new();
        let mut bob = Contact::new("bob@example.com");
        bob.lists = ListMembership::FORWARD | ListMembership::ALLOW | ListMembership::REVERSE;
        contacts.upsert(bob);
        let mut carol = Contact::new("carol@example.com");
        carol.lists = ListMembership::BLOCK;
        contacts.upsert(carol);
        let mut fan = Contact::new("fan@other.org");
        fan.lists = ListMembership::REVERSE;
        contacts.upsert(fan);

        insta::assert_snapshot!(
            membership_xml(&contacts),
            @r#"<ml l="1"><d n="example.com"><c n="bob" l="3" t="1"/><c n="carol" l="4" t="1"/></d></ml>"#
        );
    }

    #[test]
    fn empty_membership_document() {
        assert_eq!(membership_xml(&ContactList::new()), r#"<ml l="1"></ml>"#);
    }

    #[test]
    fn personal_message_extraction() {
        assert_eq!(
            personal_message(b"<Data><PSM>gone fishing &amp; back</PSM><CurrentMedia></CurrentMedia></Data>"),
            Some("gone fishing & back".to_string())
        );
        assert_eq!(personal_message(b"<Data><PSM></PSM></Data>"), Some(String::new()));
        assert_eq!(personal_message(b"<Data></Data>"), None);
    }

    #[tokio::test]
    async fn static_ticket() {
        let provider = StaticTicket("t=abc".to_string());
        assert_eq!(provider.ticket("a@b.c", "MBI", "nonce").await.unwrap(), "t=abc");
    }

    #[test]
    fn sync_progress_completes_when_counts_reached() {
        let (tx, mut rx) = oneshot::channel();
        let mut progress = SyncProgress {
            done: Some(tx),
            ..SyncProgress::default()
        };
        progress.check();
        assert!(rx.try_recv().is_err());

        progress.expected = Some((1, 1));
        progress.groups = 1;
        progress.check();
        assert!(rx.try_recv().is_err());

        progress.contacts = 1;
        progress.check();
        assert!(rx.try_recv().is_ok());
    }
}
