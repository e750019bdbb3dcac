//! The engine facade.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use msnp_core::{Contact, ContactList, ContentDescriptor, ListMembership, ObjectKind, PresenceStatus};
use msnp_protocol::SessionId;
use tokio::sync::mpsc;
use tracing::info;

use crate::cache::ObjectCache;
use crate::config::EngineConfig;
use crate::conversation::{Conversation, ConversationId};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, MessengerEvent};
use crate::nameserver::{Nameserver, NsLink, NsState, SharedAccount, TicketProvider};
use crate::p2p::{P2pManager, TransferInfo};
use crate::switchboard::SwitchboardLayer;
use crate::sync::read;

/// One messenger account session.
///
/// Owns the nameserver connection, every switchboard and conversation,
/// transfers, the contact list and the object cache. Everything that
/// happens is reported on the event channel returned by [`Messenger::new`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use msnp_engine::{EngineConfig, Messenger, MessengerEvent, StaticTicket};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let tickets = Arc::new(StaticTicket("t=ticket".to_string()));
///     let (messenger, mut events) = Messenger::new(EngineConfig::default(), tickets);
///     messenger.login("alice@example.com").await?;
///
///     let chat = messenger.open_conversation(&["bob@example.com".to_string()])?;
///     chat.send_text("hello").await?;
///
///     while let Some(event) = events.recv().await {
///         if let MessengerEvent::TextMessageReceived { from, text, .. } = event {
///             println!("{from}: {text}");
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Messenger {
    account: SharedAccount,
    contacts: Arc<RwLock<ContactList>>,
    cache: Arc<ObjectCache>,
    nameserver: Arc<Nameserver>,
    switchboards: Arc<SwitchboardLayer>,
    p2p: Arc<P2pManager>,
}

impl Messenger {
    pub fn new(
        config: EngineConfig,
        tickets: Arc<dyn TicketProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (events, rx) = EventSink::channel();
        let account: SharedAccount = Arc::default();
        let link = NsLink::default();
        let contacts = Arc::new(RwLock::new(ContactList::new()));
        let cache = Arc::new(ObjectCache::new(config.cache_capacity_bytes));

        let switchboards =
            SwitchboardLayer::new(config.clone(), account.clone(), link.clone(), events.clone());
        let p2p = P2pManager::new(config.clone(), cache.clone(), switchboards.clone(), events.clone());
        let nameserver = Arc::new(Nameserver::new(
            config,
            account.clone(),
            link,
            contacts.clone(),
            switchboards.clone(),
            p2p.clone(),
            tickets,
            events,
        ));

        let messenger = Self {
            account,
            contacts,
            cache,
            nameserver,
            switchboards,
            p2p,
        };
        (messenger, rx)
    }

    /// Signs in. Returns once the contact list is synchronized and the
    /// initial presence is set.
    pub async fn login(&self, account: &str) -> EngineResult<()> {
        self.nameserver.login(account).await
    }

    pub fn sign_out(&self) {
        info!(account = %self.account(), "Signing out");
        self.nameserver.sign_out();
    }

    pub fn state(&self) -> NsState {
        self.nameserver.state()
    }

    pub fn is_ready(&self) -> bool {
        self.nameserver.is_ready()
    }

    pub fn account(&self) -> String {
        read(&self.account).clone()
    }

    /// Our presence as last confirmed by the server.
    pub fn status(&self) -> PresenceStatus {
        self.nameserver.status()
    }

    pub fn display_name(&self) -> String {
        self.nameserver.display_name()
    }

    /// The contact list, kept current by the nameserver session.
    pub fn contacts(&self) -> Arc<RwLock<ContactList>> {
        self.contacts.clone()
    }

    pub fn contact(&self, account: &str) -> Option<Contact> {
        read(&self.contacts).get(account).cloned()
    }

    pub fn cache(&self) -> Arc<ObjectCache> {
        self.cache.clone()
    }

    pub async fn add_contact(&self, account: &str, list: ListMembership) -> EngineResult<()> {
        self.nameserver.add_contact(account, list).await
    }

    pub async fn remove_contact(&self, account: &str, list: ListMembership) -> EngineResult<()> {
        self.nameserver.remove_contact(account, list).await
    }

    /// Moves `account` from the allow list to the block list.
    pub async fn block(&self, account: &str) -> EngineResult<()> {
        if self
            .contact(account)
            .is_some_and(|c| c.lists.contains(ListMembership::ALLOW))
        {
            self.nameserver
                .remove_contact(account, ListMembership::ALLOW)
                .await?;
        }
        self.nameserver
            .add_contact(account, ListMembership::BLOCK)
            .await
    }

    /// Moves `account` from the block list to the allow list.
    pub async fn unblock(&self, account: &str) -> EngineResult<()> {
        if self
            .contact(account)
            .is_some_and(|c| c.lists.contains(ListMembership::BLOCK))
        {
            self.nameserver
                .remove_contact(account, ListMembership::BLOCK)
                .await?;
        }
        self.nameserver
            .add_contact(account, ListMembership::ALLOW)
            .await
    }

    pub async fn add_group(&self, name: &str) -> EngineResult<String> {
        self.nameserver.add_group(name).await
    }

    pub async fn remove_group(&self, id: &str) -> EngineResult<()> {
        self.nameserver.remove_group(id).await
    }

    pub async fn rename_group(&self, id: &str, name: &str) -> EngineResult<()> {
        self.nameserver.rename_group(id, name).await
    }

    pub async fn set_status(&self, status: PresenceStatus) -> EngineResult<()> {
        self.nameserver.set_status(status).await
    }

    pub async fn set_display_name(&self, name: &str) -> EngineResult<()> {
        self.nameserver.set_display_name(name).await
    }

    pub async fn set_personal_message(&self, message: &str) -> EngineResult<()> {
        self.nameserver.set_personal_message(message).await
    }

    /// Publishes `data` as the display picture and announces it.
    pub async fn set_display_picture(&self, data: Bytes, name: &str) -> EngineResult<ContentDescriptor> {
        let descriptor = self.publish_object(ObjectKind::Avatar, name, data)?;
        self.nameserver
            .set_display_picture(Some(descriptor.clone()))
            .await?;
        Ok(descriptor)
    }

    pub async fn clear_display_picture(&self) -> EngineResult<()> {
        self.nameserver.set_display_picture(None).await
    }

    /// Stores one of our own objects so peers can request it.
    pub fn publish_object(&self, kind: ObjectKind, name: &str, data: Bytes) -> EngineResult<ContentDescriptor> {
        let descriptor = ContentDescriptor::for_content(self.account(), kind, name, &data);
        self.cache.publish(descriptor.clone(), data)?;
        Ok(descriptor)
    }

    /// Opens (or reuses) a conversation with exactly `participants`.
    pub fn open_conversation(&self, participants: &[String]) -> EngineResult<Conversation> {
        let id = self.switchboards.open(participants)?;
        Ok(Conversation::new(id, self.switchboards.clone()))
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.switchboards
            .is_open(id)
            .then(|| Conversation::new(id, self.switchboards.clone()))
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.switchboards
            .conversations()
            .into_iter()
            .map(|id| Conversation::new(id, self.switchboards.clone()))
            .collect()
    }

    /// Offers an object to `account`.
    pub async fn send_object(
        &self,
        account: &str,
        descriptor: ContentDescriptor,
        data: Bytes,
    ) -> EngineResult<SessionId> {
        self.p2p.send_object(account, descriptor, data).await
    }

    /// Fetches an object from `account`, or from the cache if it is there.
    pub async fn request_object(&self, account: &str, descriptor: ContentDescriptor) -> EngineResult<Bytes> {
        self.p2p.request_object(account, descriptor).await
    }

    /// Fetches the display picture `account` currently advertises.
    pub async fn fetch_display_picture(&self, account: &str) -> EngineResult<Option<Bytes>> {
        let Some(descriptor) = self.contact(account).and_then(|c| c.display_image) else {
            return Ok(None);
        };
        if descriptor.kind != ObjectKind::Avatar {
            return Err(EngineError::invalid_state(format!(
                "{account} advertises a {} as display picture",
                descriptor.kind
            )));
        }
        self.request_object(account, descriptor).await.map(Some)
    }

    pub fn accept_transfer(&self, session: SessionId) -> EngineResult<()> {
        self.p2p.accept(session)
    }

    pub fn decline_transfer(&self, session: SessionId) -> EngineResult<()> {
        self.p2p.decline(session)
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.p2p.transfers()
    }
}
