//! Contacts, groups and the contact list.
//!
//! The contact list is populated by the nameserver during synchronization and
//! kept current by presence and list-edit notifications. Accounts are
//! compared case-insensitively, so the list is keyed by the lower-cased
//! account name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::object::ContentDescriptor;

/// Presence state advertised by a contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Busy,
    Away,
    Idle,
    BeRightBack,
    OnThePhone,
    OutToLunch,
    /// Signed in but appearing offline.
    Hidden,
    #[default]
    Offline,
}

impl PresenceStatus {
    /// Three-letter wire code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Online => "NLN",
            Self::Busy => "BSY",
            Self::Away => "AWY",
            Self::Idle => "IDL",
            Self::BeRightBack => "BRB",
            Self::OnThePhone => "PHN",
            Self::OutToLunch => "LUN",
            Self::Hidden => "HDN",
            Self::Offline => "FLN",
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "NLN" => Self::Online,
            "BSY" => Self::Busy,
            "AWY" => Self::Away,
            "IDL" => Self::Idle,
            "BRB" => Self::BeRightBack,
            "PHN" => Self::OnThePhone,
            "LUN" => Self::OutToLunch,
            "HDN" => Self::Hidden,
            "FLN" => Self::Offline,
            _ => return None,
        })
    }

    pub fn is_online(self) -> bool {
        !matches!(self, Self::Offline | Self::Hidden)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Away => "away",
            Self::Idle => "idle",
            Self::BeRightBack => "be right back",
            Self::OnThePhone => "on the phone",
            Self::OutToLunch => "out to lunch",
            Self::Hidden => "hidden",
            Self::Offline => "offline",
        };
        f.write_str(label)
    }
}

impl FromStr for PresenceStatus {
    type Err = String;

    /// Accepts either the wire code or the lowercase name used in config files.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(status) = Self::from_code(&s.to_ascii_uppercase()) {
            return Ok(status);
        }
        match s.to_ascii_lowercase().replace(['-', '_'], " ").as_str() {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "away" => Ok(Self::Away),
            "idle" => Ok(Self::Idle),
            "be right back" | "brb" => Ok(Self::BeRightBack),
            "on the phone" | "phone" => Ok(Self::OnThePhone),
            "out to lunch" | "lunch" => Ok(Self::OutToLunch),
            "hidden" | "invisible" => Ok(Self::Hidden),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown presence status: {other}")),
        }
    }
}

/// Network a contact belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Passport,
    Lcs,
    Mobile,
    Yahoo,
}

impl ClientType {
    pub fn network_id(self) -> u32 {
        match self {
            Self::Passport => 1,
            Self::Lcs => 2,
            Self::Mobile => 4,
            Self::Yahoo => 32,
        }
    }

    pub fn from_network_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Passport),
            2 => Some(Self::Lcs),
            4 => Some(Self::Mobile),
            32 => Some(Self::Yahoo),
            _ => None,
        }
    }
}

/// Bit set of the server-side lists a contact is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListMembership(u8);

impl ListMembership {
    pub const NONE: Self = Self(0);
    /// Forward list: people the user has added.
    pub const FORWARD: Self = Self(1);
    /// Allow list.
    pub const ALLOW: Self = Self(2);
    /// Block list.
    pub const BLOCK: Self = Self(4);
    /// Reverse list: people who have added the user.
    pub const REVERSE: Self = Self(8);
    /// Pending list: additions the user has not acknowledged yet.
    pub const PENDING: Self = Self(16);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x1f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Two-letter list code used by `ADC`/`REM`.
    pub fn code(self) -> Option<&'static str> {
        match self {
            Self::FORWARD => Some("FL"),
            Self::ALLOW => Some("AL"),
            Self::BLOCK => Some("BL"),
            Self::REVERSE => Some("RL"),
            Self::PENDING => Some("PL"),
            _ => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "FL" => Some(Self::FORWARD),
            "AL" => Some(Self::ALLOW),
            "BL" => Some(Self::BLOCK),
            "RL" => Some(Self::REVERSE),
            "PL" => Some(Self::PENDING),
            _ => None,
        }
    }
}

impl std::ops::BitOr for ListMembership {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A user group on the contact list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

/// A single contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub account: String,
    pub display_name: String,
    pub client_type: ClientType,
    pub status: PresenceStatus,
    /// Client capability bits announced with presence.
    pub capabilities: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_image: Option<ContentDescriptor>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub personal_message: String,
    pub lists: ListMembership,
    pub groups: Vec<String>,
    /// Server-assigned contact id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
}

impl Contact {
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        Self {
            display_name: account.clone(),
            account,
            client_type: ClientType::default(),
            status: PresenceStatus::Offline,
            capabilities: 0,
            display_image: None,
            personal_message: String::new(),
            lists: ListMembership::NONE,
            groups: Vec::new(),
            guid: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.is_online()
    }

    pub fn is_blocked(&self) -> bool {
        self.lists.contains(ListMembership::BLOCK)
    }
}

fn key(account: &str) -> String {
    account.to_ascii_lowercase()
}

/// Contacts and groups of the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactList {
    contacts: BTreeMap<String, Contact>,
    groups: BTreeMap<String, Group>,
}

impl ContactList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &str) -> Option<&Contact> {
        self.contacts.get(&key(account))
    }

    pub fn get_mut(&mut self, account: &str) -> Option<&mut Contact> {
        self.contacts.get_mut(&key(account))
    }

    /// Returns the contact for `account`, creating an empty one if needed.
    pub fn entry(&mut self, account: &str) -> &mut Contact {
        self.contacts
            .entry(key(account))
            .or_insert_with(|| Contact::new(account))
    }

    /// Inserts or replaces a contact, returning the previous value.
    pub fn upsert(&mut self, contact: Contact) -> Option<Contact> {
        self.contacts.insert(key(&contact.account), contact)
    }

    pub fn remove(&mut self, account: &str) -> Option<Contact> {
        self.contacts.remove(&key(account))
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// Contacts on the given list.
    pub fn on_list(&self, list: ListMembership) -> impl Iterator<Item = &Contact> {
        self.contacts.values().filter(move |c| c.lists.contains(list))
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.id.clone(), group);
    }

    /// Removes a group and drops it from every contact's group set.
    pub fn remove_group(&mut self, id: &str) -> Option<Group> {
        let removed = self.groups.remove(id)?;
        for contact in self.contacts.values_mut() {
            contact.groups.retain(|g| g != id);
        }
        Some(removed)
    }

    pub fn rename_group(&mut self, id: &str, name: impl Into<String>) -> bool {
        match self.groups.get_mut(id) {
            Some(group) => {
                group.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Marks every contact offline.
    pub fn set_all_offline(&mut self) {
        for contact in self.contacts.values_mut() {
            contact.status = PresenceStatus::Offline;
        }
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_roundtrip() {
        for status in [
            PresenceStatus::Online,
            PresenceStatus::Busy,
            PresenceStatus::Away,
            PresenceStatus::Idle,
            PresenceStatus::BeRightBack,
            PresenceStatus::OnThePhone,
            PresenceStatus::OutToLunch,
            PresenceStatus::Hidden,
            PresenceStatus::Offline,
        ] {
            assert_eq!(PresenceStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(PresenceStatus::from_code("XXX"), None);
    }

    #[test]
    fn status_from_str_accepts_names_and_codes() {
        assert_eq!("busy".parse::<PresenceStatus>(), Ok(PresenceStatus::Busy));
        assert_eq!("awy".parse::<PresenceStatus>(), Ok(PresenceStatus::Away));
        assert_eq!("be-right-back".parse::<PresenceStatus>(), Ok(PresenceStatus::BeRightBack));
        assert_eq!("invisible".parse::<PresenceStatus>(), Ok(PresenceStatus::Hidden));
        assert!("sleepy".parse::<PresenceStatus>().is_err());
    }

    #[test]
    fn hidden_is_not_online() {
        assert!(PresenceStatus::Busy.is_online());
        assert!(!PresenceStatus::Hidden.is_online());
        assert!(!PresenceStatus::Offline.is_online());
    }

    #[test]
    fn network_ids() {
        assert_eq!(ClientType::Yahoo.network_id(), 32);
        assert_eq!(ClientType::from_network_id(1), Some(ClientType::Passport));
        assert_eq!(ClientType::from_network_id(3), None);
    }

    #[test]
    fn membership_bits() {
        let mut lists = ListMembership::FORWARD | ListMembership::ALLOW;
        assert_eq!(lists.bits(), 3);
        assert!(lists.contains(ListMembership::FORWARD));
        assert!(!lists.contains(ListMembership::BLOCK));
        assert!(!lists.contains(ListMembership::NONE));

        lists.insert(ListMembership::REVERSE);
        lists.remove(ListMembership::FORWARD);
        assert_eq!(lists.bits(), 10);
        assert_eq!(ListMembership::from_bits(0xff).bits(), 0x1f);
    }

    #[test]
    fn membership_codes() {
        assert_eq!(ListMembership::BLOCK.code(), Some("BL"));
        assert_eq!(ListMembership::from_code("RL"), Some(ListMembership::REVERSE));
        assert_eq!((ListMembership::FORWARD | ListMembership::ALLOW).code(), None);
    }

    #[test]
    fn accounts_are_case_insensitive() {
        let mut list = ContactList::new();
        list.upsert(Contact::new("Bob@Example.com"));

        assert!(list.get("bob@example.com").is_some());
        list.entry("BOB@EXAMPLE.COM").display_name = "Bob".to_string();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("bob@example.com").unwrap().display_name, "Bob");
        assert_eq!(list.get("bob@example.com").unwrap().account, "Bob@Example.com");
    }

    #[test]
    fn entry_creates_offline_contact() {
        let mut list = ContactList::new();
        let contact = list.entry("alice@example.com");
        assert_eq!(contact.status, PresenceStatus::Offline);
        assert_eq!(contact.display_name, "alice@example.com");
    }

    #[test]
    fn removing_group_detaches_contacts() {
        let mut list = ContactList::new();
        list.add_group(Group { id: "g1".into(), name: "Friends".into() });
        let mut contact = Contact::new("bob@example.com");
        contact.groups.push("g1".into());
        list.upsert(contact);

        assert!(list.rename_group("g1", "Pals"));
        assert_eq!(list.group("g1").unwrap().name, "Pals");

        assert!(list.remove_group("g1").is_some());
        assert!(list.get("bob@example.com").unwrap().groups.is_empty());
        assert!(!list.rename_group("g1", "Gone"));
    }

    #[test]
    fn on_list_filters_by_membership() {
        let mut list = ContactList::new();
        let mut blocked = Contact::new("spam@example.com");
        blocked.lists = ListMembership::BLOCK;
        list.upsert(blocked);
        let mut friend = Contact::new("bob@example.com");
        friend.lists = ListMembership::FORWARD | ListMembership::ALLOW;
        list.upsert(friend);

        let blocked: Vec<_> = list.on_list(ListMembership::BLOCK).collect();
        assert_eq!(blocked.len(), 1);
        assert!(blocked[0].is_blocked());
    }

    #[test]
    fn set_all_offline_and_clear() {
        let mut list = ContactList::new();
        list.entry("bob@example.com").status = PresenceStatus::Online;
        list.set_all_offline();
        assert_eq!(list.get("bob@example.com").unwrap().status, PresenceStatus::Offline);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.group_count(), 0);
    }
}
