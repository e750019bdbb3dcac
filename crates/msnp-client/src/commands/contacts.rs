//! Contact list commands.

use std::time::Duration;

use msnp_core::{Contact, ListMembership, PresenceStatus};
use msnp_engine::MessengerEvent;

use super::Session;
use crate::error::{ClientError, ClientResult};

/// How long presence notifications are collected after login.
const PRESENCE_SETTLE: Duration = Duration::from_secs(2);

/// Prints the forward list, as a table or JSON.
pub async fn list(mut session: Session, online_only: bool, json: bool) -> ClientResult<()> {
    // Initial presence (ILN) follows the login; give it a moment.
    session
        .wait_for(PRESENCE_SETTLE, |_: &MessengerEvent| None::<()>)
        .await?;

    let mut contacts: Vec<Contact> = {
        let list = session.messenger.contacts();
        let list = list
            .read()
            .map_err(|_| ClientError::Usage("contact list unavailable".to_string()))?;
        list.on_list(ListMembership::FORWARD)
            .filter(|c| !online_only || c.is_online())
            .cloned()
            .collect()
    };
    contacts.sort_by(|a, b| a.account.cmp(&b.account));
    session.sign_out();

    if json {
        let out = serde_json::to_string_pretty(&contacts)
            .map_err(|e| ClientError::Usage(format!("failed to serialize contacts: {e}")))?;
        println!("{out}");
    } else {
        print!("{}", render_table(&contacts));
    }
    Ok(())
}

pub async fn block(session: Session, contact: &str) -> ClientResult<()> {
    session.messenger.block(contact).await?;
    println!("Blocked {contact}.");
    session.sign_out();
    Ok(())
}

pub async fn unblock(session: Session, contact: &str) -> ClientResult<()> {
    session.messenger.unblock(contact).await?;
    println!("Unblocked {contact}.");
    session.sign_out();
    Ok(())
}

fn marker(status: PresenceStatus) -> char {
    match status {
        PresenceStatus::Online => '+',
        PresenceStatus::Offline | PresenceStatus::Hidden => ' ',
        _ => '~',
    }
}

/// One line per contact: presence marker, account, name, status and
/// personal message.
pub fn render_table(contacts: &[Contact]) -> String {
    if contacts.is_empty() {
        return "No contacts.\n".to_string();
    }
    let width = contacts.iter().map(|c| c.account.len()).max().unwrap_or(0);
    let mut out = String::new();
    for contact in contacts {
        let mut line = format!(
            "{} {:width$}  {} ({})",
            marker(contact.status),
            contact.account,
            contact.display_name,
            contact.status,
        );
        if contact.is_blocked() {
            line.push_str(" [blocked]");
        }
        if !contact.personal_message.is_empty() {
            line.push_str(" - ");
            line.push_str(&contact.personal_message);
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(account: &str, status: PresenceStatus) -> Contact {
        let mut contact = Contact::new(account);
        contact.display_name = account.split('@').next().unwrap_or_default().to_string();
        contact.status = status;
        contact.lists = ListMembership::FORWARD | ListMembership::ALLOW;
        contact
    }

    #[test]
    fn table_aligns_accounts() {
        let mut carol = contact("carol@example.org", PresenceStatus::Away);
        carol.personal_message = "lunch".to_string();
        let contacts = [contact("bob@example.com", PresenceStatus::Online), carol];
        assert_eq!(
            render_table(&contacts),
            "+ bob@example.com    bob (online)\n\
             ~ carol@example.org  carol (away) - lunch\n"
        );
    }

    #[test]
    fn blocked_and_offline_contacts() {
        let mut dave = contact("dave@example.com", PresenceStatus::Offline);
        dave.lists.insert(ListMembership::BLOCK);
        assert_eq!(
            render_table(&[dave]),
            "  dave@example.com  dave (offline) [blocked]\n"
        );
    }

    #[test]
    fn empty_list() {
        assert_eq!(render_table(&[]), "No contacts.\n");
    }
}
