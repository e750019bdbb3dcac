//! File and display picture transfers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use msnp_core::{ContentDescriptor, ObjectKind};
use msnp_engine::{MessengerEvent, TransferOutcome};
use tracing::info;

use super::Session;
use crate::error::{ClientError, ClientResult};

/// How long the peer has to accept and finish a transfer.
const TRANSFER_LIMIT: Duration = Duration::from_secs(600);

/// How long to wait for the peer's presence to name a picture.
const PRESENCE_LIMIT: Duration = Duration::from_secs(10);

/// Offers `path` to `contact` and waits until the transfer ends.
pub async fn send_file(mut session: Session, contact: &str, path: &Path) -> ClientResult<()> {
    let data = Bytes::from(tokio::fs::read(path).await?);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::Usage(format!("{} has no file name", path.display())))?;
    let descriptor = ContentDescriptor::for_content(session.messenger.account(), ObjectKind::File, name, &data);

    let id = session.messenger.send_object(contact, descriptor, data).await?;
    println!("Offered {name} to {contact}, waiting for an answer...");

    let outcome = session
        .wait_for(TRANSFER_LIMIT, |event| match event {
            MessengerEvent::TransferClosed { session, outcome } if *session == id => Some(outcome.clone()),
            _ => None,
        })
        .await?;
    session.sign_out();

    match outcome {
        Some(TransferOutcome::Completed) => {
            println!("Sent {name}.");
            Ok(())
        }
        Some(TransferOutcome::Declined) => Err(ClientError::Transfer(format!("{contact} declined {name}"))),
        Some(TransferOutcome::Aborted(reason)) => Err(ClientError::Transfer(reason)),
        None => Err(ClientError::Transfer("timed out".to_string())),
    }
}

/// Downloads the display picture `contact` advertises.
pub async fn fetch_avatar(
    mut session: Session,
    contact: &str,
    output: Option<PathBuf>,
    download_dir: &Path,
) -> ClientResult<()> {
    let key = contact.to_ascii_lowercase();
    let advertised = |session: &Session| {
        session
            .messenger
            .contact(contact)
            .is_some_and(|c| c.display_image.is_some())
    };
    if !advertised(&session) {
        session
            .wait_for(PRESENCE_LIMIT, |event| match event {
                MessengerEvent::PresenceChanged { account, .. } if account.to_ascii_lowercase() == key => Some(()),
                _ => None,
            })
            .await?;
    }

    let data = session
        .messenger
        .fetch_display_picture(contact)
        .await?
        .ok_or_else(|| ClientError::Usage(format!("{contact} has no display picture")))?;
    session.sign_out();

    let path = output.unwrap_or_else(|| avatar_path(download_dir, contact));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &data).await?;
    info!(contact, bytes = data.len(), path = %path.display(), "Saved display picture");
    println!("Saved {} ({} bytes).", path.display(), data.len());
    Ok(())
}

/// Default location of a downloaded picture.
fn avatar_path(download_dir: &Path, contact: &str) -> PathBuf {
    let name: String = contact
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    download_dir.join("avatars").join(format!("{name}.png"))
}
