//! Command implementations.

pub mod chat;
pub mod config;
pub mod contacts;
pub mod transfer;

use std::sync::Arc;
use std::time::Duration;

use msnp_engine::{Messenger, MessengerEvent, StaticTicket};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// A signed-in messenger and its event stream.
pub struct Session {
    pub messenger: Messenger,
    pub events: UnboundedReceiver<MessengerEvent>,
}

impl Session {
    /// Signs in with the configured account and applies the profile.
    pub async fn sign_in(config: &ClientConfig) -> ClientResult<Self> {
        let account = config.account()?.to_string();
        let ticket = config.resolve_ticket()?;
        let (messenger, events) = Messenger::new(config.engine_config(), Arc::new(StaticTicket(ticket)));

        info!(account = %account, nameserver = %config.server.nameserver, "Signing in");
        messenger.login(&account).await?;

        if let Some(name) = &config.profile.display_name {
            messenger.set_display_name(name).await?;
        }
        if let Some(message) = &config.profile.personal_message {
            messenger.set_personal_message(message).await?;
        }
        Ok(Self { messenger, events })
    }

    /// Waits up to `limit` for an event `pick` accepts.
    pub async fn wait_for<T>(
        &mut self,
        limit: Duration,
        mut pick: impl FnMut(&MessengerEvent) -> Option<T>,
    ) -> ClientResult<Option<T>> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(MessengerEvent::Disconnected { reason })) => {
                    return Err(ClientError::Disconnected(reason));
                }
                Ok(Some(event)) => {
                    if let Some(found) = pick(&event) {
                        return Ok(Some(found));
                    }
                    debug!(?event, "Skipping event");
                }
                Ok(None) => return Err(ClientError::Disconnected("event stream ended".to_string())),
                Err(_) => return Ok(None),
            }
        }
    }

    pub fn sign_out(self) {
        self.messenger.sign_out();
    }
}
