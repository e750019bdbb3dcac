//! Interactive conversation over stdin/stdout.

use msnp_engine::{ConversationId, MessengerEvent, TransferOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use super::Session;
use crate::error::{ClientError, ClientResult};

/// What a line typed by the user asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Text(&'a str),
    Nudge,
    Invite(&'a str),
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => Input::Quit,
        ("/nudge", _) => Input::Nudge,
        ("/invite", who) if !who.trim().is_empty() => Input::Invite(who.trim()),
        _ if line.trim().is_empty() => Input::Empty,
        _ => Input::Text(line),
    }
}

/// Opens a conversation with `participants` and relays stdin lines to it
/// until `/quit`, end of input, or the conversation ends.
pub async fn run(mut session: Session, participants: &[String]) -> ClientResult<()> {
    let chat = session.messenger.open_conversation(participants)?;
    println!(
        "* talking to {} (/nudge, /invite <contact>, /quit)",
        participants.join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Nudge => report(chat.send_nudge().await),
                    Input::Invite(who) => report(chat.invite(who).await),
                    Input::Text(text) => report(chat.send_text(text).await),
                }
            }
            event = session.events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    MessengerEvent::Disconnected { reason } => {
                        return Err(ClientError::Disconnected(reason.clone()));
                    }
                    MessengerEvent::SessionClosed { conversation } if *conversation == chat.id() => {
                        println!("* conversation ended");
                        break;
                    }
                    MessengerEvent::TransferInvitationReceived { session: sid, from, descriptor } => {
                        println!("* {from} offers {} ({} bytes), declining", descriptor.friendly, descriptor.size);
                        if let Err(e) = session.messenger.decline_transfer(*sid) {
                            warn!(error = %e, "Could not decline transfer");
                        }
                    }
                    _ => {}
                }
                if let Some(line) = describe(&event, chat.id()) {
                    println!("{line}");
                } else {
                    debug!(?event, "Event");
                }
            }
        }
    }

    chat.close();
    session.sign_out();
    Ok(())
}

fn report(result: msnp_engine::EngineResult<()>) {
    if let Err(e) = result {
        eprintln!("! {e}");
    }
}

/// Renders an event of `conversation` for the terminal.
fn describe(event: &MessengerEvent, conversation: ConversationId) -> Option<String> {
    match event {
        MessengerEvent::TextMessageReceived {
            conversation: c,
            from,
            text,
            ..
        } if *c == conversation => Some(format!("<{from}> {text}")),
        MessengerEvent::NudgeReceived { conversation: c, from } if *c == conversation => {
            Some(format!("* {from} sent a nudge"))
        }
        MessengerEvent::ContactJoined { conversation: c, account } if *c == conversation => {
            Some(format!("* {account} joined"))
        }
        MessengerEvent::ContactLeft { conversation: c, account } if *c == conversation => {
            Some(format!("* {account} left"))
        }
        MessengerEvent::PresenceChanged {
            account, status, ..
        } => Some(format!("* {account} is now {status}")),
        MessengerEvent::TransferClosed {
            session,
            outcome: TransferOutcome::Aborted(reason),
        } => Some(format!("* transfer {session} aborted: {reason}")),
        _ => None,
    }
}
