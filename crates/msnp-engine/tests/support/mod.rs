//! Loopback fake servers for end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use msnp_engine::{EngineConfig, Messenger, MessengerEvent, StaticTicket};
use msnp_protocol::{Frame, FrameCodec, MimeMessage, P2pMessage, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::Framed;

pub const ME: &str = "alice@example.com";
pub const BOB: &str = "bob@example.com";
pub const CAROL: &str = "carol@example.com";
pub const TICKET: &str = "t=secret&p=";

const STEP: Duration = Duration::from_secs(5);

/// A listening socket standing in for a nameserver or switchboard.
pub struct Server {
    listener: TcpListener,
    pub addr: String,
}

impl Server {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        Self { listener, addr }
    }

    pub async fn accept(&self) -> Peer {
        let (stream, _) = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("no connection")
            .unwrap();
        Peer {
            framed: Framed::new(stream, FrameCodec),
        }
    }
}

/// The server end of one client connection.
pub struct Peer {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Peer {
    /// Next frame from the client, skipping keepalives.
    pub async fn recv(&mut self) -> Frame {
        loop {
            let frame = tokio::time::timeout(STEP, self.framed.next())
                .await
                .expect("client went quiet")
                .expect("client disconnected")
                .unwrap();
            if !frame.is("PNG") {
                return frame;
            }
        }
    }

    pub async fn expect(&mut self, command: &str) -> Frame {
        let frame = self.recv().await;
        assert!(frame.is(command), "expected {command}, got {frame}");
        frame
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Writes `frames` with a single flush, so the client reads them
    /// together.
    pub async fn send_batch(&mut self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.framed.feed(frame).await.unwrap();
        }
        self.framed.flush().await.unwrap();
    }

    /// Answers `request` with its own trid.
    pub async fn reply<I, S>(&mut self, request: &Frame, command: &str, params: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let trid = request.trid.expect("request without trid");
        self.send(Frame::new(command).with_trid(trid).with_params(params))
            .await;
    }

    /// Delivers a message from `from` on this switchboard.
    pub async fn deliver(&mut self, from: &str, message: MimeMessage) {
        self.send(
            Frame::new("MSG")
                .with_params([from, "Friend"])
                .with_payload(message.to_bytes()),
        )
        .await;
    }

    /// Next P2P inner frame sent by the client.
    pub async fn recv_p2p(&mut self) -> P2pMessage {
        loop {
            let frame = self.recv().await;
            if !frame.is("MSG") || frame.param(0) != Some("D") {
                continue;
            }
            let message = MimeMessage::parse(frame.payload_bytes()).unwrap();
            return P2pMessage::from_frame(&message.body.nested().unwrap()).unwrap();
        }
    }

    pub async fn send_p2p(&mut self, from: &str, message: P2pMessage) {
        self.deliver(from, MimeMessage::p2p(ME, message.to_frame()))
            .await;
    }

    /// Waits for the client to hang up.
    pub async fn closed(mut self) {
        loop {
            match tokio::time::timeout(STEP, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("client kept the connection open"),
            }
        }
    }

    /// Drops the connection.
    pub fn hang_up(self) {}
}

pub fn config(nameserver: &Server) -> EngineConfig {
    EngineConfig::new(nameserver.addr.clone())
        .with_request_timeout(STEP)
        .with_binding_timeout(STEP)
        .with_rebind_timeout(STEP)
        .with_keepalive_interval(Duration::from_secs(600))
}

pub fn messenger(config: EngineConfig) -> (Messenger, UnboundedReceiver<MessengerEvent>) {
    Messenger::new(config, Arc::new(StaticTicket(TICKET.to_string())))
}

/// Plays the nameserver side of a login with `contacts` on the forward
/// and allow lists.
pub async fn serve_login(ns: &mut Peer, contacts: &[&str]) {
    let ver = ns.expect("VER").await;
    ns.reply(&ver, "VER", [PROTOCOL_VERSION, "CVR0"]).await;

    let usr = ns.expect("USR").await;
    assert_eq!(usr.params, ["SSO", "I", ME]);
    ns.reply(&usr, "USR", ["SSO", "S", "MBI_KEY_OLD", "bm9uY2U="]).await;

    let usr = ns.expect("USR").await;
    assert_eq!(usr.param(2), Some(TICKET));
    ns.reply(&usr, "USR", ["OK", ME, "1", "0"]).await;

    let syn = ns.expect("SYN").await;
    let count = contacts.len().to_string();
    ns.reply(&syn, "SYN", ["0", "0", count.as_str(), "1"]).await;
    ns.send(Frame::new("LSG").with_params(["Friends", "g1"])).await;
    for contact in contacts {
        ns.send(Frame::new("LST").with_params([
            format!("N={contact}"),
            format!("F={contact}"),
            format!("C=guid-{contact}"),
            "3".to_string(),
            "g1".to_string(),
        ]))
        .await;
    }

    let adl = ns.expect("ADL").await;
    ns.reply(&adl, "ADL", ["OK"]).await;

    let chg = ns.expect("CHG").await;
    let params = chg.params.clone();
    ns.reply(&chg, "CHG", params).await;
}

/// Logs `messenger` in against a fresh fake nameserver.
pub async fn signed_in(
    nameserver: &Server,
    messenger: &Messenger,
    contacts: &[&str],
) -> Peer {
    let (result, ns) = tokio::join!(messenger.login(ME), async {
        let mut ns = nameserver.accept().await;
        serve_login(&mut ns, contacts).await;
        ns
    });
    result.unwrap();
    ns
}

/// Answers an `XFR SB` and returns the switchboard after its `USR`.
pub async fn serve_referral(ns: &mut Peer, switchboard: &Server) -> Peer {
    let xfr = ns.expect("XFR").await;
    assert_eq!(xfr.param(0), Some("SB"));
    ns.reply(&xfr, "XFR", ["SB", switchboard.addr.as_str(), "CKI", "sb-ticket"])
        .await;

    let mut sb = switchboard.accept().await;
    let usr = sb.expect("USR").await;
    assert_eq!(usr.params, [ME, "sb-ticket"]);
    sb.reply(&usr, "USR", ["OK", ME, "Alice"]).await;
    sb
}

/// Answers one `CAL` and lets the callee join.
pub async fn serve_call(sb: &mut Peer, callee: &str) {
    let cal = sb.expect("CAL").await;
    assert_eq!(cal.param(0), Some(callee));
    sb.reply(&cal, "CAL", ["RINGING", "1234"]).await;
    sb.send(Frame::new("JOI").with_params([callee, "Friend"])).await;
}

/// Sends `RNG` from `inviter` and plays the switchboard side of `ANS`.
pub async fn ring(ns: &mut Peer, switchboard: &Server, inviter: &str, session: &str) -> Peer {
    ns.send(Frame::new("RNG").with_params([
        session,
        switchboard.addr.as_str(),
        "CKI",
        "ring-ticket",
        inviter,
        "Friend",
    ]))
    .await;

    let mut sb = switchboard.accept().await;
    let ans = sb.expect("ANS").await;
    assert_eq!(ans.params, [ME, "ring-ticket", session]);
    sb.reply(&ans, "IRO", ["1", "1", inviter, "Friend"]).await;
    sb.reply(&ans, "ANS", ["OK"]).await;
    sb
}

/// Next event matching `pick`, skipping everything else.
pub async fn wait_for<T>(
    events: &mut UnboundedReceiver<MessengerEvent>,
    mut pick: impl FnMut(MessengerEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(STEP, events.recv())
            .await
            .expect("event did not arrive")
            .expect("event channel closed");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}
