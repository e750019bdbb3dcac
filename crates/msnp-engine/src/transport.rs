//! One framed connection to a nameserver or switchboard.
//!
//! A [`Transport`] owns two tasks: a reader that decodes frames and hands
//! each one to every registered [`FrameHandler`] in registration order, and
//! a writer fed by an unbounded queue. Handlers run synchronously on the
//! reader task, so they must not block; they may call [`Transport::send`].
//!
//! `send` assigns the transaction id and enqueues the frame under one lock,
//! so frames reach the wire in trid order. [`Transport::request`] also
//! registers a waiter for the reply carrying the same trid.
//!
//! Every frame read or written is logged at TRACE level under this module's
//! target.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use msnp_protocol::{Frame, FrameCodec, spec_for};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::sync::{lock, read, write};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// What a transport is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Nameserver,
    Switchboard,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nameserver => f.write_str("ns"),
            Self::Switchboard => f.write_str("sb"),
        }
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    Remote,
    /// [`Transport::disconnect`] was called.
    Local,
    /// A read or write failed.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("closed by peer"),
            Self::Local => f.write_str("closed locally"),
            Self::Error(e) => write!(f, "connection error: {e}"),
        }
    }
}

/// Receives frames and the close notification of a transport.
pub trait FrameHandler: Send + Sync {
    /// Called for every decoded frame, on the reader task.
    fn handle_frame(&self, transport: &Transport, frame: &Frame);

    /// Called once when the transport closes. The handler is unregistered
    /// afterwards.
    fn connection_closed(&self, transport: &Transport, reason: &CloseReason);
}

/// Timeouts used by a transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}

type Matcher = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

struct Waiter {
    command: String,
    matches: Matcher,
    reply: oneshot::Sender<EngineResult<Frame>>,
}

struct WriterState {
    next_trid: u32,
    queue: Option<mpsc::UnboundedSender<Frame>>,
}

struct Inner {
    id: u64,
    kind: ConnectionKind,
    config: TransportConfig,
    peer: Mutex<Option<String>>,
    handlers: RwLock<Vec<Arc<dyn FrameHandler>>>,
    writer: Mutex<WriterState>,
    waiters: Mutex<HashMap<u32, Waiter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// Handle to one connection. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("peer", &*lock(&self.inner.peer))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Creates an unconnected transport with default timeouts.
    pub fn new(kind: ConnectionKind) -> Self {
        Self::with_config(kind, TransportConfig::default())
    }

    pub fn with_config(kind: ConnectionKind, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                config,
                peer: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                writer: Mutex::new(WriterState {
                    next_trid: 1,
                    queue: None,
                }),
                waiters: Mutex::new(HashMap::new()),
                reader: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    /// Endpoint this transport connected to, if known.
    pub fn peer(&self) -> Option<String> {
        lock(&self.inner.peer).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Adds a handler. Handlers see frames in registration order.
    pub fn register_handler(&self, handler: Arc<dyn FrameHandler>) {
        if self.is_closed() {
            warn!(conn = self.inner.id, "Registering handler on a closed transport");
            return;
        }
        write(&self.inner.handlers).push(handler);
    }

    /// Connects to `host:port` over TCP.
    pub async fn connect(&self, endpoint: &str) -> EngineResult<()> {
        debug!(conn = self.inner.id, kind = %self.inner.kind, endpoint, "Connecting");
        let stream =
            match tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(endpoint))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(EngineError::timeout(format!("connect to {endpoint}"))),
            };
        stream.set_nodelay(true)?;
        *lock(&self.inner.peer) = Some(endpoint.to_string());
        self.connect_stream(stream)
    }

    /// Attaches an already connected stream and starts the reader and writer.
    pub fn connect_stream<S>(&self, stream: S) -> EngineResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.connected.swap(true, Ordering::AcqRel) || self.is_closed() {
            return Err(EngineError::invalid_state("transport already connected"));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.writer).queue = Some(tx);

        tokio::spawn(self.clone().write_loop(FramedWrite::new(write_half, FrameCodec), rx));
        let reader = tokio::spawn(self.clone().read_loop(FramedRead::new(read_half, FrameCodec)));
        *lock(&self.inner.reader) = Some(reader);
        debug!(conn = self.inner.id, kind = %self.inner.kind, "Connected");
        Ok(())
    }

    async fn read_loop<R>(self, mut frames: FramedRead<R, FrameCodec>)
    where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            match frames.next().await {
                Some(Ok(frame)) => {
                    trace!(conn = self.inner.id, kind = %self.inner.kind, "<< {}", frame);
                    self.dispatch(&frame);
                    if self.is_closed() {
                        return;
                    }
                }
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Remote,
            }
        };
        self.close(reason);
    }

    async fn write_loop<W>(
        self,
        mut sink: FramedWrite<W, FrameCodec>,
        mut queue: mpsc::UnboundedReceiver<Frame>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = queue.recv().await {
            trace!(conn = self.inner.id, kind = %self.inner.kind, ">> {}", frame);
            if let Err(e) = sink.send(frame).await {
                warn!(conn = self.inner.id, error = %e, "Write failed");
                self.close(CloseReason::Error(e.to_string()));
                return;
            }
        }
        // Queue dropped: everything queued before disconnect is flushed.
        if let Err(e) = sink.close().await {
            trace!(conn = self.inner.id, error = %e, "Shutdown after close failed");
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let handlers = read(&self.inner.handlers).clone();
        for handler in &handlers {
            handler.handle_frame(self, frame);
        }

        let Some(trid) = frame.trid else { return };
        let mut waiters = lock(&self.inner.waiters);
        let Some(waiter) = waiters.get(&trid) else {
            return;
        };
        let result = if let Some(code) = frame.error_code() {
            Err(EngineError::Server {
                code,
                command: waiter.command.clone(),
            })
        } else if (waiter.matches)(frame) {
            Ok(frame.clone())
        } else {
            return;
        };
        if let Some(waiter) = waiters.remove(&trid) {
            let _ = waiter.reply.send(result);
        }
    }

    /// Returns true if a request is waiting for a reply with `trid`.
    pub fn has_waiter(&self, trid: u32) -> bool {
        lock(&self.inner.waiters).contains_key(&trid)
    }

    /// Queues a frame, assigning the next trid if its command carries one.
    ///
    /// Returns the assigned trid. Never blocks, so it is safe to call from
    /// a [`FrameHandler`].
    pub fn send(&self, frame: Frame) -> EngineResult<Option<u32>> {
        self.enqueue(frame, None)
    }

    fn enqueue(&self, mut frame: Frame, waiter: Option<Waiter>) -> EngineResult<Option<u32>> {
        let mut writer = lock(&self.inner.writer);
        let Some(queue) = writer.queue.as_ref() else {
            return Err(EngineError::ConnectionClosed);
        };
        if frame.trid.is_none() && spec_for(&frame.command).outbound_trid() {
            frame.trid = Some(writer.next_trid);
        }
        let trid = frame.trid;
        if let (Some(trid), Some(waiter)) = (trid, waiter) {
            lock(&self.inner.waiters).insert(trid, waiter);
        }
        if queue.send(frame).is_err() {
            if let Some(trid) = trid {
                lock(&self.inner.waiters).remove(&trid);
            }
            return Err(EngineError::ConnectionClosed);
        }
        if let Some(trid) = trid {
            writer.next_trid = writer.next_trid.max(trid.wrapping_add(1));
        }
        Ok(trid)
    }

    /// Sends a frame and waits for the reply with the same trid and command.
    pub async fn request(&self, frame: Frame) -> EngineResult<Frame> {
        let command = frame.command.clone();
        self.request_with(frame, move |reply| reply.command == command)
            .await
    }

    /// Sends a frame and waits for the first frame with the same trid that
    /// satisfies `matches`. Numeric errors with that trid fail the request.
    pub async fn request_with<F>(&self, frame: Frame, matches: F) -> EngineResult<Frame>
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        let command = frame.command.clone();
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            command: command.clone(),
            matches: Box::new(matches),
            reply: tx,
        };
        let Some(trid) = self.enqueue(frame, Some(waiter))? else {
            return Err(EngineError::invalid_state(format!(
                "{command} carries no trid and cannot be awaited"
            )));
        };

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Err(_) => {
                lock(&self.inner.waiters).remove(&trid);
                Err(EngineError::timeout(format!("{command} reply (trid {trid})")))
            }
        }
    }

    /// Closes the connection. Queued frames are still written.
    pub fn disconnect(&self) {
        self.close(CloseReason::Local);
    }

    fn close(&self, reason: CloseReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = self.inner.id, kind = %self.inner.kind, %reason, "Connection closed");

        lock(&self.inner.writer).queue = None;
        // Dropping the senders fails every pending request with ConnectionClosed.
        lock(&self.inner.waiters).clear();

        let handlers = std::mem::take(&mut *write(&self.inner.handlers));
        for handler in &handlers {
            handler.connection_closed(self, &reason);
        }

        if reason == CloseReason::Local {
            if let Some(reader) = lock(&self.inner.reader).take() {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl FrameHandler for Recorder {
        fn handle_frame(&self, _transport: &Transport, frame: &Frame) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, frame.command));
        }

        fn connection_closed(&self, _transport: &Transport, reason: &CloseReason) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:closed:{reason}", self.name));
        }
    }

    fn pair() -> (Transport, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let transport = Transport::new(ConnectionKind::Nameserver);
        transport.connect_stream(local).unwrap();
        (transport, remote)
    }

    async fn read_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn trids_are_assigned_in_order() {
        let (transport, remote) = pair();
        assert_eq!(transport.send(Frame::new("VER").with_param("MSNP18")).unwrap(), Some(1));
        assert_eq!(transport.send(Frame::new("PNG")).unwrap(), None);
        assert_eq!(transport.send(Frame::new("CHG").with_param("NLN")).unwrap(), Some(2));

        let mut reader = BufReader::new(remote);
        assert_eq!(read_line(&mut reader).await, "VER 1 MSNP18\r\n");
        assert_eq!(read_line(&mut reader).await, "PNG\r\n");
        assert_eq!(read_line(&mut reader).await, "CHG 2 NLN\r\n");
    }

    #[tokio::test]
    async fn handlers_see_frames_in_registration_order() {
        let (transport, mut remote) = pair();
        let log = Arc::new(StdMutex::new(Vec::new()));
        transport.register_handler(Arc::new(Recorder { name: "a", log: log.clone() }));
        transport.register_handler(Arc::new(Recorder { name: "b", log: log.clone() }));

        remote.write_all(b"QNG 50\r\nOUT\r\n").await.unwrap();
        drop(remote);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !transport.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:QNG",
                "b:QNG",
                "a:OUT",
                "b:OUT",
                "a:closed:closed by peer",
                "b:closed:closed by peer"
            ]
        );
    }

    #[tokio::test]
    async fn request_resolves_with_matching_reply() {
        let (transport, remote) = pair();
        let (read_half, mut write_half) = tokio::io::split(remote);

        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "USR 1 SSO I bob@example.com\r\n");
            // Unrelated frame with another trid first.
            write_half.write_all(b"CHG 9 NLN 0\r\nUSR 1 SSO S MBI_KEY nonce\r\n").await.unwrap();
            write_half
        });

        let reply = transport
            .request(Frame::new("USR").with_params(["SSO", "I", "bob@example.com"]))
            .await
            .unwrap();
        assert_eq!(reply.trid, Some(1));
        assert_eq!(reply.params, vec!["SSO", "S", "MBI_KEY", "nonce"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn numeric_error_fails_request() {
        let (transport, mut remote) = pair();
        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request(Frame::new("USR").with_param("OK")).await })
        };
        while !transport.has_waiter(1) {
            tokio::task::yield_now().await;
        }
        remote.write_all(b"911 1\r\n").await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Server { code: 911, ref command }) if command == "USR"
        ));
    }

    #[tokio::test]
    async fn close_fails_pending_requests_and_notifies_once() {
        let (transport, _remote) = pair();
        let log = Arc::new(StdMutex::new(Vec::new()));
        transport.register_handler(Arc::new(Recorder { name: "h", log: log.clone() }));

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request(Frame::new("SYN").with_params(["0", "0"])).await })
        };
        while !transport.has_waiter(1) {
            tokio::task::yield_now().await;
        }

        transport.disconnect();
        transport.disconnect();

        assert!(matches!(pending.await.unwrap(), Err(EngineError::ConnectionClosed)));
        assert_eq!(*log.lock().unwrap(), vec!["h:closed:closed locally"]);
        assert!(matches!(transport.send(Frame::new("PNG")), Err(EngineError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let (local, _remote) = tokio::io::duplex(1024);
        let transport = Transport::with_config(
            ConnectionKind::Switchboard,
            TransportConfig {
                connect_timeout: Duration::from_secs(1),
                request_timeout: Duration::from_secs(5),
            },
        );
        transport.connect_stream(local).unwrap();

        let result = transport.request(Frame::new("CAL").with_param("bob@example.com")).await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        assert!(!transport.has_waiter(1));
    }

    #[tokio::test]
    async fn frames_without_trid_cannot_be_awaited() {
        let (transport, _remote) = pair();
        let result = transport.request(Frame::new("PNG")).await;
        assert!(matches!(result, Err(EngineError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (transport, _remote) = pair();
        let (other, _other_remote) = tokio::io::duplex(64);
        assert!(transport.connect_stream(other).is_err());
    }
}
