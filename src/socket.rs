//! Non-blocking sockets over TCP and in-process streams.
//!
//! A [`Socket`] either binds an endpoint and accepts any number of peers, or connects to a single peer and
//! reconnects with bounded backoff whenever the session drops. Every transport session is assigned a fresh
//! [`Identity`]. Reading, writing and heartbeats run in spawned tasks; the owning role only ever sees
//! [`SocketEvent`]s through [`Socket::poll_event`] and hands outgoing messages to [`Socket::send`], which never
//! blocks.
//!
//! The socket does not implement any flow control. That is the job of the
//! [connections](crate::connection) built on top of it.

mod session;

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{self, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{Backoff, BackoffConfig},
    codec::{FrameFormat, MessageCodec},
    config::TransportConfig,
    endpoint::{Endpoint, SocketMode},
    error::{DisconnectReason, TransportError},
    message::{Identity, Message},
};

const INPROC_BUFFER_SIZE: usize = 256 * 1024;

/// A bidirectional byte stream a session can run over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Shared state for the sockets of one process: the transport configuration and the in-process endpoint table.
///
/// There is no global registry. Roles that should reach each other over `inproc://` endpoints must be given
/// clones of the same `Context`.
#[derive(Clone, Debug, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    config: TransportConfig,
    inproc: Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>,
}

impl Context {
    /// Creates a context with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                config,
                inproc: Mutex::default(),
            }),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    fn bind_inproc(&self, name: &str) -> io::Result<mpsc::UnboundedReceiver<DuplexStream>> {
        let mut table = self
            .inner
            .inproc
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if table.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("inproc://{name} is already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(name.to_string(), tx);
        Ok(rx)
    }

    fn connect_inproc(&self, name: &str) -> io::Result<DuplexStream> {
        let table = self
            .inner
            .inproc
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let listener = table.get(name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("inproc://{name} is not bound"),
            )
        })?;
        let (local, remote) = tokio::io::duplex(INPROC_BUFFER_SIZE);
        listener.send(remote).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("inproc://{name} is closed"),
            )
        })?;
        Ok(local)
    }
}

/// Heartbeat timing for tagged sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// How often a HEARTBEAT is sent.
    pub interval: Duration,
    /// Silence after which the session is dropped.
    pub timeout: Duration,
}

/// Per-socket options.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Wire format of every session.
    pub format: FrameFormat,
    /// Largest accepted frame.
    pub max_message_size: usize,
    /// Heartbeats, if the format supports them.
    pub heartbeat: Option<Heartbeat>,
    /// Reconnect policy for connect-mode sockets.
    pub reconnect: BackoffConfig,
    /// Upper bound on a single dial attempt.
    pub connect_timeout: Duration,
    /// How long closing sessions may flush queued frames.
    pub linger: Duration,
    /// Queued payload bytes at which a session counts as congested.
    pub high_water: usize,
}

impl SocketOptions {
    /// Options for tagged sessions with heartbeats.
    pub fn tagged(config: &TransportConfig) -> Self {
        SocketOptions {
            format: FrameFormat::Tagged,
            max_message_size: config.max_message_size,
            heartbeat: Some(Heartbeat {
                interval: config.heartbeat_interval,
                timeout: config.heartbeat_timeout,
            }),
            reconnect: config.reconnect.clone(),
            connect_timeout: config.heartbeat_timeout,
            linger: config.linger,
            high_water: config.sink_high_water,
        }
    }

    /// Options for raw sessions. Raw streams cannot carry heartbeats, and raw sinks keep retrying forever since a
    /// missing sink is never fatal.
    pub fn raw(config: &TransportConfig) -> Self {
        SocketOptions {
            format: FrameFormat::Raw,
            heartbeat: None,
            reconnect: config.reconnect.clone().unbounded(),
            ..SocketOptions::tagged(config)
        }
    }
}

/// Something that happened on a socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// A transport session was established.
    Connected(Identity),
    /// A message arrived from a peer.
    Message(Identity, Message),
    /// A session ended.
    Disconnected(Identity, DisconnectReason),
    /// A connect-mode socket gave up reconnecting.
    Exhausted {
        /// Failed dial attempts in a row.
        attempts: u32,
    },
    /// The socket's background task is gone.
    Closed,
}

pub(crate) enum Signal {
    Connected {
        identity: Identity,
        outgoing: mpsc::UnboundedSender<Message>,
        queued: Arc<AtomicUsize>,
    },
    Message {
        identity: Identity,
        message: Message,
    },
    Disconnected {
        identity: Identity,
        reason: DisconnectReason,
    },
    Exhausted {
        attempts: u32,
    },
}

/// The local end of one session: its outgoing queue and how many payload bytes wait in it.
#[derive(Debug)]
struct Peer {
    outgoing: mpsc::UnboundedSender<Message>,
    queued: Arc<AtomicUsize>,
}

/// A bound or connected socket. See the [module docs](self).
#[derive(Debug)]
pub struct Socket {
    endpoint: Endpoint,
    mode: SocketMode,
    codec: MessageCodec,
    high_water: usize,
    signals: mpsc::UnboundedReceiver<Signal>,
    peers: BTreeMap<Identity, Peer>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Socket {
    /// Binds or connects depending on `mode`.
    pub async fn open(
        ctx: &Context,
        endpoint: &Endpoint,
        mode: SocketMode,
        options: SocketOptions,
    ) -> Result<Self, TransportError> {
        match mode {
            SocketMode::Bind => Socket::bind(ctx, endpoint, options).await,
            SocketMode::Connect => Ok(Socket::connect(ctx, endpoint, options)),
        }
    }

    /// Binds `endpoint` and starts accepting peers.
    ///
    /// For TCP endpoints bound to port 0, [`Socket::endpoint`] reports the port the OS chose.
    pub async fn bind(
        ctx: &Context,
        endpoint: &Endpoint,
        options: SocketOptions,
    ) -> Result<Self, TransportError> {
        let (listener, local) = match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint
                    .bind_addr()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                let listener = TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                (
                    Listener::Tcp(listener),
                    Endpoint::tcp(local_addr.ip().to_string(), local_addr.port()),
                )
            }
            Endpoint::Inproc(name) => (
                Listener::Inproc(ctx.bind_inproc(name)?),
                endpoint.clone(),
            ),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let codec = MessageCodec::new(options.format, options.max_message_size);
        let high_water = options.high_water;
        let driver = tokio::spawn(accept_loop(listener, tx, options, cancel.clone()));
        tracing::debug!(%endpoint, local = %local, "socket bound");

        Ok(Socket {
            endpoint: local,
            mode: SocketMode::Bind,
            codec,
            high_water,
            signals: rx,
            peers: BTreeMap::new(),
            cancel,
            driver: Some(driver),
        })
    }

    /// Starts dialing `endpoint` in the background. Must be called from within a tokio runtime.
    pub fn connect(ctx: &Context, endpoint: &Endpoint, options: SocketOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let codec = MessageCodec::new(options.format, options.max_message_size);
        let high_water = options.high_water;
        let driver = tokio::spawn(connect_loop(
            ctx.clone(),
            endpoint.clone(),
            tx,
            options,
            cancel.clone(),
        ));
        tracing::debug!(%endpoint, "socket connecting");

        Socket {
            endpoint: endpoint.clone(),
            mode: SocketMode::Connect,
            codec,
            high_water,
            signals: rx,
            peers: BTreeMap::new(),
            cancel,
            driver: Some(driver),
        }
    }

    /// The endpoint this socket is bound or connecting to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the socket binds or connects.
    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    /// Polls for the next socket event.
    pub fn poll_event(&mut self, cx: &mut task::Context<'_>) -> Poll<SocketEvent> {
        let Some(signal) = std::task::ready!(self.signals.poll_recv(cx)) else {
            return Poll::Ready(SocketEvent::Closed);
        };
        let event = match signal {
            Signal::Connected {
                identity,
                outgoing,
                queued,
            } => {
                self.peers.insert(identity, Peer { outgoing, queued });
                SocketEvent::Connected(identity)
            }
            Signal::Message { identity, message } => SocketEvent::Message(identity, message),
            Signal::Disconnected { identity, reason } => {
                self.peers.remove(&identity);
                SocketEvent::Disconnected(identity, reason)
            }
            Signal::Exhausted { attempts } => SocketEvent::Exhausted { attempts },
        };
        Poll::Ready(event)
    }

    /// Fails with a protocol violation if `message` cannot be framed on this socket, for example because it is
    /// larger than `max_message_size`.
    pub fn validate(&self, message: &Message) -> Result<(), TransportError> {
        self.codec
            .validate(message)
            .map(drop)
            .map_err(|err| TransportError::violation(format!("outgoing message refused: {err}")))
    }

    /// Queues a message for a peer without blocking.
    ///
    /// A message that fails [`validate`](Socket::validate) is refused here and never reaches the session.
    pub fn send(&mut self, identity: Identity, message: Message) -> Result<(), TransportError> {
        self.validate(&message)?;
        let Some(peer) = self.peers.get(&identity) else {
            return Err(TransportError::TransientPeerUnavailable(identity));
        };
        let len = message.payload_len();
        peer.queued.fetch_add(len, Ordering::Relaxed);
        if peer.outgoing.send(message).is_err() {
            self.peers.remove(&identity);
            return Err(TransportError::PeerLost {
                identity,
                reason: DisconnectReason::Closed,
            });
        }
        Ok(())
    }

    /// Drops the session with a peer. A connect-mode socket will dial again.
    pub fn disconnect(&mut self, identity: Identity) {
        if self.peers.remove(&identity).is_some() {
            tracing::debug!(endpoint = %self.endpoint, peer = %identity, "session reset");
        }
    }

    /// Connected peers, oldest session first.
    pub fn peers(&self) -> impl Iterator<Item = Identity> + '_ {
        self.peers.keys().copied()
    }

    /// The oldest connected peer.
    pub fn first_peer(&self) -> Option<Identity> {
        self.peers.keys().next().copied()
    }

    /// Whether a session with `identity` is currently open.
    pub fn is_connected(&self, identity: Identity) -> bool {
        self.peers.contains_key(&identity)
    }

    /// Payload bytes handed to `send` for `identity` that its session has not written yet.
    pub fn queued_bytes(&self, identity: Identity) -> usize {
        self.peers
            .get(&identity)
            .map_or(0, |peer| peer.queued.load(Ordering::Relaxed))
    }

    /// Whether the session with `identity` has reached the high-water mark of queued bytes.
    pub fn is_congested(&self, identity: Identity) -> bool {
        self.queued_bytes(identity) >= self.high_water
    }

    /// Stops accepting or dialing, lets open sessions flush queued frames for up to `linger`, and waits for the
    /// background task to finish.
    pub async fn shutdown(&mut self, linger: Duration) {
        self.peers.clear();
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            if tokio::time::timeout(linger, driver).await.is_err() {
                tracing::warn!(endpoint = %self.endpoint, "socket linger expired");
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Listener {
    Tcp(TcpListener),
    Inproc(mpsc::UnboundedReceiver<DuplexStream>),
}

impl Listener {
    async fn accept(&mut self) -> io::Result<Box<dyn Io>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Listener::Inproc(rx) => match rx.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            },
        }
    }
}

async fn dial(ctx: &Context, endpoint: &Endpoint, timeout: Duration) -> io::Result<Box<dyn Io>> {
    match endpoint {
        Endpoint::Tcp { .. } => {
            let addr = endpoint
                .connect_addr()
                .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Endpoint::Inproc(name) => Ok(Box::new(ctx.connect_inproc(name)?)),
    }
}

async fn accept_loop(
    mut listener: Listener,
    signals: mpsc::UnboundedSender<Signal>,
    options: SocketOptions,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let identity = Identity::generate();
                    let (tx, rx) = mpsc::unbounded_channel();
                    let queued = Arc::new(AtomicUsize::new(0));
                    let connected = Signal::Connected {
                        identity,
                        outgoing: tx,
                        queued: queued.clone(),
                    };
                    if signals.send(connected).is_err() {
                        break;
                    }
                    tracing::debug!(peer = %identity, "peer accepted");
                    let signals = signals.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();
                    sessions.spawn(async move {
                        let outgoing = session::Outgoing { rx, queued };
                        let reason = session::run(stream, identity, outgoing, &signals, &options, cancel).await;
                        let _ = signals.send(Signal::Disconnected { identity, reason });
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::NotConnected => break,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(options.reconnect.initial_delay).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    let drain = async { while sessions.join_next().await.is_some() {} };
    let _ = tokio::time::timeout(options.linger, drain).await;
}

async fn connect_loop(
    ctx: Context,
    endpoint: Endpoint,
    signals: mpsc::UnboundedSender<Signal>,
    options: SocketOptions,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(options.reconnect.clone());
    loop {
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return,
            dialed = dial(&ctx, &endpoint, options.connect_timeout) => dialed,
        };

        match dialed {
            Ok(stream) => {
                backoff.reset();
                let identity = Identity::generate();
                let (tx, rx) = mpsc::unbounded_channel();
                let queued = Arc::new(AtomicUsize::new(0));
                if signals
                    .send(Signal::Connected {
                        identity,
                        outgoing: tx,
                        queued: queued.clone(),
                    })
                    .is_err()
                {
                    return;
                }
                tracing::debug!(%endpoint, peer = %identity, "connected");

                let outgoing = session::Outgoing { rx, queued };
                let reason =
                    session::run(stream, identity, outgoing, &signals, &options, cancel.clone()).await;
                if signals
                    .send(Signal::Disconnected { identity, reason })
                    .is_err()
                    || cancel.is_cancelled()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(%endpoint, error = %err, "dial failed");
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                tracing::error!(%endpoint, attempts = backoff.failures(), "reconnect attempts exhausted");
                let _ = signals.send(Signal::Exhausted {
                    attempts: backoff.failures(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use bytes::Bytes;

    use super::*;
    use crate::message::Tag;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_retries: Some(3),
            },
            ..TransportConfig::default()
        }
    }

    async fn next(socket: &mut Socket) -> SocketEvent {
        poll_fn(|cx| socket.poll_event(cx)).await
    }

    #[tokio::test]
    async fn inproc_sessions_exchange_messages() {
        let ctx = Context::new(fast_config());
        let options = SocketOptions::tagged(ctx.config());
        let endpoint = Endpoint::inproc("sessions");
        let mut server = Socket::bind(&ctx, &endpoint, options.clone()).await.unwrap();
        let mut client = Socket::connect(&ctx, &endpoint, options);

        let SocketEvent::Connected(server_side) = next(&mut server).await else {
            panic!("expected connection on the server");
        };
        let SocketEvent::Connected(client_side) = next(&mut client).await else {
            panic!("expected connection on the client");
        };
        assert_ne!(server_side, client_side);

        client
            .send(client_side, Message::event_from(Bytes::from_static(b"evt")))
            .unwrap();
        match next(&mut server).await {
            SocketEvent::Message(from, msg) => {
                assert_eq!(from, server_side);
                assert_eq!(msg.tag(), Tag::Event);
                assert_eq!(msg.frames()[0], Bytes::from_static(b"evt"));
            }
            other => panic!("unexpected {other:?}"),
        }

        server.send(server_side, Message::confirm()).unwrap();
        assert!(matches!(
            next(&mut client).await,
            SocketEvent::Message(_, msg) if msg.tag() == Tag::Confirm
        ));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_transient() {
        let ctx = Context::new(fast_config());
        let mut socket = Socket::bind(
            &ctx,
            &Endpoint::inproc("nobody"),
            SocketOptions::tagged(ctx.config()),
        )
        .await
        .unwrap();
        let err = socket
            .send(Identity::from_raw(u64::MAX), Message::ready())
            .unwrap_err();
        assert!(matches!(err, TransportError::TransientPeerUnavailable(_)));
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let ctx = Context::new(fast_config());
        let endpoint = Endpoint::inproc("taken");
        let options = SocketOptions::tagged(ctx.config());
        let _first = Socket::bind(&ctx, &endpoint, options.clone()).await.unwrap();
        assert!(Socket::bind(&ctx, &endpoint, options).await.is_err());
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_retries() {
        let ctx = Context::new(fast_config());
        let mut socket = Socket::connect(
            &ctx,
            &Endpoint::inproc("never-bound"),
            SocketOptions::tagged(ctx.config()),
        );
        match next(&mut socket).await {
            SocketEvent::Exhausted { attempts } => assert_eq!(attempts, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_server_disconnects_and_client_redials() {
        let ctx = Context::new(TransportConfig {
            reconnect: BackoffConfig {
                max_retries: Some(50),
                ..fast_config().reconnect
            },
            ..fast_config()
        });
        let endpoint = Endpoint::inproc("flaky");
        let options = SocketOptions::tagged(ctx.config());
        let mut server = Socket::bind(&ctx, &endpoint, options.clone()).await.unwrap();
        let mut client = Socket::connect(&ctx, &endpoint, options.clone());

        let SocketEvent::Connected(first) = next(&mut client).await else {
            panic!("expected first session");
        };
        let SocketEvent::Connected(_) = next(&mut server).await else {
            panic!("expected accept");
        };
        server.shutdown(Duration::from_millis(100)).await;
        drop(server);

        match next(&mut client).await {
            SocketEvent::Disconnected(identity, _) => assert_eq!(identity, first),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!client.is_connected(first));

        let _server = Socket::bind(&ctx, &endpoint, options).await.unwrap();
        let SocketEvent::Connected(second) = next(&mut client).await else {
            panic!("expected a new session");
        };
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn silent_peer_is_evicted_on_heartbeat_timeout() {
        let ctx = Context::new(fast_config());
        let endpoint = Endpoint::inproc("silent");
        let mut watchful = SocketOptions::tagged(ctx.config());
        watchful.heartbeat = Some(Heartbeat {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
        });
        let mut server = Socket::bind(&ctx, &endpoint, watchful).await.unwrap();
        let silent = SocketOptions {
            heartbeat: None,
            ..SocketOptions::tagged(ctx.config())
        };
        let _client = Socket::connect(&ctx, &endpoint, silent);

        let SocketEvent::Connected(peer) = next(&mut server).await else {
            panic!("expected accept");
        };
        match next(&mut server).await {
            SocketEvent::Disconnected(identity, DisconnectReason::HeartbeatTimeout) => {
                assert_eq!(identity, peer)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tcp_loopback_session() {
        let ctx = Context::new(fast_config());
        let options = SocketOptions::raw(ctx.config());
        let mut server = Socket::bind(&ctx, &Endpoint::tcp("127.0.0.1", 0), options.clone())
            .await
            .unwrap();
        let bound = server.endpoint().clone();
        let mut client = Socket::connect(&ctx, &bound, options);

        let SocketEvent::Connected(to_server) = next(&mut client).await else {
            panic!("expected tcp connection");
        };
        client
            .send(to_server, Message::event_from(Bytes::from_static(b"raw blob")))
            .unwrap();

        loop {
            match next(&mut server).await {
                SocketEvent::Connected(_) => continue,
                SocketEvent::Message(_, msg) => {
                    assert_eq!(msg.frames()[0], Bytes::from_static(b"raw blob"));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
