//! Reconnecting Transport
//!
//! Owns the single feed connection to the pipeline service. All socket work
//! happens on one actor task: inbound frames, reconnect timers, heartbeat
//! ticks and outbound commands are serialized through its select loop, so
//! listeners run to completion before the next frame is read.
//!
//! ```text
//!             connect()                 handshake ok
//!  Offline ─────────────▶ Connecting ───────────────▶ Online
//!     ▲  ▲                    │                         │
//!     │  └──── dial failed ───┘      close / read error │
//!     │                                                 │
//!     └─────────────────────────────────────────────────┘
//!        (then Connecting again after the backoff delay,
//!         unless disconnect() was called)
//! ```
//!
//! [`Transport`] is the cheap, clonable handle given to consumers. Exactly one
//! owner creates it with [`Transport::spawn`] and calls
//! [`Transport::disconnect`] on teardown.
//!
//! Commands are at-most-once: [`Transport::send`] drops a command unless the
//! connection is online, and nothing is queued for later delivery. Callers
//! that need their commands to land re-issue them after a `connected` event.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::backoff::{Backoff, DEFAULT_BACKOFF_STEPS};
use crate::bus::{EventBus, Handler, Subscription};
use crate::credentials::{CredentialSource, resolve_token, subprotocol_header};
use crate::protocol::{ClientCommand, EventKind, Inbound, PING_FRAME, ServerEvent, decode_frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type DialFuture = Pin<Box<dyn Future<Output = Result<WsStream, DialError>> + Send>>;

/// Upper bound on waiting for our close frame to flush on disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Three-state connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keep-alive tick while online. The pipeline service does not need pings,
/// so by default the tick is armed but writes nothing.
#[derive(Clone, Debug)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub send_frames: bool,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            send_frames: false,
        }
    }
}

/// Runtime transport configuration.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Feed endpoint, e.g. `ws://127.0.0.1:8000/ws`
    pub url: String,
    /// Explicit session token; takes precedence over the credential source.
    pub token: Option<String>,
    pub backoff_steps: Vec<Duration>,
    pub heartbeat: HeartbeatPolicy,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            backoff_steps: DEFAULT_BACKOFF_STEPS.to_vec(),
            heartbeat: HeartbeatPolicy::default(),
        }
    }
}

/// Why a dial attempt did not produce a connection.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("session token is not a valid sub-protocol value")]
    InvalidToken,

    #[error(transparent)]
    Handshake(#[from] tungstenite::Error),
}

enum Request {
    Connect,
    /// Carries an optional ack fired once teardown has finished.
    Disconnect(Option<oneshot::Sender<()>>),
    Send(ClientCommand),
}

struct Shared {
    status: watch::Sender<ConnectionStatus>,
    /// Cleared by `disconnect()`; no automatic reconnect while false.
    enabled: AtomicBool,
    /// Bumped by every `disconnect()`. Status writes from an older session
    /// are discarded so nothing re-enters Connecting/Online after teardown.
    session: AtomicU64,
}

/// Handle to the feed connection. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct Transport {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    bus: EventBus,
}

impl Transport {
    /// Start the transport actor. The connection stays `Offline` until
    /// [`Transport::connect`] is called. Must be called inside a tokio runtime.
    pub fn spawn(config: TransportConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Offline);
        let shared = Arc::new(Shared {
            status: status_tx,
            enabled: AtomicBool::new(false),
            session: AtomicU64::new(0),
        });
        let bus = EventBus::new();

        let actor = TransportActor {
            backoff: Backoff::new(config.backoff_steps.clone()),
            config,
            credentials,
            shared: shared.clone(),
            bus: bus.clone(),
            requests: requests_rx,
            session: 0,
            attempt: 0,
            dialing: None,
            connection: None,
            reconnect_at: None,
            heartbeat: None,
        };
        tokio::spawn(actor.run());

        Self {
            requests: requests_tx,
            shared,
            bus,
        }
    }

    /// Begin connecting and re-enable automatic reconnects. A no-op while a
    /// connection is live or being dialed; dials immediately if a reconnect
    /// was pending.
    pub fn connect(&self) {
        self.shared.status.send_modify(|status| {
            self.shared.enabled.store(true, Ordering::SeqCst);
            if *status == ConnectionStatus::Offline {
                *status = ConnectionStatus::Connecting;
            }
        });
        let _ = self.requests.send(Request::Connect);
    }

    /// Close the connection, cancel pending reconnects and the heartbeat, and
    /// stay `Offline` until the next [`Transport::connect`].
    pub fn disconnect(&self) {
        self.begin_disconnect();
        let _ = self.requests.send(Request::Disconnect(None));
    }

    /// [`Transport::disconnect`], then wait until commands queued before it
    /// have been written and the socket is closed.
    pub async fn close(&self) {
        self.begin_disconnect();
        let (done_tx, done_rx) = oneshot::channel();
        if self.requests.send(Request::Disconnect(Some(done_tx))).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn begin_disconnect(&self) {
        self.shared.status.send_modify(|status| {
            self.shared.enabled.store(false, Ordering::SeqCst);
            self.shared.session.fetch_add(1, Ordering::SeqCst);
            *status = ConnectionStatus::Offline;
        });
    }

    /// Fire-and-forget. Returns false when the command was dropped because the
    /// connection is not online.
    pub fn send(&self, command: ClientCommand) -> bool {
        if self.status() != ConnectionStatus::Online {
            debug!(command = command.name(), "feed not online, command dropped");
            return false;
        }
        self.requests.send(Request::Send(command)).is_ok()
    }

    pub fn on(&self, kind: EventKind, handler: Handler) -> Subscription {
        self.bus.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, handler: &Handler) {
        self.bus.off(kind, handler)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver that observes every status transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the connection is online. Returns false on timeout.
    pub async fn wait_online(&self, timeout: Duration) -> bool {
        let mut status = self.watch_status();
        matches!(
            tokio::time::timeout(
                timeout,
                status.wait_for(|s| *s == ConnectionStatus::Online)
            )
            .await,
            Ok(Ok(_))
        )
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

/// What woke the actor's select loop.
enum Wake {
    Request(Request),
    Dialed(Result<WsStream, DialError>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    Reconnect,
    Heartbeat,
}

struct TransportActor {
    config: TransportConfig,
    credentials: Arc<dyn CredentialSource>,
    shared: Arc<Shared>,
    bus: EventBus,
    requests: mpsc::UnboundedReceiver<Request>,
    backoff: Backoff,
    /// Session this actor is working for (see `Shared::session`).
    session: u64,
    attempt: u32,
    dialing: Option<DialFuture>,
    connection: Option<WsStream>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl TransportActor {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => Wake::Request(request),
                    None => break,
                },
                dialed = poll_dial(&mut self.dialing) => Wake::Dialed(dialed),
                frame = next_frame(&mut self.connection) => Wake::Frame(frame),
                () = wait_timer(&mut self.reconnect_at) => Wake::Reconnect,
                () = next_tick(&mut self.heartbeat) => Wake::Heartbeat,
            };

            match wake {
                Wake::Request(Request::Connect) => self.on_connect_request(),
                Wake::Request(Request::Disconnect(done)) => {
                    self.teardown().await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Wake::Request(Request::Send(command)) => self.write_command(command).await,
                Wake::Dialed(result) => self.on_dialed(result).await,
                Wake::Frame(frame) => self.on_frame(frame),
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    if self.is_current() {
                        self.start_dial();
                    }
                }
                Wake::Heartbeat => self.on_heartbeat().await,
            }
        }

        debug!("all transport handles dropped, shutting down");
        self.teardown().await;
    }

    /// True while no `disconnect()` has happened since this session began.
    fn is_current(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
            && self.shared.session.load(Ordering::SeqCst) == self.session
    }

    fn publish(&self, next: ConnectionStatus) {
        self.shared.status.send_if_modified(|status| {
            if !self.is_current() || *status == next {
                return false;
            }
            trace!(from = %status, to = %next, "feed status");
            *status = next;
            true
        });
    }

    fn on_connect_request(&mut self) {
        self.session = self.shared.session.load(Ordering::SeqCst);
        if self.connection.is_some() || self.dialing.is_some() {
            return;
        }
        self.reconnect_at = None;
        self.start_dial();
    }

    fn start_dial(&mut self) {
        self.publish(ConnectionStatus::Connecting);
        let token = resolve_token(self.config.token.as_deref(), self.credentials.as_ref());

        let request = match build_request(&self.config.url, token.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "could not build feed request");
                self.go_offline();
                return;
            }
        };

        debug!(url = %self.config.url, attempt = self.attempt, authenticated = token.is_some(), "dialing feed");
        self.dialing = Some(Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
            Ok(stream)
        }));
    }

    async fn on_dialed(&mut self, result: Result<WsStream, DialError>) {
        self.dialing = None;
        match result {
            Ok(mut stream) => {
                if !self.is_current() {
                    // disconnect() won the race; this connection is unwanted.
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await;
                    return;
                }
                self.connection = Some(stream);
                self.backoff.reset();
                self.attempt = 0;
                self.publish(ConnectionStatus::Online);
                self.arm_heartbeat();
                info!(url = %self.config.url, "feed connected");
                self.emit_connected();
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "feed dial failed");
                self.go_offline();
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(&text),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.on_text(text),
                Err(_) => debug!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(close))) => {
                info!(frame = ?close, "feed closed by server");
                self.go_offline();
            }
            // Ping/Pong are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "feed read error");
                self.go_offline();
            }
            None => {
                info!("feed stream ended");
                self.go_offline();
            }
        }
    }

    fn on_text(&self, text: &str) {
        // A frame read before disconnect() returned is not delivered.
        if !self.is_current() {
            trace!("dropping frame read after disconnect");
            return;
        }
        match decode_frame(text) {
            Ok(Inbound::Control(control)) => trace!(?control, "control frame consumed"),
            Ok(Inbound::Event(ServerEvent::Connected)) => self.emit_connected(),
            Ok(Inbound::Event(event)) => {
                let delivered = self.bus.emit(&event);
                trace!(kind = %event.kind(), delivered, "event dispatched");
            }
            Err(e) => debug!(error = %e, "dropping undecodable frame"),
        }
    }

    /// Single path for `connected`, whether from the handshake or a frame.
    fn emit_connected(&self) {
        self.bus.emit(&ServerEvent::Connected);
    }

    async fn write_command(&mut self, command: ClientCommand) {
        let Some(stream) = self.connection.as_mut() else {
            debug!(command = command.name(), "feed went offline, command dropped");
            return;
        };
        let frame = match command.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(command = command.name(), error = %e, "could not encode command");
                return;
            }
        };
        match stream.send(Message::Text(frame.into())).await {
            Ok(()) => debug!(command = command.name(), "command sent"),
            Err(e) => {
                warn!(command = command.name(), error = %e, "feed write failed");
                self.go_offline();
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        if !self.config.heartbeat.send_frames {
            return;
        }
        let Some(stream) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = stream.send(Message::Text(PING_FRAME.to_string().into())).await {
            warn!(error = %e, "heartbeat write failed");
            self.go_offline();
        }
    }

    fn arm_heartbeat(&mut self) {
        let period = self.config.heartbeat.interval;
        if period.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
    }

    /// Drop the connection and, unless disconnected on purpose, schedule the
    /// next attempt.
    fn go_offline(&mut self) {
        self.connection = None;
        self.heartbeat = None;
        self.publish(ConnectionStatus::Offline);
        if self.is_current() && self.reconnect_at.is_none() {
            let delay = self.backoff.next_delay();
            self.attempt += 1;
            info!(
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "feed reconnect scheduled"
            );
            self.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    async fn teardown(&mut self) {
        self.dialing = None;
        self.reconnect_at = None;
        self.heartbeat = None;
        if let Some(mut stream) = self.connection.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, stream.close(None)).await;
            info!(url = %self.config.url, "feed disconnected");
        }
    }
}

fn build_request(url: &str, token: Option<&str>) -> Result<HandshakeRequest, DialError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        let value =
            HeaderValue::from_str(&subprotocol_header(token)).map_err(|_| DialError::InvalidToken)?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

async fn poll_dial(dialing: &mut Option<DialFuture>) -> Result<WsStream, DialError> {
    match dialing {
        Some(dial) => dial.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    connection: &mut Option<WsStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match connection {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
