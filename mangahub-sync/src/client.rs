//! Reconnecting consumer-side client.
//!
//! Provides:
//! - Connection lifecycle (connect, close, reconnect with backoff)
//! - Non-blocking send into a bounded outbound queue
//! - `next_frame()` yielding one inbound frame or a disconnect signal
//! - Status events on a side channel
//!
//! The transport is supplied by a [`Dialer`]. `WsChatDialer` speaks the
//! chat hub's WebSocket protocol; `UdpNotificationDialer` registers with
//! the UDP notification hub.
//!
//! ```text
//!           send() ─► outbound queue ─► writer task ─► Link.outbound
//! next_frame() ◄── receive queue ◄── reader task ◄── Link.inbound
//!                       (either task failing brings both down)
//! ```

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::{BackoffPolicy, ReconnectState};
use crate::error::SyncError;
use crate::protocol::{ChatMessage, ClientFrame, NotificationEvent, UdpControl, REGISTER, REGISTERED};

/// Largest datagram a notification listener reads.
const MAX_DATAGRAM: usize = 64 * 1024;

/// How long teardown waits for a task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Attempt ceiling reached; only an explicit `connect()` leaves this.
    Failed,
}

/// Status transitions published on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

/// Result of one `next_frame()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<T> {
    Frame(T),
    Disconnected,
}

/// What the writer hands to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing<T> {
    Frame(T),
    Keepalive,
}

pub type InboundStream<T> = BoxStream<'static, Result<T, SyncError>>;
pub type OutboundSink<T> = Pin<Box<dyn Sink<Outgoing<T>, Error = SyncError> + Send>>;

/// A dialed connection, split into decoded halves.
pub struct Link<I, O> {
    pub inbound: InboundStream<I>,
    pub outbound: OutboundSink<O>,
}

/// Transport-specific handshake.
pub trait Dialer: Send + Sync + 'static {
    type Inbound: Send + 'static;
    type Outbound: Send + 'static;

    fn dial(&self) -> BoxFuture<'_, Result<Link<Self::Inbound, Self::Outbound>, SyncError>>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Receive queue capacity; overflow drops the newest frame
    pub recv_capacity: usize,
    /// Outbound queue capacity; `send` fails when full
    pub send_capacity: usize,
    /// Interval between keepalives
    pub keepalive_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recv_capacity: 256,
            send_capacity: 256,
            keepalive_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Owns one outbound connection and its reconnection state.
pub struct ReconnectingClient<D: Dialer> {
    dialer: D,
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Backoff attempt counter
    reconnect: ReconnectState,

    /// Feeds the writer task of the current link
    outgoing_tx: Option<mpsc::Sender<D::Outbound>>,

    /// Filled by the reader task of the current link
    frames_rx: Option<mpsc::Receiver<D::Inbound>>,

    /// Link-down signal shared by the current reader and writer
    link_down: Option<Arc<watch::Sender<bool>>>,
    tasks: Vec<JoinHandle<()>>,

    status_tx: mpsc::Sender<ConnectionStatus>,
    status_rx: Option<mpsc::Receiver<ConnectionStatus>>,
}

impl<D: Dialer> ReconnectingClient<D> {
    pub fn new(dialer: D, config: ClientConfig) -> Self {
        let (status_tx, status_rx) = mpsc::channel(64);
        let reconnect = ReconnectState::new(config.backoff);
        Self {
            dialer,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconnect,
            outgoing_tx: None,
            frames_rx: None,
            link_down: None,
            tasks: Vec::new(),
            status_tx,
            status_rx: Some(status_rx),
        }
    }

    /// Take the status receiver (can only be called once).
    pub fn take_status_rx(&mut self) -> Option<mpsc::Receiver<ConnectionStatus>> {
        self.status_rx.take()
    }

    /// Dial and start the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        self.teardown().await;
        self.set_state(ConnectionState::Connecting).await;
        self.emit(ConnectionStatus::Connecting);

        match self.dialer.dial().await {
            Ok(link) => {
                self.start_link(link).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.dialer.peer());
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Redial with exponential backoff until a dial succeeds or the attempt
    /// ceiling is reached. Once exhausted, returns
    /// [`SyncError::ReconnectExhausted`] without sleeping.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        self.teardown().await;

        loop {
            let Some(delay) = self.reconnect.next_delay() else {
                let attempts = self.reconnect.attempt();
                log::error!("Giving up on {} after {attempts} attempts", self.dialer.peer());
                self.set_state(ConnectionState::Failed).await;
                self.emit(ConnectionStatus::Failed { attempts });
                return Err(SyncError::ReconnectExhausted { attempts });
            };
            let attempt = self.reconnect.attempt();

            log::info!(
                "Reconnecting to {} in {delay:?} (attempt {attempt})",
                self.dialer.peer()
            );
            self.set_state(ConnectionState::Reconnecting).await;
            self.emit(ConnectionStatus::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            match self.dialer.dial().await {
                Ok(link) => {
                    self.start_link(link).await;
                    return Ok(());
                }
                Err(e) => log::warn!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    /// Enqueue a frame for the writer. Fails immediately when the queue is
    /// full or there is no live link.
    pub fn send(&self, frame: D::Outbound) -> Result<(), SyncError> {
        let Some(tx) = self.outgoing_tx.as_ref() else {
            return Err(SyncError::NotConnected("client"));
        };
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SyncError::QueueFull,
            TrySendError::Closed(_) => SyncError::NotConnected("client"),
        })
    }

    /// Wait for exactly one inbound frame, or for the link to go down.
    /// Frames already received are returned before the disconnect.
    pub async fn next_frame(&mut self) -> ClientEvent<D::Inbound> {
        let Some(frames) = self.frames_rx.as_mut() else {
            return ClientEvent::Disconnected;
        };
        match frames.recv().await {
            Some(frame) => ClientEvent::Frame(frame),
            None => {
                self.frames_rx = None;
                ClientEvent::Disconnected
            }
        }
    }

    /// Stop both tasks and return to `Disconnected`.
    pub async fn close(&mut self) {
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected).await;
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn attempt(&self) -> u32 {
        self.reconnect.attempt()
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    async fn start_link(&mut self, link: Link<D::Inbound, D::Outbound>) {
        let (frames_tx, frames_rx) = mpsc::channel(self.config.recv_capacity.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.send_capacity.max(1));
        let down = Arc::new(watch::channel(false).0);

        self.reconnect.reset();
        self.set_state(ConnectionState::Connected).await;
        self.emit(ConnectionStatus::Connected);

        let reader = tokio::spawn(read_loop(
            link.inbound,
            frames_tx,
            down.clone(),
            self.state.clone(),
            self.status_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            link.outbound,
            outgoing_rx,
            self.config.keepalive_interval,
            down.clone(),
            self.state.clone(),
            self.status_tx.clone(),
        ));

        self.outgoing_tx = Some(outgoing_tx);
        self.frames_rx = Some(frames_rx);
        self.link_down = Some(down);
        self.tasks = vec![reader, writer];
        log::info!("Connected to {}", self.dialer.peer());
    }

    async fn teardown(&mut self) {
        if let Some(down) = self.link_down.take() {
            down.send_replace(true);
        }
        self.outgoing_tx = None;
        self.frames_rx = None;
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                log::debug!("Connection task still busy at close, aborting");
                task.abort();
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn emit(&self, status: ConnectionStatus) {
        if let Err(e) = self.status_tx.try_send(status) {
            log::debug!("Status event not delivered: {e}");
        }
    }
}

impl<D: Dialer> Drop for ReconnectingClient<D> {
    fn drop(&mut self) {
        if let Some(down) = self.link_down.take() {
            down.send_replace(true);
        }
    }
}

/// Mark the link down once, whichever task gets there first.
async fn mark_down(
    down: &watch::Sender<bool>,
    state: &RwLock<ConnectionState>,
    status: &mpsc::Sender<ConnectionStatus>,
) {
    if down.send_replace(true) {
        return;
    }
    let mut state = state.write().await;
    if *state == ConnectionState::Connected {
        *state = ConnectionState::Disconnected;
        let _ = status.try_send(ConnectionStatus::Disconnected);
        log::info!("Connection lost");
    }
}

async fn read_loop<I>(
    mut inbound: InboundStream<I>,
    frames: mpsc::Sender<I>,
    down: Arc<watch::Sender<bool>>,
    state: Arc<RwLock<ConnectionState>>,
    status: mpsc::Sender<ConnectionStatus>,
) {
    let mut stop = down.subscribe();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            item = inbound.next() => match item {
                Some(Ok(frame)) => match frames.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => log::warn!("Receive queue full, dropping frame"),
                    Err(TrySendError::Closed(_)) => break,
                },
                Some(Err(e)) => {
                    log::warn!("Read failed: {e}");
                    break;
                }
                None => break,
            }
        }
    }
    mark_down(&down, &state, &status).await;
}

async fn write_loop<O>(
    mut outbound: OutboundSink<O>,
    mut frames: mpsc::Receiver<O>,
    keepalive_interval: Duration,
    down: Arc<watch::Sender<bool>>,
    state: Arc<RwLock<ConnectionState>>,
    status: mpsc::Sender<ConnectionStatus>,
) {
    let mut stop = down.subscribe();
    let mut keepalive = tokio::time::interval(keepalive_interval.max(Duration::from_millis(10)));
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = outbound.send(Outgoing::Frame(frame)).await {
                        log::warn!("Write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if let Err(e) = outbound.send(Outgoing::Keepalive).await {
                    log::warn!("Keepalive failed: {e}");
                    break;
                }
            }
        }
    }
    let _ = outbound.close().await;
    mark_down(&down, &state, &status).await;
}

/// Dials the chat hub for one room.
#[derive(Debug, Clone)]
pub struct WsChatDialer {
    /// Hub endpoint, e.g. `ws://127.0.0.1:9092/ws`
    pub url: String,
    pub room_id: String,
    /// Bearer credential
    pub token: String,
}

impl WsChatDialer {
    pub fn new(url: impl Into<String>, room_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            token: token.into(),
        }
    }

    fn endpoint(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("room_id", &self.room_id)
            .finish();
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.url)
    }
}

impl Dialer for WsChatDialer {
    type Inbound = ChatMessage;
    type Outbound = ClientFrame;

    fn dial(&self) -> BoxFuture<'_, Result<Link<ChatMessage, ClientFrame>, SyncError>> {
        Box::pin(async move {
            let mut request = self.endpoint().into_client_request()?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|e| SyncError::Handshake(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
            let (ws_sink, ws_stream) = ws_stream.split();

            let inbound = ws_stream
                .filter_map(|message| async move {
                    match message {
                        Ok(Message::Text(text)) => match ChatMessage::decode(text.as_str()) {
                            Ok(chat) => Some(Ok(chat)),
                            Err(e) => {
                                log::warn!("Skipping malformed chat frame: {e}");
                                None
                            }
                        },
                        Ok(Message::Close(_)) => Some(Err(SyncError::ConnectionClosed)),
                        Ok(_) => None,
                        Err(e) => Some(Err(SyncError::from(e))),
                    }
                })
                .boxed();

            let outbound = ws_sink
                .sink_map_err(SyncError::from)
                .with(|outgoing: Outgoing<ClientFrame>| async move {
                    let message = match outgoing {
                        Outgoing::Frame(frame) => Message::text(serde_json::to_string(&frame)?),
                        Outgoing::Keepalive => Message::Ping(Vec::new().into()),
                    };
                    Ok::<_, SyncError>(message)
                });

            Ok(Link {
                inbound,
                outbound: Box::pin(outbound),
            })
        })
    }

    fn peer(&self) -> String {
        format!("chat room {} at {}", self.room_id, self.url)
    }
}

/// Registers with the UDP notification hub.
#[derive(Debug, Clone)]
pub struct UdpNotificationDialer {
    pub target: SocketAddr,
    /// Local address to bind, usually an ephemeral port
    pub bind_addr: String,
    /// How long to wait for `REGISTERED`
    pub handshake_timeout: Duration,
}

impl UdpNotificationDialer {
    pub fn new(target: SocketAddr) -> Self {
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        Self {
            target,
            bind_addr: bind_addr.to_string(),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

fn is_registered_reply(datagram: &[u8]) -> bool {
    std::str::from_utf8(datagram).is_ok_and(|text| text.trim() == REGISTERED)
}

impl Dialer for UdpNotificationDialer {
    type Inbound = NotificationEvent;
    type Outbound = UdpControl;

    fn dial(&self) -> BoxFuture<'_, Result<Link<NotificationEvent, UdpControl>, SyncError>> {
        Box::pin(async move {
            let socket = UdpSocket::bind(&self.bind_addr).await?;
            socket.connect(self.target).await?;
            socket.send(REGISTER.as_bytes()).await?;

            let mut buf = vec![0u8; MAX_DATAGRAM];
            let deadline = tokio::time::Instant::now() + self.handshake_timeout;
            loop {
                let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                    .await
                    .map_err(|_| SyncError::Timeout("waiting for REGISTERED"))??;
                if is_registered_reply(&buf[..len]) {
                    break;
                }
                log::debug!("Ignoring {len}-byte datagram before registration");
            }
            log::debug!("Registered with notification hub {}", self.target);

            let socket = Arc::new(socket);

            let inbound = futures_util::stream::unfold((socket.clone(), buf), |(socket, mut buf)| async move {
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(len) => {
                            let datagram = &buf[..len];
                            // Keepalive re-registrations are confirmed too
                            if is_registered_reply(datagram) {
                                continue;
                            }
                            match NotificationEvent::decode(datagram) {
                                Ok(event) => return Some((Ok(event), (socket, buf))),
                                Err(e) => log::warn!("Skipping malformed notification: {e}"),
                            }
                        }
                        Err(e) => return Some((Err(SyncError::from(e)), (socket, buf))),
                    }
                }
            })
            .boxed();

            let outbound = futures_util::sink::unfold(socket, |socket, outgoing: Outgoing<UdpControl>| async move {
                let datagram = match outgoing {
                    Outgoing::Frame(control) => control.to_datagram()?,
                    Outgoing::Keepalive => REGISTER.as_bytes().to_vec(),
                };
                socket.send(&datagram).await?;
                Ok::<_, SyncError>(socket)
            });

            Ok(Link {
                inbound,
                outbound: Box::pin(outbound),
            })
        })
    }

    fn peer(&self) -> String {
        format!("notification hub {}", self.target)
    }
}

/// Chat client for one room.
pub type ChatClient = ReconnectingClient<WsChatDialer>;

/// UDP notification listener.
pub type NotificationListener = ReconnectingClient<UdpNotificationDialer>;
