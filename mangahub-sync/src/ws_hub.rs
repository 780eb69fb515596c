//! WebSocket chat hub with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Room "manga-1" ── registry ──┬── Client A
//!            ├── commands ─► dispatch                               └── Client B
//! Client B ──┘   (FIFO)            └── Room "manga-2" ── registry ───── Client C
//! ```
//!
//! Each room is its own connection registry. Rooms appear on first join and
//! are removed as soon as their last member leaves.
//!
//! A joining connection waits for the dispatch task to acknowledge the join
//! before its read loop starts. The `join` notice is enqueued to existing
//! members inside that same dispatch step, so every existing member sees it
//! before anything the new member sends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{Identity, IdentityResolver};
use crate::error::SyncError;
use crate::history::ChatHistory;
use crate::protocol::{ChatKind, ChatMessage, ClientFrame};
use crate::registry::{
    BroadcastStats, ConnId, ConnectionHandle, ConnectionRegistry, RegistryCounters,
};

type RoomHandle = ConnectionHandle<Identity, Message>;

/// Floor for the keepalive interval; `interval` rejects zero.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);
type MembershipView = Arc<RwLock<HashMap<String, Vec<RoomMember>>>>;

/// WebSocket hub configuration.
#[derive(Debug, Clone)]
pub struct WsHubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Capacity of the dispatch command channel
    pub command_capacity: usize,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// Upper bound on the HTTP upgrade
    pub handshake_timeout: Duration,
}

impl Default for WsHubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9092".to_string(),
            queue_capacity: 64,
            command_capacity: 1024,
            ping_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// One member of a room, as exposed to the room-info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub connection_id: ConnId,
    pub user_id: String,
    pub username: String,
}

impl RoomMember {
    fn from_handle(handle: &RoomHandle) -> Self {
        Self {
            connection_id: handle.id(),
            user_id: handle.meta().user_id.clone(),
            username: handle.meta().username.clone(),
        }
    }
}

enum RoomCommand {
    Join {
        room_id: String,
        handle: RoomHandle,
        joined: oneshot::Sender<()>,
    },
    Leave {
        room_id: String,
        conn_id: ConnId,
    },
    Broadcast {
        message: ChatMessage,
    },
}

/// State owned by the dispatch task.
struct RoomTable {
    rooms: HashMap<String, ConnectionRegistry<Identity, Message>>,
    counters: Arc<RegistryCounters>,
    view: MembershipView,
}

impl RoomTable {
    async fn join(&mut self, room_id: String, handle: RoomHandle) {
        let counters = self.counters.clone();
        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            log::info!("Room {room_id} created");
            ConnectionRegistry::with_counters(counters)
        });

        if !room.is_empty() {
            let notice = ChatMessage::join(&room_id, handle.meta());
            if let Some(frame) = encode_frame(&notice) {
                room.broadcast(&frame, None);
            }
        }

        log::info!(
            "{} ({}) joined room {room_id} as {}",
            handle.meta().username,
            handle.meta().user_id,
            handle.id()
        );
        room.register(handle);
        self.publish(&room_id).await;
    }

    async fn leave(&mut self, room_id: String, conn_id: ConnId) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(handle) = room.unregister(&conn_id) else {
            return;
        };
        log::info!("{} left room {room_id}", handle.meta().username);

        if room.is_empty() {
            self.rooms.remove(&room_id);
            log::info!("Room {room_id} removed (empty)");
        } else {
            let notice = ChatMessage::leave(&room_id, handle.meta());
            if let Some(frame) = encode_frame(&notice) {
                room.broadcast(&frame, None);
            }
        }
        drop(handle);
        self.publish(&room_id).await;
    }

    fn broadcast(&self, message: &ChatMessage) {
        let Some(room) = self.rooms.get(&message.room_id) else {
            log::debug!("Dropping message for unknown room {}", message.room_id);
            return;
        };
        if let Some(frame) = encode_frame(message) {
            let report = room.broadcast(&frame, None);
            if report.dropped > 0 {
                log::warn!(
                    "Room {}: message {} dropped for {} members",
                    message.room_id,
                    message.id,
                    report.dropped
                );
            }
        }
    }

    /// Refresh the read-only membership view for one room.
    async fn publish(&self, room_id: &str) {
        let mut view = self.view.write().await;
        match self.rooms.get(room_id) {
            Some(room) => {
                let members = room.handles().map(RoomMember::from_handle).collect();
                view.insert(room_id.to_string(), members);
            }
            None => {
                view.remove(room_id);
            }
        }
    }
}

fn encode_frame(message: &ChatMessage) -> Option<Message> {
    match message.encode() {
        Ok(json) => Some(Message::text(json)),
        Err(e) => {
            log::warn!("Failed to encode chat message {}: {e}", message.id);
            None
        }
    }
}

/// Running WebSocket hub.
pub struct WebSocketRoomHub {
    local_addr: SocketAddr,
    commands: mpsc::Sender<RoomCommand>,
    counters: Arc<RegistryCounters>,
    view: MembershipView,
    stop: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketRoomHub {
    /// Bind the listener and spawn the accept and dispatch tasks.
    ///
    /// `history` is optional; the hub works the same without it.
    pub async fn start(
        config: WsHubConfig,
        resolver: Arc<dyn IdentityResolver>,
        history: Option<Arc<dyn ChatHistory>>,
    ) -> Result<Self, SyncError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| SyncError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (stop, _) = watch::channel(false);
        let counters = Arc::new(RegistryCounters::default());
        let view: MembershipView = Arc::new(RwLock::new(HashMap::new()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let table = RoomTable {
            rooms: HashMap::new(),
            counters: counters.clone(),
            view: view.clone(),
        };
        let dispatch = tokio::spawn(dispatch_loop(table, command_rx, stop.subscribe()));

        let context = ConnectionContext {
            commands: commands.clone(),
            resolver,
            history,
            config,
        };
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::new(context),
            stop.subscribe(),
            shutting_down.clone(),
        ));

        log::info!("WebSocket chat hub listening on {local_addr}");

        Ok(Self {
            local_addr,
            commands,
            counters,
            view,
            stop,
            shutting_down,
            tasks: Mutex::new(vec![accept, dispatch]),
        })
    }

    /// Members of a room. An unknown or torn-down room is empty.
    pub async fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        self.view
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.view.read().await.len()
    }

    pub async fn rooms(&self) -> Vec<String> {
        self.view.read().await.keys().cloned().collect()
    }

    /// Send a `system` message to every member of a room.
    pub async fn send_system_message(&self, room_id: &str, content: &str) -> Result<(), SyncError> {
        let message = ChatMessage::system(room_id, content);
        self.commands
            .send(RoomCommand::Broadcast { message })
            .await
            .map_err(|_| SyncError::HubClosed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connection count across all rooms, for health checks.
    pub fn connection_count(&self) -> usize {
        self.counters.active_connections()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.counters.snapshot()
    }

    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.view.write().await.clear();
        log::info!("WebSocket chat hub on {} shut down", self.local_addr);
    }
}

/// Shared by every connection task.
struct ConnectionContext {
    commands: mpsc::Sender<RoomCommand>,
    resolver: Arc<dyn IdentityResolver>,
    history: Option<Arc<dyn ChatHistory>>,
    config: WsHubConfig,
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    mut stop: watch::Receiver<bool>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, context).await {
                            log::warn!("WebSocket connection from {addr} failed: {e}");
                        }
                    });
                }
                Err(e) if shutting_down.load(Ordering::SeqCst) => {
                    log::info!("Listener closed during shutdown: {e}");
                    break;
                }
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn dispatch_loop(
    mut table: RoomTable,
    mut commands: mpsc::Receiver<RoomCommand>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = stop.changed() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            RoomCommand::Join { room_id, handle, joined } => {
                table.join(room_id, handle).await;
                let _ = joined.send(());
            }
            RoomCommand::Leave { room_id, conn_id } => table.leave(room_id, conn_id).await,
            RoomCommand::Broadcast { message } => table.broadcast(&message),
        }
    }

    log::info!("WebSocket dispatch stopped with {} rooms", table.rooms.len());
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Validate the upgrade request: a `room_id` query parameter and a bearer
/// credential (header, or `token` query parameter).
fn authorize(
    request: &Request,
    resolver: &dyn IdentityResolver,
) -> Result<(Identity, String), ErrorResponse> {
    let query = request.uri().query().unwrap_or("");
    let mut room_id = None;
    let mut query_token = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "room_id" => room_id = Some(value.into_owned()),
            "token" => query_token = Some(value.into_owned()),
            _ => {}
        }
    }

    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    let room_id = room_id
        .filter(|room| !room.trim().is_empty())
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "room_id query parameter is required"))?;
    let credential = bearer
        .or(query_token)
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing bearer credential"))?;
    let identity = resolver
        .resolve(&credential)
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "invalid credential"))?;

    Ok((identity, room_id))
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<ConnectionContext>,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut admitted: Option<(Identity, String)> = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        let (identity, room_id) = authorize(request, context.resolver.as_ref())?;
        admitted = Some((identity, room_id));
        Ok(response)
    });
    let ws_stream = tokio::time::timeout(context.config.handshake_timeout, handshake)
        .await
        .map_err(|_| SyncError::Timeout("waiting for the WebSocket upgrade"))??;
    let Some((identity, room_id)) = admitted else {
        return Err(SyncError::Handshake("upgrade completed without identity".to_string()));
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (handle, mut outbound) = ConnectionHandle::new(identity.clone(), context.config.queue_capacity);
    let conn_id = handle.id();
    log::debug!("WebSocket upgrade from {addr} for {} in room {room_id}", identity.username);

    // Existing members get the join notice before this connection can send.
    let (joined_tx, joined_rx) = oneshot::channel();
    let join = RoomCommand::Join {
        room_id: room_id.clone(),
        handle,
        joined: joined_tx,
    };
    context.commands.send(join).await.map_err(|_| SyncError::HubClosed)?;
    joined_rx.await.map_err(|_| SyncError::HubClosed)?;

    let ping_interval = context.config.ping_interval.max(MIN_PING_INTERVAL);
    let mut writer_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(frame).await {
                            log::warn!("Write to {addr} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        log::warn!("Keepalive to {addr} failed: {e}");
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer_task => break,
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(message) = admit_frame(text.as_str(), &room_id, &identity) else {
                        continue;
                    };
                    if let Some(history) = &context.history {
                        if let Err(e) = history.record(&message) {
                            log::warn!("Failed to record chat message {}: {e}", message.id);
                        }
                    }
                    if context.commands.send(RoomCommand::Broadcast { message }).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    log::warn!("Ignoring {}-byte binary frame from {addr}", data.len());
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Connection closed by {addr}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Read from {addr} failed: {e}");
                    break;
                }
            }
        }
    }

    let _ = context.commands.send(RoomCommand::Leave { room_id, conn_id }).await;
    Ok(())
}

/// Turn a client frame into a room message, or log why it was skipped.
fn admit_frame(text: &str, room_id: &str, author: &Identity) -> Option<ChatMessage> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Malformed chat frame from {}: {e}", author.username);
            return None;
        }
    };
    if frame.kind != ChatKind::Text {
        log::warn!("{} sent a {:?} frame; only text is accepted", author.username, frame.kind);
        return None;
    }
    if frame.content.trim().is_empty() {
        log::debug!("Skipping empty message from {}", author.username);
        return None;
    }
    if !frame.room_id.is_empty() && frame.room_id != room_id {
        log::warn!(
            "{} addressed room {} on a connection bound to {room_id}",
            author.username,
            frame.room_id
        );
        return None;
    }
    Some(ChatMessage::text(room_id, author, frame.content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenTable;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{DuplexStream, ReadBuf};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::WebSocketStream;

    fn resolver() -> TokenTable {
        TokenTable::new().with("good", Identity::new("u1", "alice"))
    }

    fn request(uri: &str, bearer: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = WsHubConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9092");
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_authorize_with_bearer_header() {
        let (identity, room) = authorize(&request("/ws?room_id=manga-1", Some("good")), &resolver()).unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(room, "manga-1");
    }

    #[test]
    fn test_authorize_with_query_token() {
        let (identity, room) = authorize(&request("/ws?room_id=a%20b&token=good", None), &resolver()).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(room, "a b");
    }

    #[test]
    fn test_authorize_rejections() {
        let missing_room = authorize(&request("/ws", Some("good")), &resolver()).unwrap_err();
        assert_eq!(missing_room.status(), StatusCode::BAD_REQUEST);

        let missing_token = authorize(&request("/ws?room_id=r", None), &resolver()).unwrap_err();
        assert_eq!(missing_token.status(), StatusCode::UNAUTHORIZED);

        let bad_token = authorize(&request("/ws?room_id=r", Some("nope")), &resolver()).unwrap_err();
        assert_eq!(bad_token.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_admit_frame_filters() {
        let alice = Identity::new("u1", "alice");

        let message = admit_frame(r#"{"room_id":"r","content":"hello"}"#, "r", &alice).unwrap();
        assert_eq!(message.kind, ChatKind::Text);
        assert_eq!(message.username, "alice");
        assert_eq!(message.room_id, "r");

        // Room omitted: bound room is used
        assert!(admit_frame(r#"{"content":"hi"}"#, "r", &alice).is_some());

        assert!(admit_frame("garbage", "r", &alice).is_none());
        assert!(admit_frame(r#"{"room_id":"r","content":"  "}"#, "r", &alice).is_none());
        assert!(admit_frame(r#"{"room_id":"r","content":"x","type":"system"}"#, "r", &alice).is_none());
        assert!(admit_frame(r#"{"room_id":"other","content":"x"}"#, "r", &alice).is_none());
    }

    #[tokio::test]
    async fn test_room_table_lifecycle() {
        let counters = Arc::new(RegistryCounters::default());
        let view: MembershipView = Arc::new(RwLock::new(HashMap::new()));
        let mut table = RoomTable {
            rooms: HashMap::new(),
            counters: counters.clone(),
            view: view.clone(),
        };

        let (alice, mut alice_rx) = ConnectionHandle::new(Identity::new("u1", "alice"), 8);
        let (bob, _bob_rx) = ConnectionHandle::new(Identity::new("u2", "bob"), 8);
        let (alice_id, bob_id) = (alice.id(), bob.id());

        table.join("r".to_string(), alice).await;
        // First member sees no join notice of its own
        assert!(alice_rx.try_recv().is_err());

        table.join("r".to_string(), bob).await;
        let notice = alice_rx.try_recv().unwrap();
        let notice = ChatMessage::decode(notice.to_text().unwrap()).unwrap();
        assert_eq!(notice.kind, ChatKind::Join);
        assert_eq!(notice.username, "bob");

        assert_eq!(view.read().await.get("r").map(Vec::len), Some(2));
        assert_eq!(counters.active_connections(), 2);

        table.leave("r".to_string(), bob_id).await;
        let notice = ChatMessage::decode(alice_rx.try_recv().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(notice.kind, ChatKind::Leave);

        table.leave("r".to_string(), alice_id).await;
        assert!(table.rooms.is_empty());
        assert!(view.read().await.get("r").is_none());

        // Idempotent teardown
        table.leave("r".to_string(), alice_id).await;
        assert!(table.rooms.is_empty());
        assert_eq!(counters.active_connections(), 0);
    }

    /// Server side of an in-memory connection whose writes fail on demand.
    struct FailingWrites {
        inner: DuplexStream,
        fail: Arc<AtomicBool>,
    }

    impl AsyncRead for FailingWrites {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FailingWrites {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if this.fail.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
            }
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.fail.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
            }
            Pin::new(&mut this.inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    struct TestRooms {
        context: Arc<ConnectionContext>,
        view: MembershipView,
        stop: watch::Sender<bool>,
    }

    impl TestRooms {
        fn start() -> Self {
            let (commands, command_rx) = mpsc::channel(64);
            let (stop, _) = watch::channel(false);
            let view: MembershipView = Arc::new(RwLock::new(HashMap::new()));
            let table = RoomTable {
                rooms: HashMap::new(),
                counters: Arc::new(RegistryCounters::default()),
                view: view.clone(),
            };
            tokio::spawn(dispatch_loop(table, command_rx, stop.subscribe()));

            let tokens = TokenTable::new()
                .with("tok-alice", Identity::new("u1", "alice"))
                .with("tok-bob", Identity::new("u2", "bob"));
            let context = ConnectionContext {
                commands,
                resolver: Arc::new(tokens),
                history: None,
                config: WsHubConfig::default(),
            };
            Self {
                context: Arc::new(context),
                view,
                stop,
            }
        }

        async fn connect<S>(&self, server_end: S, client_end: DuplexStream, token: &str) -> WebSocketStream<DuplexStream>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let context = self.context.clone();
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            tokio::spawn(async move {
                let _ = handle_connection(server_end, addr, context).await;
            });
            let url = format!("ws://hub.test/ws?room_id=r&token={token}");
            let (ws, _) = tokio_tungstenite::client_async(url, client_end).await.unwrap();
            ws
        }

        async fn wait_for_members(&self, expected: usize) {
            timeout(Duration::from_secs(2), async {
                while self.view.read().await.get("r").map(Vec::len).unwrap_or(0) != expected {
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("room never reached {expected} members"));
        }
    }

    async fn next_chat(ws: &mut WebSocketStream<DuplexStream>) -> ChatMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for a chat message")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return ChatMessage::decode(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_write_failure_unregisters_only_that_member() {
        let rooms = TestRooms::start();

        let fail = Arc::new(AtomicBool::new(false));
        let (alice_server, alice_client) = tokio::io::duplex(64 * 1024);
        let alice_server = FailingWrites {
            inner: alice_server,
            fail: fail.clone(),
        };
        let mut alice = rooms.connect(alice_server, alice_client, "tok-alice").await;
        rooms.wait_for_members(1).await;

        let (bob_server, bob_client) = tokio::io::duplex(64 * 1024);
        let mut bob = rooms.connect(bob_server, bob_client, "tok-bob").await;
        rooms.wait_for_members(2).await;
        assert_eq!(next_chat(&mut alice).await.kind, ChatKind::Join);

        // Alice's socket still reads fine; only writes to her fail
        fail.store(true, Ordering::SeqCst);
        let message = ChatMessage::system("r", "Chapter 12 released");
        rooms
            .context
            .commands
            .send(RoomCommand::Broadcast { message })
            .await
            .unwrap();

        assert_eq!(next_chat(&mut bob).await.kind, ChatKind::System);
        rooms.wait_for_members(1).await;
        let members = rooms.view.read().await.get("r").cloned().unwrap();
        assert_eq!(members[0].username, "bob");

        let notice = next_chat(&mut bob).await;
        assert_eq!(notice.kind, ChatKind::Leave);
        assert_eq!(notice.username, "alice");

        // The room keeps working for the remaining member
        let message = ChatMessage::system("r", "still here");
        rooms
            .context
            .commands
            .send(RoomCommand::Broadcast { message })
            .await
            .unwrap();
        assert_eq!(next_chat(&mut bob).await.content, "still here");

        rooms.stop.send_replace(true);
    }
}
