//! TCP progress-sync hub: one global broadcast domain.
//!
//! ```text
//! conn A ─ reader ──┐                        ┌── writer ─ conn A
//! conn B ─ reader ──┼─► commands ─► dispatch ┼── writer ─ conn B
//! conn C ─ reader ──┘   (FIFO)      (registry)└── writer ─ conn C
//! ```
//!
//! Readers decode newline-delimited `ProgressEvent`s and forward them as
//! commands. The dispatch task is the only owner of the registry, so
//! register, unregister and broadcast are applied strictly in the order
//! they were enqueued.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::ProgressEvent;
use crate::registry::{
    BroadcastStats, ConnId, ConnectionHandle, ConnectionRegistry, RegistryCounters,
};

type Payload = Arc<Vec<u8>>;
type TcpHandle = ConnectionHandle<SocketAddr, Payload>;

/// TCP hub configuration.
#[derive(Debug, Clone)]
pub struct TcpHubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Capacity of the dispatch command channel
    pub command_capacity: usize,
}

impl Default for TcpHubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            queue_capacity: 64,
            command_capacity: 1024,
        }
    }
}

enum HubCommand {
    Register(TcpHandle),
    Unregister(ConnId),
    Broadcast {
        origin: Option<ConnId>,
        event: ProgressEvent,
    },
}

/// Running TCP hub.
pub struct TcpSyncHub {
    local_addr: SocketAddr,
    commands: mpsc::Sender<HubCommand>,
    counters: Arc<RegistryCounters>,
    stop: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSyncHub {
    /// Bind the listener and spawn the accept and dispatch tasks.
    ///
    /// A bind failure is the only fatal error and is returned here.
    pub async fn start(config: TcpHubConfig) -> Result<Self, SyncError> {
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
        let shutting_down = Arc::new(AtomicBool::new(false));

        let registry = ConnectionRegistry::with_counters(counters.clone());
        let dispatch = tokio::spawn(dispatch_loop(registry, command_rx, stop.subscribe()));
        let accept = tokio::spawn(accept_loop(
            listener,
            commands.clone(),
            config.queue_capacity,
            stop.subscribe(),
            shutting_down.clone(),
        ));

        log::info!("TCP sync hub listening on {local_addr}");

        Ok(Self {
            local_addr,
            commands,
            counters,
            stop,
            shutting_down,
            tasks: Mutex::new(vec![accept, dispatch]),
        })
    }

    /// Broadcast an event to every connected client.
    pub async fn broadcast(&self, event: ProgressEvent) -> Result<(), SyncError> {
        self.commands
            .send(HubCommand::Broadcast { origin: None, event })
            .await
            .map_err(|_| SyncError::HubClosed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connection count, for health checks.
    pub fn connection_count(&self) -> usize {
        self.counters.active_connections()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.counters.snapshot()
    }

    /// Stop accepting and dispatching. Registered connections see their
    /// queues close and wind down on their own.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        log::info!("TCP sync hub on {} shut down", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    commands: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
    mut stop: watch::Receiver<bool>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    tokio::spawn(handle_connection(stream, addr, commands.clone(), queue_capacity));
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
    mut registry: ConnectionRegistry<SocketAddr, Payload>,
    mut commands: mpsc::Receiver<HubCommand>,
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
            HubCommand::Register(handle) => {
                log::info!("TCP client {} connected as {}", handle.meta(), handle.id());
                registry.register(handle);
            }
            HubCommand::Unregister(id) => {
                if let Some(handle) = registry.unregister(&id) {
                    log::info!("TCP client {} disconnected", handle.meta());
                }
            }
            HubCommand::Broadcast { origin, event } => match event.encode() {
                Ok(bytes) => {
                    let report = registry.broadcast(&Arc::new(bytes), origin);
                    log::debug!(
                        "Progress {}/{} ch.{} delivered to {}, dropped for {}",
                        event.user_id,
                        event.manga_id,
                        event.chapter,
                        report.delivered,
                        report.dropped
                    );
                }
                Err(e) => log::warn!("Failed to encode progress event: {e}"),
            },
        }
    }

    log::info!("TCP dispatch stopped with {} connections", registry.len());
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    commands: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
) {
    let (handle, mut outbound) = ConnectionHandle::new(addr, queue_capacity);
    let conn_id = handle.id();
    if commands.send(HubCommand::Register(handle)).await.is_err() {
        return;
    }

    let (reader, mut writer) = stream.into_split();

    let mut writer_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = write_line(&mut writer, &payload).await {
                log::warn!("Write to {addr} failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = &mut writer_task => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ProgressEvent::decode(&line) {
                        Ok(event) => {
                            let command = HubCommand::Broadcast { origin: Some(conn_id), event };
                            if commands.send(command).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Skipping malformed line from {addr}: {e}"),
                    }
                }
                Ok(None) => {
                    log::debug!("Connection closed by {addr}");
                    break;
                }
                Err(e) => {
                    log::warn!("Read from {addr} failed: {e}");
                    break;
                }
            }
        }
    }

    let _ = commands.send(HubCommand::Unregister(conn_id)).await;
}

async fn write_line(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await
}
