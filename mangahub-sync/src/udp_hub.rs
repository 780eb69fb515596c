//! UDP notification hub: best-effort fan-out to registered peers.
//!
//! Peers join with a bare `REGISTER` datagram and are confirmed with
//! `REGISTERED`. The confirmation is sent while the registry write lock is
//! held, so no notification can reach a peer before its confirmation.
//!
//! UDP gives no delivery feedback, so registrations are soft state: each
//! one expires after `registration_ttl` unless the peer registers again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::{NotificationEvent, UdpCommand, REGISTERED};
use crate::registry::DeliveryReport;

/// Largest datagram the hub will read.
const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP hub configuration.
#[derive(Debug, Clone)]
pub struct UdpHubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Registrations expire after this long without a fresh `REGISTER`
    /// (None = never expire)
    pub registration_ttl: Option<Duration>,
    /// How often expired registrations are pruned
    pub prune_interval: Duration,
    /// Accept `BROADCAST <json>` datagrams
    pub allow_admin_broadcast: bool,
}

impl Default for UdpHubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9091".to_string(),
            registration_ttl: Some(Duration::from_secs(300)),
            prune_interval: Duration::from_secs(30),
            allow_admin_broadcast: true,
        }
    }
}

/// Registered peers with the time they last registered.
type PeerTable = Arc<RwLock<HashMap<SocketAddr, Instant>>>;

#[derive(Debug, Default)]
struct UdpCounters {
    notifications: AtomicU64,
    datagrams_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Snapshot of UDP hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpHubStats {
    pub registered_peers: usize,
    pub notifications: u64,
    pub datagrams_sent: u64,
    pub send_failures: u64,
}

/// Cloneable handle for delivering notifications and querying peers.
#[derive(Clone)]
pub struct UdpHubHandle {
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    counters: Arc<UdpCounters>,
}

impl UdpHubHandle {
    /// Send `event` to every registered peer. Per-peer send failures are
    /// logged and counted, never returned.
    pub async fn notify(&self, event: &NotificationEvent) -> Result<DeliveryReport, SyncError> {
        let datagram = event.encode()?;
        let peers = self.peers.read().await;
        let mut report = DeliveryReport::default();

        for addr in peers.keys() {
            match self.socket.send_to(&datagram, addr).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    log::warn!("UDP notification to {addr} failed: {e}");
                    report.dropped += 1;
                }
            }
        }
        drop(peers);

        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        self.counters
            .datagrams_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .send_failures
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        Ok(report)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn is_registered(&self, addr: &SocketAddr) -> bool {
        self.peers.read().await.contains_key(addr)
    }

    pub async fn stats(&self) -> UdpHubStats {
        UdpHubStats {
            registered_peers: self.peer_count().await,
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            datagrams_sent: self.counters.datagrams_sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Running UDP hub.
pub struct UdpNotificationHub {
    local_addr: SocketAddr,
    handle: UdpHubHandle,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpNotificationHub {
    /// Bind the socket and spawn the receive loop.
    pub async fn start(config: UdpHubConfig) -> Result<Self, SyncError> {
        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|source| SyncError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let handle = UdpHubHandle {
            socket: Arc::new(socket),
            peers: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(UdpCounters::default()),
        };
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(handle.clone(), config, stop_rx));

        log::info!("UDP notification hub listening on {local_addr}");

        Ok(Self {
            local_addr,
            handle,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn handle(&self) -> UdpHubHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn notify(&self, event: &NotificationEvent) -> Result<DeliveryReport, SyncError> {
        self.handle.notify(event).await
    }

    pub async fn peer_count(&self) -> usize {
        self.handle.peer_count().await
    }

    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        log::info!("UDP notification hub on {} shut down", self.local_addr);
    }
}

async fn receive_loop(hub: UdpHubHandle, config: UdpHubConfig, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut prune = tokio::time::interval(config.prune_interval.max(Duration::from_millis(10)));
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = async {
                if config.registration_ttl.is_some() {
                    prune.tick().await
                } else {
                    // Registrations never expire
                    std::future::pending().await
                }
            } => {
                if let Some(ttl) = config.registration_ttl {
                    prune_expired(&hub.peers, ttl).await;
                }
            }
            received = hub.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => handle_datagram(&hub, &config, &buf[..len], from).await,
                Err(e) => log::warn!("UDP receive failed: {e}"),
            }
        }
    }
}

async fn handle_datagram(hub: &UdpHubHandle, config: &UdpHubConfig, datagram: &[u8], from: SocketAddr) {
    match UdpCommand::parse(datagram) {
        Ok(UdpCommand::Register) => {
            let mut peers = hub.peers.write().await;
            let is_new = peers.insert(from, Instant::now()).is_none();
            // Reply while holding the lock so no notification overtakes it
            if let Err(e) = hub.socket.send_to(REGISTERED.as_bytes(), from).await {
                log::warn!("Failed to confirm registration for {from}: {e}");
                peers.remove(&from);
                return;
            }
            if is_new {
                log::info!("UDP peer {from} registered ({} total)", peers.len());
            } else {
                log::debug!("UDP peer {from} refreshed registration");
            }
        }
        Ok(UdpCommand::Unregister) => {
            if hub.peers.write().await.remove(&from).is_some() {
                log::info!("UDP peer {from} unregistered");
            }
        }
        Ok(UdpCommand::Broadcast(event)) => {
            if !config.allow_admin_broadcast {
                log::warn!("Rejected admin broadcast from {from}: disabled");
                return;
            }
            match hub.notify(&event).await {
                Ok(report) => log::info!(
                    "Admin broadcast from {from} sent to {} peers ({} failed)",
                    report.delivered,
                    report.dropped
                ),
                Err(e) => log::warn!("Admin broadcast from {from} failed: {e}"),
            }
        }
        Ok(UdpCommand::Unknown) => {
            log::debug!("Ignoring unrecognised {}-byte datagram from {from}", datagram.len());
        }
        Err(e) => log::warn!("Malformed datagram from {from}: {e}"),
    }
}

async fn prune_expired(peers: &PeerTable, ttl: Duration) {
    let mut peers = peers.write().await;
    let before = peers.len();
    peers.retain(|_, registered| registered.elapsed() < ttl);
    let pruned = before - peers.len();
    if pruned > 0 {
        log::info!("Pruned {pruned} expired UDP registrations");
    }
}
