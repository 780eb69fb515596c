//! Protocol bridge: one progress event, three independent transports.
//!
//! ```text
//!                         ┌── task ── TCP line ──────► TCP sync hub
//! broadcast_progress_update ── task ── UDP notify ────► registered peers
//!                         └── task ── JSON-RPC line ──► audit service
//! ```
//!
//! Every branch runs in its own task. A branch that fails is logged and
//! counted; it never delays or fails the other two, and the caller only
//! gets back the task handles.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::protocol::{AuditRequest, NotificationEvent, ProgressEvent, RpcRequest};
use crate::udp_hub::UdpHubHandle;

/// TCP sync hub dialed when no address is configured.
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:9090";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP sync hub to forward progress lines to. `None` means the hub
    /// started alongside the bridge, or `DEFAULT_TCP_ADDR` standalone.
    pub tcp_addr: Option<String>,
    /// Audit RPC endpoint
    pub rpc_addr: String,
    /// Upper bound on each dial
    pub dial_timeout: Duration,
    /// Upper bound on each line write, including the wait for the link
    pub write_timeout: Duration,
    /// Dial a disconnected branch again when the next event arrives
    pub redial_on_use: bool,
    /// JSON-RPC method invoked for each event
    pub rpc_method: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_addr: None,
            rpc_addr: "127.0.0.1:9093".to_string(),
            dial_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            redial_on_use: true,
            rpc_method: "AuditService.RecordProgress".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Point the TCP branch at a hub bound on `bound`, unless an address
    /// was set explicitly. A wildcard bind is dialed over loopback.
    pub fn with_local_tcp_hub(mut self, bound: SocketAddr) -> Self {
        if self.tcp_addr.is_none() {
            let mut target = bound;
            if target.ip().is_unspecified() {
                target.set_ip(match target {
                    SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                    SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
                });
            }
            self.tcp_addr = Some(target.to_string());
        }
        self
    }
}

/// The three downstream transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Tcp,
    Udp,
    Rpc,
}

impl Branch {
    fn name(self) -> &'static str {
        match self {
            Branch::Tcp => "tcp",
            Branch::Udp => "udp",
            Branch::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How one branch handled one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Delivered,
    /// Branch not connected (or not configured) and not redialed.
    Skipped,
    Failed(String),
}

impl BranchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Outcome of all three branches for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub tcp: BranchOutcome,
    pub udp: BranchOutcome,
    pub rpc: BranchOutcome,
}

/// Handles of the three branch tasks for one event.
///
/// Dropping a `FanOut` detaches the tasks; they still run to completion.
pub struct FanOut {
    tcp: JoinHandle<BranchOutcome>,
    udp: JoinHandle<BranchOutcome>,
    rpc: JoinHandle<BranchOutcome>,
}

impl FanOut {
    /// Wait for every branch to finish.
    pub async fn join(self) -> FanOutReport {
        let (tcp, udp, rpc) = tokio::join!(self.tcp, self.udp, self.rpc);
        FanOutReport {
            tcp: settle_task(Branch::Tcp, tcp),
            udp: settle_task(Branch::Udp, udp),
            rpc: settle_task(Branch::Rpc, rpc),
        }
    }
}

fn settle_task(
    branch: Branch,
    result: Result<BranchOutcome, tokio::task::JoinError>,
) -> BranchOutcome {
    result.unwrap_or_else(|e| {
        log::error!("Bridge {branch} task did not complete: {e}");
        BranchOutcome::Failed(e.to_string())
    })
}

#[derive(Debug, Default)]
struct BranchCounters {
    delivered: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl BranchCounters {
    fn record(&self, outcome: &BranchOutcome) {
        let counter = match outcome {
            BranchOutcome::Delivered => &self.delivered,
            BranchOutcome::Skipped => &self.skipped,
            BranchOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BranchStats {
        BranchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStats {
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Per-branch counters and connection flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub tcp: BranchStats,
    pub udp: BranchStats,
    pub rpc: BranchStats,
    pub tcp_connected: bool,
    pub rpc_connected: bool,
}

/// Live half of a line link.
struct LinkConn {
    writer: OwnedWriteHalf,
    drainer: JoinHandle<()>,
}

/// Outbound newline-delimited connection whose inbound side is read and
/// discarded.
struct LineLink {
    branch: Branch,
    addr: String,
    dial_timeout: Duration,
    write_timeout: Duration,
    conn: Mutex<Option<LinkConn>>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    epoch: Arc<AtomicU64>,
}

impl LineLink {
    fn new(branch: Branch, addr: String, config: &BridgeConfig) -> Self {
        Self {
            branch,
            addr,
            dial_timeout: config.dial_timeout,
            write_timeout: config.write_timeout,
            conn: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn lock_conn(&self) -> Result<tokio::sync::MutexGuard<'_, Option<LinkConn>>, SyncError> {
        tokio::time::timeout(self.write_timeout, self.conn.lock())
            .await
            .map_err(|_| SyncError::Timeout("waiting for a bridge link"))
    }

    /// Drop the live connection, if any, and mark the link down.
    fn disconnect(&self, slot: &mut Option<LinkConn>) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(stale) = slot.take() {
            stale.drainer.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn dial(&self) -> Result<(), SyncError> {
        let mut slot = self.conn.lock().await;
        self.dial_locked(&mut slot).await
    }

    async fn dial_locked(&self, slot: &mut Option<LinkConn>) -> Result<(), SyncError> {
        if let Some(stale) = slot.take() {
            stale.drainer.abort();
        }

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| SyncError::Timeout("dialing a bridge peer"))??;
        let (reader, writer) = stream.into_split();

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.epoch.clone();
        let connected = self.connected.clone();
        let branch = self.branch;
        let addr = self.addr.clone();
        let drainer = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => log::trace!("{branch} peer {addr} replied: {line}"),
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("{branch} peer {addr} read failed: {e}");
                        break;
                    }
                }
            }
            if current.load(Ordering::SeqCst) == epoch {
                connected.store(false, Ordering::SeqCst);
                log::info!("Bridge {branch} link to {addr} closed by peer");
            }
        });

        *slot = Some(LinkConn { writer, drainer });
        self.connected.store(true, Ordering::SeqCst);
        log::info!("Bridge {} link connected to {}", self.branch, self.addr);
        Ok(())
    }

    /// Make sure the link is usable. `Ok(false)` means not connected and
    /// either redial is off or the link was closed.
    async fn ensure(&self, redial: bool) -> Result<bool, SyncError> {
        if self.is_connected() {
            return Ok(true);
        }
        if !redial || self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut slot = self.lock_conn().await?;
        // The link may have been closed or redialed while we waited
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.is_connected() {
            return Ok(true);
        }
        self.dial_locked(&mut slot).await?;
        Ok(true)
    }

    async fn send_line(&self, line: &[u8]) -> Result<(), SyncError> {
        let mut slot = self.lock_conn().await?;
        if !self.is_connected() {
            if let Some(stale) = slot.take() {
                stale.drainer.abort();
            }
            return Err(SyncError::NotConnected(self.branch.name()));
        }
        let Some(conn) = slot.as_mut() else {
            return Err(SyncError::NotConnected(self.branch.name()));
        };
        let written = tokio::time::timeout(self.write_timeout, conn.writer.write_all(line)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect(&mut slot);
                Err(e.into())
            }
            Err(_) => {
                log::warn!("Bridge {} peer {} stopped reading; dropping the link", self.branch, self.addr);
                self.disconnect(&mut slot);
                Err(SyncError::Timeout("writing to a bridge peer"))
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.writer.shutdown().await;
            conn.drainer.abort();
        }
    }
}

/// Fire-and-forget JSON-RPC audit client.
struct RpcAuditClient {
    link: LineLink,
    method: String,
    next_id: AtomicU64,
}

impl RpcAuditClient {
    async fn record(&self, event: &ProgressEvent) -> Result<(), SyncError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::audit(&self.method, id, AuditRequest::from(event));
        self.link.send_line(&request.encode_line()?).await
    }
}

struct BridgeInner {
    redial_on_use: bool,
    tcp: LineLink,
    rpc: RpcAuditClient,
    udp: Option<UdpHubHandle>,
    closed: AtomicBool,
    tcp_counters: BranchCounters,
    udp_counters: BranchCounters,
    rpc_counters: BranchCounters,
}

impl BridgeInner {
    fn counters(&self, branch: Branch) -> &BranchCounters {
        match branch {
            Branch::Tcp => &self.tcp_counters,
            Branch::Udp => &self.udp_counters,
            Branch::Rpc => &self.rpc_counters,
        }
    }

    fn settle(&self, branch: Branch, event: &ProgressEvent, result: Result<BranchOutcome, SyncError>) -> BranchOutcome {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!(
                    "Bridge {branch} branch failed for {}/{}: {e}",
                    event.user_id,
                    event.manga_id
                );
                BranchOutcome::Failed(e.to_string())
            }
        };
        if outcome == BranchOutcome::Skipped {
            log::debug!("Bridge {branch} branch skipped: not connected");
        }
        self.counters(branch).record(&outcome);
        outcome
    }

    async fn ready(&self, link: &LineLink) -> Result<bool, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        link.ensure(self.redial_on_use).await
    }

    async fn forward_tcp(&self, event: &ProgressEvent) -> BranchOutcome {
        let result = self.try_forward_tcp(event).await;
        self.settle(Branch::Tcp, event, result)
    }

    async fn try_forward_tcp(&self, event: &ProgressEvent) -> Result<BranchOutcome, SyncError> {
        if !self.ready(&self.tcp).await? {
            return Ok(BranchOutcome::Skipped);
        }
        let mut line = event.encode()?;
        line.push(b'\n');
        self.tcp.send_line(&line).await?;
        Ok(BranchOutcome::Delivered)
    }

    async fn notify_udp(&self, event: &ProgressEvent) -> BranchOutcome {
        let result = self.try_notify_udp(event).await;
        self.settle(Branch::Udp, event, result)
    }

    async fn try_notify_udp(&self, event: &ProgressEvent) -> Result<BranchOutcome, SyncError> {
        let Some(udp) = self.udp.as_ref() else {
            return Ok(BranchOutcome::Skipped);
        };
        let report = udp.notify(&NotificationEvent::progress(event)).await?;
        log::debug!(
            "Progress notification sent to {} UDP peers ({} failed)",
            report.delivered,
            report.dropped
        );
        Ok(BranchOutcome::Delivered)
    }

    async fn audit_rpc(&self, event: &ProgressEvent) -> BranchOutcome {
        let result = self.try_audit_rpc(event).await;
        self.settle(Branch::Rpc, event, result)
    }

    async fn try_audit_rpc(&self, event: &ProgressEvent) -> Result<BranchOutcome, SyncError> {
        if !self.ready(&self.rpc.link).await? {
            return Ok(BranchOutcome::Skipped);
        }
        self.rpc.record(event).await?;
        Ok(BranchOutcome::Delivered)
    }
}

/// Orchestrator fanning progress events out to every transport.
#[derive(Clone)]
pub struct ProtocolBridge {
    inner: Arc<BridgeInner>,
}

impl ProtocolBridge {
    /// Dial the TCP and RPC peers. Never fails: a peer that cannot be
    /// reached leaves its branch disconnected.
    pub async fn connect(config: BridgeConfig, udp: Option<UdpHubHandle>) -> Self {
        let tcp_addr = config
            .tcp_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_TCP_ADDR.to_string());
        let tcp = LineLink::new(Branch::Tcp, tcp_addr.clone(), &config);
        let rpc = RpcAuditClient {
            link: LineLink::new(Branch::Rpc, config.rpc_addr.clone(), &config),
            method: config.rpc_method.clone(),
            next_id: AtomicU64::new(1),
        };

        let (tcp_dial, rpc_dial) = tokio::join!(tcp.dial(), rpc.link.dial());
        if let Err(e) = tcp_dial {
            log::warn!("Bridge TCP peer {tcp_addr} unreachable, branch degraded: {e}");
        }
        if let Err(e) = rpc_dial {
            log::warn!("Bridge RPC peer {} unreachable, branch degraded: {e}", config.rpc_addr);
        }
        if udp.is_none() {
            log::info!("Bridge started without a UDP hub; notifications are skipped");
        }

        Self {
            inner: Arc::new(BridgeInner {
                redial_on_use: config.redial_on_use,
                tcp,
                rpc,
                udp,
                closed: AtomicBool::new(false),
                tcp_counters: BranchCounters::default(),
                udp_counters: BranchCounters::default(),
                rpc_counters: BranchCounters::default(),
            }),
        }
    }

    /// Spawn the three branch tasks for `event` and return at once.
    pub fn broadcast_progress_update(&self, event: ProgressEvent) -> FanOut {
        let event = Arc::new(event);
        log::debug!(
            "Bridging progress {}/{} ch.{}",
            event.user_id,
            event.manga_id,
            event.chapter
        );

        let tcp = {
            let inner = self.inner.clone();
            let event = event.clone();
            tokio::spawn(async move { inner.forward_tcp(&event).await })
        };
        let udp = {
            let inner = self.inner.clone();
            let event = event.clone();
            tokio::spawn(async move { inner.notify_udp(&event).await })
        };
        let rpc = {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.audit_rpc(&event).await })
        };

        FanOut { tcp, udp, rpc }
    }

    pub fn is_tcp_connected(&self) -> bool {
        self.inner.tcp.is_connected()
    }

    pub fn is_rpc_connected(&self) -> bool {
        self.inner.rpc.link.is_connected()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            tcp: self.inner.tcp_counters.snapshot(),
            udp: self.inner.udp_counters.snapshot(),
            rpc: self.inner.rpc_counters.snapshot(),
            tcp_connected: self.is_tcp_connected(),
            rpc_connected: self.is_rpc_connected(),
        }
    }

    /// Close the TCP and RPC links. Tasks already spawned keep running and
    /// find their branch disconnected.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.tcp.close().await;
        self.inner.rpc.link.close().await;
        log::info!("Protocol bridge closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn refused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn test_config_default() {
        let config = BridgeConfig::default();
        assert!(config.redial_on_use);
        assert_eq!(config.rpc_method, "AuditService.RecordProgress");
        assert_eq!(config.tcp_addr, None);
    }

    #[test]
    fn test_local_tcp_hub_fills_only_an_unset_address() {
        let bound: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        let config = BridgeConfig::default().with_local_tcp_hub(bound);
        assert_eq!(config.tcp_addr.as_deref(), Some("127.0.0.1:40123"));

        let wildcard: SocketAddr = "0.0.0.0:40124".parse().unwrap();
        let config = BridgeConfig::default().with_local_tcp_hub(wildcard);
        assert_eq!(config.tcp_addr.as_deref(), Some("127.0.0.1:40124"));

        let explicit = BridgeConfig {
            tcp_addr: Some("10.0.0.5:9090".to_string()),
            ..BridgeConfig::default()
        }
        .with_local_tcp_hub(bound);
        assert_eq!(explicit.tcp_addr.as_deref(), Some("10.0.0.5:9090"));
    }

    #[tokio::test]
    async fn test_unreachable_peers_degrade_without_redial() {
        let config = BridgeConfig {
            tcp_addr: Some(refused_addr().await),
            rpc_addr: refused_addr().await,
            redial_on_use: false,
            dial_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        };
        let bridge = ProtocolBridge::connect(config, None).await;
        assert!(!bridge.is_tcp_connected());
        assert!(!bridge.is_rpc_connected());

        let report = bridge
            .broadcast_progress_update(ProgressEvent::new("u1", "m1", 3, "reading"))
            .join()
            .await;
        assert_eq!(report.tcp, BranchOutcome::Skipped);
        assert_eq!(report.udp, BranchOutcome::Skipped);
        assert_eq!(report.rpc, BranchOutcome::Skipped);

        let stats = bridge.stats();
        assert_eq!(stats.tcp.skipped, 1);
        assert_eq!(stats.rpc.skipped, 1);
    }

    #[tokio::test]
    async fn test_redial_failure_is_reported_per_branch() {
        let config = BridgeConfig {
            tcp_addr: Some(refused_addr().await),
            rpc_addr: refused_addr().await,
            dial_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        };
        let bridge = ProtocolBridge::connect(config, None).await;

        let report = bridge
            .broadcast_progress_update(ProgressEvent::new("u1", "m1", 4, "reading"))
            .join()
            .await;
        assert!(matches!(report.tcp, BranchOutcome::Failed(_)));
        assert!(matches!(report.rpc, BranchOutcome::Failed(_)));
        assert_eq!(bridge.stats().tcp.failed, 1);
    }

    #[tokio::test]
    async fn test_close_skips_later_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BridgeConfig {
            tcp_addr: Some(listener.local_addr().unwrap().to_string()),
            rpc_addr: refused_addr().await,
            dial_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        };
        let bridge = ProtocolBridge::connect(config, None).await;
        assert!(bridge.is_tcp_connected());

        bridge.close().await;
        assert!(!bridge.is_tcp_connected());

        let report = bridge
            .broadcast_progress_update(ProgressEvent::new("u1", "m1", 5, "reading"))
            .join()
            .await;
        assert_eq!(report.tcp, BranchOutcome::Skipped);
        assert_eq!(report.rpc, BranchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_closed_link_never_redials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BridgeConfig {
            tcp_addr: Some(refused_addr().await),
            rpc_addr: listener.local_addr().unwrap().to_string(),
            dial_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        };
        let bridge = ProtocolBridge::connect(config, None).await;
        assert!(bridge.is_rpc_connected());
        bridge.close().await;

        // A branch task that got past the closed check before `close`
        let redialed = bridge.inner.rpc.link.ensure(true).await.unwrap();
        assert!(!redialed);
        assert!(!bridge.is_rpc_connected());
    }
}
