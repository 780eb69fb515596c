//! Composition root: starts every hub and the bridge, and owns them.

use std::sync::Arc;

use crate::auth::IdentityResolver;
use crate::bridge::{BridgeStats, FanOut, ProtocolBridge};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::history::ChatHistory;
use crate::protocol::ProgressEvent;
use crate::tcp_hub::TcpSyncHub;
use crate::udp_hub::UdpNotificationHub;
use crate::ws_hub::{RoomMember, WebSocketRoomHub};

/// Live counts for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub tcp_connections: usize,
    pub udp_peers: usize,
    pub ws_connections: usize,
    pub ws_rooms: usize,
    pub bridge: BridgeStats,
}

/// Every running sync service.
pub struct SyncServices {
    tcp: TcpSyncHub,
    udp: UdpNotificationHub,
    ws: WebSocketRoomHub,
    bridge: ProtocolBridge,
}

impl SyncServices {
    /// Start the TCP, UDP and WebSocket hubs, then connect the bridge to
    /// them. A bind failure stops whatever was already started.
    pub async fn start(
        config: SyncConfig,
        resolver: Arc<dyn IdentityResolver>,
        history: Option<Arc<dyn ChatHistory>>,
    ) -> Result<Self, SyncError> {
        let tcp = TcpSyncHub::start(config.tcp).await?;

        let udp = match UdpNotificationHub::start(config.udp).await {
            Ok(udp) => udp,
            Err(e) => {
                tcp.shutdown().await;
                return Err(e);
            }
        };

        let ws = match WebSocketRoomHub::start(config.ws, resolver, history).await {
            Ok(ws) => ws,
            Err(e) => {
                udp.shutdown().await;
                tcp.shutdown().await;
                return Err(e);
            }
        };

        let bridge_config = config.bridge.with_local_tcp_hub(tcp.local_addr());
        let bridge = ProtocolBridge::connect(bridge_config, Some(udp.handle())).await;

        log::info!(
            "Sync services running: tcp={} udp={} ws={}",
            tcp.local_addr(),
            udp.local_addr(),
            ws.local_addr()
        );

        Ok(Self { tcp, udp, ws, bridge })
    }

    /// Entry point for the HTTP tier after a progress change is persisted.
    pub fn broadcast_progress_update(&self, event: ProgressEvent) -> FanOut {
        self.bridge.broadcast_progress_update(event)
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        self.ws.room_members(room_id).await
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            tcp_connections: self.tcp.connection_count(),
            udp_peers: self.udp.peer_count().await,
            ws_connections: self.ws.connection_count(),
            ws_rooms: self.ws.room_count().await,
            bridge: self.bridge.stats(),
        }
    }

    pub fn tcp(&self) -> &TcpSyncHub {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpNotificationHub {
        &self.udp
    }

    pub fn ws(&self) -> &WebSocketRoomHub {
        &self.ws
    }

    pub fn bridge(&self) -> &ProtocolBridge {
        &self.bridge
    }

    /// Close the bridge first so no new fan-out reaches a stopping hub.
    pub async fn shutdown(&self) {
        self.bridge.close().await;
        self.ws.shutdown().await;
        self.udp.shutdown().await;
        self.tcp.shutdown().await;
        log::info!("Sync services stopped");
    }
}
