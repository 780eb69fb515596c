//! # mangahub-sync: multi-transport synchronization backbone for MangaHub
//!
//! Takes one reading-progress change and fans it out over four
//! independently failing transports.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌──────────────────┐
//!   HTTP tier ──────────► │  ProtocolBridge  │
//!                         └──┬──────┬──────┬─┘
//!                  TCP line  │      │      │  JSON-RPC line
//!                            ▼      │      ▼
//! ┌─────────────┐   ┌────────────┐  │  ┌──────────────┐
//! │ TCP clients │◄─►│ TcpSyncHub │  │  │ audit service│
//! └─────────────┘   └────────────┘  │  └──────────────┘
//!                                   ▼ notify
//! ┌─────────────┐           ┌────────────────────┐
//! │ UDP peers   │◄──────────│ UdpNotificationHub │
//! └─────────────┘           └────────────────────┘
//!
//! ┌─────────────┐  WebSocket  ┌──────────────────┐
//! │ ChatClient  │◄───────────►│ WebSocketRoomHub │── rooms ── registries
//! └─────────────┘             └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`]: connection registry with bounded per-connection queues
//! - [`tcp_hub`]: newline-delimited JSON progress hub
//! - [`udp_hub`]: `REGISTER`ed peers and best-effort notifications
//! - [`ws_hub`]: room-based chat over WebSocket
//! - [`bridge`]: per-event fan-out across TCP, UDP and RPC
//! - [`client`]: reconnecting chat client and notification listener
//! - [`services`]: starts and stops everything above

pub mod auth;
pub mod backoff;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod registry;
pub mod services;
pub mod tcp_hub;
pub mod udp_hub;
pub mod ws_hub;

// Re-exports for convenience
pub use auth::{Identity, IdentityResolver, TokenTable};
pub use backoff::{backoff_delay, BackoffPolicy, ReconnectState};
pub use bridge::{BranchOutcome, BridgeConfig, BridgeStats, FanOut, FanOutReport, ProtocolBridge};
pub use client::{
    ChatClient, ClientConfig, ClientEvent, ConnectionState, ConnectionStatus, Dialer,
    NotificationListener, ReconnectingClient, UdpNotificationDialer, WsChatDialer,
};
pub use config::SyncConfig;
pub use error::SyncError;
pub use history::{ChatHistory, InMemoryHistory};
pub use protocol::{
    ChatKind, ChatMessage, ClientFrame, NotificationEvent, ProgressEvent, UdpControl,
};
pub use registry::{BroadcastStats, ConnId, ConnectionHandle, ConnectionRegistry, DeliveryReport};
pub use services::{HealthSnapshot, SyncServices};
pub use tcp_hub::{TcpHubConfig, TcpSyncHub};
pub use udp_hub::{UdpHubConfig, UdpHubHandle, UdpNotificationHub};
pub use ws_hub::{RoomMember, WebSocketRoomHub, WsHubConfig};
