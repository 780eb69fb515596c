//! Integration tests for the UDP notification hub and the notification
//! listener client.

use std::sync::Arc;

use mangahub_sync::client::{
    ClientConfig, ClientEvent, ConnectionState, NotificationListener, UdpNotificationDialer,
};
use mangahub_sync::protocol::{NotificationEvent, UdpControl};
use mangahub_sync::udp_hub::{UdpHubConfig, UdpNotificationHub};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

async fn start_hub(config: UdpHubConfig) -> UdpNotificationHub {
    UdpNotificationHub::start(UdpHubConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..config
    })
    .await
    .unwrap()
}

async fn peer_socket(hub: &UdpNotificationHub) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(hub.local_addr()).await.unwrap();
    socket
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let len = timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf.truncate(len);
    buf
}

async fn wait_for_peers(hub: &UdpNotificationHub, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.peer_count().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer count never settled");
}

#[tokio::test]
async fn test_register_then_notify() {
    let hub = start_hub(UdpHubConfig::default()).await;
    let peer = peer_socket(&hub).await;

    peer.send(b"REGISTER").await.unwrap();
    assert_eq!(recv(&peer).await, b"REGISTERED");
    assert_eq!(hub.peer_count().await, 1);

    let event = NotificationEvent::new("new_chapter", "m1", "Chapter 101 is out");
    let report = hub.notify(&event).await.unwrap();
    assert_eq!(report.delivered, 1);

    let received = NotificationEvent::decode(&recv(&peer).await).unwrap();
    assert_eq!(received, event);

    hub.shutdown().await;
}

#[tokio::test]
async fn test_registered_precedes_any_notification() {
    let hub = Arc::new(start_hub(UdpHubConfig::default()).await);

    // Notifications flow continuously while the peer registers
    let flooder = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let event = NotificationEvent::new("flood", "m1", "tick");
            loop {
                let _ = hub.notify(&event).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let peer = peer_socket(&hub).await;
    peer.send(b"  REGISTER\n").await.unwrap();
    assert_eq!(recv(&peer).await, b"REGISTERED");

    let next = NotificationEvent::decode(&recv(&peer).await).unwrap();
    assert_eq!(next.kind, "flood");

    flooder.abort();
    hub.shutdown().await;
}

#[tokio::test]
async fn test_unregister_stops_delivery() {
    let hub = start_hub(UdpHubConfig::default()).await;
    let peer = peer_socket(&hub).await;

    peer.send(b"REGISTER").await.unwrap();
    assert_eq!(recv(&peer).await, b"REGISTERED");

    peer.send(b"UNREGISTER").await.unwrap();
    wait_for_peers(&hub, 0).await;

    let report = hub
        .notify(&NotificationEvent::new("test", "m1", "nobody"))
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);

    let mut buf = [0u8; 64];
    let silent = timeout(Duration::from_millis(200), peer.recv(&mut buf)).await;
    assert!(silent.is_err(), "unregistered peer still received a datagram");

    hub.shutdown().await;
}

#[tokio::test]
async fn test_admin_broadcast_and_garbage() {
    let hub = start_hub(UdpHubConfig::default()).await;
    let listener = peer_socket(&hub).await;
    listener.send(b"REGISTER").await.unwrap();
    assert_eq!(recv(&listener).await, b"REGISTERED");

    let admin = peer_socket(&hub).await;
    admin.send(b"hello?").await.unwrap();
    admin.send(b"BROADCAST {broken").await.unwrap();
    admin
        .send(br#"BROADCAST {"type":"announcement","message":"Maintenance at 02:00"}"#)
        .await
        .unwrap();

    let event = NotificationEvent::decode(&recv(&listener).await).unwrap();
    assert_eq!(event.kind, "announcement");
    assert_eq!(event.message, "Maintenance at 02:00");
    assert_eq!(event.manga_id, "");

    // Garbage never registers the sender
    assert_eq!(hub.peer_count().await, 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_admin_broadcast_can_be_disabled() {
    let hub = start_hub(UdpHubConfig {
        allow_admin_broadcast: false,
        ..UdpHubConfig::default()
    })
    .await;
    let listener = peer_socket(&hub).await;
    listener.send(b"REGISTER").await.unwrap();
    assert_eq!(recv(&listener).await, b"REGISTERED");

    let admin = peer_socket(&hub).await;
    admin
        .send(br#"BROADCAST {"type":"announcement","message":"ignored"}"#)
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    let silent = timeout(Duration::from_millis(200), listener.recv(&mut buf)).await;
    assert!(silent.is_err());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_registrations_expire() {
    let hub = start_hub(UdpHubConfig {
        registration_ttl: Some(Duration::from_millis(100)),
        prune_interval: Duration::from_millis(20),
        ..UdpHubConfig::default()
    })
    .await;
    let peer = peer_socket(&hub).await;
    peer.send(b"REGISTER").await.unwrap();
    assert_eq!(recv(&peer).await, b"REGISTERED");

    wait_for_peers(&hub, 0).await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_notification_listener_client() {
    let hub = start_hub(UdpHubConfig::default()).await;
    let dialer = UdpNotificationDialer::new(hub.local_addr());
    let mut listener = NotificationListener::new(dialer, ClientConfig::default());

    listener.connect().await.unwrap();
    assert_eq!(listener.state().await, ConnectionState::Connected);
    assert_eq!(hub.peer_count().await, 1);

    let event = NotificationEvent::new("progress_update", "m7", "u1 reached chapter 3");
    hub.notify(&event).await.unwrap();
    let frame = timeout(Duration::from_secs(2), listener.next_frame()).await.unwrap();
    assert_eq!(frame, ClientEvent::Frame(event));

    listener.send(UdpControl::Unregister).unwrap();
    wait_for_peers(&hub, 0).await;

    listener.close().await;
    assert_eq!(listener.state().await, ConnectionState::Disconnected);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_listener_keepalive_refreshes_registration() {
    let hub = start_hub(UdpHubConfig {
        registration_ttl: Some(Duration::from_millis(300)),
        prune_interval: Duration::from_millis(20),
        ..UdpHubConfig::default()
    })
    .await;
    let config = ClientConfig {
        keepalive_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let mut listener =
        NotificationListener::new(UdpNotificationDialer::new(hub.local_addr()), config);
    listener.connect().await.unwrap();

    // Well past the TTL, still registered
    sleep(Duration::from_millis(700)).await;
    assert_eq!(hub.peer_count().await, 1);

    // Keepalive confirmations never surface as frames
    let event = NotificationEvent::new("ping", "m1", "still here");
    hub.notify(&event).await.unwrap();
    let frame = timeout(Duration::from_secs(2), listener.next_frame()).await.unwrap();
    assert_eq!(frame, ClientEvent::Frame(event));

    listener.close().await;
    hub.shutdown().await;
}
