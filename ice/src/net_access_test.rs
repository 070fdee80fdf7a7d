use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex as SyncMutex;

use tokio::net::UdpSocket;
use tokio::sync::Notify;

use super::*;

async fn bind_udp() -> (Arc<dyn util::Conn + Send + Sync>, SocketAddr) {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let addr = socket.local_addr().unwrap();
    (Arc::new(socket), addr)
}

struct RecordingSink {
    received: SyncMutex<Vec<(Vec<u8>, SocketAddr, SocketAddr)>>,
    notify: Notify,
}

impl Default for RecordingSink {
    fn default() -> Self {
        RecordingSink {
            received: SyncMutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl InboundSink for RecordingSink {
    async fn dispatch(&self, buf: Vec<u8>, local: SocketAddr, remote: SocketAddr) {
        self.received.lock().unwrap().push((buf, local, remote));
        self.notify.notify_one();
    }
}

#[tokio::test]
async fn test_udp_send_and_dispatch() {
    let nam = Arc::new(NetAccessManager::new());
    let sink = Arc::new(RecordingSink::default());
    nam.set_dispatch_sink(Arc::downgrade(&sink) as Weak<dyn InboundSink>).await;

    let (a_sock, a_addr) = bind_udp().await;
    let (b_sock, b_addr) = bind_udp().await;

    nam.add_socket(a_sock, a_addr, None, Transport::Udp).await.unwrap();
    nam.add_socket(b_sock, b_addr, None, Transport::Udp).await.unwrap();

    nam.send(b"hello", a_addr, b_addr).await.unwrap();

    sink.notify.notified().await;

    let received = sink.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, b"hello");
    assert_eq!(received[0].1, b_addr);
    assert_eq!(received[0].2, a_addr);
}

#[tokio::test]
async fn test_send_with_no_route() {
    let nam = NetAccessManager::new();
    let unused = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 49999);
    let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
    let err = nam.send(b"x", unused, other).await.unwrap_err();
    assert!(matches!(err, Error::NoRoute { .. }));
}

#[tokio::test]
async fn test_duplicate_socket_rejected() {
    let nam = NetAccessManager::new();
    let (a_sock, a_addr) = bind_udp().await;
    let (a_sock2, _) = bind_udp().await;

    nam.add_socket(a_sock, a_addr, None, Transport::Udp).await.unwrap();
    let err = nam.add_socket(a_sock2, a_addr, None, Transport::Udp).await.unwrap_err();
    assert!(matches!(err, Error::ErrConnectionAddrAlreadyExist));
}

#[tokio::test]
async fn test_remove_socket_then_no_route() {
    let nam = NetAccessManager::new();
    let (a_sock, a_addr) = bind_udp().await;
    nam.add_socket(a_sock, a_addr, None, Transport::Udp).await.unwrap();
    nam.remove_socket(a_addr, None).await.unwrap();

    let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
    let err = nam.send(b"x", a_addr, other).await.unwrap_err();
    assert!(matches!(err, Error::NoRoute { .. }));
}
