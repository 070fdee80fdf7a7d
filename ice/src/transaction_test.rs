use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::*;

fn local() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4000)
}

fn remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
}

struct RecordingTransport {
    sent_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, _buf: &[u8]) -> Result<()> {
        self.sent_at.lock().unwrap().push(Instant::now());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingCollector {
    timeouts: AtomicU32,
    responses: AtomicU32,
}

impl TransactionCollector for RecordingCollector {
    fn on_response(&self, _id: TransactionId, _message: Message, _from: SocketAddr) {
        self.responses.fetch_add(1, Ordering::SeqCst);
    }

    fn on_timeout(&self, _id: TransactionId) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retransmission_schedule_and_timeout() {
    let table: ClientTransactionMap = Arc::new(AsyncMutex::new(HashMap::new()));
    let transport = Arc::new(RecordingTransport {
        sent_at: Mutex::new(Vec::new()),
    });
    let collector = Arc::new(RecordingCollector::default());

    let id = TransactionId::new();
    let tx = Arc::new(StunClientTransaction::new(id, vec![0, 1, 2], local(), remote()));

    let start = Instant::now();
    start_client_transaction(
        tx,
        table.clone(),
        transport.clone(),
        collector.clone(),
        RetransmitParams::default(),
    )
    .await;

    // advance past the final 7900ms timeout
    tokio::time::advance(Duration::from_millis(8000)).await;
    tokio::task::yield_now().await;

    let sent = transport.sent_at.lock().unwrap();
    assert_eq!(sent.len(), 8, "expected 8 total sends (1 initial + 7 retransmits)");

    let expected_ms = [0u64, 100, 300, 700, 1500, 3100, 4700, 6300];
    for (got, want) in sent.iter().zip(expected_ms.iter()) {
        let elapsed = got.saturating_duration_since(start).as_millis() as i64;
        let want = *want as i64;
        assert!(
            (elapsed - want).abs() <= 5,
            "send at {}ms, expected {}ms",
            elapsed,
            want
        );
    }

    assert_eq!(collector.timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(collector.responses.load(Ordering::SeqCst), 0);
    assert!(table.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_retransmission() {
    let table: ClientTransactionMap = Arc::new(AsyncMutex::new(HashMap::new()));
    let transport = Arc::new(RecordingTransport {
        sent_at: Mutex::new(Vec::new()),
    });
    let collector = Arc::new(RecordingCollector::default());

    let id = TransactionId::new();
    let tx = Arc::new(StunClientTransaction::new(id, vec![0], local(), remote()));
    let tx_clone = tx.clone();

    start_client_transaction(
        tx,
        table.clone(),
        transport,
        collector.clone(),
        RetransmitParams::default(),
    )
    .await;

    tx_clone.cancel(false).await;
    tokio::time::advance(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    assert_eq!(collector.timeouts.load(Ordering::SeqCst), 0);
    assert!(table.lock().await.is_empty());
}

#[tokio::test]
async fn test_server_transaction_caches_response_once() {
    let tx = StunServerTransaction::new(TransactionId::new(), remote(), local());
    assert!(!tx.is_retransmitting());

    tx.send_response(vec![1, 2, 3]).await.unwrap();
    assert!(tx.is_retransmitting());
    assert_eq!(tx.cached_response().await, Some(vec![1, 2, 3]));

    let err = tx.send_response(vec![4, 5, 6]).await.unwrap_err();
    assert_eq!(err, Error::TransactionAlreadyAnswered);
    assert_eq!(tx.cached_response().await, Some(vec![1, 2, 3]));
}

#[tokio::test(start_paused = true)]
async fn test_server_transaction_sweeper_evicts_expired() {
    let table: ServerTransactionMap = Arc::new(AsyncMutex::new(HashMap::new()));
    let id = TransactionId::new();
    table.lock().await.insert(
        id,
        Arc::new(StunServerTransaction::new(id, remote(), local())),
    );

    spawn_server_transaction_sweeper(table.clone(), Duration::from_millis(100));

    tokio::time::advance(SERVER_TRANSACTION_LIFETIME + Duration::from_millis(500)).await;
    tokio::task::yield_now().await;

    assert!(table.lock().await.is_empty());
}
