#[cfg(test)]
mod transaction_test;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::message::Message;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How long a server transaction's cached response is kept around to answer
/// retransmitted requests. RFC 5389 recommends 10s; this uses a 9500ms
/// figure to leave headroom before that recommendation.
pub const SERVER_TRANSACTION_LIFETIME: Duration = Duration::from_millis(9500);

/// Retransmission parameters for a client transaction.
///
/// Defaults double the interval starting at `t0`, capped at `tmax`, for
/// `max_retries` retransmissions after the initial send — giving the
/// absolute send schedule 0, 100, 300, 700, 1500, 3100, 4700, 6300 ms, with a
/// final `tmax` wait before the transaction times out at 7900 ms.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitParams {
    pub t0: Duration,
    pub tmax: Duration,
    pub max_retries: u32,
}

impl Default for RetransmitParams {
    fn default() -> Self {
        RetransmitParams {
            t0: Duration::from_millis(100),
            tmax: Duration::from_millis(1600),
            max_retries: 7,
        }
    }
}

/// Sends a single datagram on behalf of a transaction. Implemented by the
/// stack over its `net_access` connector registry; kept as a narrow trait so
/// the retransmit loop here doesn't need to know about sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<()>;
}

/// Receives the outcome of a client transaction. `on_response` fires at most
/// once; `on_timeout` fires iff `on_response` never does.
pub trait TransactionCollector: Send + Sync {
    fn on_response(&self, id: TransactionId, message: Message, from: SocketAddr);
    fn on_timeout(&self, id: TransactionId);
}

/// A single outstanding client (request-originating) transaction.
pub struct StunClientTransaction {
    pub id: TransactionId,
    pub raw: Vec<u8>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    cancelled: Arc<AtomicBool>,
    cancel_tx: AsyncMutex<Option<mpsc::Sender<bool>>>,
}

impl StunClientTransaction {
    #[must_use]
    pub fn new(id: TransactionId, raw: Vec<u8>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        StunClientTransaction {
            id,
            raw,
            local_addr,
            remote_addr,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx: AsyncMutex::new(None),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the transaction. If `wait_for_response` is false, the
    /// retransmit waiter is woken immediately instead of letting the current
    /// interval elapse.
    pub async fn cancel(&self, wait_for_response: bool) {
        self.cancelled.store(true, Ordering::SeqCst);
        if !wait_for_response {
            let guard = self.cancel_tx.lock().await;
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(true);
            }
        }
    }

    async fn set_cancel_tx(&self, tx: mpsc::Sender<bool>) {
        let mut guard = self.cancel_tx.lock().await;
        *guard = Some(tx);
    }
}

pub type ClientTransactionMap = Arc<AsyncMutex<HashMap<TransactionId, Arc<StunClientTransaction>>>>;

/// Inserts `tx` into `table` and spawns its retransmit loop, grounded on
/// `turn/src/client/transaction.rs`'s `start_rtx_timer`: a `tokio::select!`
/// races the retransmit sleep against a cancel channel, so cancellation and
/// timer expiry share one waiter per transaction.
pub async fn start_client_transaction(
    tx: Arc<StunClientTransaction>,
    table: ClientTransactionMap,
    transport: Arc<dyn Transport>,
    collector: Arc<dyn TransactionCollector>,
    params: RetransmitParams,
) {
    {
        let mut t = table.lock().await;
        t.insert(tx.id, tx.clone());
    }

    let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
    tx.set_cancel_tx(cancel_tx).await;

    if let Err(err) = transport.send(&tx.raw).await {
        log::debug!("initial send failed for transaction {:?}: {}", tx.id, err);
        table.lock().await.remove(&tx.id);
        collector.on_timeout(tx.id);
        return;
    }

    tokio::spawn(async move {
        let mut interval = params.t0;
        let mut attempt = 0_u32;

        loop {
            let timer = tokio::time::sleep(interval);
            tokio::pin!(timer);

            tokio::select! {
                _ = timer.as_mut() => {}
                _ = cancel_rx.recv() => {
                    table.lock().await.remove(&tx.id);
                    return;
                }
            }

            if tx.is_cancelled() {
                table.lock().await.remove(&tx.id);
                return;
            }

            // The response handler removes the transaction from the table as
            // soon as it arrives; if it's gone, our work here is done.
            if !table.lock().await.contains_key(&tx.id) {
                return;
            }

            if attempt >= params.max_retries {
                // final Tmax wait already elapsed above on the last loop
                // iteration; declare timeout now.
                table.lock().await.remove(&tx.id);
                collector.on_timeout(tx.id);
                return;
            }

            attempt += 1;
            interval = std::cmp::min(interval * 2, params.tmax);

            log::trace!("retransmitting transaction {:?} (attempt {})", tx.id, attempt);
            if let Err(err) = transport.send(&tx.raw).await {
                log::debug!("retransmit failed for transaction {:?}: {}", tx.id, err);
                table.lock().await.remove(&tx.id);
                collector.on_timeout(tx.id);
                return;
            }
        }
    });
}

/// A single server (request-answering) transaction. Created lazily on first
/// delivery of a well-formed request and cached so that retransmitted
/// requests replay the same response instead of re-running request handling.
pub struct StunServerTransaction {
    pub id: TransactionId,
    pub request_source: SocketAddr,
    pub local_addr: SocketAddr,
    response: AsyncMutex<Option<Vec<u8>>>,
    retransmitting: AtomicBool,
    pub expiration_time: Instant,
}

impl StunServerTransaction {
    #[must_use]
    pub fn new(id: TransactionId, request_source: SocketAddr, local_addr: SocketAddr) -> Self {
        StunServerTransaction {
            id,
            request_source,
            local_addr,
            response: AsyncMutex::new(None),
            retransmitting: AtomicBool::new(false),
            expiration_time: Instant::now() + SERVER_TRANSACTION_LIFETIME,
        }
    }

    #[must_use]
    pub fn is_retransmitting(&self) -> bool {
        self.retransmitting.load(Ordering::SeqCst)
    }

    /// Caches `response` for replay to retransmitted requests. Fails with
    /// `TransactionAlreadyAnswered` if this transaction already has a
    /// response set.
    pub async fn send_response(&self, response: Vec<u8>) -> Result<()> {
        let mut guard = self.response.lock().await;
        if guard.is_some() {
            return Err(Error::TransactionAlreadyAnswered);
        }
        *guard = Some(response);
        self.retransmitting.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[must_use]
    pub async fn cached_response(&self) -> Option<Vec<u8>> {
        self.response.lock().await.clone()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiration_time
    }
}

pub type ServerTransactionMap = Arc<AsyncMutex<HashMap<TransactionId, Arc<StunServerTransaction>>>>;

/// Spawns the background sweeper that evicts expired server transactions.
/// A single sweeper per stack keeps `ServerTransactionMap` bounded without
/// any per-transaction timer.
pub fn spawn_server_transaction_sweeper(table: ServerTransactionMap, tick: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut t = table.lock().await;
            t.retain(|_, tx| !tx.is_expired(now));
        }
    });
}
