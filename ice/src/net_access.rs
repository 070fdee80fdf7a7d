#[cfg(test)]
mod net_access_test;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock as AsyncRwLock;

use crate::error::{Error, Result};

/// Transport over which a `Connector` is bound. Distinct from [`crate::network_type::NetworkType`],
/// which also carries the IP family; the registry only ever keys on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Receives raw inbound frames dispatched by a [`Connector`]'s receive loop. Implemented by the
/// stack; held here only as a `Weak` reference so the registry never keeps the stack alive. This
/// is the rewritten form of the source's Stack/NetAccessManager/Connector/Stack reference cycle:
/// the registry (and each connector) carries a non-owning handle back to its owner.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn dispatch(&self, buf: Vec<u8>, local: SocketAddr, remote: SocketAddr);
}

const RECEIVE_MTU: usize = 8192;

/// The owning object for a single bound socket, parameterized by local and (for TCP) remote
/// address. For UDP, `remote_addr` is always `None`: the peer address travels with each
/// `send`/`recv_from` call instead. Owns the receive-loop task for its socket.
pub struct Connector {
    pub socket: Arc<dyn util::Conn + Send + Sync>,
    pub local_addr: SocketAddr,
    pub remote_addr: Option<SocketAddr>,
    pub transport: Transport,
    sink: Weak<dyn InboundSink>,
}

/// A registry of bound sockets addressed by `(local, remote, transport)`, and the dispatcher of
/// incoming raw datagrams to the stack. One `NetAccessManager` per stack; additions and removals
/// are infrequent and take the exclusive side of the lock, while `send` only needs read access.
pub struct NetAccessManager {
    connectors: AsyncRwLock<BTreeMap<(SocketAddr, Option<SocketAddr>), Arc<Connector>>>,
    sink: AsyncRwLock<Option<Weak<dyn InboundSink>>>,
}

impl Default for NetAccessManager {
    fn default() -> Self {
        NetAccessManager {
            connectors: AsyncRwLock::new(BTreeMap::new()),
            sink: AsyncRwLock::new(None),
        }
    }
}

impl NetAccessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires the registry to the stack that owns it. Called once, right after the stack is
    /// wrapped in an `Arc`, so every `Connector` registered afterwards picks up a non-owning
    /// handle back to it.
    pub async fn set_dispatch_sink(&self, sink: Weak<dyn InboundSink>) {
        let mut guard = self.sink.write().await;
        *guard = Some(sink);
    }

    /// Registers a bound socket and spawns its receive loop. Fails with
    /// `ErrConnectionAddrAlreadyExist` if a connector already occupies this key.
    pub async fn add_socket(
        &self,
        socket: Arc<dyn util::Conn + Send + Sync>,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        transport: Transport,
    ) -> Result<Arc<Connector>> {
        let registry_key = match transport {
            Transport::Udp => (local_addr, None),
            Transport::Tcp => (local_addr, remote_addr),
        };

        let sink = self.sink.read().await.clone().unwrap_or_else(|| Weak::<NullSink>::new());

        let connector = Arc::new(Connector {
            socket,
            local_addr,
            remote_addr: if transport == Transport::Udp {
                None
            } else {
                remote_addr
            },
            transport,
            sink,
        });

        {
            let mut connectors = self.connectors.write().await;
            if connectors.contains_key(&registry_key) {
                return Err(Error::ErrConnectionAddrAlreadyExist);
            }
            connectors.insert(registry_key, connector.clone());
        }

        tokio::spawn(receive_loop(connector.clone()));

        Ok(connector)
    }

    /// Removes the connector at `(local, remote)` and closes its socket.
    pub async fn remove_socket(&self, local: SocketAddr, remote: Option<SocketAddr>) -> Result<()> {
        let connector = {
            let mut connectors = self.connectors.write().await;
            connectors.remove(&(local, remote))
        };

        if let Some(connector) = connector {
            let _ = connector.socket.close().await;
            Ok(())
        } else {
            Err(Error::NoRoute { local, remote })
        }
    }

    /// Closes and drops every registered connector. Called once from `Stack::shutdown` so a
    /// dropped stack doesn't leave sockets' receive loops spinning on a half-torn-down registry.
    pub async fn close_all(&self) {
        let connectors = {
            let mut connectors = self.connectors.write().await;
            std::mem::take(&mut *connectors)
        };
        for (_, connector) in connectors {
            let _ = connector.socket.close().await;
        }
    }

    /// Looks up the connector for `(local, remote)` per the rules in §4.4: exact match for TCP
    /// (falling back to a not-yet-negotiated connector bound at `local`), local-only match for
    /// UDP.
    async fn lookup(&self, local: SocketAddr, remote: SocketAddr, transport: Transport) -> Option<Arc<Connector>> {
        let connectors = self.connectors.read().await;
        match transport {
            Transport::Udp => connectors.get(&(local, None)).cloned(),
            Transport::Tcp => connectors
                .get(&(local, Some(remote)))
                .or_else(|| connectors.get(&(local, None)))
                .cloned(),
        }
    }

    /// Rebinds a pending (unconnected) TCP connector to `remote` once a peer has been accepted,
    /// moving its registry key from `(local, None)` to `(local, Some(remote))`.
    pub async fn negotiate_tcp_remote(&self, local: SocketAddr, remote: SocketAddr) -> Result<()> {
        let mut connectors = self.connectors.write().await;
        let pending = connectors.remove(&(local, None)).ok_or(Error::NoRoute {
            local,
            remote: Some(remote),
        })?;
        let negotiated = Arc::new(Connector {
            socket: pending.socket.clone(),
            local_addr: pending.local_addr,
            remote_addr: Some(remote),
            transport: pending.transport,
            sink: pending.sink.clone(),
        });
        connectors.insert((local, Some(remote)), negotiated);
        Ok(())
    }

    /// Sends `bytes` from `local` to `remote`, resolving the connector per §4.4's lookup rules.
    pub async fn send(&self, bytes: &[u8], local: SocketAddr, remote: SocketAddr) -> Result<()> {
        let transport = {
            let connectors = self.connectors.read().await;
            connectors
                .get(&(local, None))
                .or_else(|| connectors.get(&(local, Some(remote))))
                .map(|c| c.transport)
        };

        let Some(transport) = transport else {
            return Err(Error::NoRoute {
                local,
                remote: Some(remote),
            });
        };

        let connector = self.lookup(local, remote, transport).await.ok_or(Error::NoRoute {
            local,
            remote: Some(remote),
        })?;

        match connector.transport {
            Transport::Udp => {
                connector.socket.send_to(bytes, remote).await?;
            }
            Transport::Tcp => {
                connector.socket.send(bytes).await?;
            }
        }
        Ok(())
    }
}

/// Never resolves; used as the `Weak` target when a connector is registered before
/// `set_dispatch_sink` has been called, so its receive loop harmlessly drops inbound frames
/// instead of panicking on an always-empty `Weak`.
struct NullSink;

#[async_trait]
impl InboundSink for NullSink {
    async fn dispatch(&self, _buf: Vec<u8>, _local: SocketAddr, _remote: SocketAddr) {}
}

async fn receive_loop(connector: Arc<Connector>) {
    let mut buf = vec![0_u8; RECEIVE_MTU];
    loop {
        match connector.socket.recv_from(&mut buf).await {
            Ok((n, remote)) => {
                log::trace!(
                    "[net_access]: {} bytes from {} on {}",
                    n,
                    remote,
                    connector.local_addr
                );
                if let Some(sink) = connector.sink.upgrade() {
                    sink.dispatch(buf[..n].to_vec(), connector.local_addr, remote).await;
                } else {
                    log::trace!("[net_access]: no dispatch sink registered, dropping frame");
                }
            }
            Err(err) => {
                log::debug!("[net_access]: connector {} closed: {}", connector.local_addr, err);
                return;
            }
        }
    }
}
