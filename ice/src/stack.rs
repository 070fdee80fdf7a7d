#[cfg(test)]
mod stack_test;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::attributes::{
    ATTR_ERROR_CODE, ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_MAPPED_ADDRESS, ATTR_MESSAGE_INTEGRITY,
    ATTR_PRIORITY, ATTR_UNKNOWN_ATTRIBUTES, ATTR_USERNAME, ATTR_USE_CANDIDATE, ATTR_XORMAPPED_ADDRESS,
};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED, CODE_UNKNOWN_ATTRIBUTE};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{
    Getter, Message, Setter, BINDING_ERROR, CLASS_ERROR_RESPONSE, CLASS_INDICATION, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use stun::textattrs::Username;
use stun::uattrs::UnknownAttributes;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock as AsyncRwLock;

use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use crate::candidate::{Candidate, CandidatePair, CandidatePairState, CandidateType, DEFAULT_LOCAL_PREFERENCE};
use crate::checklist::{CheckList, CheckListState};
use crate::conncheck::{ConnCheckServer, RoleResolution};
use crate::control::{AttrControl, Role};
use crate::credentials::CredentialsManager;
use crate::error::{Error, Result};
use crate::net_access::{Connector, InboundSink, NetAccessManager};
use crate::net_access::Transport as NetTransport;
use crate::priority::PriorityAttr;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::transaction::{
    spawn_server_transaction_sweeper, start_client_transaction, ClientTransactionMap, RetransmitParams,
    ServerTransactionMap, StunClientTransaction, StunServerTransaction, TransactionCollector,
    Transport as TxTransport,
};
use crate::use_candidate::UseCandidateAttr;

/// The single "shared secret" media label used to key [`CredentialsManager`]'s remote table when a
/// caller configures remote credentials through [`Stack::set_remote_credentials`] rather than
/// talking to the manager directly. A stack that needs a distinct remote credential per media
/// stream should bypass this and call `stack.credentials().set_remote_credentials(...)` itself.
const DEFAULT_MEDIA: &str = "default";

/// Configuration for a [`Stack`], built once and handed to [`Stack::new`]. Mirrors the
/// field-and-defaults shape of `ice/src/agent/agent_config.rs`'s `AgentConfig`, narrowed to what
/// the stack itself consumes now that candidate gathering lives outside the core.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub retransmit: RetransmitParams,
    pub require_message_integrity: bool,
    pub propagate_retransmissions: bool,
    pub tick_interval: Duration,
    pub server_transaction_sweep_interval: Duration,
    pub local_ufrag: String,
    pub local_pwd: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            retransmit: RetransmitParams::default(),
            require_message_integrity: true,
            propagate_retransmissions: false,
            tick_interval: Duration::from_millis(20),
            server_transaction_sweep_interval: Duration::from_secs(1),
            local_ufrag: generate_ufrag(),
            local_pwd: generate_pwd(),
        }
    }
}

impl StackConfig {
    #[must_use]
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder(StackConfig::default())
    }
}

/// Builder for [`StackConfig`]: a plain struct assembled by value rather than a
/// `ThreadLocal`-overridable global (see `DESIGN.md`).
pub struct StackConfigBuilder(StackConfig);

impl StackConfigBuilder {
    #[must_use]
    pub fn retransmit(mut self, params: RetransmitParams) -> Self {
        self.0.retransmit = params;
        self
    }

    #[must_use]
    pub fn require_message_integrity(mut self, required: bool) -> Self {
        self.0.require_message_integrity = required;
        self
    }

    #[must_use]
    pub fn propagate_retransmissions(mut self, propagate: bool) -> Self {
        self.0.propagate_retransmissions = propagate;
        self
    }

    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.0.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn local_credentials(mut self, ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.0.local_ufrag = ufrag.into();
        self.0.local_pwd = pwd.into();
        self
    }

    #[must_use]
    pub fn build(self) -> StackConfig {
        self.0
    }
}

/// Handles one inbound Binding Request (or other request method) and returns the bytes of a
/// response, or `None` to leave the request unanswered (per §4.6/§7, unknown request methods get
/// no synthesized error).
#[async_trait]
pub trait RequestListener: Send + Sync {
    async fn on_request(&self, request: &Message, local: SocketAddr, remote: SocketAddr) -> Option<Vec<u8>>;
}

/// Handles one inbound Indication, addressed by the local socket it arrived on.
#[async_trait]
pub trait IndicationListener: Send + Sync {
    async fn on_indication(&self, indication: &Message, local: SocketAddr, remote: SocketAddr);
}

/// One media stream's working set: its check list, the local candidates bound to it (used to
/// match an inbound request's destination back to "our side" of a pair), and the component ids
/// that must all have a selected pair before the stream is `Completed`.
struct StreamState {
    checklist: Arc<CheckList>,
    local_candidates: Vec<Arc<dyn Candidate + Send + Sync>>,
    components: HashSet<u16>,
}

/// Composes the network-access registry, credential store, client/server transaction tables, and
/// connectivity-check server into the single object an application drives. One `Stack` per ICE
/// agent; `Arc<Stack>` is the only way to hold one, since its dispatch path needs to hand a `Weak`
/// reference to the registry it owns (see `net_access.rs`'s note on breaking the
/// Stack/NetAccessManager/Connector reference cycle).
pub struct Stack {
    config: StackConfig,
    net: Arc<NetAccessManager>,
    credentials: Arc<CredentialsManager>,
    conncheck: ConnCheckServer,
    client_transactions: ClientTransactionMap,
    collectors: SyncMutex<HashMap<TransactionId, Arc<dyn TransactionCollector>>>,
    server_transactions: ServerTransactionMap,
    request_listeners: AsyncRwLock<Vec<Arc<dyn RequestListener>>>,
    indication_listeners: AsyncRwLock<HashMap<SocketAddr, Vec<Arc<dyn IndicationListener>>>>,
    streams: AsyncMutex<HashMap<String, StreamState>>,
    role: AtomicU8,
    tie_breaker: AtomicU64,
    remote_ufrag: SyncMutex<Option<String>>,
}

fn role_to_u8(role: Role) -> u8 {
    match role {
        Role::Controlling => 0,
        Role::Controlled => 1,
        Role::Unspecified => 2,
    }
}

fn role_from_u8(v: u8) -> Role {
    match v {
        0 => Role::Controlling,
        1 => Role::Controlled,
        _ => Role::Unspecified,
    }
}

/// Adapts [`NetAccessManager::send`] to the narrow [`TxTransport`] trait the client-transaction
/// retransmit loop in `transaction.rs` depends on, so that module stays ignorant of sockets.
struct NetAccessTransport {
    net: Arc<NetAccessManager>,
    local: SocketAddr,
    remote: SocketAddr,
}

#[async_trait]
impl TxTransport for NetAccessTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        self.net.send(buf, self.local, self.remote).await
    }
}

/// Wraps a caller-supplied [`TransactionCollector`] so that, whichever outcome fires first, this
/// stack's own `collectors` side table (used to correlate a later inbound `Response` back to its
/// collector; see [`Stack::handle_response`]) is cleaned up alongside it. On the response path
/// `handle_response` already removes the entry itself before invoking the collector, so only the
/// timeout path needs this wrapper.
struct BoundCollector {
    id: TransactionId,
    inner: Arc<dyn TransactionCollector>,
    stack: Weak<Stack>,
}

impl TransactionCollector for BoundCollector {
    fn on_response(&self, id: TransactionId, message: Message, from: SocketAddr) {
        self.inner.on_response(id, message, from);
    }

    fn on_timeout(&self, id: TransactionId) {
        self.inner.on_timeout(id);
        if let Some(stack) = self.stack.upgrade() {
            stack.collectors.lock().unwrap().remove(&self.id);
        }
    }
}

/// A check issued by the periodic scheduling tick, correlating its response back to the check
/// list and pair it was issued for (§4.5's response-handling and nomination rules).
struct CheckCollector {
    stack: Weak<Stack>,
    stream: String,
    pair: Arc<CandidatePair>,
    nominating: bool,
}

impl TransactionCollector for CheckCollector {
    fn on_response(&self, id: TransactionId, message: Message, from: SocketAddr) {
        let Some(stack) = self.stack.upgrade() else { return };
        let stream = self.stream.clone();
        let pair = self.pair.clone();
        let nominating = self.nominating;
        tokio::spawn(async move {
            stack.handle_check_response(stream, pair, message, from, nominating).await;
        });
        let _ = id;
    }

    fn on_timeout(&self, id: TransactionId) {
        self.pair.state.store(CandidatePairState::Failed as u8, Ordering::SeqCst);
        let _ = id;
    }
}

impl Stack {
    /// Builds a new stack and wires its `NetAccessManager` to dispatch inbound frames back to it,
    /// spawns the server-transaction sweeper, and starts the periodic check-list scheduling tick
    /// (§4.5). Registers the stack's own local ufrag/pwd as a short-term credential.
    pub async fn new(config: StackConfig) -> Arc<Self> {
        let credentials = Arc::new(CredentialsManager::new());
        credentials.set_local_credentials(&config.local_ufrag, &config.local_pwd);

        let stack = Arc::new(Stack {
            net: Arc::new(NetAccessManager::new()),
            conncheck: ConnCheckServer::new(credentials.clone()),
            credentials,
            client_transactions: Arc::new(AsyncMutex::new(HashMap::new())),
            collectors: SyncMutex::new(HashMap::new()),
            server_transactions: Arc::new(AsyncMutex::new(HashMap::new())),
            request_listeners: AsyncRwLock::new(Vec::new()),
            indication_listeners: AsyncRwLock::new(HashMap::new()),
            streams: AsyncMutex::new(HashMap::new()),
            role: AtomicU8::new(role_to_u8(Role::Controlling)),
            tie_breaker: AtomicU64::new(rand::random::<u64>()),
            remote_ufrag: SyncMutex::new(None),
            config,
        });

        stack
            .net
            .set_dispatch_sink(Arc::downgrade(&stack) as Weak<dyn InboundSink>)
            .await;

        spawn_server_transaction_sweeper(
            stack.server_transactions.clone(),
            stack.config.server_transaction_sweep_interval,
        );

        spawn_check_ticker(Arc::downgrade(&stack), stack.config.tick_interval);

        stack
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialsManager> {
        &self.credentials
    }

    #[must_use]
    pub fn role(&self) -> Role {
        role_from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role_to_u8(role), Ordering::SeqCst);
    }

    /// Flips the agent's role and, per §4.5's "recompute pair priorities" step, re-stamps every
    /// pair in every registered check list with the new role so their `priority()` reflects the
    /// new G/D assignment instead of staying pinned to the role that was in effect when the pair
    /// was formed.
    async fn switch_role(&self, role: Role) {
        self.set_role(role);
        let controlling = role == Role::Controlling;
        let streams = self.streams.lock().await;
        for state in streams.values() {
            state.checklist.set_role(controlling).await;
        }
    }

    #[must_use]
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker.load(Ordering::SeqCst)
    }

    /// Registers the remote peer's ufrag/pwd under this stack's single default media bucket. A
    /// stack juggling distinct credentials per media stream should use
    /// `stack.credentials().set_remote_credentials(ufrag, pwd, media)` directly instead.
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str) {
        self.credentials.set_remote_credentials(ufrag, pwd, DEFAULT_MEDIA);
        *self.remote_ufrag.lock().unwrap() = Some(ufrag.to_owned());
    }

    /// Registers a media stream's check list and local candidates so inbound requests addressed
    /// to one of those candidates' sockets can be correlated back to it (learned peer-reflexive
    /// candidates, triggered checks) and so the periodic tick drives its scheduling.
    pub async fn register_checklist(
        &self,
        stream: impl Into<String>,
        checklist: Arc<CheckList>,
        local_candidates: Vec<Arc<dyn Candidate + Send + Sync>>,
    ) {
        let components = local_candidates.iter().map(Candidate::component).collect();
        self.streams.lock().await.insert(
            stream.into(),
            StreamState {
                checklist,
                local_candidates,
                components,
            },
        );
    }

    pub async fn add_socket(
        &self,
        socket: Arc<dyn util::Conn + Send + Sync>,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        transport: NetTransport,
    ) -> Result<Arc<Connector>> {
        self.net.add_socket(socket, local, remote, transport).await
    }

    pub async fn remove_socket(&self, local: SocketAddr, remote: Option<SocketAddr>) -> Result<()> {
        self.net.remove_socket(local, remote).await
    }

    /// Sends a client (request-originating) transaction, per §4.2's contract. `via` is the local
    /// address the request is sent from; `to` is its destination.
    pub async fn send_request(
        self: &Arc<Self>,
        request: Message,
        to: SocketAddr,
        via: SocketAddr,
        collector: Arc<dyn TransactionCollector>,
        retransmit_params: Option<RetransmitParams>,
    ) -> Result<TransactionId> {
        let id = request.transaction_id;
        self.collectors.lock().unwrap().insert(id, collector.clone());

        let bound = Arc::new(BoundCollector {
            id,
            inner: collector,
            stack: Arc::downgrade(self),
        });

        let tx = Arc::new(StunClientTransaction::new(id, request.raw, via, to));
        let transport = Arc::new(NetAccessTransport {
            net: self.net.clone(),
            local: via,
            remote: to,
        });

        start_client_transaction(
            tx,
            self.client_transactions.clone(),
            transport,
            bound,
            retransmit_params.unwrap_or(self.config.retransmit),
        )
        .await;

        Ok(id)
    }

    /// Answers a server (request-answering) transaction exactly once, per §4.3.
    pub async fn send_response(&self, tid: TransactionId, response: Message, via: SocketAddr, to: SocketAddr) -> Result<()> {
        let tx = {
            let table = self.server_transactions.lock().await;
            table.get(&tid).cloned().ok_or(Error::TransactionDoesNotExist)?
        };
        tx.send_response(response.raw.clone()).await?;
        self.net.send(&response.raw, via, to).await
    }

    /// Sends a fire-and-forget Indication; there is no transaction to track a response for.
    pub async fn send_indication(&self, indication: Message, to: SocketAddr, via: SocketAddr) -> Result<()> {
        self.net.send(&indication.raw, via, to).await
    }

    pub async fn add_request_listener(&self, listener: Arc<dyn RequestListener>) {
        self.request_listeners.write().await.push(listener);
    }

    /// Re-dispatches a request to every registered [`RequestListener`] without answering it again
    /// -- used for a request that has already been (or is already being) answered by its server
    /// transaction, so a returned response would have nowhere to go. Only called when
    /// [`StackConfig::propagate_retransmissions`] is set, per §6's "propagate received
    /// retransmissions" flag: by default a retransmission of a request this stack already saw is
    /// invisible to request listeners, since the cached/in-flight answer already covers it.
    async fn dispatch_to_request_listeners(&self, message: &Message, local: SocketAddr, remote: SocketAddr) {
        let listeners = self.request_listeners.read().await;
        for listener in listeners.iter() {
            let _ = listener.on_request(message, local, remote).await;
        }
    }

    pub async fn add_indication_listener(&self, local: SocketAddr, listener: Arc<dyn IndicationListener>) {
        self.indication_listeners.write().await.entry(local).or_default().push(listener);
    }

    /// Cancels every outstanding client transaction and closes every registered connector.
    pub async fn shutdown(&self) {
        let ids: Vec<TransactionId> = {
            let table = self.client_transactions.lock().await;
            table.keys().copied().collect()
        };
        for id in ids {
            let tx = self.client_transactions.lock().await.get(&id).cloned();
            if let Some(tx) = tx {
                tx.cancel(true).await;
            }
        }
        self.net.close_all().await;
    }

    async fn handle_response(&self, message: Message, from: SocketAddr) {
        let collector = self.collectors.lock().unwrap().remove(&message.transaction_id);
        let Some(collector) = collector else {
            log::trace!("[stack]: dropping response for unknown transaction {:?}", message.transaction_id);
            return;
        };

        if let Some(tx) = self.client_transactions.lock().await.remove(&message.transaction_id) {
            tx.cancel(false).await;
        }

        collector.on_response(message.transaction_id, message, from);
    }

    async fn handle_indication(&self, message: Message, local: SocketAddr, remote: SocketAddr) {
        let listeners = {
            let guard = self.indication_listeners.read().await;
            guard.get(&local).cloned().unwrap_or_default()
        };
        for listener in listeners {
            listener.on_indication(&message, local, remote).await;
        }
    }

    async fn handle_request(&self, message: Message, local: SocketAddr, remote: SocketAddr) {
        let tx = {
            let mut table = self.server_transactions.lock().await;
            if let Some(existing) = table.get(&message.transaction_id).cloned() {
                if let Some(cached) = existing.cached_response().await {
                    let _ = self.net.send(&cached, local, remote).await;
                } else {
                    log::trace!("[stack]: dropping duplicate in-flight request {:?}", message.transaction_id);
                }
                if self.config.propagate_retransmissions {
                    self.dispatch_to_request_listeners(&message, local, remote).await;
                }
                return;
            }
            let fresh = Arc::new(StunServerTransaction::new(message.transaction_id, remote, local));
            table.insert(message.transaction_id, fresh.clone());
            fresh
        };

        let local_ufrag = match self.validate_request(&message) {
            Ok(ufrag) => ufrag,
            Err(()) => {
                let resp = self.build_unauthorized_response(&message);
                if let Ok(resp) = resp {
                    let _ = tx.send_response(resp.clone()).await;
                    let _ = self.net.send(&resp, local, remote).await;
                }
                self.server_transactions.lock().await.remove(&message.transaction_id);
                return;
            }
        };

        let unknown = unknown_comprehension_required_attributes(&message);
        if !unknown.is_empty() {
            if let Ok(resp) = self.build_unknown_attribute_response(&message, &local_ufrag, unknown) {
                let _ = tx.send_response(resp.clone()).await;
                let _ = self.net.send(&resp, local, remote).await;
            }
            return;
        }

        let answer = if message.typ.method == METHOD_BINDING {
            self.handle_binding_request(&message, &local_ufrag, local, remote).await
        } else {
            None
        };

        if let Some(bytes) = answer {
            if tx.send_response(bytes.clone()).await.is_ok() {
                let _ = self.net.send(&bytes, local, remote).await;
            }
        }
    }

    /// Per §4.4 point 2 and §7: a missing/unparsable USERNAME, a local credential this agent
    /// doesn't hold, or a MESSAGE-INTEGRITY that fails to verify (or is absent when required) are
    /// all authentication errors answered with 401.
    fn validate_request(&self, message: &Message) -> std::result::Result<String, ()> {
        let mut username = Username::new(ATTR_USERNAME, String::new());
        username.get_from(message).map_err(|_| ())?;
        let full = username.to_string();
        let local_ufrag = full.split(':').next().unwrap_or("").to_owned();
        if local_ufrag.is_empty() {
            return Err(());
        }

        let Some(key) = self.credentials.get_local_key(&local_ufrag) else {
            return Err(());
        };

        if message.contains(ATTR_MESSAGE_INTEGRITY) {
            let mut clone = message.clone();
            if MessageIntegrity(key).check(&mut clone).is_err() {
                return Err(());
            }
        } else if self.config.require_message_integrity {
            return Err(());
        }

        Ok(local_ufrag)
    }

    fn build_unauthorized_response(&self, request: &Message) -> Result<Vec<u8>> {
        // The request never authenticated, so there is no local ufrag to sign with; answer with
        // this stack's own credential instead, always replying under the identity the response is
        // actually sent as.
        let key = self
            .credentials
            .get_local_key(&self.config.local_ufrag)
            .ok_or_else(|| Error::Other("stack has no local credential".to_owned()))?;
        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_UNAUTHORIZED,
                reason: b"Unauthorized".to_vec(),
            }),
            Box::new(MessageIntegrity(key)),
            Box::new(FINGERPRINT),
        ])?;
        Ok(out.raw)
    }

    fn build_unknown_attribute_response(
        &self,
        request: &Message,
        local_ufrag: &str,
        unknown: Vec<stun::attributes::AttrType>,
    ) -> Result<Vec<u8>> {
        let key = self
            .credentials
            .get_local_key(local_ufrag)
            .ok_or_else(|| Error::Other(format!("no local credential for {local_ufrag}")))?;
        let mut out = Message::new();
        out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(ErrorCodeAttribute {
                code: CODE_UNKNOWN_ATTRIBUTE,
                reason: b"Unknown Attribute".to_vec(),
            }),
            Box::new(UnknownAttributes(unknown)),
            Box::new(MessageIntegrity(key)),
            Box::new(FINGERPRINT),
        ])?;
        Ok(out.raw)
    }

    /// Implements §4.6 end to end: parses the request, learns a peer-reflexive candidate and
    /// schedules a triggered check, resolves a role conflict if signalled, and builds the Binding
    /// Success (or 487/400) response.
    async fn handle_binding_request(
        &self,
        message: &Message,
        local_ufrag: &str,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<Vec<u8>> {
        let we_are_controlling = self.role() == Role::Controlling;

        let outcome = match self.conncheck.parse_request(message, remote, we_are_controlling) {
            Ok(outcome) => outcome,
            Err(_) => return self.conncheck.build_bad_request_response(message, local_ufrag).ok(),
        };

        if let Some((stream, local_candidate)) = self.find_local_candidate(local).await {
            self.learn_peer_reflexive(&stream, &local_candidate, remote, outcome.priority, outcome.use_candidate, we_are_controlling)
                .await;
        }

        match self.conncheck.resolve_role_conflict(message, self.role(), self.tie_breaker()) {
            RoleResolution::RejectPeer => {
                return self.conncheck.build_role_conflict_response(message, local_ufrag).ok();
            }
            RoleResolution::SwitchRole(new_role) => self.switch_role(new_role).await,
            RoleResolution::NoConflict => {}
        }

        self.conncheck.build_success_response(message, remote, local_ufrag).ok()
    }

    async fn find_local_candidate(&self, local: SocketAddr) -> Option<(String, Arc<dyn Candidate + Send + Sync>)> {
        let streams = self.streams.lock().await;
        for (name, state) in streams.iter() {
            if let Some(candidate) = state.local_candidates.iter().find(|c| c.addr() == local) {
                return Some((name.clone(), candidate.clone()));
            }
        }
        None
    }

    async fn learn_peer_reflexive(
        &self,
        stream: &str,
        local_candidate: &Arc<dyn Candidate + Send + Sync>,
        remote: SocketAddr,
        priority: u32,
        use_candidate: bool,
        we_are_controlling: bool,
    ) {
        let Ok(remote_candidate) = build_peer_reflexive(remote, local_candidate.component(), priority, local_candidate.network_type().is_tcp())
        else {
            return;
        };

        let streams = self.streams.lock().await;
        let Some(state) = streams.get(stream) else { return };

        if use_candidate {
            if let Some(existing) = state.checklist.find_pair(local_candidate, &remote_candidate).await {
                if existing.state.load(Ordering::SeqCst) == CandidatePairState::Succeeded as u8 {
                    state.checklist.handle_nomination(existing).await;
                    return;
                }
            }
        }

        let pair = Arc::new(CandidatePair::new(local_candidate.clone(), remote_candidate, we_are_controlling));
        state.checklist.schedule_triggered(pair).await;
    }

    /// Called by [`CheckCollector::on_response`] for an ordinary or nominating check issued by the
    /// scheduling tick. Implements §4.5's response-handling and nomination rules.
    async fn handle_check_response(
        self: Arc<Self>,
        stream: String,
        mut pair: Arc<CandidatePair>,
        message: Message,
        _from: SocketAddr,
        was_nomination: bool,
    ) {
        if message.typ.class == CLASS_ERROR_RESPONSE {
            let mut ec = ErrorCodeAttribute::default();
            if ec.get_from(&message).is_ok() && ec.code == CODE_ROLE_CONFLICT {
                self.switch_role(self.role().opposite()).await;
                pair.state.store(CandidatePairState::Waiting as u8, Ordering::SeqCst);
                if let Some(state) = self.streams.lock().await.get(&stream) {
                    state.checklist.schedule_triggered(pair).await;
                }
                return;
            }
            pair.state.store(CandidatePairState::Failed as u8, Ordering::SeqCst);
            return;
        }

        if message.typ.class != CLASS_SUCCESS_RESPONSE {
            return;
        }

        let mut mapped = XorMappedAddress::default();
        if mapped.get_from_as(&message, ATTR_XORMAPPED_ADDRESS).is_err() {
            pair.state.store(CandidatePairState::Failed as u8, Ordering::SeqCst);
            return;
        }
        let mapped_addr = SocketAddr::new(mapped.ip, mapped.port);

        let streams = self.streams.lock().await;
        let Some(state) = streams.get(&stream) else { return };

        if mapped_addr == pair.local.addr() {
            pair.state.store(CandidatePairState::Succeeded as u8, Ordering::SeqCst);
        } else if let Ok(prflx) = build_local_peer_reflexive(&pair.local, mapped_addr) {
            let controlling = self.role() == Role::Controlling;
            let new_pair = Arc::new(CandidatePair::new(prflx, pair.remote.clone(), controlling));
            new_pair.state.store(CandidatePairState::Succeeded as u8, Ordering::SeqCst);
            state.checklist.insert_pair(new_pair.clone()).await;
            pair = new_pair;
        } else {
            pair.state.store(CandidatePairState::Failed as u8, Ordering::SeqCst);
            return;
        }

        let foundation = format!("{}{}", pair.local.foundation(), pair.remote.foundation());
        for other in streams.values() {
            other.checklist.unfreeze_foundation(&foundation).await;
        }

        if was_nomination {
            state.checklist.handle_nomination(pair.clone()).await;
        } else if self.role() == Role::Controlling
            && state.checklist.selected_pair(pair.local.component()).await.is_none()
        {
            let stream = stream.clone();
            let this = self.clone();
            tokio::spawn(async move {
                this.send_check(stream, pair, true).await;
            });
        }

        state.checklist.update_state(&state.components).await;
    }

    /// Issues a Binding Request for `pair`, per §4.5 point 3: `PRIORITY` carries the
    /// peer-reflexive priority this side would assign the local candidate, `ICE-CONTROLLING`/
    /// `ICE-CONTROLLED` carries this agent's tie-breaker, and `USE-CANDIDATE` is set iff
    /// `nominate`.
    async fn send_check(self: &Arc<Self>, stream: String, pair: Arc<CandidatePair>, nominate: bool) {
        let Some(remote_ufrag) = self.remote_ufrag() else { return };
        let Some(key) = self.credentials.get_remote_key(&remote_ufrag, DEFAULT_MEDIA) else {
            return;
        };

        let mut request = Message::new();
        let username = format!("{}:{}", remote_ufrag, self.config.local_ufrag);
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(stun::message::BINDING_REQUEST),
            Box::new(Username::new(ATTR_USERNAME, username)),
            Box::new(PriorityAttr(peer_reflexive_priority(pair.local.component()))),
            Box::new(AttrControl {
                role: self.role(),
                tie_breaker: crate::control::TieBreaker(self.tie_breaker()),
            }),
        ];
        if nominate {
            setters.push(Box::new(UseCandidateAttr::new()));
        }
        setters.push(Box::new(MessageIntegrity(key)));
        setters.push(Box::new(FINGERPRINT));

        if request.build(&setters).is_err() {
            return;
        }

        let local = pair.local.addr();
        let remote = pair.remote.addr();
        let collector = Arc::new(CheckCollector {
            stack: Arc::downgrade(self),
            stream,
            pair,
            nominating: nominate,
        });

        let _ = self
            .send_request(request, remote, local, collector, Some(self.config.retransmit))
            .await;
    }

    /// The remote peer's ufrag, as last set via [`Stack::set_remote_credentials`]. `CredentialsManager`
    /// keys remote credentials by `(ufrag, media)` rather than exposing "the" current remote ufrag,
    /// so the stack tracks it separately for use when building outgoing checks.
    fn remote_ufrag(&self) -> Option<String> {
        self.remote_ufrag.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboundSink for Stack {
    async fn dispatch(&self, buf: Vec<u8>, local: SocketAddr, remote: SocketAddr) {
        if buf.len() < stun::message::MESSAGE_HEADER_SIZE {
            log::trace!("[stack]: dropping runt datagram from {remote}");
            return;
        }

        let mut message = Message::new();
        message.raw = buf;
        let decode_err = message.decode().is_err();

        if decode_err {
            if message.typ.class == CLASS_REQUEST {
                if let Ok(resp) = self.conncheck.build_bad_request_response(&message, &self.config.local_ufrag) {
                    let _ = self.net.send(&resp, local, remote).await;
                }
            } else {
                log::debug!("[stack]: dropping undecodable message from {remote}");
            }
            return;
        }

        match message.typ.class {
            CLASS_SUCCESS_RESPONSE | CLASS_ERROR_RESPONSE => self.handle_response(message, remote).await,
            CLASS_REQUEST => self.handle_request(message, local, remote).await,
            CLASS_INDICATION => self.handle_indication(message, local, remote).await,
            _ => {}
        }
    }
}

fn unknown_comprehension_required_attributes(message: &Message) -> Vec<stun::attributes::AttrType> {
    const KNOWN: &[u16] = &[
        ATTR_USERNAME.0,
        ATTR_MESSAGE_INTEGRITY.0,
        ATTR_PRIORITY.0,
        ATTR_USE_CANDIDATE.0,
        ATTR_ICE_CONTROLLED.0,
        ATTR_ICE_CONTROLLING.0,
        ATTR_ERROR_CODE.0,
        ATTR_XORMAPPED_ADDRESS.0,
        ATTR_UNKNOWN_ATTRIBUTES.0,
        ATTR_MAPPED_ADDRESS.0,
    ];
    message
        .attributes
        .0
        .iter()
        .filter(|a| a.typ.required() && !KNOWN.contains(&a.typ.0))
        .map(|a| a.typ)
        .collect()
}

fn peer_reflexive_priority(component: u16) -> u32 {
    (1_u32 << 24) * u32::from(CandidateType::PeerReflexive.preference())
        + (1_u32 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
        + (256 - u32::from(component))
}

fn build_peer_reflexive(addr: SocketAddr, component: u16, priority: u32, tcp: bool) -> Result<Arc<dyn Candidate + Send + Sync>> {
    let cfg = CandidatePeerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: if tcp { "tcp".to_owned() } else { "udp".to_owned() },
            address: addr.ip().to_string(),
            port: addr.port(),
            component,
            priority,
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(Arc::new(cfg.new_candidate_peer_reflexive()?))
}

fn build_local_peer_reflexive(base: &Arc<dyn Candidate + Send + Sync>, mapped: SocketAddr) -> Result<Arc<dyn Candidate + Send + Sync>> {
    let cfg = CandidatePeerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: if base.network_type().is_tcp() { "tcp".to_owned() } else { "udp".to_owned() },
            address: mapped.ip().to_string(),
            port: mapped.port(),
            component: base.component(),
            priority: peer_reflexive_priority(base.component()),
            conn: base.get_conn().cloned(),
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(Arc::new(cfg.new_candidate_peer_reflexive()?))
}

/// Spawns the background tick that drives every registered check list's scheduling algorithm
/// (§4.5), issuing one Binding Request per active pair per tick.
fn spawn_check_ticker(stack: Weak<Stack>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(stack) = stack.upgrade() else { return };

            let snapshot: Vec<(String, Arc<CheckList>)> = {
                let streams = stack.streams.lock().await;
                streams.iter().map(|(name, state)| (name.clone(), state.checklist.clone())).collect()
            };

            for (name, checklist) in snapshot {
                if checklist.state() != CheckListState::Running {
                    continue;
                }
                if let Some(pair) = checklist.next_check().await {
                    stack.send_check(name, pair, false).await;
                }
            }
        }
    });
}
