//! ICE agent: gathering, pair formation, connectivity checks, nomination.
//!
//! The agent owns no sockets; the I/O layer registers each bound socket with
//! [`IceAgent::add_local_socket`] and feeds received datagrams through
//! [`IceAgent::process_packet`]. Timers are driven by calling
//! [`IceAgent::tick`] on the configured check interval (or by spawning
//! [`IceAgent::drive`] on the owning runtime).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::candidate::{pair_priority, CandidateType, IceCandidate};
use crate::config::{IceConfig, IceCredentials, IceRole};
use crate::error::Error;
use crate::stun::{StunAttribute, StunClass, StunMessage, StunMethod};
use crate::turn::{TurnClient, TurnConfig, TurnEvent};
use crate::Result;

/// Connection state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    /// No checks started
    New,
    /// Connectivity checks running
    Checking,
    /// A pair is selected and usable
    Connected,
    /// All components have selected pairs
    Completed,
    /// No pair could be established in time
    Failed,
    /// A previously working pair stopped responding
    Disconnected,
    /// Agent shut down
    Closed,
}

/// Gathering state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    /// Gathering not started
    New,
    /// Candidates being discovered
    Gathering,
    /// All discovery finished
    Complete,
}

/// Events the agent emits.
#[derive(Debug, Clone)]
pub enum IceAgentEvent {
    /// Connection state changed
    ConnectionStateChange(IceConnectionState),
    /// Gathering state changed
    GatheringStateChange(IceGatheringState),
    /// A new local candidate is available for signalling
    NewCandidate(IceCandidate),
    /// The nominated pair changed
    SelectedPair {
        /// Local side of the pair
        local: IceCandidate,
        /// Remote side of the pair
        remote: IceCandidate,
    },
    /// Application data arrived on a connected pair
    DataReceived {
        /// Payload bytes
        data: Bytes,
        /// Sender address
        source: SocketAddr,
    },
}

/// Candidate pair check state (RFC 8445 Section 6.1.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

struct CandidatePair {
    local: IceCandidate,
    remote: IceCandidate,
    priority: u64,
    state: PairState,
    nominated: bool,
    socket_index: usize,
    last_check: Option<Instant>,
}

impl CandidatePair {
    fn foundation_key(&self) -> (String, String) {
        (self.local.foundation.clone(), self.remote.foundation.clone())
    }
}

struct LocalSocket {
    socket: Arc<UdpSocket>,
    component: u32,
    address: SocketAddr,
}

enum PendingTransaction {
    /// Server-reflexive gather request through the indexed socket
    Gather { socket_index: usize },
    /// Connectivity check on the pair keyed by (local, remote) address
    Check {
        pair_key: (SocketAddr, SocketAddr),
        nominating: bool,
    },
}

struct Inner {
    connection_state: IceConnectionState,
    gathering_state: IceGatheringState,
    role: IceRole,
    remote_credentials: Option<IceCredentials>,

    sockets: Vec<LocalSocket>,
    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    pairs: Vec<CandidatePair>,
    selected: Option<(SocketAddr, SocketAddr)>,

    pending: HashMap<[u8; 12], PendingTransaction>,
    gather_deadline: Option<Instant>,
    outstanding_gathers: usize,
    checks_started_at: Option<Instant>,
    last_keepalive: Instant,

    turn: Option<TurnClient>,
    turn_events: Option<mpsc::Receiver<TurnEvent>>,
}

/// ICE agent for a single media session.
pub struct IceAgent {
    config: IceConfig,
    local_credentials: IceCredentials,
    tiebreaker: u64,
    inner: Mutex<Inner>,
    events: mpsc::Sender<IceAgentEvent>,
}

impl IceAgent {
    /// Create an agent. Events are delivered on the returned receiver.
    pub fn new(config: IceConfig, role: IceRole) -> (Self, mpsc::Receiver<IceAgentEvent>) {
        let (events, events_rx) = mpsc::channel(128);
        let agent = Self {
            config,
            local_credentials: IceCredentials::generate(),
            tiebreaker: rand::random(),
            inner: Mutex::new(Inner {
                connection_state: IceConnectionState::New,
                gathering_state: IceGatheringState::New,
                role,
                remote_credentials: None,
                sockets: Vec::new(),
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
                pairs: Vec::new(),
                selected: None,
                pending: HashMap::new(),
                gather_deadline: None,
                outstanding_gathers: 0,
                checks_started_at: None,
                last_keepalive: Instant::now(),
                turn: None,
                turn_events: None,
            }),
            events,
        };
        (agent, events_rx)
    }

    /// Local short-term credentials for signalling.
    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    /// Install the peer's credentials from signalling.
    pub async fn set_remote_credentials(&self, credentials: IceCredentials) {
        self.inner.lock().await.remote_credentials = Some(credentials);
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> IceConnectionState {
        self.inner.lock().await.connection_state
    }

    /// Current gathering state.
    pub async fn gathering_state(&self) -> IceGatheringState {
        self.inner.lock().await.gathering_state
    }

    /// Current role.
    pub async fn role(&self) -> IceRole {
        self.inner.lock().await.role
    }

    /// Local candidates gathered so far.
    pub async fn local_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().await.local_candidates.clone()
    }

    /// The selected pair, once nominated.
    pub async fn selected_pair(&self) -> Option<(IceCandidate, IceCandidate)> {
        let inner = self.inner.lock().await;
        let (local_addr, remote_addr) = inner.selected?;
        inner
            .pairs
            .iter()
            .find(|p| p.local.address == local_addr && p.remote.address == remote_addr)
            .map(|p| (p.local.clone(), p.remote.clone()))
    }

    /// Register a bound socket owned by the I/O layer.
    pub async fn add_local_socket(&self, socket: Arc<UdpSocket>, component: u32) -> Result<()> {
        let address = socket.local_addr()?;
        self.inner.lock().await.sockets.push(LocalSocket {
            socket,
            component,
            address,
        });
        Ok(())
    }

    async fn emit(&self, event: IceAgentEvent) {
        if self.events.send(event).await.is_err() {
            warn!("ICE event receiver dropped");
        }
    }

    async fn set_connection_state(&self, inner: &mut Inner, state: IceConnectionState) {
        if inner.connection_state != state {
            debug!(from = ?inner.connection_state, to = ?state, "ICE connection state");
            inner.connection_state = state;
            self.emit(IceAgentEvent::ConnectionStateChange(state)).await;
        }
    }

    async fn set_gathering_state(&self, inner: &mut Inner, state: IceGatheringState) {
        if inner.gathering_state != state {
            inner.gathering_state = state;
            self.emit(IceAgentEvent::GatheringStateChange(state)).await;
        }
    }

    /// Start candidate gathering: host candidates from registered sockets,
    /// server-reflexive via STUN, relay via TURN.
    pub async fn gather_candidates(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.sockets.is_empty() {
            return Err(Error::InvalidState(
                "no local sockets registered".to_string(),
            ));
        }

        self.set_gathering_state(&mut inner, IceGatheringState::Gathering)
            .await;
        inner.gather_deadline = Some(Instant::now() + self.config.gathering_timeout);

        // Host candidates from every registered socket
        if self.config.gather_host {
            let mut new_candidates = Vec::new();
            for (index, local) in inner.sockets.iter().enumerate() {
                let candidate = IceCandidate::host(
                    format!("host-{index}"),
                    local.component,
                    local.address,
                );
                new_candidates.push(candidate);
            }
            for candidate in new_candidates {
                inner.local_candidates.push(candidate.clone());
                self.emit(IceAgentEvent::NewCandidate(candidate)).await;
            }
        }

        // Server-reflexive discovery via STUN Binding requests
        for server in &self.config.stun_servers {
            let Ok(server_addr) = server.address.parse::<SocketAddr>() else {
                warn!(server = %server.address, "unresolvable STUN server");
                continue;
            };
            for index in 0..inner.sockets.len() {
                let request = StunMessage::binding_request();
                inner
                    .pending
                    .insert(request.transaction_id, PendingTransaction::Gather {
                        socket_index: index,
                    });
                inner.outstanding_gathers += 1;
                let wire = request.serialize();
                if let Err(e) = inner.sockets[index].socket.send_to(&wire, server_addr).await {
                    warn!(error = %e, "STUN gather send failed");
                    inner.outstanding_gathers -= 1;
                    inner.pending.remove(&request.transaction_id);
                }
            }
        }

        // Relay allocation via the first TURN server
        if let Some(turn_server) = self.config.turn_servers.first() {
            if let Ok(server_addr) = turn_server.address.parse::<SocketAddr>() {
                let socket = Arc::clone(&inner.sockets[0].socket);
                let (mut turn, turn_events) = TurnClient::new(
                    socket,
                    TurnConfig {
                        server: server_addr,
                        username: turn_server.username.clone().unwrap_or_default(),
                        password: turn_server.password.clone().unwrap_or_default(),
                        lifetime_secs: 600,
                    },
                );
                if let Err(e) = turn.allocate().await {
                    warn!(error = %e, "TURN allocate failed");
                } else {
                    inner.turn = Some(turn);
                    inner.turn_events = Some(turn_events);
                }
            }
        }

        self.finish_gathering_if_done(&mut inner).await;
        Ok(())
    }

    async fn finish_gathering_if_done(&self, inner: &mut Inner) {
        if inner.gathering_state != IceGatheringState::Gathering {
            return;
        }
        let deadline_passed = inner
            .gather_deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false);
        let turn_pending = inner
            .turn
            .as_ref()
            .map(|t| t.state() == crate::turn::TurnState::Allocating)
            .unwrap_or(false);

        if (inner.outstanding_gathers == 0 && !turn_pending) || deadline_passed {
            self.set_gathering_state(inner, IceGatheringState::Complete)
                .await;
        }
    }

    /// Add a remote candidate from signalling and form pairs.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let mut inner = self.inner.lock().await;
        if inner
            .remote_candidates
            .iter()
            .any(|c| c.address == candidate.address && c.component == candidate.component)
        {
            trace!("duplicate remote candidate ignored");
            return;
        }
        inner.remote_candidates.push(candidate.clone());
        self.form_pairs_for_remote(&mut inner, &candidate);

        if inner.connection_state == IceConnectionState::New && !inner.pairs.is_empty() {
            inner.checks_started_at = Some(Instant::now());
            self.set_connection_state(&mut inner, IceConnectionState::Checking)
                .await;
        }
    }

    fn form_pairs_for_remote(&self, inner: &mut Inner, remote: &IceCandidate) {
        let role = inner.role;
        let locals = inner.local_candidates.clone();
        let mut new_pairs = Vec::new();

        for local in &locals {
            if local.component != remote.component {
                continue;
            }
            let Some(socket_index) = self.socket_index_for(inner, local) else {
                continue;
            };

            let (g, d) = match role {
                IceRole::Controlling => (local.priority, remote.priority),
                IceRole::Controlled => (remote.priority, local.priority),
            };
            new_pairs.push(CandidatePair {
                local: local.clone(),
                remote: remote.clone(),
                priority: pair_priority(g, d),
                state: PairState::Frozen,
                nominated: false,
                socket_index,
                last_check: None,
            });
        }

        for pair in new_pairs {
            // The first pair of each foundation group starts waiting, the
            // rest stay frozen until that group produces a result
            let group_active = inner.pairs.iter().any(|p| {
                p.foundation_key() == pair.foundation_key()
                    && matches!(
                        p.state,
                        PairState::Waiting | PairState::InProgress | PairState::Succeeded
                    )
            });
            let mut pair = pair;
            pair.state = if group_active {
                PairState::Frozen
            } else {
                PairState::Waiting
            };
            inner.pairs.push(pair);
        }

        inner.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn socket_index_for(&self, inner: &Inner, candidate: &IceCandidate) -> Option<usize> {
        // Host candidates send from their own socket; reflexive and relay
        // candidates send through their base socket
        let base = candidate.related_address.unwrap_or(candidate.address);
        let lookup = match candidate.candidate_type {
            CandidateType::Host => candidate.address,
            _ => base,
        };
        inner
            .sockets
            .iter()
            .position(|s| s.address == lookup)
            .or_else(|| {
                inner
                    .sockets
                    .iter()
                    .position(|s| s.component == candidate.component)
            })
    }

    /// Periodic driver: promotes checks, enforces timeouts, sends keepalives.
    pub async fn tick(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        self.poll_turn_events(&mut inner).await;
        self.finish_gathering_if_done(&mut inner).await;

        match inner.connection_state {
            IceConnectionState::Checking
            | IceConnectionState::Connected
            | IceConnectionState::Completed => {}
            _ => return Ok(()),
        }

        self.expire_stale_checks(&mut inner);
        self.send_next_check(&mut inner).await?;
        self.check_nomination_timeout(&mut inner).await;
        self.send_keepalive_if_due(&mut inner).await?;
        Ok(())
    }

    /// Convenience driver that ticks at the configured interval until the
    /// agent is closed. Spawn on the owning runtime.
    pub async fn drive(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.connectivity_check_interval);
        loop {
            interval.tick().await;
            if self.connection_state().await == IceConnectionState::Closed {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "ICE tick failed");
            }
        }
    }

    async fn poll_turn_events(&self, inner: &mut Inner) {
        let mut relayed = Vec::new();
        if let Some(events) = &mut inner.turn_events {
            while let Ok(event) = events.try_recv() {
                match event {
                    TurnEvent::Allocated(allocation) => {
                        relayed.push(allocation.relayed_address);
                    }
                    TurnEvent::AllocationFailed { code, reason } => {
                        warn!(code, %reason, "relay gathering failed");
                    }
                    TurnEvent::Data { peer, data } => {
                        self.emit(IceAgentEvent::DataReceived { data, source: peer })
                            .await;
                    }
                    _ => {}
                }
            }
        }

        for relayed_address in relayed {
            let component = inner.sockets.first().map(|s| s.component).unwrap_or(1);
            let server = inner.sockets[0].address;
            let candidate = IceCandidate::relay(
                format!("relay-{relayed_address}"),
                component,
                relayed_address,
                server,
            );
            inner.local_candidates.push(candidate.clone());
            self.emit(IceAgentEvent::NewCandidate(candidate)).await;
        }
    }

    fn expire_stale_checks(&self, inner: &mut Inner) {
        let timeout = self.config.connectivity_check_interval * 40;
        let mut completed_groups = Vec::new();
        for pair in &mut inner.pairs {
            if pair.state == PairState::InProgress {
                if let Some(last) = pair.last_check {
                    if last.elapsed() > timeout {
                        debug!(local = %pair.local.address, remote = %pair.remote.address,
                               "connectivity check timed out");
                        pair.state = PairState::Failed;
                        completed_groups.push(pair.foundation_key());
                    }
                }
            }
        }
        for group in completed_groups {
            Self::unfreeze_group(inner, &group);
        }
    }

    fn unfreeze_group(inner: &mut Inner, group: &(String, String)) {
        if let Some(pair) = inner
            .pairs
            .iter_mut()
            .find(|p| p.state == PairState::Frozen && &p.foundation_key() == group)
        {
            pair.state = PairState::Waiting;
        }
    }

    async fn send_next_check(&self, inner: &mut Inner) -> Result<()> {
        let Some(remote_creds) = inner.remote_credentials.clone() else {
            return Ok(());
        };

        // Highest-priority waiting pair (list is sorted descending)
        let Some(index) = inner.pairs.iter().position(|p| p.state == PairState::Waiting) else {
            return Ok(());
        };

        let role = inner.role;
        let (request, pair_key, socket_index, remote_addr) = {
            let pair = &mut inner.pairs[index];
            pair.state = PairState::InProgress;
            pair.last_check = Some(Instant::now());

            let mut request = StunMessage::binding_request();
            request.add_attribute(StunAttribute::Username(format!(
                "{}:{}",
                remote_creds.ufrag, self.local_credentials.ufrag
            )));
            // Priority a peer-reflexive candidate born of this check would have
            let prflx_priority = IceCandidate::compute_priority(
                CandidateType::PeerReflexive,
                65535,
                pair.local.component,
            );
            request.add_attribute(StunAttribute::Priority(prflx_priority));
            match role {
                IceRole::Controlling => {
                    request.add_attribute(StunAttribute::IceControlling(self.tiebreaker))
                }
                IceRole::Controlled => {
                    request.add_attribute(StunAttribute::IceControlled(self.tiebreaker))
                }
            };
            request.add_message_integrity(remote_creds.password.as_bytes());
            request.add_fingerprint();

            (
                request,
                (pair.local.address, pair.remote.address),
                pair.socket_index,
                pair.remote.address,
            )
        };

        inner.pending.insert(request.transaction_id, PendingTransaction::Check {
            pair_key,
            nominating: false,
        });

        trace!(local = %pair_key.0, remote = %pair_key.1, "sending connectivity check");
        inner.sockets[socket_index]
            .socket
            .send_to(&request.serialize(), remote_addr)
            .await?;
        Ok(())
    }

    async fn check_nomination_timeout(&self, inner: &mut Inner) {
        let Some(started) = inner.checks_started_at else {
            return;
        };
        if inner.selected.is_some() {
            return;
        }
        let any_succeeded = inner.pairs.iter().any(|p| p.state == PairState::Succeeded);

        if started.elapsed() > self.config.nomination_timeout && !any_succeeded {
            self.set_connection_state(inner, IceConnectionState::Failed)
                .await;
        }
    }

    async fn send_keepalive_if_due(&self, inner: &mut Inner) -> Result<()> {
        let Some((local_addr, remote_addr)) = inner.selected else {
            return Ok(());
        };
        if inner.last_keepalive.elapsed() < self.config.keepalive_interval {
            return Ok(());
        }
        inner.last_keepalive = Instant::now();

        let Some(pair_index) = inner
            .pairs
            .iter()
            .position(|p| p.local.address == local_addr && p.remote.address == remote_addr)
        else {
            return Ok(());
        };
        let socket_index = inner.pairs[pair_index].socket_index;

        let mut indication = StunMessage::binding_indication();
        indication.add_fingerprint();
        trace!(remote = %remote_addr, "sending keepalive");
        inner.sockets[socket_index]
            .socket
            .send_to(&indication.serialize(), remote_addr)
            .await?;
        Ok(())
    }

    /// Send application data on the selected pair.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock().await;
        match inner.connection_state {
            IceConnectionState::Connected | IceConnectionState::Completed => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot send data in state {state:?}"
                )))
            }
        }
        let Some((local_addr, remote_addr)) = inner.selected else {
            return Err(Error::IceError("no selected pair".to_string()));
        };
        let pair = inner
            .pairs
            .iter()
            .find(|p| p.local.address == local_addr && p.remote.address == remote_addr)
            .ok_or_else(|| Error::IceError("selected pair vanished".to_string()))?;

        if pair.local.candidate_type == CandidateType::Relay {
            if let Some(turn) = &inner.turn {
                return turn.send_to(data, remote_addr).await;
            }
        }
        inner.sockets[pair.socket_index]
            .socket
            .send_to(data, remote_addr)
            .await?;
        Ok(())
    }

    /// Process a datagram received by the I/O layer on `local_addr`.
    ///
    /// STUN traffic drives the state machine; anything else is surfaced as
    /// [`IceAgentEvent::DataReceived`]. Returns `true` when the packet was
    /// STUN (or TURN) signalling.
    pub async fn process_packet(
        &self,
        data: &[u8],
        source: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<bool> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(turn) = &mut inner.turn {
                if turn.process_packet(data, source).await? {
                    return Ok(true);
                }
            }
        }

        if !StunMessage::is_stun(data) {
            self.emit(IceAgentEvent::DataReceived {
                data: Bytes::copy_from_slice(data),
                source,
            })
            .await;
            return Ok(false);
        }

        let msg = StunMessage::parse(data)?;
        match (msg.class, msg.method) {
            (StunClass::Request, StunMethod::Binding) => {
                self.handle_binding_request(data, msg, source, local_addr).await?;
            }
            (StunClass::SuccessResponse, StunMethod::Binding) => {
                self.handle_binding_response(msg, source, local_addr).await?;
            }
            (StunClass::ErrorResponse, StunMethod::Binding) => {
                self.handle_binding_error(msg).await;
            }
            (StunClass::Indication, StunMethod::Binding) => {
                trace!(%source, "keepalive received");
            }
            other => {
                debug!(?other, "unhandled STUN message");
            }
        }
        Ok(true)
    }

    async fn handle_binding_request(
        &self,
        raw: &[u8],
        msg: StunMessage,
        source: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        // Checks from the peer are keyed with our password
        if StunMessage::verify_message_integrity(raw, self.local_credentials.password.as_bytes())
            .is_err()
        {
            warn!(%source, "binding request failed integrity check");
            return Ok(());
        }

        // Role conflict resolution (RFC 8445 Section 7.3.1.1)
        let role = inner.role;
        let peer_controlling = msg.attribute(|a| match a {
            StunAttribute::IceControlling(t) => Some(*t),
            _ => None,
        });
        let peer_controlled = msg.attribute(|a| match a {
            StunAttribute::IceControlled(t) => Some(*t),
            _ => None,
        });

        if role == IceRole::Controlling {
            if let Some(peer_tiebreaker) = peer_controlling {
                // Both believe they are controlling
                if self.tiebreaker >= peer_tiebreaker {
                    let response = self.role_conflict_response(msg.transaction_id);
                    self.send_from(&inner, local_addr, &response, source).await?;
                    return Ok(());
                }
                info!("role conflict: switching to controlled");
                inner.role = IceRole::Controlled;
            }
        } else if let Some(peer_tiebreaker) = peer_controlled {
            // Both believe they are controlled
            if self.tiebreaker >= peer_tiebreaker {
                info!("role conflict: switching to controlling");
                inner.role = IceRole::Controlling;
            } else {
                let response = self.role_conflict_response(msg.transaction_id);
                self.send_from(&inner, local_addr, &response, source).await?;
                return Ok(());
            }
        }

        // Unknown source: a peer-reflexive candidate
        let known = inner.remote_candidates.iter().any(|c| c.address == source);
        if !known {
            let component = inner
                .sockets
                .iter()
                .find(|s| s.address == local_addr)
                .map(|s| s.component)
                .unwrap_or(1);
            let priority = msg
                .attribute(|a| match a {
                    StunAttribute::Priority(p) => Some(*p),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    IceCandidate::compute_priority(CandidateType::PeerReflexive, 65535, component)
                });
            let candidate = IceCandidate {
                foundation: format!("prflx-{source}"),
                component,
                protocol: "udp".to_string(),
                priority,
                address: source,
                candidate_type: CandidateType::PeerReflexive,
                related_address: None,
            };
            debug!(%source, "learned peer-reflexive candidate");
            inner.remote_candidates.push(candidate.clone());
            self.form_pairs_for_remote(&mut inner, &candidate);
        }

        // Success response with the reflexive view of the peer
        let mut response = StunMessage::binding_response(msg.transaction_id);
        response.add_attribute(StunAttribute::XorMappedAddress(source));
        response.add_message_integrity(self.local_credentials.password.as_bytes());
        response.add_fingerprint();
        self.send_from(&inner, local_addr, &response, source).await?;

        // Nomination: the controlling peer marked this pair for use
        if msg.has_use_candidate() && inner.role == IceRole::Controlled {
            if let Some(index) = inner
                .pairs
                .iter()
                .position(|p| p.local.address == local_addr && p.remote.address == source)
            {
                if inner.pairs[index].state == PairState::Succeeded {
                    self.select_pair(&mut inner, index).await;
                } else {
                    // Remember the nomination; select as soon as our own
                    // check of this pair succeeds
                    inner.pairs[index].nominated = true;
                }
            }
        }

        // A valid check from the peer makes this pair checkable now
        if let Some(pair) = inner
            .pairs
            .iter_mut()
            .find(|p| p.local.address == local_addr && p.remote.address == source)
        {
            if pair.state == PairState::Frozen {
                pair.state = PairState::Waiting;
            }
        }

        Ok(())
    }

    /// 487 error response telling the peer to flip its role.
    fn role_conflict_response(&self, transaction_id: [u8; 12]) -> StunMessage {
        let mut response = StunMessage {
            class: StunClass::ErrorResponse,
            method: StunMethod::Binding,
            transaction_id,
            attributes: Vec::new(),
        };
        response.add_attribute(StunAttribute::ErrorCode {
            code: 487,
            reason: "Role Conflict".to_string(),
        });
        response.add_message_integrity(self.local_credentials.password.as_bytes());
        response.add_fingerprint();
        response
    }

    async fn handle_binding_response(
        &self,
        msg: StunMessage,
        source: SocketAddr,
        _local_addr: SocketAddr,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(&msg.transaction_id) else {
            trace!(%source, "binding response with unknown transaction");
            return Ok(());
        };

        match pending {
            PendingTransaction::Gather { socket_index } => {
                inner.outstanding_gathers = inner.outstanding_gathers.saturating_sub(1);
                if let Some(mapped) = msg.xor_mapped_address() {
                    let base = inner.sockets[socket_index].address;
                    if !inner.local_candidates.iter().any(|c| c.address == mapped) {
                        let candidate = IceCandidate::server_reflexive(
                            format!("srflx-{socket_index}"),
                            inner.sockets[socket_index].component,
                            mapped,
                            base,
                        );
                        info!(%mapped, "discovered server-reflexive candidate");
                        inner.local_candidates.push(candidate.clone());
                        self.emit(IceAgentEvent::NewCandidate(candidate)).await;
                    }
                }
                self.finish_gathering_if_done(&mut inner).await;
            }
            PendingTransaction::Check { pair_key, nominating } => {
                let Some(index) = inner
                    .pairs
                    .iter()
                    .position(|p| p.local.address == pair_key.0 && p.remote.address == pair_key.1)
                else {
                    return Ok(());
                };

                inner.pairs[index].state = PairState::Succeeded;
                let group = inner.pairs[index].foundation_key();
                Self::unfreeze_group(&mut inner, &group);
                debug!(local = %pair_key.0, remote = %pair_key.1, "connectivity check succeeded");

                let role = inner.role;
                let pending_nomination = inner.pairs[index].nominated;

                if nominating || (role == IceRole::Controlled && pending_nomination) {
                    self.select_pair(&mut inner, index).await;
                } else if role == IceRole::Controlling && inner.selected.is_none() {
                    // Nominate: repeat the check with USE-CANDIDATE
                    self.send_nomination(&mut inner, index).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_binding_error(&self, msg: StunMessage) {
        let mut inner = self.inner.lock().await;
        let Some(PendingTransaction::Check { pair_key, .. }) =
            inner.pending.remove(&msg.transaction_id)
        else {
            return;
        };

        if msg.error_code().map(|(code, _)| code) == Some(487) {
            // Role conflict: flip and retry the pair
            inner.role = match inner.role {
                IceRole::Controlling => IceRole::Controlled,
                IceRole::Controlled => IceRole::Controlling,
            };
            info!(role = ?inner.role, "role conflict reported by peer, switching");
        }

        let mut group_to_unfreeze = None;
        if let Some(pair) = inner
            .pairs
            .iter_mut()
            .find(|p| p.local.address == pair_key.0 && p.remote.address == pair_key.1)
        {
            match msg.error_code().map(|(code, _)| code) {
                Some(487) => pair.state = PairState::Waiting,
                _ => {
                    pair.state = PairState::Failed;
                    group_to_unfreeze = Some(pair.foundation_key());
                }
            }
        }
        if let Some(group) = group_to_unfreeze {
            Self::unfreeze_group(&mut inner, &group);
        }
    }

    async fn send_nomination(&self, inner: &mut Inner, index: usize) -> Result<()> {
        let Some(remote_creds) = inner.remote_credentials.clone() else {
            return Ok(());
        };

        let (request, pair_key, socket_index, remote_addr) = {
            let pair = &inner.pairs[index];
            let mut request = StunMessage::binding_request();
            request.add_attribute(StunAttribute::Username(format!(
                "{}:{}",
                remote_creds.ufrag, self.local_credentials.ufrag
            )));
            request.add_attribute(StunAttribute::Priority(pair.local.priority));
            request.add_attribute(StunAttribute::IceControlling(self.tiebreaker));
            request.add_attribute(StunAttribute::UseCandidate);
            request.add_message_integrity(remote_creds.password.as_bytes());
            request.add_fingerprint();
            (
                request,
                (pair.local.address, pair.remote.address),
                pair.socket_index,
                pair.remote.address,
            )
        };

        debug!(remote = %remote_addr, "nominating pair");
        inner.pending.insert(request.transaction_id, PendingTransaction::Check {
            pair_key,
            nominating: true,
        });
        inner.sockets[socket_index]
            .socket
            .send_to(&request.serialize(), remote_addr)
            .await?;
        Ok(())
    }

    async fn select_pair(&self, inner: &mut Inner, index: usize) {
        let (local, remote) = {
            let pair = &mut inner.pairs[index];
            pair.nominated = true;
            (pair.local.clone(), pair.remote.clone())
        };
        if inner.selected == Some((local.address, remote.address)) {
            return;
        }
        inner.selected = Some((local.address, remote.address));
        info!(local = %local.address, remote = %remote.address, "pair selected");
        self.emit(IceAgentEvent::SelectedPair {
            local: local.clone(),
            remote: remote.clone(),
        })
        .await;
        self.set_connection_state(inner, IceConnectionState::Connected)
            .await;

        // Completed once every component with pairs has a nominated one
        let mut components: Vec<u32> = inner.pairs.iter().map(|p| p.local.component).collect();
        components.sort_unstable();
        components.dedup();
        let all_selected = components.iter().all(|component| {
            inner
                .pairs
                .iter()
                .any(|p| p.local.component == *component && p.nominated)
        });
        if all_selected {
            self.set_connection_state(inner, IceConnectionState::Completed)
                .await;
        }
    }

    async fn send_from(
        &self,
        inner: &Inner,
        local_addr: SocketAddr,
        msg: &StunMessage,
        destination: SocketAddr,
    ) -> Result<()> {
        let socket = inner
            .sockets
            .iter()
            .find(|s| s.address == local_addr)
            .or_else(|| inner.sockets.first())
            .ok_or_else(|| Error::IceError("no socket to send from".to_string()))?;
        socket.socket.send_to(&msg.serialize(), destination).await?;
        Ok(())
    }

    /// Shut down the agent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.pairs.clear();
        inner.pending.clear();
        inner.selected = None;
        self.set_connection_state(&mut inner, IceConnectionState::Closed)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn agent_with_socket(role: IceRole) -> (Arc<IceAgent>, mpsc::Receiver<IceAgentEvent>) {
        let (agent, events) = IceAgent::new(IceConfig::default(), role);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        agent.add_local_socket(socket, 1).await.unwrap();
        (Arc::new(agent), events)
    }

    #[tokio::test]
    async fn test_host_gathering_emits_candidate() {
        let (agent, mut events) = agent_with_socket(IceRole::Controlling).await;
        agent.gather_candidates().await.unwrap();

        let mut saw_candidate = false;
        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                IceAgentEvent::NewCandidate(c) => {
                    assert_eq!(c.candidate_type, CandidateType::Host);
                    saw_candidate = true;
                }
                IceAgentEvent::GatheringStateChange(IceGatheringState::Complete) => {
                    saw_complete = true;
                }
                _ => {}
            }
        }
        assert!(saw_candidate);
        assert!(saw_complete);
        assert_eq!(agent.local_candidates().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pair_formation_sorts_by_priority() {
        let (agent, _events) = agent_with_socket(IceRole::Controlling).await;
        agent.gather_candidates().await.unwrap();
        agent
            .set_remote_credentials(IceCredentials::generate())
            .await;

        let relay_remote = IceCandidate::relay(
            "r1",
            1,
            "198.51.100.1:6000".parse().unwrap(),
            "198.51.100.1:3478".parse().unwrap(),
        );
        let host_remote = IceCandidate::host("h1", 1, "192.0.2.10:5000".parse().unwrap());
        agent.add_remote_candidate(relay_remote).await;
        agent.add_remote_candidate(host_remote.clone()).await;

        let inner = agent.inner.lock().await;
        assert_eq!(inner.pairs.len(), 2);
        // Host/host pair outranks host/relay
        assert_eq!(inner.pairs[0].remote.address, host_remote.address);
        assert!(inner.pairs[0].priority > inner.pairs[1].priority);
    }

    #[tokio::test]
    async fn test_checks_move_to_checking_state() {
        let (agent, _events) = agent_with_socket(IceRole::Controlling).await;
        agent.gather_candidates().await.unwrap();
        agent
            .set_remote_credentials(IceCredentials::generate())
            .await;
        agent
            .add_remote_candidate(IceCandidate::host(
                "h1",
                1,
                "192.0.2.10:5000".parse().unwrap(),
            ))
            .await;

        assert_eq!(
            agent.connection_state().await,
            IceConnectionState::Checking
        );
    }

    #[tokio::test]
    async fn test_controlled_agent_resolves_role_conflict_by_tiebreaker() {
        let (agent, _events) = IceAgent::new(IceConfig::default(), IceRole::Controlled);
        let agent = Arc::new(agent);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = socket.local_addr().unwrap();
        agent.add_local_socket(Arc::clone(&socket), 1).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let conflicted_check = |tiebreaker: u64, password: &str| {
            let mut request = StunMessage::binding_request();
            request.add_attribute(StunAttribute::Username("x:y".to_string()));
            request.add_attribute(StunAttribute::IceControlled(tiebreaker));
            request.add_message_integrity(password.as_bytes());
            request.add_fingerprint();
            request.serialize()
        };
        let password = agent.local_credentials().password.clone();

        // Peer also claims controlled, with the maximum tiebreaker: this
        // agent loses the comparison, keeps its role and answers 487
        let wire = conflicted_check(u64::MAX, &password);
        agent
            .process_packet(&wire, peer_addr, local_addr)
            .await
            .unwrap();
        assert_eq!(agent.role().await, IceRole::Controlled);

        let mut buf = [0u8; 1500];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let response = StunMessage::parse(&buf[..n]).unwrap();
        assert_eq!(response.class, StunClass::ErrorResponse);
        assert_eq!(response.error_code().map(|(code, _)| code), Some(487));

        // A peer with the minimum tiebreaker loses: this agent takes over
        let wire = conflicted_check(0, &password);
        agent
            .process_packet(&wire, peer_addr, local_addr)
            .await
            .unwrap();
        assert_eq!(agent.role().await, IceRole::Controlling);
    }

    #[tokio::test]
    async fn test_two_agents_connect_over_loopback() {
        let (left, mut left_events) = IceAgent::new(IceConfig::default(), IceRole::Controlling);
        let (right, mut right_events) = IceAgent::new(IceConfig::default(), IceRole::Controlled);
        let left = Arc::new(left);
        let right = Arc::new(right);

        let left_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let right_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let left_addr = left_socket.local_addr().unwrap();
        let right_addr = right_socket.local_addr().unwrap();

        left.add_local_socket(Arc::clone(&left_socket), 1).await.unwrap();
        right
            .add_local_socket(Arc::clone(&right_socket), 1)
            .await
            .unwrap();

        // Exchange credentials and candidates over "signalling"
        left.set_remote_credentials(right.local_credentials().clone())
            .await;
        right
            .set_remote_credentials(left.local_credentials().clone())
            .await;
        left.gather_candidates().await.unwrap();
        right.gather_candidates().await.unwrap();
        left.add_remote_candidate(IceCandidate::host("h-right", 1, right_addr))
            .await;
        right
            .add_remote_candidate(IceCandidate::host("h-left", 1, left_addr))
            .await;

        // Packet pumps standing in for the I/O layer
        let pump = |agent: Arc<IceAgent>, socket: Arc<UdpSocket>, local: SocketAddr| {
            tokio::spawn(async move {
                let mut buf = [0u8; 1500];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, source)) => {
                            let _ = agent.process_packet(&buf[..n], source, local).await;
                        }
                        Err(_) => break,
                    }
                }
            })
        };
        let left_pump = pump(Arc::clone(&left), Arc::clone(&left_socket), left_addr);
        let right_pump = pump(Arc::clone(&right), Arc::clone(&right_socket), right_addr);

        // Tick both agents until connected or timeout
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            left.tick().await.unwrap();
            right.tick().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;

            let l = left.connection_state().await;
            let r = right.connection_state().await;
            if (l == IceConnectionState::Connected || l == IceConnectionState::Completed)
                && (r == IceConnectionState::Connected || r == IceConnectionState::Completed)
            {
                break;
            }
            if Instant::now() > deadline {
                panic!("agents failed to connect: left={l:?} right={r:?}");
            }
        }

        // Both sides selected the loopback pair
        let (_, left_remote) = left.selected_pair().await.unwrap();
        assert_eq!(left_remote.address, right_addr);
        let (_, right_remote) = right.selected_pair().await.unwrap();
        assert_eq!(right_remote.address, left_addr);

        // Data flows over the selected pair and surfaces as an event
        left.send_data(b"hello from left").await.unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        let mut got_data = false;
        while Instant::now() < deadline {
            match tokio::time::timeout(
                std::time::Duration::from_millis(100),
                right_events.recv(),
            )
            .await
            {
                Ok(Some(IceAgentEvent::DataReceived { data, .. })) => {
                    assert_eq!(&data[..], b"hello from left");
                    got_data = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => continue,
            }
        }
        assert!(got_data, "data never arrived");

        // Drain pending events so the channel does not block shutdown
        while left_events.try_recv().is_ok() {}

        left.close().await;
        right.close().await;
        left_pump.abort();
        right_pump.abort();
    }
}
