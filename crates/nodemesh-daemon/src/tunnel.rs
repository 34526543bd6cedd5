//! Tunnel sessions
//!
//! A session carries one operation's bytes along a resolved route. The origin
//! sends `TunnelOpen` toward the target; every intermediate hop records a
//! relay entry and forwards frames without looking at their payload. Each
//! endpoint grants the other a credit window of data frames, returned with
//! `TunnelCredit` as the reader consumes them, so a slow consumer stalls only
//! its own session. Relays forward by awaiting space on the next link's
//! queue, which pauses the link they read from.
//!
//! An empty data frame ends the sender's direction only: the peer reads to
//! end of stream while its own writes still flow back.
//!
//! Closing is propagate-and-forget: a `TunnelClose` travels the remaining hops
//! and nobody waits for it. When a neighbor or a node on the route goes away,
//! endpoints fail with `SessionFailure` and relays pass the close along.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use nodemesh_core::{
    CloseReason, MeshError, NetMessage, NodeId, OperationKind, Route, SessionId, SessionState,
    TunnelCloseMessage, TunnelConfig, TunnelCreditMessage, TunnelDataMessage,
    TunnelOpenAckMessage, TunnelOpenMessage,
};

use crate::operations::OperationHandler;

/// Outbound queues of the local node's neighbors (children and parent)
pub trait NeighborLinks: Send + Sync {
    fn outbound(&self, node_id: &str) -> Option<mpsc::Sender<NetMessage>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Origin,
    Target,
}

/// Where an endpoint's outgoing frames go
enum Sink {
    /// The neighbor on the route
    Hop(NodeId),
    /// The other endpoint lives in this process
    Local(RwLock<Weak<SessionShared>>),
}

/// Endpoint state shared between the manager and the session handle
struct SessionShared {
    id: SessionId,
    role: Role,
    route: Route,
    operation: OperationKind,
    sink: Sink,
    state: RwLock<SessionState>,
    failure: RwLock<Option<MeshError>>,
    /// Frames we may still send before the peer returns credit
    send_credits: Semaphore,
    /// Window we granted the peer
    recv_window: u32,
    /// Frames read since the last credit grant
    unacked: AtomicU32,
    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    last_activity: Mutex<Instant>,
    moved_data: AtomicBool,
    /// Set once our direction has been shut down
    write_shut: AtomicBool,
}

impl SessionShared {
    fn new(
        id: SessionId,
        role: Role,
        route: Route,
        operation: OperationKind,
        sink: Sink,
        send_window: u32,
        recv_window: u32,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(recv_window.max(1) as usize);
        let shared = Arc::new(Self {
            id,
            role,
            route,
            operation,
            sink,
            state: RwLock::new(SessionState::Opening),
            failure: RwLock::new(None),
            send_credits: Semaphore::new(send_window as usize),
            recv_window,
            unacked: AtomicU32::new(0),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            last_activity: Mutex::new(Instant::now()),
            moved_data: AtomicBool::new(false),
            write_shut: AtomicBool::new(false),
        });
        (shared, inbound_rx)
    }

    fn hop(&self) -> Option<&str> {
        match &self.sink {
            Sink::Hop(hop) => Some(hop),
            Sink::Local(_) => None,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.moved_data.store(true, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn state(&self, idle_after: Duration) -> SessionState {
        let state = *self.state.read();
        if state == SessionState::Established && self.moved_data.load(Ordering::Relaxed) {
            if self.idle_for() < idle_after {
                SessionState::Streaming
            } else {
                SessionState::Idle
            }
        } else {
            state
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.read().is_terminal()
    }

    /// Opening -> Established; false when the session already ended
    fn establish(&self) -> bool {
        let mut state = self.state.write();
        if *state != SessionState::Opening {
            return false;
        }
        *state = SessionState::Established;
        true
    }

    /// Enter a terminal state; false when already terminal
    fn finish(&self, terminal: SessionState, failure: Option<MeshError>) -> bool {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return false;
            }
            if let Some(e) = failure {
                *self.failure.write() = Some(e);
            }
            *state = terminal;
        }
        self.send_credits.close();
        self.inbound_tx.lock().take();
        true
    }

    fn failure(&self) -> Option<MeshError> {
        self.failure.read().clone()
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        let state = *self.state.read();
        if state.is_open() {
            return Ok(());
        }
        Err(self.failure().unwrap_or(MeshError::SessionClosed))
    }

    /// The peer sent its last byte; the reader sees end of stream once drained
    fn end_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    /// Queue a frame received from the network for the reader
    fn deliver(&self, data: Vec<u8>) -> Result<(), MeshError> {
        let guard = self.inbound_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Ok(());
        };
        match tx.try_send(Bytes::from(data)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(MeshError::SessionFailure {
                session_id: self.id,
                reason: "peer exceeded its credit window".into(),
            }),
            // Reader went away; nothing left to deliver to
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Hand bytes to the in-process peer, waiting for room
    async fn deliver_local(&self, data: Bytes) -> Result<(), MeshError> {
        let tx = self.inbound_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(data).await.map_err(|_| MeshError::SessionClosed),
            None => Err(MeshError::SessionClosed),
        }
    }

    fn local_peer(&self) -> Option<Arc<SessionShared>> {
        match &self.sink {
            Sink::Local(peer) => peer.read().upgrade(),
            Sink::Hop(_) => None,
        }
    }
}

/// Relay entry kept by an intermediate hop
struct Relay {
    prev: NodeId,
    next: NodeId,
    route: Route,
    last_activity: Instant,
}

impl Relay {
    fn other_side(&self, from: &str) -> Option<&NodeId> {
        if from == self.prev {
            Some(&self.next)
        } else if from == self.next {
            Some(&self.prev)
        } else {
            None
        }
    }
}

/// Caller-facing end of a tunnel session
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    tunnel: Arc<TunnelManager>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl SessionHandle {
    fn new(
        shared: Arc<SessionShared>,
        inbound: mpsc::Receiver<Bytes>,
        tunnel: Arc<TunnelManager>,
    ) -> Self {
        Self {
            shared,
            tunnel,
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn route(&self) -> &[NodeId] {
        &self.shared.route
    }

    pub fn operation(&self) -> &OperationKind {
        &self.shared.operation
    }

    pub fn is_origin(&self) -> bool {
        self.shared.role == Role::Origin
    }

    pub fn state(&self) -> SessionState {
        self.shared.state(self.tunnel.config.idle_after())
    }

    /// Why the session failed, if it did
    pub fn failure(&self) -> Option<MeshError> {
        self.shared.failure()
    }

    /// Largest payload a single data frame carries
    pub fn max_frame_size(&self) -> usize {
        self.tunnel.config.max_frame_size
    }

    /// Send bytes to the other endpoint
    ///
    /// Large writes are split into frames; each frame waits for send credit.
    pub async fn write(&self, data: &[u8]) -> Result<usize, MeshError> {
        self.shared.ensure_open()?;
        if self.shared.write_shut.load(Ordering::Acquire) {
            return Err(MeshError::SessionClosed);
        }

        for chunk in data.chunks(self.tunnel.config.max_frame_size.max(1)) {
            match &self.shared.sink {
                Sink::Hop(hop) => {
                    let permit = self
                        .shared
                        .send_credits
                        .acquire()
                        .await
                        .map_err(|_| self.closed_error())?;
                    permit.forget();

                    let msg = NetMessage::TunnelData(TunnelDataMessage {
                        session_id: self.shared.id,
                        data: chunk.to_vec(),
                    });
                    if let Err(e) = self.tunnel.send_hop(hop, msg).await {
                        self.tunnel.fail_local(&self.shared, e.to_string());
                        return Err(self.closed_error());
                    }
                }
                Sink::Local(_) => {
                    self.shared.ensure_open()?;
                    let peer = self.shared.local_peer().ok_or(MeshError::SessionClosed)?;
                    peer.deliver_local(Bytes::copy_from_slice(chunk)).await?;
                    peer.touch();
                }
            }
            self.shared.touch();
        }

        Ok(data.len())
    }

    /// Next chunk from the other endpoint; `None` at end of stream
    pub async fn read(&self) -> Result<Option<Bytes>, MeshError> {
        let next = self.inbound.lock().await.recv().await;
        match next {
            Some(data) => {
                self.shared.touch();
                self.return_credit();
                Ok(Some(data))
            }
            None => match self.shared.failure() {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    /// Finish our direction while still reading the peer's
    ///
    /// The other endpoint's `read` returns `None` after the bytes already
    /// sent; later writes here fail. A session the peer already closed
    /// normally has nothing left to signal.
    pub async fn shutdown_write(&self) -> Result<(), MeshError> {
        if self.shared.is_terminal() {
            return match self.shared.failure() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        if self.shared.write_shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match &self.shared.sink {
            Sink::Hop(hop) => {
                let msg = NetMessage::TunnelData(TunnelDataMessage {
                    session_id: self.shared.id,
                    data: Vec::new(),
                });
                if let Err(e) = self.tunnel.send_hop(hop, msg).await {
                    self.tunnel.fail_local(&self.shared, e.to_string());
                    return Err(self.closed_error());
                }
            }
            Sink::Local(_) => {
                if let Some(peer) = self.shared.local_peer() {
                    peer.end_inbound();
                }
            }
        }
        debug!("Session {} finished sending", self.shared.id);
        Ok(())
    }

    /// Close normally
    pub fn close(&self) {
        self.tunnel
            .close_endpoint(&self.shared, CloseReason::Normal, None);
    }

    /// Close with a reason the other endpoint will see
    pub fn close_with(&self, reason: CloseReason, message: Option<String>) {
        self.tunnel.close_endpoint(&self.shared, reason, message);
    }

    fn closed_error(&self) -> MeshError {
        self.shared.failure().unwrap_or(MeshError::SessionClosed)
    }

    fn return_credit(&self) {
        let Sink::Hop(hop) = &self.shared.sink else {
            return;
        };
        let threshold = (self.shared.recv_window / 2).max(1);
        let pending = self.shared.unacked.fetch_add(1, Ordering::AcqRel) + 1;
        if pending < threshold {
            return;
        }
        let credits = self.shared.unacked.swap(0, Ordering::AcqRel);
        if credits > 0 && !self.shared.is_terminal() {
            self.tunnel.send_detached(
                hop,
                NetMessage::TunnelCredit(TunnelCreditMessage {
                    session_id: self.shared.id,
                    credits,
                }),
            );
        }
    }
}

/// A handle dropped without `close` abandons its session; the peer must not
/// mistake that for a complete stream.
impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.shared.is_terminal() {
            self.tunnel.close_endpoint(
                &self.shared,
                CloseReason::OperationFailed,
                Some("session abandoned".into()),
            );
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("operation", &self.shared.operation.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Session endpoints and relay entries of the local node
pub struct TunnelManager {
    local_id: NodeId,
    config: TunnelConfig,
    links: Arc<dyn NeighborLinks>,
    handler: Arc<dyn OperationHandler>,
    sessions: DashMap<SessionId, Arc<SessionShared>>,
    pending: DashMap<SessionId, oneshot::Sender<Result<u32, MeshError>>>,
    relays: DashMap<SessionId, Relay>,
}

impl TunnelManager {
    pub fn new(
        local_id: impl Into<NodeId>,
        config: TunnelConfig,
        links: Arc<dyn NeighborLinks>,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            config,
            links,
            handler,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            relays: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Endpoint sessions open on this node
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions this node relays for others
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Open a session along `route`, which must start at the local node
    pub async fn open(
        self: &Arc<Self>,
        route: Route,
        operation: OperationKind,
    ) -> Result<SessionHandle, MeshError> {
        match route.first() {
            Some(first) if *first == self.local_id => {}
            _ => {
                return Err(MeshError::Validation(format!(
                    "route must start at {}",
                    self.local_id
                )))
            }
        }
        let session_id = SessionId::try_generate().map_err(|e| MeshError::Io(e.to_string()))?;

        if route.len() == 1 {
            return Ok(self.open_loopback(session_id, route, operation));
        }

        let hop = route[1].clone();
        let (shared, inbound) = SessionShared::new(
            session_id,
            Role::Origin,
            route.clone(),
            operation.clone(),
            Sink::Hop(hop.clone()),
            0,
            self.config.window,
        );
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.insert(session_id, ack_tx);
        self.sessions.insert(session_id, Arc::clone(&shared));

        info!(
            "Opening session {} ({}) via {}",
            session_id,
            operation.name(),
            route.join(" -> ")
        );
        let open = NetMessage::TunnelOpen(TunnelOpenMessage {
            session_id,
            route,
            operation,
            window: self.config.window,
        });
        if let Err(e) = self.send_hop(&hop, open).await {
            self.pending.remove(&session_id);
            self.sessions.remove(&session_id);
            shared.finish(SessionState::Failed, Some(e.clone()));
            return Err(e);
        }

        let result = match timeout(self.config.open_timeout(), ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::SessionFailure {
                session_id,
                reason: "open abandoned".into(),
            }),
            Err(_) => Err(MeshError::Timeout(format!("opening session {}", session_id))),
        };

        match result {
            Ok(window) => {
                shared.send_credits.add_permits(window as usize);
                if !shared.establish() {
                    return Err(shared.failure().unwrap_or(MeshError::SessionClosed));
                }
                debug!("Session {} established (window {})", session_id, window);
                Ok(SessionHandle::new(shared, inbound, Arc::clone(self)))
            }
            Err(e) => {
                self.pending.remove(&session_id);
                if self.sessions.remove(&session_id).is_some() {
                    // Let relays on the way forget the half-open session
                    self.send_detached(&hop, close_frame(session_id, CloseReason::Normal, None));
                }
                shared.finish(SessionState::Failed, Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Both endpoints on this node: wire two sessions back to back
    fn open_loopback(
        self: &Arc<Self>,
        session_id: SessionId,
        route: Route,
        operation: OperationKind,
    ) -> SessionHandle {
        let window = self.config.window;
        let (origin, origin_rx) = SessionShared::new(
            session_id,
            Role::Origin,
            route.clone(),
            operation.clone(),
            Sink::Local(RwLock::new(Weak::new())),
            0,
            window,
        );
        let (target, target_rx) = SessionShared::new(
            session_id,
            Role::Target,
            route,
            operation,
            Sink::Local(RwLock::new(Weak::new())),
            0,
            window,
        );
        if let Sink::Local(peer) = &origin.sink {
            *peer.write() = Arc::downgrade(&target);
        }
        if let Sink::Local(peer) = &target.sink {
            *peer.write() = Arc::downgrade(&origin);
        }
        origin.establish();
        target.establish();

        debug!("Opened local session {}", session_id);
        self.spawn_operation(SessionHandle::new(target, target_rx, Arc::clone(self)));
        SessionHandle::new(origin, origin_rx, Arc::clone(self))
    }

    /// Run the local operation for an accepted session
    fn spawn_operation(&self, handle: SessionHandle) {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let session = Arc::new(handle);
            let operation = session.operation().clone();
            match handler.run(operation, Arc::clone(&session)).await {
                Ok(()) => session.close(),
                Err(e) => {
                    warn!("Operation for session {} failed: {}", session.id(), e);
                    session.close_with(CloseReason::OperationFailed, Some(e.to_string()));
                }
            }
        });
    }

    /// Handle a tunnel frame received from neighbor `from`
    pub async fn handle_frame(self: &Arc<Self>, from: &str, msg: NetMessage) {
        match msg {
            NetMessage::TunnelOpen(m) => self.on_open(from, m).await,
            NetMessage::TunnelOpenAck(m) => {
                let session_id = m.session_id;
                if self.relay(from, session_id, NetMessage::TunnelOpenAck(m.clone())).await {
                    return;
                }
                self.on_open_ack(from, m);
            }
            NetMessage::TunnelData(m) => {
                let session_id = m.session_id;
                let session = self.sessions.get(&session_id).map(|s| Arc::clone(&s));
                match session {
                    Some(session) => self.on_data(from, &session, m.data),
                    None => {
                        if !self.relay(from, session_id, NetMessage::TunnelData(m)).await {
                            debug!("Dropping data for unknown session {}", session_id);
                        }
                    }
                }
            }
            NetMessage::TunnelCredit(m) => {
                let session_id = m.session_id;
                let session = self.sessions.get(&session_id).map(|s| Arc::clone(&s));
                match session {
                    Some(session) if session.hop() == Some(from) => {
                        session.send_credits.add_permits(m.credits as usize);
                    }
                    Some(_) => warn!("Credit for session {} from wrong hop {}", session_id, from),
                    None => {
                        self.relay(from, session_id, NetMessage::TunnelCredit(m)).await;
                    }
                }
            }
            NetMessage::TunnelClose(m) => self.on_close(from, m),
            other => debug!("Ignoring {} in tunnel layer", other.kind()),
        }
    }

    async fn on_open(self: &Arc<Self>, from: &str, m: TunnelOpenMessage) {
        let session_id = m.session_id;
        let position = m.route.iter().position(|id| *id == self.local_id);
        let valid = position.is_some_and(|pos| pos > 0 && m.route[pos - 1] == from);
        let Some(pos) = position.filter(|_| valid) else {
            warn!("Rejecting session {} from {}: not on its route", session_id, from);
            self.send_detached(
                from,
                close_frame(session_id, CloseReason::ProtocolViolation, Some("bad route".into())),
            );
            return;
        };

        if pos == m.route.len() - 1 {
            self.accept_session(from, m).await;
            return;
        }

        let next = m.route[pos + 1].clone();
        if self.links.outbound(&next).is_none() {
            warn!("Cannot relay session {}: no link to {}", session_id, next);
            self.send_detached(
                from,
                close_frame(
                    session_id,
                    CloseReason::HopUnreachable,
                    Some(format!("{} unreachable from {}", next, self.local_id)),
                ),
            );
            return;
        }

        self.relays.insert(
            session_id,
            Relay {
                prev: from.to_string(),
                next: next.clone(),
                route: m.route.clone(),
                last_activity: Instant::now(),
            },
        );
        debug!("Relaying session {} {} -> {}", session_id, from, next);

        if let Err(e) = self.send_hop(&next, NetMessage::TunnelOpen(m)).await {
            self.relays.remove(&session_id);
            self.send_detached(
                from,
                close_frame(session_id, CloseReason::HopUnreachable, Some(e.to_string())),
            );
        }
    }

    async fn accept_session(self: &Arc<Self>, from: &str, m: TunnelOpenMessage) {
        let session_id = m.session_id;
        if self.sessions.contains_key(&session_id) {
            warn!("Duplicate open for session {}", session_id);
            self.send_detached(
                from,
                close_frame(session_id, CloseReason::ProtocolViolation, Some("duplicate session".into())),
            );
            return;
        }

        let (shared, inbound) = SessionShared::new(
            session_id,
            Role::Target,
            m.route,
            m.operation,
            Sink::Hop(from.to_string()),
            m.window,
            self.config.window,
        );
        shared.establish();
        self.sessions.insert(session_id, Arc::clone(&shared));

        let ack = NetMessage::TunnelOpenAck(TunnelOpenAckMessage {
            session_id,
            window: self.config.window,
        });
        if let Err(e) = self.send_hop(from, ack).await {
            self.sessions.remove(&session_id);
            shared.finish(SessionState::Failed, Some(e));
            return;
        }

        info!(
            "Accepted session {} ({}) from {}",
            session_id,
            shared.operation.name(),
            shared.route.first().map(String::as_str).unwrap_or("?")
        );
        self.spawn_operation(SessionHandle::new(shared, inbound, Arc::clone(self)));
    }

    fn on_open_ack(&self, from: &str, m: TunnelOpenAckMessage) {
        let expected_hop = self
            .sessions
            .get(&m.session_id)
            .is_some_and(|s| s.hop() == Some(from));
        if !expected_hop {
            debug!("Unexpected open ack for session {} from {}", m.session_id, from);
            return;
        }
        if let Some((_, tx)) = self.pending.remove(&m.session_id) {
            let _ = tx.send(Ok(m.window));
        }
    }

    fn on_data(&self, from: &str, session: &Arc<SessionShared>, data: Vec<u8>) {
        if session.hop() != Some(from) {
            warn!("Data for session {} from wrong hop {}", session.id, from);
            return;
        }
        if data.is_empty() {
            debug!("Session {} peer finished sending", session.id);
            session.end_inbound();
            session.touch();
            return;
        }
        if let Err(e) = session.deliver(data) {
            warn!("Session {}: {}", session.id, e);
            self.send_detached(
                from,
                close_frame(session.id, CloseReason::ProtocolViolation, Some(e.to_string())),
            );
            self.sessions.remove(&session.id);
            session.finish(SessionState::Failed, Some(e));
            return;
        }
        session.touch();
    }

    fn on_close(&self, from: &str, m: TunnelCloseMessage) {
        let session_id = m.session_id;

        if let Some((_, relay)) = self.relays.remove(&session_id) {
            match relay.other_side(from) {
                Some(other) => {
                    debug!("Relay of session {} closed by {}", session_id, from);
                    self.send_detached(other, NetMessage::TunnelClose(m));
                }
                None => {
                    warn!("Close for session {} from unrelated node {}", session_id, from);
                    self.relays.insert(session_id, relay);
                }
            }
            return;
        }

        let Some(session) = self.sessions.get(&session_id).map(|s| Arc::clone(&s)) else {
            debug!("Close for unknown session {}", session_id);
            return;
        };
        if session.hop() != Some(from) {
            warn!("Close for session {} from wrong hop {}", session_id, from);
            return;
        }
        self.sessions.remove(&session_id);

        let failure = match m.reason {
            CloseReason::Normal => None,
            reason => Some(MeshError::SessionFailure {
                session_id,
                reason: match m.message {
                    Some(message) => format!("{}: {}", reason, message),
                    None => reason.to_string(),
                },
            }),
        };
        if let Some((_, tx)) = self.pending.remove(&session_id) {
            let _ = tx.send(Err(failure.clone().unwrap_or(MeshError::SessionClosed)));
        }
        let terminal = if failure.is_some() {
            SessionState::Failed
        } else {
            SessionState::Closed
        };
        if session.finish(terminal, failure) {
            info!("Session {} closed by peer ({})", session_id, m.reason);
        }
    }

    /// Forward a frame for a relayed session; false when not relayed here
    async fn relay(&self, from: &str, session_id: SessionId, msg: NetMessage) -> bool {
        let target = match self.relays.get_mut(&session_id) {
            Some(mut relay) => {
                relay.last_activity = Instant::now();
                relay.other_side(from).cloned()
            }
            None => return false,
        };
        let Some(target) = target else {
            warn!("Frame for session {} from unrelated node {}", session_id, from);
            return true;
        };

        if let Err(e) = self.send_hop(&target, msg).await {
            warn!("Relay of session {} to {} failed: {}", session_id, target, e);
            self.relays.remove(&session_id);
            self.send_detached(
                from,
                close_frame(session_id, CloseReason::HopUnreachable, Some(e.to_string())),
            );
        }
        true
    }

    /// Close one local endpoint and tell the other side
    fn close_endpoint(
        &self,
        shared: &Arc<SessionShared>,
        reason: CloseReason,
        message: Option<String>,
    ) {
        match &shared.sink {
            Sink::Hop(hop) => {
                self.sessions.remove(&shared.id);
                self.pending.remove(&shared.id);
                {
                    let mut state = shared.state.write();
                    if state.is_terminal() {
                        return;
                    }
                    *state = SessionState::Closing;
                }
                self.send_detached(hop, close_frame(shared.id, reason, message));
                shared.finish(SessionState::Closed, None);
                debug!("Session {} closed ({})", shared.id, reason);
            }
            Sink::Local(_) => {
                if !shared.finish(SessionState::Closed, None) {
                    return;
                }
                if let Some(peer) = shared.local_peer() {
                    let failure = (reason != CloseReason::Normal).then(|| MeshError::SessionFailure {
                        session_id: shared.id,
                        reason: match message {
                            Some(m) => format!("{}: {}", reason, m),
                            None => reason.to_string(),
                        },
                    });
                    let terminal = if failure.is_some() {
                        SessionState::Failed
                    } else {
                        SessionState::Closed
                    };
                    peer.finish(terminal, failure);
                }
            }
        }
    }

    /// Fail a local endpoint without sending anything
    fn fail_local(&self, shared: &Arc<SessionShared>, reason: String) {
        self.sessions.remove(&shared.id);
        let err = MeshError::SessionFailure {
            session_id: shared.id,
            reason,
        };
        if let Some((_, tx)) = self.pending.remove(&shared.id) {
            let _ = tx.send(Err(err.clone()));
        }
        if shared.finish(SessionState::Failed, Some(err)) {
            warn!("Session {} failed", shared.id);
        }
    }

    /// A neighbor link went down: every session through it is lost
    pub fn fail_neighbor(&self, node_id: &str) {
        let doomed: Vec<Arc<SessionShared>> = self
            .sessions
            .iter()
            .filter(|s| s.hop() == Some(node_id))
            .map(|s| Arc::clone(&s))
            .collect();
        for session in &doomed {
            self.fail_local(session, format!("hop {} unreachable", node_id));
        }

        let relayed: Vec<(SessionId, NodeId)> = self
            .relays
            .iter()
            .filter_map(|r| r.other_side(node_id).map(|other| (*r.key(), other.clone())))
            .collect();
        for (session_id, other) in &relayed {
            self.relays.remove(session_id);
            self.send_detached(
                other,
                close_frame(
                    *session_id,
                    CloseReason::HopUnreachable,
                    Some(format!("{} unreachable", node_id)),
                ),
            );
        }

        if !doomed.is_empty() || !relayed.is_empty() {
            info!(
                "Link to {} lost: failed {} sessions, dropped {} relays",
                node_id,
                doomed.len(),
                relayed.len()
            );
        }
    }

    /// A node left the mesh: every session whose route uses it is lost
    pub fn fail_node(&self, node_id: &str) {
        if node_id == self.local_id {
            return;
        }
        let reason = format!("node {} removed", node_id);

        let doomed: Vec<Arc<SessionShared>> = self
            .sessions
            .iter()
            .filter(|s| s.route.iter().any(|id| id == node_id))
            .map(|s| Arc::clone(&s))
            .collect();
        for session in &doomed {
            if let Some(hop) = session.hop().filter(|hop| *hop != node_id) {
                self.send_detached(
                    hop,
                    close_frame(session.id, CloseReason::HopUnreachable, Some(reason.clone())),
                );
            }
            self.fail_local(session, reason.clone());
        }

        let relayed: Vec<(SessionId, NodeId, NodeId)> = self
            .relays
            .iter()
            .filter(|r| r.route.iter().any(|id| id == node_id))
            .map(|r| (*r.key(), r.prev.clone(), r.next.clone()))
            .collect();
        for (session_id, prev, next) in &relayed {
            self.relays.remove(session_id);
            for side in [prev, next] {
                if side != node_id {
                    self.send_detached(
                        side,
                        close_frame(*session_id, CloseReason::HopUnreachable, Some(reason.clone())),
                    );
                }
            }
        }
    }

    /// Close sessions and relays with no traffic for `max_idle`
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<Arc<SessionShared>> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() >= max_idle)
            .map(|s| Arc::clone(&s))
            .collect();
        for session in &idle {
            self.close_endpoint(session, CloseReason::IdleTimeout, None);
            *session.failure.write() = Some(MeshError::SessionFailure {
                session_id: session.id,
                reason: CloseReason::IdleTimeout.to_string(),
            });
        }

        let stale: Vec<SessionId> = self
            .relays
            .iter()
            .filter(|r| r.last_activity.elapsed() >= max_idle)
            .map(|r| *r.key())
            .collect();
        for session_id in &stale {
            if let Some((_, relay)) = self.relays.remove(session_id) {
                for side in [&relay.prev, &relay.next] {
                    self.send_detached(side, close_frame(*session_id, CloseReason::IdleTimeout, None));
                }
            }
        }

        let reaped = idle.len() + stale.len();
        if reaped > 0 {
            info!("Reaped {} idle sessions and {} relays", idle.len(), stale.len());
        }
        reaped
    }

    /// Send to a neighbor, waiting for room on its queue
    async fn send_hop(&self, hop: &str, msg: NetMessage) -> Result<(), MeshError> {
        let sender = self
            .links
            .outbound(hop)
            .ok_or_else(|| MeshError::LinkUnavailable {
                node_id: hop.to_string(),
                reason: "no link".into(),
            })?;
        sender
            .send(msg)
            .await
            .map_err(|_| MeshError::LinkUnavailable {
                node_id: hop.to_string(),
                reason: "link closed".into(),
            })
    }

    /// Send without waiting; falls back to a background send when the queue is full
    fn send_detached(&self, hop: &str, msg: NetMessage) {
        let Some(sender) = self.links.outbound(hop) else {
            debug!("No link to {} for {}", hop, msg.kind());
            return;
        };
        match sender.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = sender.send(msg).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn close_frame(session_id: SessionId, reason: CloseReason, message: Option<String>) -> NetMessage {
    NetMessage::TunnelClose(TunnelCloseMessage {
        session_id,
        reason,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Target-side handler that echoes everything back
    struct Echo;

    #[async_trait]
    impl OperationHandler for Echo {
        async fn run(
            &self,
            _operation: OperationKind,
            session: Arc<SessionHandle>,
        ) -> Result<(), MeshError> {
            while let Some(data) = session.read().await? {
                session.write(&data).await?;
            }
            Ok(())
        }
    }

    /// Neighbor table backed by plain channels
    #[derive(Default)]
    struct Wires {
        links: DashMap<NodeId, mpsc::Sender<NetMessage>>,
    }

    impl Wires {
        fn connect(&self, node_id: &str, capacity: usize) -> mpsc::Receiver<NetMessage> {
            let (tx, rx) = mpsc::channel(capacity);
            self.links.insert(node_id.to_string(), tx);
            rx
        }
    }

    impl NeighborLinks for Wires {
        fn outbound(&self, node_id: &str) -> Option<mpsc::Sender<NetMessage>> {
            self.links.get(node_id).map(|s| s.clone())
        }
    }

    fn config(window: u32) -> TunnelConfig {
        TunnelConfig {
            window,
            max_frame_size: 4,
            open_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn manager(local: &str, wires: Arc<Wires>, window: u32) -> Arc<TunnelManager> {
        Arc::new(TunnelManager::new(local, config(window), wires, Arc::new(Echo)))
    }

    fn route(ids: &[&str]) -> Route {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_loopback_echo() {
        let tunnel = manager("R", Arc::new(Wires::default()), 8);
        let session = tunnel
            .open(route(&["R"]), OperationKind::Terminal { shell: None })
            .await
            .unwrap();

        assert_eq!(session.write(b"hello").await.unwrap(), 5);
        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            echoed.extend_from_slice(&session.read().await.unwrap().unwrap());
        }
        assert_eq!(echoed, b"hello");
        assert_eq!(session.state(), SessionState::Streaming);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_half_close_keeps_replies() {
        let tunnel = manager("R", Arc::new(Wires::default()), 8);
        let session = tunnel
            .open(route(&["R"]), OperationKind::Terminal { shell: None })
            .await
            .unwrap();

        session.write(b"hello").await.unwrap();
        session.shutdown_write().await.unwrap();
        assert!(matches!(
            session.write(b"late").await,
            Err(MeshError::SessionClosed)
        ));

        let mut echoed = Vec::new();
        while let Some(data) = session.read().await.unwrap() {
            echoed.extend_from_slice(&data);
        }
        assert_eq!(echoed, b"hello");
    }

    /// Open `R -> A` from R, answering the open on A's behalf
    async fn open_to_a() -> (
        Arc<TunnelManager>,
        SessionHandle,
        mpsc::Receiver<NetMessage>,
    ) {
        let wires = Arc::new(Wires::default());
        let mut to_a = wires.connect("A", 8);
        let origin = manager("R", wires, 8);

        let opening = {
            let origin = Arc::clone(&origin);
            tokio::spawn(async move {
                origin
                    .open(route(&["R", "A"]), OperationKind::PortForward { port: 22 })
                    .await
            })
        };
        let session_id = match to_a.recv().await {
            Some(NetMessage::TunnelOpen(m)) => m.session_id,
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        };
        origin
            .handle_frame(
                "A",
                NetMessage::TunnelOpenAck(TunnelOpenAckMessage {
                    session_id,
                    window: 8,
                }),
            )
            .await;
        let session = opening.await.unwrap().unwrap();
        (origin, session, to_a)
    }

    #[tokio::test]
    async fn test_shutdown_write_still_reads() {
        let (origin, session, mut to_a) = open_to_a().await;

        session.shutdown_write().await.unwrap();
        match to_a.recv().await {
            Some(NetMessage::TunnelData(m)) => assert!(m.data.is_empty()),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        assert!(session.write(b"x").await.is_err());

        origin
            .handle_frame(
                "A",
                NetMessage::TunnelData(TunnelDataMessage {
                    session_id: session.id(),
                    data: b"pong".to_vec(),
                }),
            )
            .await;
        assert_eq!(session.read().await.unwrap().as_deref(), Some(&b"pong"[..]));
        assert_eq!(origin.session_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_not_a_clean_close() {
        let (origin, session, mut to_a) = open_to_a().await;
        let session_id = session.id();

        drop(session);
        match to_a.recv().await {
            Some(NetMessage::TunnelClose(m)) => {
                assert_eq!(m.session_id, session_id);
                assert_eq!(m.reason, CloseReason::OperationFailed);
            }
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        assert_eq!(origin.session_count(), 0);
    }

    #[tokio::test]
    async fn test_target_replies_after_peer_finishes() {
        let wires = Arc::new(Wires::default());
        let mut to_b = wires.connect("B", 8);
        // Reads everything, then answers once
        struct Reply;
        #[async_trait]
        impl OperationHandler for Reply {
            async fn run(
                &self,
                _operation: OperationKind,
                session: Arc<SessionHandle>,
            ) -> Result<(), MeshError> {
                while session.read().await?.is_some() {}
                session.write(b"done").await?;
                Ok(())
            }
        }
        let target = Arc::new(TunnelManager::new("A", config(8), wires, Arc::new(Reply)));

        let session_id = SessionId::generate();
        target
            .handle_frame(
                "B",
                NetMessage::TunnelOpen(TunnelOpenMessage {
                    session_id,
                    route: route(&["B", "A"]),
                    operation: OperationKind::PortForward { port: 22 },
                    window: 8,
                }),
            )
            .await;
        assert!(matches!(to_b.recv().await, Some(NetMessage::TunnelOpenAck(_))));

        for data in [b"ping".to_vec(), Vec::new()] {
            target
                .handle_frame(
                    "B",
                    NetMessage::TunnelData(TunnelDataMessage { session_id, data }),
                )
                .await;
        }
        match to_b.recv().await {
            Some(NetMessage::TunnelData(m)) => assert_eq!(m.data, b"done"),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        match to_b.recv().await {
            Some(NetMessage::TunnelClose(m)) => assert_eq!(m.reason, CloseReason::Normal),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
    }

    #[tokio::test]
    async fn test_open_requires_local_origin() {
        let tunnel = manager("R", Arc::new(Wires::default()), 8);
        let err = tunnel
            .open(route(&["A", "R"]), OperationKind::PortForward { port: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[tokio::test]
    async fn test_open_without_link_fails() {
        let tunnel = manager("R", Arc::new(Wires::default()), 8);
        let err = tunnel
            .open(route(&["R", "A"]), OperationKind::PortForward { port: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::LinkUnavailable { .. }));
        assert_eq!(tunnel.session_count(), 0);
    }

    #[tokio::test]
    async fn test_open_times_out() {
        let wires = Arc::new(Wires::default());
        let _to_a = wires.connect("A", 8);
        let tunnel = manager("R", wires, 8);

        let err = tunnel
            .open(route(&["R", "A"]), OperationKind::PortForward { port: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout(_)));
        assert_eq!(tunnel.session_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_forwards_both_ways() {
        let wires = Arc::new(Wires::default());
        let mut to_b = wires.connect("B", 8);
        let mut to_c = wires.connect("C", 8);
        let relay = manager("A", wires, 8);

        let session_id = SessionId::generate();
        relay
            .handle_frame(
                "B",
                NetMessage::TunnelOpen(TunnelOpenMessage {
                    session_id,
                    route: route(&["B", "A", "C"]),
                    operation: OperationKind::PortForward { port: 22 },
                    window: 8,
                }),
            )
            .await;
        assert!(matches!(to_c.recv().await, Some(NetMessage::TunnelOpen(_))));
        assert_eq!(relay.relay_count(), 1);

        relay
            .handle_frame(
                "C",
                NetMessage::TunnelOpenAck(TunnelOpenAckMessage {
                    session_id,
                    window: 8,
                }),
            )
            .await;
        assert!(matches!(to_b.recv().await, Some(NetMessage::TunnelOpenAck(_))));

        relay
            .handle_frame(
                "B",
                NetMessage::TunnelData(TunnelDataMessage {
                    session_id,
                    data: b"ping".to_vec(),
                }),
            )
            .await;
        match to_c.recv().await {
            Some(NetMessage::TunnelData(m)) => assert_eq!(m.data, b"ping"),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }

        relay.handle_frame("C", close_frame(session_id, CloseReason::Normal, None)).await;
        assert!(matches!(to_b.recv().await, Some(NetMessage::TunnelClose(_))));
        assert_eq!(relay.relay_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_without_next_link_closes() {
        let wires = Arc::new(Wires::default());
        let mut to_b = wires.connect("B", 8);
        let relay = manager("A", wires, 8);

        relay
            .handle_frame(
                "B",
                NetMessage::TunnelOpen(TunnelOpenMessage {
                    session_id: SessionId::generate(),
                    route: route(&["B", "A", "C"]),
                    operation: OperationKind::PortForward { port: 22 },
                    window: 8,
                }),
            )
            .await;
        match to_b.recv().await {
            Some(NetMessage::TunnelClose(m)) => assert_eq!(m.reason, CloseReason::HopUnreachable),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        assert_eq!(relay.relay_count(), 0);
    }

    #[tokio::test]
    async fn test_neighbor_loss_fails_relay_and_endpoint() {
        let wires = Arc::new(Wires::default());
        let mut to_b = wires.connect("B", 8);
        let _to_c = wires.connect("C", 8);
        let relay = manager("A", wires, 8);

        let session_id = SessionId::generate();
        relay
            .handle_frame(
                "B",
                NetMessage::TunnelOpen(TunnelOpenMessage {
                    session_id,
                    route: route(&["B", "A", "C"]),
                    operation: OperationKind::PortForward { port: 22 },
                    window: 8,
                }),
            )
            .await;

        relay.fail_neighbor("C");
        match to_b.recv().await {
            Some(NetMessage::TunnelClose(m)) => {
                assert_eq!(m.session_id, session_id);
                assert_eq!(m.reason, CloseReason::HopUnreachable);
            }
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        assert_eq!(relay.relay_count(), 0);
    }

    #[tokio::test]
    async fn test_target_enforces_credit_window() {
        let wires = Arc::new(Wires::default());
        let mut to_b = wires.connect("B", 16);
        // A handler that never reads
        struct Stall;
        #[async_trait]
        impl OperationHandler for Stall {
            async fn run(
                &self,
                _operation: OperationKind,
                _session: Arc<SessionHandle>,
            ) -> Result<(), MeshError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
        let target = Arc::new(TunnelManager::new("A", config(2), wires, Arc::new(Stall)));

        let session_id = SessionId::generate();
        target
            .handle_frame(
                "B",
                NetMessage::TunnelOpen(TunnelOpenMessage {
                    session_id,
                    route: route(&["B", "A"]),
                    operation: OperationKind::PortForward { port: 22 },
                    window: 2,
                }),
            )
            .await;
        assert!(matches!(to_b.recv().await, Some(NetMessage::TunnelOpenAck(_))));

        for _ in 0..3 {
            target
                .handle_frame(
                    "B",
                    NetMessage::TunnelData(TunnelDataMessage {
                        session_id,
                        data: vec![1],
                    }),
                )
                .await;
        }
        match to_b.recv().await {
            Some(NetMessage::TunnelClose(m)) => assert_eq!(m.reason, CloseReason::ProtocolViolation),
            other => panic!("unexpected {:?}", other.map(|m| m.kind())),
        }
        assert_eq!(target.session_count(), 0);
    }
}
