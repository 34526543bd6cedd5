//! Child link pool
//!
//! One long-lived link per direct child of the local node. Each link is owned
//! by a connector task that dials the child, authenticates with the child's
//! token, and reconnects with exponential backoff when the link drops. Link
//! transitions are reported on an event channel consumed by the mesh runtime.
//!
//! A link is a pair of bounded channels ([`LinkChannel`]). Transports bridge
//! those channels to the wire; a full outbound queue makes senders wait, which
//! is how backpressure from a slow hop reaches whoever feeds it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use nodemesh_core::{
    Config, MeshError, NetMessage, NodeId, NodeInfo, PingMessage, ReconnectConfig,
};

use crate::handshake;

/// Operations the registry needs from the links to its direct children
#[async_trait]
pub trait ChildLinks: Send + Sync {
    /// Send to one child, bounded by the per-child send timeout
    async fn send(&self, node_id: &str, msg: NetMessage) -> Result<(), MeshError>;

    /// Send to every child concurrently; failures are logged, never returned
    async fn broadcast(&self, msg: &NetMessage);

    /// Start maintaining a link to `node`
    fn establish(&self, node: &NodeInfo);

    /// Tear down the link to `node_id`
    fn close(&self, node_id: &str);
}

/// Bidirectional message channel to one neighbor
pub struct LinkChannel {
    pub outbound: mpsc::Sender<NetMessage>,
    pub inbound: mpsc::Receiver<NetMessage>,
}

impl LinkChannel {
    /// Two connected ends, each with `capacity` queued messages per direction
    pub fn pair(capacity: usize) -> (LinkChannel, LinkChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            LinkChannel {
                outbound: a_tx,
                inbound: b_rx,
            },
            LinkChannel {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Dials a node and returns a raw (unauthenticated) link to it
#[async_trait]
pub trait LinkConnector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeInfo) -> Result<LinkChannel, MeshError>;
}

/// Link state as seen by the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Up,
    Down,
}

/// Link transitions reported by connector tasks
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake succeeded; frames from the child arrive on `inbound`
    Up {
        node_id: NodeId,
        inbound: mpsc::Receiver<NetMessage>,
    },
    /// An established link dropped
    Down { node_id: NodeId, reason: String },
    /// A reconnect attempt is scheduled
    Reconnecting { node_id: NodeId, attempt: u32 },
    /// Reconnect attempts are exhausted
    Lost { node_id: NodeId },
}

/// Pool settings
#[derive(Clone, Debug)]
pub struct LinkPoolConfig {
    pub local_id: NodeId,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive: Duration,
    pub reconnect: ReconnectConfig,
}

impl LinkPoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            local_id: config.node.id.clone(),
            send_timeout: config.mesh.send_timeout(),
            handshake_timeout: config.mesh.handshake_timeout(),
            keepalive: Duration::from_secs(config.mesh.keepalive_secs.max(1)),
            reconnect: config.reconnect.clone(),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    status: LinkStatus,
    outbound: Option<mpsc::Sender<NetMessage>>,
}

struct ChildLink {
    state: Arc<RwLock<LinkState>>,
    task: JoinHandle<()>,
}

/// Links to the direct children of the local node
pub struct ChildLinkPool {
    config: LinkPoolConfig,
    connector: Arc<dyn LinkConnector>,
    links: DashMap<NodeId, ChildLink>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChildLinkPool {
    /// Create a pool and the receiver for its link events
    pub fn new(
        config: LinkPoolConfig,
        connector: Arc<dyn LinkConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pool = Self {
            config,
            connector,
            links: DashMap::new(),
            event_tx,
        };
        (pool, event_rx)
    }

    /// Outbound queue of a link that is currently up
    pub fn sender(&self, node_id: &str) -> Option<mpsc::Sender<NetMessage>> {
        let link = self.links.get(node_id)?;
        let state = link.state.read();
        state.outbound.clone()
    }

    pub fn status(&self, node_id: &str) -> Option<LinkStatus> {
        self.links.get(node_id).map(|link| link.state.read().status)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Ids of children whose links are up
    pub fn connected(&self) -> Vec<NodeId> {
        self.links
            .iter()
            .filter(|link| link.state.read().status == LinkStatus::Up)
            .map(|link| link.key().clone())
            .collect()
    }

    /// Close every link
    pub fn shutdown(&self) {
        let ids: Vec<NodeId> = self.links.iter().map(|l| l.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    async fn send_to(
        sender: Option<mpsc::Sender<NetMessage>>,
        node_id: &str,
        msg: NetMessage,
        timeout: Duration,
    ) -> Result<(), MeshError> {
        let sender = sender.ok_or_else(|| MeshError::LinkUnavailable {
            node_id: node_id.to_string(),
            reason: "link is not up".into(),
        })?;
        sender
            .send_timeout(msg, timeout)
            .await
            .map_err(|e| MeshError::LinkUnavailable {
                node_id: node_id.to_string(),
                reason: match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => "send timed out".into(),
                    mpsc::error::SendTimeoutError::Closed(_) => "link closed".into(),
                },
            })
    }
}

#[async_trait]
impl ChildLinks for ChildLinkPool {
    async fn send(&self, node_id: &str, msg: NetMessage) -> Result<(), MeshError> {
        Self::send_to(self.sender(node_id), node_id, msg, self.config.send_timeout).await
    }

    async fn broadcast(&self, msg: &NetMessage) {
        let targets: Vec<(NodeId, Option<mpsc::Sender<NetMessage>>)> = self
            .links
            .iter()
            .map(|link| (link.key().clone(), link.state.read().outbound.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let timeout = self.config.send_timeout;
        let sends = targets.into_iter().map(|(node_id, sender)| async move {
            let result = Self::send_to(sender, &node_id, msg.clone(), timeout).await;
            (node_id, result)
        });

        for (node_id, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!("Failed to propagate {} to {}: {}", msg.kind(), node_id, e);
            }
        }
    }

    fn establish(&self, node: &NodeInfo) {
        if self.links.contains_key(&node.id) {
            debug!("Link to {} already managed", node.id);
            return;
        }

        let state = Arc::new(RwLock::new(LinkState {
            status: LinkStatus::Connecting,
            outbound: None,
        }));
        let task = tokio::spawn(run_link(
            node.clone(),
            self.config.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&state),
            self.event_tx.clone(),
        ));
        info!("Establishing link to child {} ({})", node.id, node.dial_address());
        self.links.insert(node.id.clone(), ChildLink { state, task });
    }

    fn close(&self, node_id: &str) {
        if let Some((_, link)) = self.links.remove(node_id) {
            link.task.abort();
            let mut state = link.state.write();
            state.status = LinkStatus::Down;
            state.outbound = None;
            info!("Closed link to {}", node_id);
        }
    }
}

impl Drop for ChildLinkPool {
    fn drop(&mut self) {
        for link in self.links.iter() {
            link.task.abort();
        }
    }
}

/// Connector task: dial, authenticate, hold the link, reconnect
async fn run_link(
    node: NodeInfo,
    config: LinkPoolConfig,
    connector: Arc<dyn LinkConnector>,
    state: Arc<RwLock<LinkState>>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        state.write().status = LinkStatus::Connecting;

        match connect_once(&node, &config, connector.as_ref()).await {
            Ok(LinkChannel { outbound, inbound }) => {
                attempt = 0;
                {
                    let mut s = state.write();
                    s.status = LinkStatus::Up;
                    s.outbound = Some(outbound.clone());
                }
                info!("Link to {} is up", node.id);
                let _ = event_tx.send(LinkEvent::Up {
                    node_id: node.id.clone(),
                    inbound,
                });

                let reason = hold_link(&outbound, &config).await;

                {
                    let mut s = state.write();
                    s.status = LinkStatus::Down;
                    s.outbound = None;
                }
                drop(outbound);
                warn!("Link to {} went down: {}", node.id, reason);
                let _ = event_tx.send(LinkEvent::Down {
                    node_id: node.id.clone(),
                    reason,
                });
            }
            Err(e) => {
                warn!("Failed to link with {}: {}", node.id, e);
                state.write().status = LinkStatus::Down;
            }
        }

        attempt = attempt.saturating_add(1);
        let exhausted =
            config.reconnect.max_attempts > 0 && attempt > config.reconnect.max_attempts;
        if !config.reconnect.enabled || exhausted {
            warn!("Giving up on link to {} after {} attempts", node.id, attempt);
            let _ = event_tx.send(LinkEvent::Lost {
                node_id: node.id.clone(),
            });
            return;
        }

        let delay = config.reconnect.backoff(attempt);
        debug!(
            "Reconnecting to {} in {:?} (attempt {})",
            node.id, delay, attempt
        );
        let _ = event_tx.send(LinkEvent::Reconnecting {
            node_id: node.id.clone(),
            attempt,
        });
        sleep(delay).await;
    }
}

async fn connect_once(
    node: &NodeInfo,
    config: &LinkPoolConfig,
    connector: &dyn LinkConnector,
) -> Result<LinkChannel, MeshError> {
    let mut channel = connector.connect(node).await?;
    let ack = handshake::initiate(
        &mut channel,
        &config.local_id,
        node,
        config.handshake_timeout,
    )
    .await?;
    debug!("Handshake with {} ({}) complete", ack.node_id, ack.name);
    Ok(channel)
}

/// Wait until the link drops, pinging it while idle
async fn hold_link(outbound: &mpsc::Sender<NetMessage>, config: &LinkPoolConfig) -> String {
    let mut ticker = interval(config.keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = outbound.closed() => return "link closed by peer".into(),
            _ = ticker.tick() => {
                let ping = NetMessage::Ping(PingMessage {
                    timestamp: unix_millis(),
                    payload: [0u8; 8],
                });
                if outbound.send_timeout(ping, config.send_timeout).await.is_err() {
                    return "keepalive failed".into();
                }
            }
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// In-process transport: nodes listen on their dial address and connectors
/// hand them one end of a [`LinkChannel::pair`]
#[derive(Clone)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<LinkChannel>>>,
    capacity: usize,
}

impl MemoryNetwork {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Accept links dialed to `address` (`host:port`)
    pub fn listen(&self, address: impl Into<String>) -> mpsc::UnboundedReceiver<LinkChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(address.into(), tx);
        rx
    }

    pub fn unlisten(&self, address: &str) {
        self.listeners.remove(address);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl LinkConnector for MemoryNetwork {
    async fn connect(&self, node: &NodeInfo) -> Result<LinkChannel, MeshError> {
        let address = node.dial_address();
        let listener = self
            .listeners
            .get(&address)
            .map(|l| l.clone())
            .ok_or_else(|| MeshError::LinkUnavailable {
                node_id: node.id.clone(),
                reason: format!("nothing listening on {}", address),
            })?;

        let (local, remote) = LinkChannel::pair(self.capacity);
        listener
            .send(remote)
            .map_err(|_| MeshError::LinkUnavailable {
                node_id: node.id.clone(),
                reason: format!("listener on {} is gone", address),
            })?;
        Ok(local)
    }
}
