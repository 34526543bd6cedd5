//! Core type definitions shared by every mesh component

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::tokens_match;

/// Node identifier (stable for the node's lifetime)
pub type NodeId = String;

/// Ordered node ids from source to destination inclusive
pub type Route = Vec<NodeId>;

/// Liveness of a node as seen by the local process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum NodeStatus {
    Started = 1,
    #[default]
    Stopped = 2,
    Error = 3,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Started => write!(f, "started"),
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Error => write!(f, "error"),
        }
    }
}

/// Identity and liveness record of a node in the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Empty only for the root
    pub parent_id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Shared secret presented on registration and link handshake
    pub token: String,
    pub status: NodeStatus,
    /// Diagnostic text for `NodeStatus::Error`
    pub status_error: Option<String>,
}

impl NodeInfo {
    pub fn new(
        id: impl Into<NodeId>,
        parent_id: impl Into<NodeId>,
        token: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            parent_id: parent_id.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    /// Builder-style address setter
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Builder-style name setter
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// Human-readable descriptor for logs and audit records
    pub fn descriptor(&self) -> String {
        format!(
            "node[{}] address[{}] port[{}]",
            self.name, self.address, self.port
        )
    }

    /// `host:port` string used by transports to dial this node
    pub fn dial_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Check a presented token against this node's secret
    pub fn check_token(&self, presented: &[u8]) -> bool {
        tokens_match(self.token.as_bytes(), presented)
    }

    /// Copy registration fields onto an existing record
    ///
    /// Identity and liveness stay put; status only moves through the
    /// registry's `set_status`.
    pub fn update_from(&mut self, other: &NodeInfo) {
        self.parent_id = other.parent_id.clone();
        self.name = other.name.clone();
        self.address = other.address.clone();
        self.port = other.port;
        self.token = other.token.clone();
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

/// `(in_node, in_port) -> (out_node, out_port)` forwarding rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwarding {
    pub in_node: NodeId,
    pub in_port: u16,
    pub out_node: NodeId,
    pub out_port: u16,
}

/// Tunnel session identifier (random, 128 bits)
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Generate a new random session id
    ///
    /// # Panics
    /// Panics if the system random number generator fails.
    pub fn generate() -> Self {
        Self::try_generate().expect("RNG failed - system entropy source unavailable")
    }

    pub fn try_generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// The external operation a tunnel session carries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Stream a file from the target node
    FileRead { path: String },
    /// Stream bytes into a file on the target node
    FileWrite { path: String, size: Option<u64> },
    /// Interactive shell on the target node (`None` = node's default shell)
    Terminal { shell: Option<String> },
    /// TCP connection to a port on the target node's loopback
    PortForward { port: u16 },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::FileRead { .. } => "file-read",
            OperationKind::FileWrite { .. } => "file-write",
            OperationKind::Terminal { .. } => "terminal",
            OperationKind::PortForward { .. } => "port-forward",
        }
    }
}

/// Tunnel session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Opening,
    Established,
    Streaming,
    Idle,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether the session can still carry data
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Established | SessionState::Streaming | SessionState::Idle
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Why a tunnel session was closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// An endpoint closed normally
    Normal,
    /// A hop on the route became unreachable
    HopUnreachable,
    /// The target refused or could not run the operation
    OperationFailed,
    /// The session sat idle past its timeout
    IdleTimeout,
    /// A peer violated the tunnel protocol (e.g. overran its credit window)
    ProtocolViolation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "closed"),
            CloseReason::HopUnreachable => write!(f, "hop unreachable"),
            CloseReason::OperationFailed => write!(f, "operation failed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let node = NodeInfo::new("n1", "root", "secret")
            .with_name("edge")
            .with_address("10.0.0.7", 21090);
        assert_eq!(node.descriptor(), "node[edge] address[10.0.0.7] port[21090]");
        assert_eq!(node.dial_address(), "10.0.0.7:21090");
        assert!(!node.is_root());
    }

    #[test]
    fn test_check_token() {
        let node = NodeInfo::new("n1", "", "secret");
        assert!(node.check_token(b"secret"));
        assert!(!node.check_token(b"secreT"));
        assert!(!node.check_token(b"secret-longer"));
        assert!(!node.check_token(b""));
    }

    #[test]
    fn test_update_from_keeps_identity() {
        let mut node = NodeInfo::new("n1", "root", "a");
        let newer = NodeInfo::new("other-id", "mid", "b").with_address("h", 9);
        node.update_from(&newer);
        assert_eq!(node.id, "n1");
        assert_eq!(node.parent_id, "mid");
        assert_eq!(node.token, "b");
        assert_eq!(node.port, 9);
    }

    #[test]
    fn test_update_from_keeps_status() {
        let mut node = NodeInfo::new("n1", "root", "a");
        node.status = NodeStatus::Error;
        node.status_error = Some("link lost".into());
        node.update_from(&NodeInfo::new("n1", "root", "a").with_name("renamed"));
        assert_eq!(node.name, "renamed");
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.status_error.as_deref(), Some("link lost"));
    }

    #[test]
    fn test_session_id_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn test_session_state_predicates() {
        assert!(SessionState::Idle.is_open());
        assert!(!SessionState::Opening.is_open());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }
}
