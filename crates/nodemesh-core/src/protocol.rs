//! Wire protocol definitions
//!
//! All link messages are defined here. Messages are serialized with bincode
//! and prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};
use crate::types::{CloseReason, NodeId, NodeInfo, OperationKind, Route, SessionId};
use crate::MAX_MESSAGE_SIZE;

/// All possible link messages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetMessage {
    // Handshake
    Hello(HelloMessage),
    HelloAck(HelloAckMessage),

    // Propagation
    NodeAdd(NodeAddMessage),
    NodeRemove(NodeRemoveMessage),

    // Tunnel sessions
    TunnelOpen(TunnelOpenMessage),
    TunnelOpenAck(TunnelOpenAckMessage),
    TunnelData(TunnelDataMessage),
    TunnelCredit(TunnelCreditMessage),
    TunnelClose(TunnelCloseMessage),

    // Control
    Ping(PingMessage),
    Pong(PongMessage),
    Error(ErrorMessage),
    Goodbye(GoodbyeMessage),
}

impl NetMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::Hello(_) => "hello",
            NetMessage::HelloAck(_) => "hello-ack",
            NetMessage::NodeAdd(_) => "node-add",
            NetMessage::NodeRemove(_) => "node-remove",
            NetMessage::TunnelOpen(_) => "tunnel-open",
            NetMessage::TunnelOpenAck(_) => "tunnel-open-ack",
            NetMessage::TunnelData(_) => "tunnel-data",
            NetMessage::TunnelCredit(_) => "tunnel-credit",
            NetMessage::TunnelClose(_) => "tunnel-close",
            NetMessage::Ping(_) => "ping",
            NetMessage::Pong(_) => "pong",
            NetMessage::Error(_) => "error",
            NetMessage::Goodbye(_) => "goodbye",
        }
    }

    /// Session this frame belongs to, for tunnel frames
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            NetMessage::TunnelOpen(m) => Some(m.session_id),
            NetMessage::TunnelOpenAck(m) => Some(m.session_id),
            NetMessage::TunnelData(m) => Some(m.session_id),
            NetMessage::TunnelCredit(m) => Some(m.session_id),
            NetMessage::TunnelClose(m) => Some(m.session_id),
            _ => None,
        }
    }

    pub fn node_add(node: NodeInfo) -> Self {
        NetMessage::NodeAdd(NodeAddMessage { node })
    }

    pub fn node_remove(node_id: impl Into<NodeId>) -> Self {
        NetMessage::NodeRemove(NodeRemoveMessage {
            node_id: node_id.into(),
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        NetMessage::Error(ErrorMessage {
            code,
            message: message.into(),
            session_id: None,
        })
    }
}

// === Handshake Messages ===

/// Sent by the dialing parent to a child it wants to link with
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
    /// Id of the dialing node
    pub from: NodeId,
    /// Id the dialer expects the remote node to have
    pub node_id: NodeId,
    /// The remote node's shared secret
    pub token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub protocol_version: u32,
    pub node_id: NodeId,
    pub name: String,
}

// === Propagation Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeAddMessage {
    pub node: NodeInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRemoveMessage {
    pub node_id: NodeId,
}

// === Tunnel Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelOpenMessage {
    pub session_id: SessionId,
    /// Full route, origin first
    pub route: Route,
    pub operation: OperationKind,
    /// Credit window the origin grants the target
    pub window: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelOpenAckMessage {
    pub session_id: SessionId,
    /// Credit window the target grants the origin
    pub window: u32,
}

/// Session payload; an empty `data` ends the sender's direction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelDataMessage {
    pub session_id: SessionId,
    pub data: Vec<u8>,
}

/// Returns consumed frames to the sender's window
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelCreditMessage {
    pub session_id: SessionId,
    pub credits: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelCloseMessage {
    pub session_id: SessionId,
    pub reason: CloseReason,
    pub message: Option<String>,
}

// === Control Messages ===

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingMessage {
    pub timestamp: u64,
    pub payload: [u8; 8],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongMessage {
    pub client_timestamp: u64,
    pub server_timestamp: u64,
    pub payload: [u8; 8],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    pub session_id: Option<SessionId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoodbyeMessage {
    pub reason: DisconnectReason,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum DisconnectReason {
    Shutdown,
    NodeRemoved,
    ProtocolError,
    AuthenticationFailed,
}

// === Serialization ===

/// Serialize a message with length prefix
pub fn serialize_message(msg: &NetMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize a message (without length prefix)
pub fn deserialize_message(data: &[u8]) -> Result<NetMessage, ProtocolError> {
    Ok(bincode::deserialize(data)?)
}

/// Decode the 4-byte length prefix, rejecting oversized frames
pub fn frame_len(prefix: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_node_add() {
        let node = NodeInfo::new("edge-1", "root", "tok").with_address("10.1.1.1", 21090);
        let bytes = serialize_message(&NetMessage::node_add(node.clone())).unwrap();

        let len = frame_len(bytes[..4].try_into().unwrap()).unwrap();
        assert_eq!(len, bytes.len() - 4);

        match deserialize_message(&bytes[4..]).unwrap() {
            NetMessage::NodeAdd(m) => assert_eq!(m.node, node),
            other => panic!("wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_roundtrip_tunnel_open() {
        let session_id = SessionId::generate();
        let msg = NetMessage::TunnelOpen(TunnelOpenMessage {
            session_id,
            route: vec!["b".into(), "a".into(), "r".into(), "c".into()],
            operation: OperationKind::PortForward { port: 22 },
            window: 16,
        });
        assert_eq!(msg.session_id(), Some(session_id));

        let bytes = serialize_message(&msg).unwrap();
        match deserialize_message(&bytes[4..]).unwrap() {
            NetMessage::TunnelOpen(m) => {
                assert_eq!(m.route.len(), 4);
                assert_eq!(m.operation, OperationKind::PortForward { port: 22 });
            }
            other => panic!("wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        assert!(matches!(
            frame_len(prefix),
            Err(ProtocolError::MessageTooLarge { .. })
        ));

        let msg = NetMessage::TunnelData(TunnelDataMessage {
            session_id: SessionId::generate(),
            data: vec![0u8; MAX_MESSAGE_SIZE + 1],
        });
        assert!(serialize_message(&msg).is_err());
    }
}
