//! Error types for the mesh

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeId, SessionId};

/// Protocol-level errors (framing and serialization)
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("link closed")]
    LinkClosed,
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Mesh errors surfaced to callers
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Malformed registration input; do not retry without fixing it
    #[error("validation failed: {0}")]
    Validation(String),

    /// Token mismatch or unknown credentials
    #[error("authentication failed for node {node_id}")]
    Authentication { node_id: NodeId },

    /// No route between two nodes
    #[error("node {to} is unreachable from {from}")]
    Unreachable { from: NodeId, to: NodeId },

    /// A specific neighbor link is down or missing
    #[error("link to {node_id} unavailable: {reason}")]
    LinkUnavailable { node_id: NodeId, reason: String },

    /// A tunnel session was force-closed
    #[error("session {session_id} failed: {reason}")]
    SessionFailure { session_id: SessionId, reason: String },

    /// The session was closed by an endpoint, or the key is unknown
    #[error("session closed")]
    SessionClosed,

    /// Upload chunk does not continue at the expected offset
    #[error("chunk out of order: expected offset {expected}, got {actual}")]
    ChunkOutOfOrder { expected: u64, actual: u64 },

    /// Too many failed attempts for this key
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        MeshError::Io(e.to_string())
    }
}

impl MeshError {
    /// Whether a caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Unreachable { .. }
                | MeshError::LinkUnavailable { .. }
                | MeshError::Timeout(_)
                | MeshError::RateLimited(_)
        )
    }
}

/// Wire error codes (sent over network)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // General (0-99)
    Ok = 0,
    Unknown = 1,
    ProtocolError = 2,
    Timeout = 4,

    // Registration (100-199)
    ValidationFailed = 100,
    AuthFailed = 101,
    RateLimited = 102,

    // Routing (200-299)
    Unreachable = 200,
    LinkUnavailable = 201,

    // Sessions (300-399)
    SessionFailed = 300,
    SessionClosed = 301,
    ChunkOutOfOrder = 302,
    OperationFailed = 303,
}

impl From<&MeshError> for ErrorCode {
    fn from(e: &MeshError) -> Self {
        match e {
            MeshError::Validation(_) => ErrorCode::ValidationFailed,
            MeshError::Authentication { .. } => ErrorCode::AuthFailed,
            MeshError::Unreachable { .. } => ErrorCode::Unreachable,
            MeshError::LinkUnavailable { .. } => ErrorCode::LinkUnavailable,
            MeshError::SessionFailure { .. } => ErrorCode::SessionFailed,
            MeshError::SessionClosed => ErrorCode::SessionClosed,
            MeshError::ChunkOutOfOrder { .. } => ErrorCode::ChunkOutOfOrder,
            MeshError::RateLimited(_) => ErrorCode::RateLimited,
            MeshError::Timeout(_) => ErrorCode::Timeout,
            MeshError::Protocol(_) => ErrorCode::ProtocolError,
            MeshError::Io(_) => ErrorCode::OperationFailed,
        }
    }
}
