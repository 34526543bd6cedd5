//! Link handshake and node registration
//!
//! A parent dials its child and proves it knows the child's token; the child
//! answers with `HelloAck` or an `AuthFailed` error. Registration checks a
//! node's presented token against the credentials provisioned for its id.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use nodemesh_core::crypto::tokens_match;
use nodemesh_core::{
    ErrorCode, HelloAckMessage, HelloMessage, MeshError, NetMessage, NodeId, NodeInfo,
    ProtocolError, PROTOCOL_VERSION,
};

use crate::link_pool::LinkChannel;
use crate::rate_limiter::RateLimiter;

/// Dialing side: present the child's token and wait for its acknowledgement
pub async fn initiate(
    channel: &mut LinkChannel,
    local_id: &str,
    node: &NodeInfo,
    wait: Duration,
) -> Result<HelloAckMessage, MeshError> {
    let hello = NetMessage::Hello(HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        from: local_id.to_string(),
        node_id: node.id.clone(),
        token: node.token.clone(),
    });
    channel
        .outbound
        .send(hello)
        .await
        .map_err(|_| ProtocolError::LinkClosed)?;

    let reply = timeout(wait, channel.inbound.recv())
        .await
        .map_err(|_| MeshError::Timeout(format!("handshake with {}", node.id)))?
        .ok_or(ProtocolError::LinkClosed)?;

    match reply {
        NetMessage::HelloAck(ack) => {
            if ack.protocol_version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: ack.protocol_version,
                }
                .into());
            }
            if ack.node_id != node.id {
                warn!("Dialed {} but {} answered", node.id, ack.node_id);
                return Err(MeshError::Authentication {
                    node_id: node.id.clone(),
                });
            }
            Ok(ack)
        }
        NetMessage::Error(e) if e.code == ErrorCode::AuthFailed => Err(MeshError::Authentication {
            node_id: node.id.clone(),
        }),
        NetMessage::Error(e) => Err(ProtocolError::UnexpectedMessage(e.message).into()),
        other => Err(ProtocolError::UnexpectedMessage(other.kind().into()).into()),
    }
}

/// Accepting side: check the dialer targets this node with this node's token
pub async fn accept(
    channel: &mut LinkChannel,
    local: &NodeInfo,
    wait: Duration,
) -> Result<HelloMessage, MeshError> {
    let first = timeout(wait, channel.inbound.recv())
        .await
        .map_err(|_| MeshError::Timeout("waiting for hello".into()))?
        .ok_or(ProtocolError::LinkClosed)?;

    let hello = match first {
        NetMessage::Hello(hello) => hello,
        other => {
            let kind = other.kind();
            reject(channel, ErrorCode::ProtocolError, "expected hello").await;
            return Err(ProtocolError::UnexpectedMessage(kind.into()).into());
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        reject(channel, ErrorCode::ProtocolError, "unsupported protocol version").await;
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: hello.protocol_version,
        }
        .into());
    }

    if hello.node_id != local.id || !local.check_token(hello.token.as_bytes()) {
        warn!("Rejected link from {}: bad credentials", hello.from);
        reject(channel, ErrorCode::AuthFailed, "authentication failed").await;
        return Err(MeshError::Authentication {
            node_id: hello.node_id,
        });
    }

    channel
        .outbound
        .send(NetMessage::HelloAck(HelloAckMessage {
            protocol_version: PROTOCOL_VERSION,
            node_id: local.id.clone(),
            name: local.name.clone(),
        }))
        .await
        .map_err(|_| ProtocolError::LinkClosed)?;

    debug!("Accepted link from parent {}", hello.from);
    Ok(hello)
}

async fn reject(channel: &LinkChannel, code: ErrorCode, message: &str) {
    let _ = channel.outbound.send(NetMessage::error(code, message)).await;
}

/// Expected tokens for nodes allowed to register
#[derive(Default)]
pub struct CredentialStore {
    expected: DashMap<NodeId, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from provisioned node descriptors
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a NodeInfo>) -> Self {
        let store = Self::new();
        for node in nodes {
            store.provision(&node.id, &node.token);
        }
        store
    }

    pub fn provision(&self, node_id: &str, token: &str) {
        self.expected.insert(node_id.to_string(), token.to_string());
    }

    pub fn revoke(&self, node_id: &str) -> bool {
        self.expected.remove(node_id).is_some()
    }

    /// Constant-time check of a presented token
    pub fn verify(&self, node_id: &str, presented: &str) -> bool {
        self.expected
            .get(node_id)
            .is_some_and(|expected| tokens_match(expected.as_bytes(), presented.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }
}

/// Admission checks run before a node enters the registry
pub struct Registrar {
    credentials: CredentialStore,
    limiter: RateLimiter,
}

impl Registrar {
    pub fn new(credentials: CredentialStore, limiter: RateLimiter) -> Self {
        Self {
            credentials,
            limiter,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Validate a registration request and authenticate its token
    pub fn admit(&self, node: &NodeInfo) -> Result<(), MeshError> {
        if node.id.is_empty() {
            return Err(MeshError::Validation("node id is empty".into()));
        }
        if node.token.is_empty() {
            return Err(MeshError::Validation(format!(
                "node {} has no token",
                node.id
            )));
        }
        if !self.limiter.check(&node.id) {
            let wait = self.limiter.block_remaining(&node.id).unwrap_or_default();
            return Err(MeshError::RateLimited(format!(
                "node {} blocked for {}s",
                node.id,
                wait.as_secs()
            )));
        }

        if !self.credentials.verify(&node.id, &node.token) {
            warn!("Registration of {} rejected: bad token", node.id);
            self.limiter.record_failure(&node.id);
            return Err(MeshError::Authentication {
                node_id: node.id.clone(),
            });
        }

        self.limiter.record_success(&node.id);
        info!("Admitted {}", node.descriptor());
        Ok(())
    }
}
