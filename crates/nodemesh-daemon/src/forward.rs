//! Port-forward listeners
//!
//! A forwarding rule `(in_node, in_port) -> (out_node, out_port)` is served on
//! `in_node`: it listens on `in_port`, and every accepted connection gets its
//! own `PortForward` session to `out_node`.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use nodemesh_core::{MeshError, OperationKind, PortForwarding};

use crate::mesh::MeshNode;
use crate::operations::pipe_stream;

struct ListenerHandle {
    rule: PortForwarding,
    shutdown_tx: oneshot::Sender<()>,
}

/// Active forwarding listeners by local port
pub struct PortForwarder {
    mesh: Arc<MeshNode>,
    listeners: DashMap<u16, ListenerHandle>,
}

impl PortForwarder {
    pub fn new(mesh: Arc<MeshNode>) -> Self {
        Self {
            mesh,
            listeners: DashMap::new(),
        }
    }

    /// Start serving a rule; returns the port actually bound
    pub async fn start(&self, rule: PortForwarding) -> Result<u16, MeshError> {
        let local_id = &self.mesh.local().id;
        if rule.in_node != *local_id {
            return Err(MeshError::Validation(format!(
                "forward from {} must run on that node, not {}",
                rule.in_node, local_id
            )));
        }
        let snapshot = self.mesh.registry().snapshot();
        for id in [&rule.in_node, &rule.out_node] {
            if !snapshot.contains(id) {
                return Err(MeshError::Validation(format!("unknown node {}", id)));
            }
        }
        if rule.in_port != 0 && self.listeners.contains_key(&rule.in_port) {
            return Err(MeshError::Validation(format!(
                "port {} is already forwarded",
                rule.in_port
            )));
        }

        let bind = SocketAddr::new(self.mesh.config().node.bind, rule.in_port);
        let listener = TcpListener::bind(bind).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.mesh),
            rule.clone(),
            shutdown_rx,
        ));

        info!(
            "Forwarding {}:{} -> {}:{}",
            rule.in_node, port, rule.out_node, rule.out_port
        );
        self.listeners.insert(port, ListenerHandle { rule, shutdown_tx });
        Ok(port)
    }

    /// Stop the listener on `port`; open connections keep running
    pub fn stop(&self, port: u16) -> bool {
        match self.listeners.remove(&port) {
            Some((_, handle)) => {
                let _ = handle.shutdown_tx.send(());
                info!("Stopped forwarding port {}", port);
                true
            }
            None => false,
        }
    }

    /// Rules currently served, keyed by bound port
    pub fn active(&self) -> Vec<(u16, PortForwarding)> {
        self.listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().rule.clone()))
            .collect()
    }

    pub fn stop_all(&self) {
        let ports: Vec<u16> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for port in ports {
            self.stop(port);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mesh: Arc<MeshNode>,
    rule: PortForwarding,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Forward connection from {}", peer);
                    tokio::spawn(forward_connection(stream, Arc::clone(&mesh), rule.clone()));
                }
                Err(e) => warn!("Accept on forward port failed: {}", e),
            }
        }
    }
    debug!("Forward listener for {}:{} closed", rule.out_node, rule.out_port);
}

async fn forward_connection(stream: TcpStream, mesh: Arc<MeshNode>, rule: PortForwarding) {
    let local_id = mesh.local().id.clone();
    let session = match mesh
        .resolve_and_open_session(
            &local_id,
            &rule.out_node,
            OperationKind::PortForward {
                port: rule.out_port,
            },
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!("Cannot forward to {}:{}: {}", rule.out_node, rule.out_port, e);
            return;
        }
    };

    if let Err(e) = pipe_stream(&session, stream).await {
        debug!("Forwarded connection on session {} ended: {}", session.id(), e);
    }
    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_pool::MemoryNetwork;
    use nodemesh_core::{Config, NodeConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn root() -> Arc<MeshNode> {
        let config = Config {
            node: NodeConfig {
                id: "R".into(),
                token: "R-token".into(),
                bind: "127.0.0.1".parse().unwrap(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mesh = MeshNode::new(config, Arc::new(MemoryNetwork::default())).unwrap();
        mesh.start().await.unwrap();
        mesh
    }

    fn rule(in_node: &str, out_node: &str, out_port: u16) -> PortForwarding {
        PortForwarding {
            in_node: in_node.into(),
            in_port: 0,
            out_node: out_node.into(),
            out_port,
        }
    }

    #[tokio::test]
    async fn test_forward_to_local_service() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = service.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let forwarder = PortForwarder::new(root().await);
        let port = forwarder.start(rule("R", "R", service_port)).await.unwrap();
        assert_eq!(forwarder.active().len(), 1);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(forwarder.stop(port));
        assert!(!forwarder.stop(port));
    }

    #[tokio::test]
    async fn test_client_half_close_gets_response() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = service.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"request");
            socket.write_all(b"response").await.unwrap();
        });

        let forwarder = PortForwarder::new(root().await);
        let port = forwarder.start(rule("R", "R", service_port)).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
    }

    #[tokio::test]
    async fn test_rejects_unknown_nodes() {
        let forwarder = PortForwarder::new(root().await);
        assert!(matches!(
            forwarder.start(rule("R", "ghost", 80)).await,
            Err(MeshError::Validation(_))
        ));
        assert!(matches!(
            forwarder.start(rule("A", "R", 80)).await,
            Err(MeshError::Validation(_))
        ));
        assert!(forwarder.active().is_empty());
    }
}
