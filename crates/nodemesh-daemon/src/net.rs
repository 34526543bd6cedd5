//! QUIC networking layer
//!
//! Every link is one bidirectional QUIC stream carrying length-prefixed
//! `NetMessage` frames. A bridge task moves frames between the stream and a
//! [`LinkChannel`], so the rest of the node only ever sees channels.
//!
//! # Security
//!
//! Nodes use self-signed certificates and the dialer skips certificate
//! verification. Peers are authenticated by the token handshake that runs as
//! the first exchange on every link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{
    ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig,
    VarInt,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};

use nodemesh_core::{
    deserialize_message, frame_len, serialize_message, MeshError, NetMessage, NodeInfo,
};

use crate::link_pool::{LinkChannel, LinkConnector};
use crate::mesh::MeshNode;

/// Keepalive interval (keeps NAT mappings open)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Idle timeout - longer than keepalive to allow connection recovery
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Server name presented in the TLS handshake
const SERVER_NAME: &str = "localhost";

/// Send a message on a stream
pub async fn send_message(stream: &mut SendStream, msg: &NetMessage) -> Result<(), MeshError> {
    let data = serialize_message(msg)?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| MeshError::Io(e.to_string()))
}

/// Receive a message from a stream
pub async fn recv_message(stream: &mut RecvStream) -> Result<NetMessage, MeshError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| MeshError::Io(e.to_string()))?;
    let len = frame_len(len_buf)?;

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| MeshError::Io(e.to_string()))?;

    Ok(deserialize_message(&payload)?)
}

/// Bridge a QUIC stream to a [`LinkChannel`]
///
/// The task ends when either direction fails or the returned channel's
/// outbound side is dropped; the connection is closed with it.
pub fn bridge_stream(
    connection: Connection,
    mut send: SendStream,
    mut recv: RecvStream,
    capacity: usize,
) -> LinkChannel {
    let (local, remote) = LinkChannel::pair(capacity);
    let LinkChannel {
        outbound,
        mut inbound,
    } = remote;

    tokio::spawn(async move {
        let peer = connection.remote_address();

        let writer = async {
            while let Some(msg) = inbound.recv().await {
                send_message(&mut send, &msg).await?;
            }
            let _ = send.finish();
            Ok::<(), MeshError>(())
        };
        let reader = async {
            loop {
                let msg = recv_message(&mut recv).await?;
                if outbound.send(msg).await.is_err() {
                    return Ok::<(), MeshError>(());
                }
            }
        };

        let result = tokio::select! {
            r = writer => r,
            r = reader => r,
        };
        match result {
            Ok(()) => debug!("Link stream with {} closed", peer),
            Err(e) => debug!("Link stream with {} ended: {}", peer, e),
        }
        connection.close(VarInt::from_u32(0), b"link closed");
    });

    local
}

/// Generate a self-signed certificate
pub fn generate_self_signed_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), MeshError> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|e| MeshError::Io(e.to_string()))?;
    let key_der = cert.get_key_pair().serialize_der();
    let cert_der = cert
        .serialize_der()
        .map_err(|e| MeshError::Io(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(key_der).into();
    Ok((vec![CertificateDer::from(cert_der)], key))
}

/// Transport settings shared by both directions of a link
pub fn create_transport_config() -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    if let Ok(idle) = IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(idle));
    }
    transport.initial_rtt(Duration::from_millis(100));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(16));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport
}

/// Create one endpoint that accepts links from a parent and dials children
pub fn create_endpoint(bind_addr: SocketAddr) -> Result<Endpoint, MeshError> {
    let transport = Arc::new(create_transport_config());
    let (certs, key) = generate_self_signed_cert()?;

    let server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MeshError::Io(e.to_string()))?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| MeshError::Io(e.to_string()))?,
    ));
    server_config.transport_config(Arc::clone(&transport));

    let client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .map_err(|e| MeshError::Io(e.to_string()))?,
    ));
    client_config.transport_config(transport);

    let mut endpoint = Endpoint::server(server_config, bind_addr)?;
    endpoint.set_default_client_config(client_config);
    info!("Link endpoint listening on {}", endpoint.local_addr()?);
    Ok(endpoint)
}

/// Dials children over QUIC
pub struct QuicLinkConnector {
    endpoint: Endpoint,
    capacity: usize,
}

impl QuicLinkConnector {
    pub fn new(endpoint: Endpoint, capacity: usize) -> Self {
        Self { endpoint, capacity }
    }
}

#[async_trait]
impl LinkConnector for QuicLinkConnector {
    async fn connect(&self, node: &NodeInfo) -> Result<LinkChannel, MeshError> {
        let unavailable = |reason: String| MeshError::LinkUnavailable {
            node_id: node.id.clone(),
            reason,
        };

        let address = node.dial_address();
        let addr = tokio::net::lookup_host(&address)
            .await?
            .next()
            .ok_or_else(|| unavailable(format!("{} did not resolve", address)))?;

        let connection = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| unavailable(e.to_string()))?
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        debug!("Connected to {} at {}", node.id, addr);
        Ok(bridge_stream(connection, send, recv, self.capacity))
    }
}

/// Accept links from parents until the endpoint closes
pub async fn serve(endpoint: Endpoint, mesh: Arc<MeshNode>, capacity: usize) {
    while let Some(incoming) = endpoint.accept().await {
        let mesh = Arc::clone(&mesh);
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Incoming connection failed: {}", e);
                    return;
                }
            };
            let remote = connection.remote_address();
            let (send, recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    warn!("No link stream from {}: {}", remote, e);
                    return;
                }
            };

            let channel = bridge_stream(connection, send, recv, capacity);
            if let Err(e) = mesh.accept_upstream(channel).await {
                warn!("Rejected link from {}: {}", remote, e);
            }
        });
    }
    debug!("Link endpoint closed");
}

/// Accepts any server certificate; links authenticate with tokens instead
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
