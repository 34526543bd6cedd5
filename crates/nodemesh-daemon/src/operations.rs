//! Target-side operations carried by tunnel sessions
//!
//! The tunnel layer hands every accepted session to an [`OperationHandler`].
//! [`LocalOperations`] runs them against the local machine: files, a shell,
//! or a TCP port on loopback.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use nodemesh_core::{MeshError, OperationKind, TunnelConfig};

use crate::tunnel::SessionHandle;

/// Runs the operation a session was opened for
///
/// Returning `Ok` closes the session normally; an error closes it with
/// `OperationFailed` and the error text.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn run(&self, operation: OperationKind, session: Arc<SessionHandle>)
        -> Result<(), MeshError>;
}

/// Operations against the local filesystem, shell and loopback ports
pub struct LocalOperations {
    default_shell: String,
}

impl LocalOperations {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
        }
    }

    async fn file_read(&self, session: &SessionHandle, path: &str) -> Result<(), MeshError> {
        let mut file = File::open(path).await?;
        let mut buf = vec![0u8; session.max_frame_size()];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            session.write(&buf[..n]).await?;
            sent += n as u64;
        }
        info!("Sent {} ({} bytes) on session {}", path, sent, session.id());
        Ok(())
    }

    async fn file_write(
        &self,
        session: &SessionHandle,
        path: &str,
        size: Option<u64>,
    ) -> Result<(), MeshError> {
        let mut file = File::create(path).await?;
        match receive_file(session, &mut file, path, size).await {
            Ok(written) => {
                info!("Received {} ({} bytes) on session {}", path, written, session.id());
                Ok(())
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(path).await {
                    warn!("Could not remove partial {}: {}", path, rm);
                }
                Err(e)
            }
        }
    }

    async fn terminal(&self, session: &SessionHandle, shell: Option<&str>) -> Result<(), MeshError> {
        let program = shell.unwrap_or(&self.default_shell);
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!("Started {} for session {}", program, session.id());

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(MeshError::Io("shell stdio unavailable".into()));
        };

        let output = async {
            let (out, err) = tokio::join!(
                forward_output(session, stdout),
                forward_output(session, stderr)
            );
            out.and(err)
        };
        tokio::pin!(output);
        let result = tokio::select! {
            r = &mut output => r,
            r = forward_input(session, stdin) => match r {
                // Stdin is closed; let the shell finish and flush
                Ok(()) if !session.state().is_terminal() => output.await,
                other => other,
            },
        };

        let _ = child.kill().await;
        result
    }

    async fn port_forward(&self, session: &SessionHandle, port: u16) -> Result<(), MeshError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        debug!("Session {} connected to local port {}", session.id(), port);
        pipe_stream(session, stream).await
    }
}

#[async_trait]
impl OperationHandler for LocalOperations {
    async fn run(
        &self,
        operation: OperationKind,
        session: Arc<SessionHandle>,
    ) -> Result<(), MeshError> {
        match operation {
            OperationKind::FileRead { path } => self.file_read(&session, &path).await,
            OperationKind::FileWrite { path, size } => {
                self.file_write(&session, &path, size).await
            }
            OperationKind::Terminal { shell } => self.terminal(&session, shell.as_deref()).await,
            OperationKind::PortForward { port } => self.port_forward(&session, port).await,
        }
    }
}

/// Shuttle bytes between a session and a duplex stream until both sides end
///
/// Each direction ends on its own: EOF from the stream half-closes the
/// session, and end of the session shuts down the stream's write side.
pub async fn pipe_stream<S>(session: &SessionHandle, stream: S) -> Result<(), MeshError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let outbound = async {
        forward_output(session, reader).await?;
        session.shutdown_write().await
    };
    tokio::try_join!(outbound, forward_input(session, writer))?;
    Ok(())
}

/// Session bytes into `file`, bounded by the declared size
async fn receive_file(
    session: &SessionHandle,
    file: &mut File,
    path: &str,
    size: Option<u64>,
) -> Result<u64, MeshError> {
    let mut written: u64 = 0;
    while let Some(data) = session.read().await? {
        written += data.len() as u64;
        if let Some(limit) = size.filter(|limit| written > *limit) {
            return Err(MeshError::Validation(format!(
                "{} exceeds declared size of {} bytes",
                path, limit
            )));
        }
        file.write_all(&data).await?;
    }
    file.flush().await?;

    if let Some(limit) = size.filter(|limit| written < *limit) {
        return Err(MeshError::Io(format!(
            "{} truncated: {} of {} bytes",
            path, written, limit
        )));
    }
    Ok(written)
}

/// Local reader into the session
async fn forward_output<R>(session: &SessionHandle, mut reader: R) -> Result<(), MeshError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; session.max_frame_size()];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        session.write(&buf[..n]).await?;
    }
}

/// Session into a local writer
async fn forward_input<W>(session: &SessionHandle, mut writer: W) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = session.read().await? {
        writer.write_all(&data).await?;
    }
    writer.shutdown().await?;
    Ok(())
}
