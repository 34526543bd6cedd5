//! Chunked uploads
//!
//! A client pushes a file to a remote node in pieces. The first chunk starts
//! an upload and gets a key; every later chunk carries that key and the byte
//! offset it continues from. Each upload rides one `FileWrite` session, so
//! chunk data streams straight to the target as it arrives. Uploads nobody
//! touches for the idle timeout are discarded by the sweeper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use nodemesh_core::crypto::{try_generate_key, StreamChecksum};
use nodemesh_core::{CloseReason, MeshError, NodeId};

use crate::tunnel::SessionHandle;

/// Progress reported after each chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes accepted so far
    pub received: u64,
    /// Whether this chunk finished the upload
    pub complete: bool,
    /// BLAKE3 of the whole upload, once complete
    pub checksum: Option<String>,
}

struct Progress {
    checksum: StreamChecksum,
    last_activity: Instant,
}

/// One open upload; the session sits outside the lock so an abort can
/// close it while a chunk is in flight
struct Upload {
    session: SessionHandle,
    target: NodeId,
    path: String,
    expected: Option<u64>,
    progress: Mutex<Progress>,
}

/// Open uploads keyed by their upload key
pub struct UploadManager {
    uploads: DashMap<String, Arc<Upload>>,
    idle_timeout: Duration,
}

impl UploadManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            uploads: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// Track a new upload over an open `FileWrite` session; returns its key
    pub fn register(
        &self,
        target: impl Into<NodeId>,
        path: impl Into<String>,
        expected: Option<u64>,
        session: SessionHandle,
    ) -> Result<String, MeshError> {
        let key = try_generate_key().map_err(|e| MeshError::Io(e.to_string()))?;
        let upload = Upload {
            session,
            target: target.into(),
            path: path.into(),
            expected,
            progress: Mutex::new(Progress {
                checksum: StreamChecksum::new(),
                last_activity: Instant::now(),
            }),
        };
        debug!("Upload {} started: {} on {}", key, upload.path, upload.target);
        self.uploads.insert(key.clone(), Arc::new(upload));
        Ok(key)
    }

    /// Append a chunk at `offset`; `is_end` finishes the upload
    pub async fn append(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
        is_end: bool,
    ) -> Result<UploadProgress, MeshError> {
        let upload = self
            .uploads
            .get(key)
            .map(|u| Arc::clone(&u))
            .ok_or(MeshError::SessionClosed)?;
        let mut progress = upload.progress.lock().await;
        // Aborted or closed by the target while this chunk waited
        if upload.session.state().is_terminal() {
            self.uploads.remove(key);
            return Err(upload.session.failure().unwrap_or(MeshError::SessionClosed));
        }

        let received = progress.checksum.len();
        if offset != received {
            return Err(MeshError::ChunkOutOfOrder {
                expected: received,
                actual: offset,
            });
        }
        if let Some(expected) = upload.expected {
            if received + data.len() as u64 > expected {
                drop(progress);
                self.abort(key, "upload exceeds its declared size");
                return Err(MeshError::Validation(format!(
                    "upload would exceed {} bytes",
                    expected
                )));
            }
        }

        if !data.is_empty() {
            if let Err(e) = upload.session.write(data).await {
                drop(progress);
                self.abort(key, &format!("lost its session: {}", e));
                return Err(e);
            }
            progress.checksum.update(data);
        }
        progress.last_activity = Instant::now();

        let received = progress.checksum.len();
        if !is_end {
            return Ok(UploadProgress {
                received,
                complete: false,
                checksum: None,
            });
        }

        upload.session.close();
        let checksum = hex::encode(progress.checksum.finalize());
        info!(
            "Upload {} of {} to {} complete ({} bytes)",
            key, upload.path, upload.target, received
        );
        drop(progress);
        self.uploads.remove(key);
        Ok(UploadProgress {
            received,
            complete: true,
            checksum: Some(checksum),
        })
    }

    /// Drop an upload and fail its session, even mid-chunk
    pub fn abort(&self, key: &str, reason: &str) -> bool {
        match self.uploads.remove(key) {
            Some((_, upload)) => {
                warn!("Upload {} aborted: {}", key, reason);
                upload
                    .session
                    .close_with(CloseReason::OperationFailed, Some(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// Discard uploads idle past the timeout; returns how many were dropped
    pub fn reap_idle(&self) -> usize {
        let stale: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .progress
                    .try_lock()
                    .is_ok_and(|p| p.last_activity.elapsed() >= self.idle_timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.abort(key, "idle timeout");
        }
        stale.len()
    }
}
