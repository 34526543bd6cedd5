//! NodeMesh Core - Shared types, wire protocol, configuration and token utilities
//!
//! This crate contains the foundational types used across all NodeMesh components.
//! It has no dependencies on networking or async runtime code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::{Config, ConfigError, MeshConfig, NodeConfig, ReconnectConfig, TunnelConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Largest data payload a single tunnel frame may carry
///
/// Leaves headroom under `MAX_MESSAGE_SIZE` for the frame envelope.
pub const MAX_FRAME_PAYLOAD: usize = MAX_MESSAGE_SIZE - 4096;

/// Default link listener port
pub const DEFAULT_PORT: u16 = 21090;
