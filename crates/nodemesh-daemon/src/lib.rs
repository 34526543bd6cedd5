//! NodeMesh Daemon - tree-structured node mesh with tunneled operations
//!
//! This crate provides:
//! - The node registry and route resolution over the tree
//! - Propagation of node additions and removals down each subtree
//! - Authenticated, self-healing links to direct children
//! - Tunnel sessions that carry file, shell and port-forward traffic
//!   hop by hop along a route
//! - QUIC transport for links
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │   MeshNode   │  driver task + per-link readers
//!                 └──────┬───────┘
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//! ┌────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Registry  │  │ TunnelManager│  │ UploadManager│
//! │ (snapshots)│  │ (sessions,   │  │ (chunked     │
//! └─────┬──────┘  │  relays)     │  │  FileWrite)  │
//!       │         └──────┬───────┘  └──────────────┘
//!       ▼                ▼
//! ┌──────────────────────────────┐
//! │  ChildLinkPool + upstream    │  bounded LinkChannels
//! └──────────────┬───────────────┘
//!                ▼
//!        QUIC bridge (net)
//! ```
//!
//! Links are pairs of bounded channels; the QUIC bridge and the in-memory
//! [`link_pool::MemoryNetwork`] are interchangeable behind
//! [`link_pool::LinkConnector`].

pub mod forward;
pub mod handshake;
pub mod link_pool;
pub mod mesh;
pub mod net;
pub mod operations;
pub mod rate_limiter;
pub mod registry;
pub mod route;
pub mod tunnel;
pub mod upload;

pub use mesh::MeshNode;
pub use registry::{NodeEvent, NodeRegistry, NodeTable};
pub use tunnel::SessionHandle;
