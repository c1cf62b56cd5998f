//! # nodemesh
//!
//! Coordination core of a clustered data store:
//! - Line-framed TCP connections between nodes with an identity handshake
//! - Cluster membership with persisted node identity
//! - Multi-phase onboarding of new nodes (schema, system tables, procedures)
//! - Soft-commit / commit / rollback across every member
//! - Predicate-filtered bulk delete on the local node
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────── Node A ────────────┐
//!        │  ClusterManager   Transactions │
//!        │        │               │       │
//!        │   Onboarding      MasterStore  │
//!        │        └──── Dispatcher ───────┤◄── loopback (self sends)
//!        │                 ▲              │
//!        │      ConnectionRegistry        │
//!        └───────┬─────────────────┬──────┘
//!                │ one line = one  │
//!                │ JSON message    │
//!           ┌────▼────┐       ┌────▼────┐
//!           │ Node B  │◄─────►│ Node C  │
//!           └─────────┘       └─────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a standalone node
//! ```bash
//! nodemesh-node serve --listen 0.0.0.0:10114 --data ./node-b
//! ```
//!
//! ### Create a cluster and onboard the standalone node into it
//! ```bash
//! nodemesh-node serve --listen 0.0.0.0:10113 --data ./node-a \
//!   --create-cluster --add-node 127.0.0.1:10114
//! ```

#![allow(clippy::result_large_err)]

pub mod bulk;
pub mod cluster;
pub mod common;
pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod txn;

// Re-export commonly used types
pub use cluster::{ClusterManager, ClusterStore, NodeId, NodeStatus};
pub use common::{Error, ErrorCode, NodeConfig, Result};
pub use server::{ClusterNode, Collaborators};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
