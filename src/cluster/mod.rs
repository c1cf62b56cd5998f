//! Cluster membership, persisted node state and onboarding

pub mod config_store;
pub mod manager;
pub mod node;
pub mod onboarding;
pub mod store;

pub use config_store::{ConfigStore, MemConfigStore, SledConfigStore};
pub use manager::ClusterManager;
pub use node::{Member, NodeId, NodeInfo, NodeStatus};
pub use onboarding::Onboarding;
pub use store::{ClusterStore, LoadReporter};
