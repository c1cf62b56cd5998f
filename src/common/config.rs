//! Configuration for a nodemesh node

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`NODEMESH_CLUSTER_ADDR=...`).
pub const ENV_PREFIX: &str = "NODEMESH";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listener dedicated to inter-node cluster traffic
    #[serde(default = "default_cluster_addr")]
    pub cluster_addr: SocketAddr,

    /// Address other nodes should dial; defaults to the bound listener address
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Directory for persisted node state. `None` keeps it in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Inbound/outbound identity exchange timeout
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// How long the onboarding coordinator waits for each phase ACK
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_ms: u64,

    /// SYNCING window after ONB5_2 before a joining node gives up (DOWN)
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// How long the transaction master waits for participant ACKs
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_ms: u64,

    /// Dispatcher worker permits (0 = available cores)
    #[serde(default)]
    pub worker_threads: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cluster_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 10113))
}
fn default_handshake_timeout() -> u64 {
    5_000
}
fn default_phase_timeout() -> u64 {
    30_000
}
fn default_sync_timeout() -> u64 {
    30
}
fn default_commit_timeout() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster_addr: default_cluster_addr(),
            advertise_addr: None,
            data_dir: None,
            handshake_timeout_ms: default_handshake_timeout(),
            phase_timeout_ms: default_phase_timeout(),
            sync_timeout_secs: default_sync_timeout(),
            commit_timeout_ms: default_commit_timeout(),
            worker_threads: 0,
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional TOML file, then `NODEMESH_*` environment variables.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let conf = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize::<NodeConfig>()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "handshake_timeout_ms must be > 0".into(),
            ));
        }
        if self.sync_timeout_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "sync_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Effective worker permit count.
    pub fn workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            crate::common::utils::available_workers()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let conf = NodeConfig::default();
        assert_eq!(conf.cluster_addr.port(), 10113);
        assert_eq!(conf.sync_timeout(), Duration::from_secs(30));
        assert!(conf.workers() >= 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "cluster_addr = \"127.0.0.1:7000\"").unwrap();
        writeln!(file, "sync_timeout_secs = 5").unwrap();
        writeln!(file, "worker_threads = 3").unwrap();
        drop(file);

        let conf = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(conf.cluster_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(conf.sync_timeout_secs, 5);
        assert_eq!(conf.workers(), 3);
        assert_eq!(conf.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_config() {
        let conf = NodeConfig {
            sync_timeout_secs: 0,
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }
}
