//! Node configuration (ambient): loaded programmatically for library/test
//! use, or from a small TOML file for the `metastore` binary, the way the
//! teacher's `MetastoreConfig` is built up and then extended here with one
//! sub-struct per component that the spec calls out as having a tunable
//! (§4.4, §4.5, §4.7, §4.8, §4.9, §4.10).

use std::path::PathBuf;
use std::time::Duration;

use common::errors::*;
use serde::{Deserialize, Serialize};

use crate::mvcc::DEFAULT_SHARD_COUNT;
use crate::watch::DEFAULT_QUEUE_CAPACITY;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchOptions {
    pub queue_capacity: usize,
    #[serde(with = "duration_millis")]
    pub slow_watcher_retry: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            slow_watcher_retry: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseOptions {
    #[serde(with = "duration_millis")]
    pub min_ttl: Duration,
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            min_ttl: crate::lease::MIN_TTL,
            check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Opt-in batching of consecutive same-type entries from one commit
    /// batch (§4.7); disabled in tests that want to assert one apply call
    /// per committed entry.
    pub batch_puts: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { batch_puts: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOptions {
    #[serde(with = "duration_millis")]
    pub election_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_millis")]
    pub clock_drift_margin: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(100),
            clock_drift_margin: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOptions {
    pub chunk_size: usize,
    /// Number of applied entries between periodic snapshots; 0 disables
    /// the periodic trigger (on-demand snapshotting for joining followers
    /// still works).
    pub applied_index_interval: u64,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            applied_index_interval: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalOptions {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for ProposalOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u64,
    pub cluster_id: u64,
    pub dir: PathBuf,
    pub peers: Vec<u64>,
    pub shard_count: usize,
    #[serde(default)]
    pub watch: WatchOptions,
    #[serde(default)]
    pub lease: LeaseOptions,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub read: ReadOptions,
    #[serde(default)]
    pub snapshot: SnapshotOptions,
    #[serde(default)]
    pub proposal: ProposalOptions,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster_id: 1,
            dir: PathBuf::from("data"),
            peers: vec![],
            shard_count: DEFAULT_SHARD_COUNT,
            watch: WatchOptions::default(),
            lease: LeaseOptions::default(),
            apply: ApplyOptions::default(),
            read: ReadOptions::default(),
            snapshot: SnapshotOptions::default(),
            proposal: ProposalOptions::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a config from a minimal TOML file. Parsing the file format
    /// itself is ambient infrastructure (§6 scopes the *protocol* wire
    /// format out, not this); unknown fields fall back to `Default`.
    pub fn load_toml(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| format_err!("failed to read config {:?}: {}", path, e))?;
        toml::from_str(&text).map_err(|e| format_err!("failed to parse config {:?}: {}", path, e))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = NodeConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.shard_count, config.shard_count);
        assert_eq!(parsed.proposal.timeout, config.proposal.timeout);
    }
}
