//! A single-cluster, strongly-consistent metadata store: an MVCC key-value
//! engine with leases, watches, and transactions, replicated by the `raft`
//! crate and backed by the `storage` engine trait.

pub mod config;
pub mod encoding;
pub mod error;
pub mod key_ranges;
pub mod lease;
pub mod mvcc;
pub mod revision;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod table_key;
pub mod txn;
pub mod watch;

pub use config::NodeConfig;
pub use error::{MetastoreError, WatchCancelReason};
pub use revision::{Header, KeyValue, Rev};
pub use store::{open_in_memory_single_node, GetRangeResult, Metastore};
