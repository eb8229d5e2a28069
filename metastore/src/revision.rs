use serde::{Deserialize, Serialize};

/// A strictly-monotonic point-in-time marker for the whole keyspace. One
/// apply step (a single Put, a single DeleteRange, one Txn outcome, one
/// lease-cascade batch) consumes exactly one revision.
pub type Rev = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: Rev,
    pub mod_revision: Rev,
    pub version: u64,
    pub lease_id: u64,
}

/// Response envelope attached to every operation, carrying the revision at
/// which it was served.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub cluster_id: u64,
    pub revision: Rev,
    pub raft_term: u64,
}
