use std::fmt;

/// Error taxonomy surfaced to the protocol adapter (§7). Every variant maps
/// to exactly one row of the spec's error table; the adapter is
/// responsible for translating these into wire-level status codes.
#[derive(Debug, Clone)]
pub enum MetastoreError {
    /// Read or watch requested a revision below `compact_rev`.
    Compacted { requested: u64, compact_rev: u64 },

    /// Log index below `first_index` or above `last_index`; no leader
    /// known.
    Unavailable(String),

    /// Proposal not committed, or read-index not acknowledged, within the
    /// configured bound.
    Timeout,

    LeaseNotFound { lease_id: u64 },

    LeaseExpired { lease_id: u64 },

    WatchCancelled { reason: WatchCancelReason },

    /// A durable write failed. This is always fatal for the node; the
    /// process should abort after logging rather than risk diverging from
    /// its peers.
    StorageError(String),

    /// Mutating proposal submitted on a non-leader node.
    NotLeader { leader_id: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCancelReason {
    ClientCancel,
    StreamClosed,
    Slow,
    Compacted,
    StoreCancelled,
}

impl fmt::Display for MetastoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetastoreError::Compacted { requested, compact_rev } => write!(
                f,
                "requested revision {} is compacted (compact_rev = {})",
                requested, compact_rev
            ),
            MetastoreError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            MetastoreError::Timeout => write!(f, "timeout"),
            MetastoreError::LeaseNotFound { lease_id } => write!(f, "lease {} not found", lease_id),
            MetastoreError::LeaseExpired { lease_id } => write!(f, "lease {} expired", lease_id),
            MetastoreError::WatchCancelled { reason } => write!(f, "watch cancelled: {:?}", reason),
            MetastoreError::StorageError(msg) => write!(f, "storage error: {}", msg),
            MetastoreError::NotLeader { leader_id } => write!(f, "not leader (leader_id = {:?})", leader_id),
        }
    }
}

impl std::error::Error for MetastoreError {}
