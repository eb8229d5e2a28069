use common::errors::*;

use crate::types::{LogIndex, StateMachineSnapshot};

/// The `ApplyFacade` counterpart to `ConsensusFacade` (see `node.rs`):
/// injected into a `Node` so that the consensus core never needs to know
/// about MVCC revisions, watch fan-out, or lease bookkeeping, and the state
/// machine never needs to know about elections or log replication.
///
/// `apply` is always called in strictly increasing `index` order by a
/// single serial driver (the apply pipeline); implementations do not need
/// to be reentrant-safe across concurrent calls, only safe to call
/// concurrently with reads.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: LogIndex, op: &[u8]) -> Result<()>;

    /// Index of the highest entry durably reflected in the state machine.
    /// Used to decide how far the log can be compacted and where replay
    /// should resume after a restart.
    async fn last_flushed(&self) -> LogIndex;

    async fn wait_for_flush(&self, index: LogIndex);

    /// Produces a point-in-time snapshot for transfer to a lagging
    /// follower. Returns `None` if the state machine has nothing applied
    /// yet (a brand new node need not snapshot anything).
    async fn snapshot(&self) -> Option<StateMachineSnapshot>;

    /// Installs a snapshot received from the leader, atomically replacing
    /// whatever state existed before. Must never be called concurrently
    /// with `apply`.
    async fn restore(&self, snapshot: StateMachineSnapshot) -> Result<()>;
}
