//! C9 state-machine snapshot: the opaque byte payload carried inside
//! `raft::StateMachineSnapshot::data`. `applied_index`/`term`/`conf_state`
//! are tracked by the raft layer itself (§4.9); this module only owns the
//! state-machine-specific half: `{current_rev, compact_rev, live
//! KeyValues, leases}` (§3 "Snapshot").

use std::time::Instant;

use common::errors::*;
use serde::{Deserialize, Serialize};

use crate::lease::{LeaseManager, LeaseSnapshot};
use crate::mvcc::MvccStore;
use crate::revision::{KeyValue, Rev};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub current_rev: Rev,
    pub compact_rev: Rev,
    pub kvs: Vec<KeyValue>,
    pub leases: Vec<LeaseSnapshot>,
}

impl SnapshotPayload {
    /// Captures a consistent point-in-time view of C3+C5, per §4.9.
    /// Concurrent mutations do not affect the snapshot once captured,
    /// since `MvccStore::snapshot_iter` is taken under the store's
    /// whole-step read guard.
    pub async fn capture(mvcc: &MvccStore, leases: &LeaseManager, now: Instant) -> Self {
        Self {
            current_rev: mvcc.current_rev(),
            compact_rev: mvcc.compact_rev(),
            kvs: mvcc.snapshot_iter().await,
            leases: leases.snapshot(now).await,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| err_msg(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            // The bootstrap snapshot (§4.2, §4.9) is a non-nil, empty
            // payload: an empty keyspace at revision 0, not an error.
            return Ok(Self {
                current_rev: 0,
                compact_rev: 0,
                kvs: vec![],
                leases: vec![],
            });
        }
        bincode::deserialize(bytes).map_err(|e| err_msg(e.to_string()))
    }

    /// Installs this snapshot, atomically replacing whatever state existed
    /// before (§4.3 `restore`, §9 "lease deadlines ... recomputed against
    /// this node's own monotonic clock").
    pub async fn restore(&self, mvcc: &MvccStore, leases: &LeaseManager, now: Instant) -> Result<()> {
        mvcc.restore(self.kvs.clone()).await?;
        mvcc.restore_revisions(self.current_rev, self.compact_rev);
        leases.restore(self.leases.clone(), now).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn empty_bootstrap_snapshot_decodes_without_error() {
        let payload = SnapshotPayload::decode(&[]).unwrap();
        assert_eq!(payload.current_rev, 0);
        assert!(payload.kvs.is_empty());
    }

    #[async_std::test]
    async fn capture_then_restore_round_trips_live_state() {
        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();

        let rev = mvcc.next_rev();
        let step = mvcc.begin_step().await;
        mvcc.put_at(&step, b"a", b"1".to_vec(), 0, rev, &leases).await.unwrap();
        drop(step);

        let now = Instant::now();
        let payload = SnapshotPayload::capture(&mvcc, &leases, now).await;
        let bytes = payload.encode().unwrap();
        let decoded = SnapshotPayload::decode(&bytes).unwrap();

        let mvcc2 = MvccStore::new(4);
        let leases2 = LeaseManager::new();
        decoded.restore(&mvcc2, &leases2, now).await.unwrap();

        assert_eq!(mvcc2.current_rev(), 1);
        let (kvs, _) = mvcc2.get_range(b"a", &[], 0, 0, crate::mvcc::SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].value, b"1");
    }
}
