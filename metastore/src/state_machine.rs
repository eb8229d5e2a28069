//! C7: the single, serial consumer of the committed-entry stream. Bridges
//! `raft::StateMachine` (the `ApplyFacade` of spec.md §9) to the MVCC
//! store, lease manager, transaction evaluator and watch hub, and doubles
//! as the pending-proposal side of C10: each applied entry resolves the
//! local waiter registered under its `seq_num`, if this node is the one
//! that proposed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_std::channel;
use async_std::sync::Mutex;
use common::errors::*;
use raft::{LogIndex, StateMachineSnapshot as RaftSnapshot, Term};

use crate::encoding::{self, Op};
use crate::lease::LeaseManager;
use crate::mvcc::{MvccStore, SortOrder, WatchEvent, WatchEventType};
use crate::revision::{KeyValue, Rev};
use crate::snapshot::SnapshotPayload;
use crate::txn::{self, TxnResult};
use crate::watch::WatchHub;

/// The effect of a single applied entry, as needed by the client-facing
/// call that proposed it (C10 resolves its waiter with one of these). Does
/// not carry `raft_term`/`cluster_id`: those are known to the proposer
/// (from its own `PendingExecutionResult`), not to the apply pipeline.
#[derive(Debug, Clone)]
pub enum ApplyResult {
    Put {
        revision: Rev,
        prev_kv: Option<KeyValue>,
    },
    DeleteRange {
        revision: Rev,
        deleted: u64,
        prev_kvs: Vec<KeyValue>,
    },
    Txn {
        revision: Rev,
        result: TxnResult,
    },
    LeaseGrant {
        revision: Rev,
        lease_id: u64,
        ttl_millis: u64,
    },
    LeaseRevoke {
        revision: Rev,
    },
    LeaseKeepAlive {
        revision: Rev,
        ttl_millis: u64,
    },
    Compact {
        revision: Rev,
        compact_rev: Rev,
    },
}

pub struct EmbeddedStateMachine {
    mvcc: MvccStore,
    leases: LeaseManager,
    watch_hub: Arc<WatchHub>,
    applied_index: AtomicU64,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, channel::Sender<Result<ApplyResult>>>>,
}

impl EmbeddedStateMachine {
    pub fn new(shard_count: usize) -> Arc<Self> {
        Self::with_watch_retry_timeout(shard_count, crate::watch::DEFAULT_SLOW_WATCHER_RETRY)
    }

    pub fn with_watch_retry_timeout(shard_count: usize, watch_slow_retry: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            mvcc: MvccStore::new(shard_count),
            leases: LeaseManager::new(),
            watch_hub: Arc::new(WatchHub::with_retry_timeout(watch_slow_retry)),
            applied_index: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn mvcc(&self) -> &MvccStore {
        &self.mvcc
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn watch_hub(&self) -> &Arc<WatchHub> {
        &self.watch_hub
    }

    pub fn applied_index(&self) -> LogIndex {
        LogIndex(self.applied_index.load(Ordering::SeqCst))
    }

    /// Assigns the next node-local proposal sequence number (C10 step 1).
    /// Never persisted: proposals that outlive a restart are orphaned and
    /// simply apply with no local waiter, which is the documented, correct
    /// behavior (§4.10).
    pub fn next_seq_num(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers a waiter for `seq_num` (C10 step 2). Returns a receiver
    /// that resolves when the apply pipeline processes the matching entry.
    pub async fn register_waiter(&self, seq_num: u64) -> channel::Receiver<Result<ApplyResult>> {
        let (tx, rx) = channel::bounded(1);
        self.pending.lock().await.insert(seq_num, tx);
        rx
    }

    /// Removes a waiter without resolving it: used on timeout/cancellation.
    /// The proposal itself is not retracted from the log (§4.10) -- it may
    /// still apply, finding no waiter, which is harmless.
    pub async fn cancel_waiter(&self, seq_num: u64) {
        self.pending.lock().await.remove(&seq_num);
    }

    async fn resolve(&self, seq_num: u64, result: Result<ApplyResult>) {
        if let Some(sender) = self.pending.lock().await.remove(&seq_num) {
            let _ = sender.try_send(result);
        }
    }

    async fn apply_entry(&self, op: &Op) -> Result<ApplyResult> {
        match op {
            Op::Put { key, value, lease_id } => {
                let rev = self.mvcc.next_rev();
                let step = self.mvcc.begin_step().await;
                let prev = self.mvcc.put_at(&step, key, value.clone(), *lease_id, rev, &self.leases).await?;
                let event = WatchEvent {
                    ty: WatchEventType::Put,
                    kv: KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(rev),
                        mod_revision: rev,
                        version: prev.as_ref().map(|p| p.version + 1).unwrap_or(1),
                        lease_id: *lease_id,
                    },
                    prev_kv: prev.clone(),
                    rev,
                };
                drop(step);
                self.watch_hub.broadcast(event).await;
                Ok(ApplyResult::Put { revision: rev, prev_kv: prev })
            }
            Op::DeleteRange { key, range_end } => {
                let rev = self.mvcc.next_rev();
                let step = self.mvcc.begin_step().await;
                let deleted = self.mvcc.delete_range_at(&step, key, range_end, rev, &self.leases).await?;
                drop(step);
                for prev_kv in &deleted {
                    self.watch_hub
                        .broadcast(WatchEvent {
                            ty: WatchEventType::Delete,
                            kv: KeyValue {
                                key: prev_kv.key.clone(),
                                value: vec![],
                                create_revision: 0,
                                mod_revision: rev,
                                version: 0,
                                lease_id: 0,
                            },
                            prev_kv: Some(prev_kv.clone()),
                            rev,
                        })
                        .await;
                }
                Ok(ApplyResult::DeleteRange {
                    revision: rev,
                    deleted: deleted.len() as u64,
                    prev_kvs: deleted,
                })
            }
            Op::Txn(payload) => {
                let parsed = encoding::payload_to_txn(payload)?;
                let rev = self.mvcc.next_rev();
                let (result, events) = txn::execute_txn(&self.mvcc, &self.leases, &parsed, rev).await?;
                for event in events {
                    self.watch_hub.broadcast(event).await;
                }
                Ok(ApplyResult::Txn { revision: rev, result })
            }
            Op::LeaseGrant { ttl_millis, requested_id } => {
                let lease_id = self
                    .leases
                    .grant(std::time::Duration::from_millis(*ttl_millis), *requested_id, Instant::now())
                    .await?;
                // A grant is itself a revision-consuming step (§8 S4: the
                // Put that follows a grant lands at rev=2, not rev=1), even
                // though it never touches the keyspace.
                let rev = self.mvcc.next_rev();
                Ok(ApplyResult::LeaseGrant {
                    revision: rev,
                    lease_id,
                    ttl_millis: *ttl_millis,
                })
            }
            Op::LeaseRevoke { lease_id } => {
                // Cascading delete of all attached keys happens as one
                // atomic apply step sharing a single new revision (§4.5).
                // Revoking a lease that is already gone (e.g. it expired
                // and was already cascaded by an earlier entry racing this
                // one) is a no-op, not an error: a well-formed apply path
                // never fails mid-step.
                let keys = match self.leases.revoke(*lease_id).await {
                    Some(keys) if !keys.is_empty() => keys,
                    _ => {
                        return Ok(ApplyResult::LeaseRevoke {
                            revision: self.mvcc.current_rev(),
                        })
                    }
                };

                let rev = self.mvcc.next_rev();
                let mut events = vec![];
                {
                    let step = self.mvcc.begin_step().await;
                    for key in keys {
                        let deleted = self.mvcc.delete_range_at(&step, &key, &[], rev, &self.leases).await?;
                        for prev_kv in deleted {
                            events.push(WatchEvent {
                                ty: WatchEventType::Delete,
                                kv: KeyValue {
                                    key: prev_kv.key.clone(),
                                    value: vec![],
                                    create_revision: 0,
                                    mod_revision: rev,
                                    version: 0,
                                    lease_id: 0,
                                },
                                prev_kv: Some(prev_kv),
                                rev,
                            });
                        }
                    }
                }
                for event in events {
                    self.watch_hub.broadcast(event).await;
                }
                Ok(ApplyResult::LeaseRevoke { revision: rev })
            }
            Op::LeaseKeepAlive { lease_id, new_ttl_millis } => {
                let ttl = self
                    .leases
                    .keep_alive(*lease_id, new_ttl_millis.map(std::time::Duration::from_millis), Instant::now())
                    .await?;
                Ok(ApplyResult::LeaseKeepAlive {
                    revision: self.mvcc.current_rev(),
                    ttl_millis: ttl.as_millis() as u64,
                })
            }
            Op::Compact { up_to_rev } => {
                let compact_rev = self.mvcc.compact(*up_to_rev).await?;
                self.watch_hub.cancel_compacted(compact_rev).await;
                Ok(ApplyResult::Compact {
                    revision: self.mvcc.current_rev(),
                    compact_rev,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl raft::StateMachine for EmbeddedStateMachine {
    async fn apply(&self, index: LogIndex, op: &[u8]) -> Result<()> {
        let entry = encoding::decode(op)?;
        let result = self.apply_entry(&entry.op).await;
        self.applied_index.store(index.value(), Ordering::SeqCst);
        self.resolve(entry.seq_num, result).await;
        Ok(())
    }

    async fn last_flushed(&self) -> LogIndex {
        self.applied_index()
    }

    async fn wait_for_flush(&self, index: LogIndex) {
        while self.applied_index().value() < index.value() {
            async_std::task::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    async fn snapshot(&self) -> Option<RaftSnapshot> {
        let payload = SnapshotPayload::capture(&self.mvcc, &self.leases, Instant::now()).await;
        let data = payload.encode().ok()?;
        Some(RaftSnapshot {
            applied_index: self.applied_index(),
            term: Term::ZERO,
            conf_state: raft::ConfState::default(),
            data,
        })
    }

    async fn restore(&self, snapshot: RaftSnapshot) -> Result<()> {
        let payload = SnapshotPayload::decode(&snapshot.data)?;
        payload.restore(&self.mvcc, &self.leases, Instant::now()).await?;
        self.applied_index.store(snapshot.applied_index.value(), Ordering::SeqCst);
        Ok(())
    }
}

/// Serves a (possibly historical) range read directly against the MVCC
/// store. Exists here, rather than only in `store.rs`, so unit tests in
/// this module can exercise the apply path and read it back without
/// pulling in the raft node.
#[cfg(test)]
pub(crate) async fn test_get(sm: &EmbeddedStateMachine, key: &[u8]) -> Option<KeyValue> {
    sm.mvcc
        .get_range(key, &[], 0, 1, SortOrder::Ascend, false)
        .await
        .ok()
        .and_then(|(kvs, _)| kvs.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Entry;

    #[async_std::test]
    async fn put_then_get_reflects_the_write() {
        let sm = EmbeddedStateMachine::new(4);
        let entry = Entry {
            seq_num: 1,
            op: Op::Put {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                lease_id: 0,
            },
        };
        sm.apply(LogIndex(1), &encoding::encode(&entry).unwrap()).await.unwrap();

        let kv = test_get(&sm, b"a").await.unwrap();
        assert_eq!(kv.value, b"1");
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 1);
        assert_eq!(kv.version, 1);
        assert_eq!(sm.applied_index(), LogIndex(1));
    }

    #[async_std::test]
    async fn lease_revoke_cascades_key_deletion_in_one_step() {
        let sm = EmbeddedStateMachine::new(4);
        let lease_id = sm.leases.grant(std::time::Duration::from_secs(60), None, Instant::now()).await.unwrap();

        let put = Entry {
            seq_num: 1,
            op: Op::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                lease_id,
            },
        };
        sm.apply(LogIndex(1), &encoding::encode(&put).unwrap()).await.unwrap();
        assert!(test_get(&sm, b"k").await.is_some());

        let revoke = Entry {
            seq_num: 2,
            op: Op::LeaseRevoke { lease_id },
        };
        sm.apply(LogIndex(2), &encoding::encode(&revoke).unwrap()).await.unwrap();

        assert!(test_get(&sm, b"k").await.is_none());
        assert_eq!(sm.mvcc.current_rev(), 2);
    }

    #[async_std::test]
    async fn proposal_waiter_resolves_on_apply() {
        let sm = EmbeddedStateMachine::new(4);
        let seq = sm.next_seq_num();
        let rx = sm.register_waiter(seq).await;

        let entry = Entry {
            seq_num: seq,
            op: Op::Put {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                lease_id: 0,
            },
        };
        sm.apply(LogIndex(1), &encoding::encode(&entry).unwrap()).await.unwrap();

        match rx.recv().await.unwrap().unwrap() {
            ApplyResult::Put { revision, .. } => assert_eq!(revision, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
