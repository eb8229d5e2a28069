use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_std::sync::RwLock;
use common::errors::*;
use storage::{Engine, MemoryEngine, WriteBatch};

use crate::error::MetastoreError;
use crate::lease::LeaseManager;
use crate::revision::{Header, KeyValue, Rev};
use crate::table_key;

pub const DEFAULT_SHARD_COUNT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascend,
    Descend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub ty: WatchEventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
    pub rev: Rev,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    rev: Rev,
    value: Option<Vec<u8>>,
    create_revision: Rev,
    version: u64,
    lease_id: u64,
}

struct Shard {
    engine: Box<dyn Engine>,
    history: RwLock<BTreeMap<Vec<u8>, VecDeque<HistoryEntry>>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            engine: Box::new(MemoryEngine::new()),
            history: RwLock::new(BTreeMap::new()),
        }
    }

    async fn push_history(&self, key: &[u8], entry: HistoryEntry) {
        self.history.write().await.entry(key.to_vec()).or_default().push_back(entry);
    }
}

/// C3: holds the applied state. Keys are partitioned into a fixed number of
/// shards by a deterministic hash (recommended 512); `current_rev` lives
/// outside any single shard so the apply pipeline can bump it once per
/// step before touching shards, which need not coordinate with each other
/// to preserve monotonicity.
///
/// `step_lock` is the "single seqlock-style guard" the spec allows as an
/// alternative to per-shard lock ordering: a multi-shard mutation (delete
/// range, transaction, lease cascade) holds it as a writer for the
/// duration of the whole step, and any reader spanning multiple shards
/// (range scans, HashKV) holds it as a reader while it gathers a
/// consistent snapshot across those shards. This keeps cross-shard
/// atomicity simple without forcing every caller to compute and sort a
/// lock-acquisition order.
pub struct MvccStore {
    shards: Vec<Shard>,
    current_rev: AtomicU64,
    compact_rev: AtomicU64,
    step_lock: RwLock<()>,
}

/// Proof that the whole-step write lock is held, threaded through every
/// mutation call that belongs to the same apply step.
pub struct StepGuard<'a>(async_std::sync::RwLockWriteGuard<'a, ()>);

/// Proof that the whole-step lock is held as a reader, for a caller that
/// needs a consistent multi-call snapshot (e.g. a watch's historical
/// replay followed by its subscription registration) rather than a single
/// atomic read.
pub struct ReadStepGuard<'a>(#[allow(dead_code)] async_std::sync::RwLockReadGuard<'a, ()>);

fn shard_index(key: &[u8], shard_count: usize) -> usize {
    (crc32fast::hash(key) as usize) % shard_count
}

impl MvccStore {
    pub fn new(shard_count: usize) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard::new());
        }
        Self {
            shards,
            current_rev: AtomicU64::new(0),
            compact_rev: AtomicU64::new(0),
            step_lock: RwLock::new(()),
        }
    }

    pub fn current_rev(&self) -> Rev {
        self.current_rev.load(Ordering::SeqCst)
    }

    pub fn compact_rev(&self) -> Rev {
        self.compact_rev.load(Ordering::SeqCst)
    }

    /// Restores `current_rev`/`compact_rev` from a loaded snapshot header,
    /// bypassing the normal one-per-step increment used during live
    /// operation.
    pub fn restore_revisions(&self, current_rev: Rev, compact_rev: Rev) {
        self.current_rev.store(current_rev, Ordering::SeqCst);
        self.compact_rev.store(compact_rev, Ordering::SeqCst);
    }

    /// Assigns the next revision for a mutating apply step. Called exactly
    /// once per step by the apply pipeline, before any shard is touched.
    pub fn next_rev(&self) -> Rev {
        self.current_rev.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[shard_index(key, self.shards.len())]
    }

    async fn read_live(&self, shard: &Shard, key: &[u8]) -> Option<KeyValue> {
        let physical = table_key::user_key(key);
        shard.engine.get(&physical).await.and_then(|bytes| bincode::deserialize(&bytes).ok())
    }

    /// Acquires the whole-step write guard: every mutation belonging to one
    /// apply step (a Put, a multi-key DeleteRange, a Txn branch, a lease
    /// cascade) must happen while this guard is held, so that a reader
    /// spanning multiple shards (`get_range`, `hash_kv`) can never observe
    /// the step half-applied.
    pub async fn begin_step(&self) -> StepGuard<'_> {
        StepGuard(self.step_lock.write().await)
    }

    /// Acquires the whole-step lock as a reader: blocks out any concurrent
    /// apply step for as long as the guard is held, without blocking other
    /// concurrent readers. Used by the watch hub to hold `history_from`'s
    /// snapshot and the watcher's subsequent registration under one guard,
    /// so no mutation can land in the gap between the two and be missed by
    /// both replay and live broadcast.
    pub async fn begin_read_step(&self) -> ReadStepGuard<'_> {
        ReadStepGuard(self.step_lock.read().await)
    }

    pub async fn put_at(&self, _guard: &StepGuard<'_>, key: &[u8], value: Vec<u8>, lease_id: u64, rev: Rev, leases: &LeaseManager) -> Result<Option<KeyValue>> {
        let shard = self.shard_for(key);
        let prev = self.read_live(shard, key).await;

        let (create_revision, version) = match &prev {
            Some(kv) if kv.version > 0 => (kv.create_revision, kv.version + 1),
            _ => (rev, 1),
        };

        let new_kv = KeyValue {
            key: key.to_vec(),
            value,
            create_revision,
            mod_revision: rev,
            version,
            lease_id,
        };

        let mut batch = WriteBatch::with_sequence(rev);
        batch.put(table_key::user_key(key), bincode::serialize(&new_kv).map_err(|e| err_msg(e.to_string()))?);
        shard
            .engine
            .write(batch)
            .await
            .map_err(|e| MetastoreError::StorageError(e.to_string()))?;

        shard
            .push_history(
                key,
                HistoryEntry {
                    rev,
                    value: Some(new_kv.value.clone()),
                    create_revision,
                    version,
                    lease_id,
                },
            )
            .await;

        if let Some(prev_kv) = &prev {
            if prev_kv.lease_id != 0 && prev_kv.lease_id != lease_id {
                leases.detach(prev_kv.lease_id, key).await;
            }
        }
        if lease_id != 0 {
            leases.attach(lease_id, key).await?;
        }

        Ok(prev)
    }

    /// Deletes every live key in `[key, range_end)` (or just `key` if
    /// `range_end` is empty) at `rev`, returning the previous live record
    /// for each deleted key so the caller can build watch events.
    pub async fn delete_range_at(&self, _guard: &StepGuard<'_>, key: &[u8], range_end: &[u8], rev: Rev, leases: &LeaseManager) -> Result<Vec<KeyValue>> {
        let physical_start = table_key::user_key(key);
        let physical_end = table_key::user_key_range_end(key, range_end);

        let mut deleted = vec![];
        for shard in &self.shards {
            let snapshot = shard.engine.snapshot().await;
            let matches: Vec<(Vec<u8>, Vec<u8>)> = snapshot.iter_range(&physical_start, &physical_end).collect();
            if matches.is_empty() {
                continue;
            }

            let mut batch = WriteBatch::with_sequence(rev);
            for (physical_key, raw) in matches {
                let prev_kv: KeyValue = match bincode::deserialize(&raw) {
                    Ok(kv) => kv,
                    Err(_) => continue,
                };
                batch.delete(physical_key);
                shard
                    .push_history(
                        &prev_kv.key,
                        HistoryEntry {
                            rev,
                            value: None,
                            create_revision: 0,
                            version: 0,
                            lease_id: 0,
                        },
                    )
                    .await;
                if prev_kv.lease_id != 0 {
                    leases.detach(prev_kv.lease_id, &prev_kv.key).await;
                }
                deleted.push(prev_kv);
            }
            if !batch.is_empty() {
                shard
                    .engine
                    .write(batch)
                    .await
                    .map_err(|e| MetastoreError::StorageError(e.to_string()))?;
            }
        }

        Ok(deleted)
    }

    /// `range_end` follows etcd's convention: empty addresses exactly
    /// `key`, `[0]` addresses `key` through the end of the namespace,
    /// anything else is a normal exclusive upper bound. `rev == 0` reads
    /// live state; otherwise reads the given historical revision, subject
    /// to `compact_rev`.
    pub async fn get_range(
        &self,
        key: &[u8],
        range_end: &[u8],
        rev: Rev,
        limit: usize,
        sort_order: SortOrder,
        keys_only: bool,
    ) -> Result<(Vec<KeyValue>, Rev)> {
        let _guard = self.step_lock.read().await;
        self.get_range_inner(key, range_end, rev, limit, sort_order, keys_only).await
    }

    /// Same as `get_range`, but for a caller that already holds the
    /// step-lock as a writer (a transaction's compare stage or a `GetRange`
    /// nested inside a txn's ops) -- `step_lock` is a plain, non-reentrant
    /// `RwLock`, so re-acquiring it as a reader from the same task while
    /// the write guard is still held would deadlock forever. The passed
    /// `StepGuard` proves the lock is already held for the duration of this
    /// call.
    pub async fn get_range_locked(
        &self,
        _guard: &StepGuard<'_>,
        key: &[u8],
        range_end: &[u8],
        rev: Rev,
        limit: usize,
        sort_order: SortOrder,
        keys_only: bool,
    ) -> Result<(Vec<KeyValue>, Rev)> {
        self.get_range_inner(key, range_end, rev, limit, sort_order, keys_only).await
    }

    async fn get_range_inner(
        &self,
        key: &[u8],
        range_end: &[u8],
        rev: Rev,
        limit: usize,
        sort_order: SortOrder,
        keys_only: bool,
    ) -> Result<(Vec<KeyValue>, Rev)> {
        let served_rev = if rev == 0 { self.current_rev() } else { rev };
        if rev != 0 {
            let compact_rev = self.compact_rev();
            if rev < compact_rev {
                return Err(MetastoreError::Compacted {
                    requested: rev,
                    compact_rev,
                }
                .into());
            }
            if rev > self.current_rev() {
                return Err(MetastoreError::Unavailable(format!("revision {} not yet applied", rev)).into());
            }
        }

        let physical_start = table_key::user_key(key);
        let physical_end = table_key::user_key_range_end(key, range_end);

        // Each shard's own iterator is already key-sorted (a `BTreeMap`
        // underneath); stitch the per-shard contributions back into one
        // globally sorted sequence with `merge_by` rather than collecting
        // everything unsorted and sorting once at the end, mirroring the
        // teacher's own sorted-merge idiom for combining per-source results.
        let mut results: Vec<KeyValue> = vec![];
        if rev == 0 {
            for shard in &self.shards {
                let snapshot = shard.engine.snapshot().await;
                let mut shard_results: Vec<KeyValue> = vec![];
                for (_physical_key, raw) in snapshot.iter_range(&physical_start, &physical_end) {
                    if let Ok(mut kv) = bincode::deserialize::<KeyValue>(&raw) {
                        if keys_only {
                            kv.value.clear();
                        }
                        shard_results.push(kv);
                    }
                }
                results = common::algorithms::merge_by(results, shard_results, |a, b| a.key.cmp(&b.key));
            }
        } else {
            for shard in &self.shards {
                let history = shard.history.read().await;
                let mut shard_results: Vec<KeyValue> = vec![];
                for (user_key, events) in history.range(key.to_vec()..) {
                    if range_end.is_empty() {
                        if user_key.as_slice() != key {
                            break;
                        }
                    } else if range_end != [0] && user_key.as_slice() >= range_end {
                        break;
                    }
                    if let Some(entry) = events.iter().rev().find(|e| e.rev <= served_rev) {
                        if let Some(value) = &entry.value {
                            shard_results.push(KeyValue {
                                key: user_key.clone(),
                                value: if keys_only { vec![] } else { value.clone() },
                                create_revision: entry.create_revision,
                                mod_revision: entry.rev,
                                version: entry.version,
                                lease_id: entry.lease_id,
                            });
                        }
                    }
                }
                drop(history);
                results = common::algorithms::merge_by(results, shard_results, |a, b| a.key.cmp(&b.key));
            }
        }

        if sort_order == SortOrder::Descend {
            results.reverse();
        }
        if limit > 0 && results.len() > limit {
            results.truncate(limit);
        }

        Ok((results, served_rev))
    }

    /// Replays every committed mutation event for keys in `[key,
    /// range_end)` with `rev >= from_rev`, in `(rev, key)` order. Used by
    /// the watch hub to deliver missed history to a newly created watcher
    /// with a historical `start_revision` before switching it onto the
    /// live broadcast path (§4.4): unlike `get_range` at a single past
    /// revision, this walks each key's retained version history so a
    /// watcher sees every intermediate mutation it missed, not just the
    /// end state as of `from_rev`.
    pub async fn history_from(&self, _guard: &ReadStepGuard<'_>, key: &[u8], range_end: &[u8], from_rev: Rev) -> Vec<WatchEvent> {
        let mut events = vec![];
        for shard in &self.shards {
            let history = shard.history.read().await;
            for (user_key, entries) in history.range(key.to_vec()..) {
                if range_end.is_empty() {
                    if user_key.as_slice() != key {
                        break;
                    }
                } else if range_end != [0] && user_key.as_slice() >= range_end {
                    break;
                }

                for entry in entries.iter().filter(|e| e.rev >= from_rev) {
                    let (ty, value) = match &entry.value {
                        Some(v) => (WatchEventType::Put, v.clone()),
                        None => (WatchEventType::Delete, vec![]),
                    };
                    events.push(WatchEvent {
                        ty,
                        kv: KeyValue {
                            key: user_key.clone(),
                            value,
                            create_revision: entry.create_revision,
                            mod_revision: entry.rev,
                            version: entry.version,
                            lease_id: entry.lease_id,
                        },
                        prev_kv: None,
                        rev: entry.rev,
                    });
                }
            }
        }

        events.sort_by(|a, b| a.rev.cmp(&b.rev).then_with(|| a.kv.key.cmp(&b.kv.key)));
        events
    }

    pub fn header(&self, cluster_id: u64, raft_term: u64) -> Header {
        Header {
            cluster_id,
            revision: self.current_rev(),
            raft_term,
        }
    }

    /// Advances `compact_rev` and drops history strictly below it. Callers
    /// (the watch hub) are responsible for cancelling watchers whose
    /// `start_revision` falls below the new bound.
    pub async fn compact(&self, up_to_rev: Rev) -> Result<Rev> {
        let _guard = self.step_lock.write().await;
        let mut compact_rev = self.compact_rev.load(Ordering::SeqCst);
        if up_to_rev > compact_rev {
            compact_rev = up_to_rev;
            self.compact_rev.store(compact_rev, Ordering::SeqCst);
        }

        for shard in &self.shards {
            let mut history = shard.history.write().await;
            history.retain(|_key, events| {
                while events.len() > 1 && events[1].rev <= compact_rev {
                    events.pop_front();
                }
                if let Some(front) = events.front() {
                    if front.rev < compact_rev && front.value.is_none() {
                        events.pop_front();
                    }
                }
                !events.is_empty()
            });
        }

        Ok(compact_rev)
    }

    /// CRC32 over all live `{key, value, mod_rev}` tuples at the current
    /// revision, in ascending key order so that any two replicas at the
    /// same applied index produce the same hash regardless of how their
    /// shards are laid out internally.
    pub async fn hash_kv(&self) -> Result<(u32, Rev, Rev)> {
        let _guard = self.step_lock.read().await;

        let mut all: BTreeMap<Vec<u8>, KeyValue> = BTreeMap::new();
        for shard in &self.shards {
            let snapshot = shard.engine.snapshot().await;
            for (_physical_key, raw) in snapshot.iter_range(&[], &[]) {
                if let Ok(kv) = bincode::deserialize::<KeyValue>(&raw) {
                    all.insert(kv.key.clone(), kv);
                }
            }
        }

        let mut hasher = crc32fast::Hasher::new();
        for (key, kv) in &all {
            hasher.update(key);
            hasher.update(&kv.value);
            hasher.update(&kv.mod_revision.to_be_bytes());
        }

        Ok((hasher.finalize(), self.current_rev(), self.compact_rev()))
    }

    /// A consistent iterator of all live records, for state-machine
    /// snapshotting (C9). Concurrent mutations do not affect the returned
    /// vector since it is materialized under the step read-guard.
    pub async fn snapshot_iter(&self) -> Vec<KeyValue> {
        let _guard = self.step_lock.read().await;
        let mut all = vec![];
        for shard in &self.shards {
            let snapshot = shard.engine.snapshot().await;
            for (_physical_key, raw) in snapshot.iter_range(&[], &[]) {
                if let Ok(kv) = bincode::deserialize::<KeyValue>(&raw) {
                    all.push(kv);
                }
            }
        }
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Installs a full set of live records, used when restoring from a
    /// snapshot. Replaces whatever state existed before.
    pub async fn restore(&self, records: Vec<KeyValue>) -> Result<()> {
        let _guard = self.step_lock.write().await;
        for shard in &self.shards {
            shard.history.write().await.clear();
        }
        for kv in records {
            let shard = self.shard_for(&kv.key);
            let mut batch = WriteBatch::with_sequence(kv.mod_revision);
            batch.put(table_key::user_key(&kv.key), bincode::serialize(&kv).map_err(|e| err_msg(e.to_string()))?);
            shard
                .engine
                .write(batch)
                .await
                .map_err(|e| MetastoreError::StorageError(e.to_string()))?;
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl From<MetastoreError> for common::errors::Error {
    fn from(e: MetastoreError) -> Self {
        err_msg(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;

    async fn put(store: &MvccStore, leases: &LeaseManager, key: &[u8], value: &[u8]) -> Rev {
        let rev = store.next_rev();
        let step = store.begin_step().await;
        store.put_at(&step, key, value.to_vec(), 0, rev, leases).await.unwrap();
        rev
    }

    #[async_std::test]
    async fn empty_range_end_reads_exactly_one_key() {
        let store = MvccStore::new(4);
        let leases = LeaseManager::new();
        put(&store, &leases, b"a", b"1").await;
        put(&store, &leases, b"b", b"2").await;

        let (kvs, _) = store.get_range(b"a", &[], 0, 0, SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, b"a");
    }

    #[async_std::test]
    async fn nul_range_end_reads_from_key_to_namespace_end() {
        let store = MvccStore::new(4);
        let leases = LeaseManager::new();
        put(&store, &leases, b"a", b"1").await;
        put(&store, &leases, b"b", b"2").await;
        put(&store, &leases, b"c", b"3").await;

        let (kvs, _) = store.get_range(b"b", &[0], 0, 0, SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[async_std::test]
    async fn bounded_range_end_excludes_the_boundary_key() {
        let store = MvccStore::new(4);
        let leases = LeaseManager::new();
        put(&store, &leases, b"a", b"1").await;
        put(&store, &leases, b"b", b"2").await;
        put(&store, &leases, b"c", b"3").await;

        let (kvs, _) = store.get_range(b"a", b"c", 0, 0, SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[async_std::test]
    async fn descending_sort_order_holds_across_shard_boundaries() {
        let store = MvccStore::new(8);
        let leases = LeaseManager::new();
        for k in [b"a", b"b", b"c", b"d", b"e"] {
            put(&store, &leases, k, b"x").await;
        }

        let (kvs, _) = store.get_range(b"", &[0], 0, 0, SortOrder::Descend, false).await.unwrap();
        let keys: Vec<u8> = kvs.iter().map(|kv| kv.key[0]).collect();
        let mut sorted_desc = keys.clone();
        sorted_desc.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(keys, sorted_desc);
    }

    #[async_std::test]
    async fn single_key_delete_leaves_neighboring_keys_live() {
        let store = MvccStore::new(4);
        let leases = LeaseManager::new();
        put(&store, &leases, b"a", b"1").await;
        put(&store, &leases, b"b", b"2").await;

        let rev = store.next_rev();
        let step = store.begin_step().await;
        let deleted = store.delete_range_at(&step, b"a", &[], rev, &leases).await.unwrap();
        drop(step);

        assert_eq!(deleted.len(), 1);
        let (kvs, _) = store.get_range(b"", &[0], 0, 0, SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, b"b");
    }

    #[async_std::test]
    async fn historical_read_of_empty_range_end_also_bounds_one_key() {
        let store = MvccStore::new(4);
        let leases = LeaseManager::new();
        let rev_a = put(&store, &leases, b"a", b"1").await;
        put(&store, &leases, b"b", b"2").await;

        let (kvs, _) = store.get_range(b"a", &[], rev_a, 0, SortOrder::Ascend, false).await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, b"a");
    }
}
