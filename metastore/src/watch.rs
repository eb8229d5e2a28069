use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_std::channel;
use async_std::sync::RwLock;
use async_std::task;
use common::errors::*;

use crate::error::WatchCancelReason;
use crate::key_ranges::KeyRanges;
use crate::mvcc::{MvccStore, WatchEvent};
use crate::revision::Rev;

/// Default bound on a watcher's delivery queue (spec recommends 128-1024
/// depending on watcher class; we pick the conservative end since this
/// store does not yet distinguish watcher classes).
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

pub const DEFAULT_SLOW_WATCHER_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum WatchMessage {
    Event(WatchEvent),
    Cancelled(WatchCancelReason),
}

fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}

/// Upper bound standing in for "no limit" in the watch range index: larger
/// than any key this store will realistically see.
fn unbounded_key_end() -> Vec<u8> {
    vec![0xff; 256]
}

/// Resolves a watch's `key_end` into a concrete upper bound for the range
/// index, using the same convention as `mvcc::get_range`'s `range_end`:
/// `None` covers exactly `key_start`, `Some([0])` is unbounded, anything
/// else is a normal exclusive upper bound.
fn resolve_key_end(key_start: &[u8], key_end: &Option<Vec<u8>>) -> Vec<u8> {
    match key_end {
        None => key_successor(key_start),
        Some(end) if end.as_slice() == [0] => unbounded_key_end(),
        Some(end) => end.clone(),
    }
}

struct WatcherEntry {
    key_start: Vec<u8>,
    key_end: Option<Vec<u8>>,
    start_revision: Rev,
    sender: channel::Sender<WatchMessage>,
    cancelled: Arc<AtomicBool>,
}

/// C4: subscription registry with slow-consumer isolation.
///
/// `ranges` indexes which watch ids cover a given key using the same
/// interval-splitting structure the point/prefix lock index in the
/// transaction layer uses; a mutation's single key is looked up with a
/// one-key-wide query (`[key, key's successor)`), so the cost of a
/// broadcast only touches watchers that actually overlap the mutated key
/// rather than every live subscription.
pub struct WatchHub {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, WatcherEntry>>,
    ranges: RwLock<KeyRanges<HashSet<u64>>>,
    slow_watcher_retry: Duration,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::with_retry_timeout(DEFAULT_SLOW_WATCHER_RETRY)
    }

    /// `retry_timeout` is the per-event bound on the bounded background
    /// retry described by §4.4 before a full queue's watcher is forcibly
    /// cancelled as slow; configurable via `NodeConfig::watch` (§5's
    /// "recommended 5s" is only the default).
    pub fn with_retry_timeout(retry_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            ranges: RwLock::new(KeyRanges::new()),
            slow_watcher_retry: retry_timeout,
        }
    }

    /// Registers a new watcher and, if `start_revision` is historical,
    /// replays missed events from `mvcc` before returning, so the caller's
    /// receiver sees history then live events in one unbroken total order.
    pub async fn create_watch(
        &self,
        mvcc: &MvccStore,
        key_start: Vec<u8>,
        key_end: Option<Vec<u8>>,
        start_revision: Rev,
        queue_capacity: usize,
    ) -> Result<(u64, channel::Receiver<WatchMessage>)> {
        let compact_rev = mvcc.compact_rev();
        if start_revision != 0 && start_revision < compact_rev {
            let (tx, rx) = channel::bounded(1);
            let _ = tx.try_send(WatchMessage::Cancelled(WatchCancelReason::Compacted));
            return Ok((0, rx));
        }

        let watch_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = channel::bounded(queue_capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));

        // Hold the whole-step lock as a reader across both the historical
        // replay and the subscription's registration: this blocks out any
        // concurrent apply step for the duration, so a mutation can never
        // land in the gap between "replay snapshot taken" and "watcher
        // registered in `ranges`" and be missed by both the replay and the
        // live broadcast path (§4.4's "history then live, total order").
        let step = mvcc.begin_read_step().await;

        // Historical replay is inclusive of `start_revision` itself: a
        // client that asks to watch from revision R expects to see the
        // mutation that produced R, not just whatever comes after it
        // (spec.md scenario S5). Walk the actual per-key version history
        // rather than re-deriving events from a single end-state snapshot
        // at `start_revision`, so a watcher that missed several mutations
        // to the same key sees every one of them, in order, not just the
        // most recent.
        if start_revision != 0 && start_revision <= mvcc.current_rev() {
            let range_end = key_end.clone().unwrap_or_default();
            for event in mvcc.history_from(&step, &key_start, &range_end, start_revision).await {
                if sender.try_send(WatchMessage::Event(event)).is_err() {
                    break;
                }
            }
        }

        self.entries.write().await.insert(
            watch_id,
            WatcherEntry {
                key_start: key_start.clone(),
                key_end: key_end.clone(),
                start_revision,
                sender,
                cancelled: cancelled.clone(),
            },
        );

        let end = resolve_key_end(&key_start, &key_end);
        self.ranges.write().await.range(key_start, end, |ids| {
            ids.insert(watch_id);
            true
        });

        drop(step);

        Ok((watch_id, receiver))
    }

    /// Cancels every live watcher whose `start_revision` has fallen below
    /// the new `compact_rev`, as required whenever history they might still
    /// need to replay is dropped (§4.3, §4.4).
    pub async fn cancel_compacted(&self, compact_rev: Rev) {
        let stale: Vec<u64> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.start_revision != 0 && entry.start_revision < compact_rev)
            .map(|(id, _)| *id)
            .collect();

        for watch_id in stale {
            self.cancel(watch_id, WatchCancelReason::Compacted).await;
        }
    }

    pub async fn cancel(&self, watch_id: u64, reason: WatchCancelReason) {
        let entry = self.entries.write().await.remove(&watch_id);
        if let Some(entry) = entry {
            if entry.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = entry.sender.try_send(WatchMessage::Cancelled(reason));
            let end = resolve_key_end(&entry.key_start, &entry.key_end);
            self.ranges.write().await.range(entry.key_start, end, |ids| {
                ids.remove(&watch_id);
                !ids.is_empty()
            });
        }
    }

    /// Delivers a single mutation's event to every watcher whose range
    /// covers its key. Never blocks: a full queue gets a bounded background
    /// retry, and a watcher that is still behind after the retry window is
    /// force-cancelled as "slow" rather than stalling the apply pipeline.
    pub async fn broadcast(self: &Arc<Self>, event: WatchEvent) {
        let key = event.kv.key.clone();
        let successor = key_successor(&key);

        let mut matched = HashSet::new();
        self.ranges.write().await.range(key, successor, |ids| {
            matched.extend(ids.iter().copied());
            !ids.is_empty()
        });

        if matched.is_empty() {
            return;
        }

        let entries = self.entries.read().await;
        for watch_id in matched {
            let Some(entry) = entries.get(&watch_id) else {
                continue;
            };
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }

            if entry.sender.try_send(WatchMessage::Event(event.clone())).is_ok() {
                continue;
            }

            let sender = entry.sender.clone();
            let cancelled = entry.cancelled.clone();
            let hub = self.clone();
            let event = event.clone();
            let retry_timeout = self.slow_watcher_retry;
            task::spawn(async move {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let delivered = async_std::future::timeout(retry_timeout, sender.send(WatchMessage::Event(event))).await;

                match delivered {
                    Ok(Ok(())) => {}
                    _ => hub.cancel(watch_id, WatchCancelReason::Slow).await,
                }
            });
        }
    }
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::{MvccStore, WatchEventType};
    use crate::revision::KeyValue;

    fn event(key: &[u8], rev: Rev) -> WatchEvent {
        WatchEvent {
            ty: WatchEventType::Put,
            kv: KeyValue {
                key: key.to_vec(),
                value: vec![],
                create_revision: rev,
                mod_revision: rev,
                version: 1,
                lease_id: 0,
            },
            prev_kv: None,
            rev,
        }
    }

    #[async_std::test]
    async fn single_key_watch_ignores_events_on_other_keys() {
        let mvcc = MvccStore::new(4);
        let hub = Arc::new(WatchHub::new());
        let (_, rx) = hub.create_watch(&mvcc, b"a".to_vec(), None, 0, 8).await.unwrap();

        hub.broadcast(event(b"b", 1)).await;
        hub.broadcast(event(b"a", 2)).await;

        match rx.recv().await.unwrap() {
            WatchMessage::Event(e) => assert_eq!(e.rev, 2),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[async_std::test]
    async fn unbounded_watch_covers_every_key_from_start() {
        let mvcc = MvccStore::new(4);
        let hub = Arc::new(WatchHub::new());
        let (_, rx) = hub.create_watch(&mvcc, b"b".to_vec(), Some(vec![0]), 0, 8).await.unwrap();

        hub.broadcast(event(b"a", 1)).await;
        hub.broadcast(event(b"b", 2)).await;
        hub.broadcast(event(b"z", 3)).await;

        match rx.recv().await.unwrap() {
            WatchMessage::Event(e) => assert_eq!(e.rev, 2),
            other => panic!("unexpected message: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            WatchMessage::Event(e) => assert_eq!(e.rev, 3),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[async_std::test]
    async fn historical_start_revision_replays_every_missed_mutation_in_order() {
        use crate::lease::LeaseManager;

        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();

        // Three puts to the same key before any watch exists: a watcher
        // created with start_revision=1 must see all three, in rev order,
        // not just the end state as of revision 1.
        for value in [b"1".as_slice(), b"2", b"3"] {
            let rev = mvcc.next_rev();
            let step = mvcc.begin_step().await;
            mvcc.put_at(&step, b"a", value.to_vec(), 0, rev, &leases).await.unwrap();
        }
        assert_eq!(mvcc.current_rev(), 3);

        let hub = Arc::new(WatchHub::new());
        let (_, rx) = hub.create_watch(&mvcc, b"a".to_vec(), None, 1, 8).await.unwrap();

        for expected_rev in 1..=3 {
            match rx.recv().await.unwrap() {
                WatchMessage::Event(e) => {
                    assert_eq!(e.rev, expected_rev);
                    assert_eq!(e.kv.value, expected_rev.to_string().into_bytes());
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[async_std::test]
    async fn start_revision_equal_to_current_rev_still_replays_its_own_mutation() {
        use crate::lease::LeaseManager;

        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();
        let rev = mvcc.next_rev();
        let step = mvcc.begin_step().await;
        mvcc.put_at(&step, b"a", b"1".to_vec(), 0, rev, &leases).await.unwrap();
        drop(step);
        assert_eq!(rev, mvcc.current_rev());

        let hub = Arc::new(WatchHub::new());
        let (_, rx) = hub.create_watch(&mvcc, b"a".to_vec(), None, rev, 8).await.unwrap();

        match rx.recv().await.unwrap() {
            WatchMessage::Event(e) => assert_eq!(e.rev, rev),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[async_std::test]
    async fn bounded_watch_excludes_the_boundary_key() {
        let mvcc = MvccStore::new(4);
        let hub = Arc::new(WatchHub::new());
        let (_, rx) = hub.create_watch(&mvcc, b"a".to_vec(), Some(b"c".to_vec()), 0, 8).await.unwrap();

        hub.broadcast(event(b"c", 1)).await;
        hub.broadcast(event(b"b", 2)).await;

        match rx.recv().await.unwrap() {
            WatchMessage::Event(e) => assert_eq!(e.rev, 2),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
