use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use common::errors::*;

use crate::batch::{WriteBatch, WriteOp};
use crate::engine::{Engine, EngineSnapshot};

struct Inner {
    data: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    sequence: u64,
}

/// An `Engine` backed entirely by an in-memory, copy-on-write map.
///
/// Writes clone the map only when a snapshot is still holding a reference
/// to the previous version (`Arc::make_mut`), so the common case of no
/// concurrent readers is a plain in-place mutation; a live snapshot simply
/// pins the old map's `Arc` until it's dropped. This gives point-in-time
/// snapshots at the cost of a full copy only when they overlap a write,
/// the same trade the teacher's embedded database makes for its own
/// snapshot reads.
pub struct MemoryEngine {
    inner: RwLock<Inner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                data: Arc::new(BTreeMap::new()),
                sequence: 0,
            }),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySnapshot {
    data: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    sequence: u64,
}

impl EngineSnapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn iter_range<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let lower = Bound::Included(start.to_vec());
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        Box::new(
            self.data
                .range::<Vec<u8>, _>((lower, upper))
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[async_trait::async_trait]
impl Engine for MemoryEngine {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().unwrap().data.get(key).cloned()
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let data = Arc::make_mut(&mut inner.data);
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
                WriteOp::DeleteRange { start, end } => {
                    let keys: Vec<Vec<u8>> = if end.is_empty() {
                        data.range(start..).map(|(k, _)| k.clone()).collect()
                    } else {
                        data.range(start..end).map(|(k, _)| k.clone()).collect()
                    };
                    for key in keys {
                        data.remove(&key);
                    }
                }
            }
        }
        inner.sequence = batch.sequence;
        Ok(())
    }

    async fn snapshot(&self) -> Box<dyn EngineSnapshot> {
        let inner = self.inner.read().unwrap();
        Box::new(MemorySnapshot {
            data: inner.data.clone(),
            sequence: inner.sequence,
        })
    }

    async fn last_flushed_sequence(&self) -> u64 {
        self.inner.read().unwrap().sequence
    }
}
