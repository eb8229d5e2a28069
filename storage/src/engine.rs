use common::errors::*;

use crate::batch::WriteBatch;

/// A point-in-time, immutable view of the keyspace. Readers iterate or
/// probe a snapshot without ever observing writes made after it was taken,
/// the same guarantee the teacher's `db.snapshot().await.iter()` gives the
/// metastore's `get`/`get_range`.
pub trait EngineSnapshot: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Iterates `[start, end)` in key order. `end.is_empty()` means
    /// unbounded (iterate to the end of the keyspace), matching the
    /// convention used for range queries throughout the keyspace.
    fn iter_range<'a>(&'a self, start: &[u8], end: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    fn sequence(&self) -> u64;
}

/// The storage engine backing a single MVCC shard (see `metastore`'s
/// sharded keyspace). Every mutating call takes a `WriteBatch` so that
/// multiple key changes belonging to the same revision land atomically.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    async fn write(&self, batch: WriteBatch) -> Result<()>;

    async fn snapshot(&self) -> Box<dyn EngineSnapshot>;

    /// The sequence number of the most recently applied `WriteBatch`. Used
    /// by the apply pipeline to resume applying after a restart without
    /// redoing work that already reached durable storage.
    async fn last_flushed_sequence(&self) -> u64;
}
