use storage::{Engine, LogEngine, MemoryEngine, WriteBatch};

#[async_std::test]
async fn memory_engine_applies_puts_and_deletes_in_order() {
    let engine = MemoryEngine::new();

    let mut batch = WriteBatch::with_sequence(1);
    batch.put(b"a".to_vec(), b"1".to_vec());
    batch.put(b"b".to_vec(), b"2".to_vec());
    engine.write(batch).await.unwrap();

    let mut batch = WriteBatch::with_sequence(2);
    batch.delete(b"a".to_vec());
    engine.write(batch).await.unwrap();

    assert_eq!(engine.get(b"a").await, None);
    assert_eq!(engine.get(b"b").await, Some(b"2".to_vec()));
    assert_eq!(engine.last_flushed_sequence().await, 2);
}

#[async_std::test]
async fn snapshot_is_unaffected_by_later_writes() {
    let engine = MemoryEngine::new();

    let mut batch = WriteBatch::with_sequence(1);
    batch.put(b"k".to_vec(), b"v1".to_vec());
    engine.write(batch).await.unwrap();

    let snapshot = engine.snapshot().await;

    let mut batch = WriteBatch::with_sequence(2);
    batch.put(b"k".to_vec(), b"v2".to_vec());
    engine.write(batch).await.unwrap();

    assert_eq!(snapshot.get(b"k"), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"k").await, Some(b"v2".to_vec()));
}

#[async_std::test]
async fn delete_range_removes_only_the_bounded_keys() {
    let engine = MemoryEngine::new();

    let mut batch = WriteBatch::with_sequence(1);
    for k in ["a", "b", "c", "d"] {
        batch.put(k.as_bytes().to_vec(), b"x".to_vec());
    }
    engine.write(batch).await.unwrap();

    let mut batch = WriteBatch::with_sequence(2);
    batch.delete_range(b"b".to_vec(), b"d".to_vec());
    engine.write(batch).await.unwrap();

    assert_eq!(engine.get(b"a").await, Some(b"x".to_vec()));
    assert_eq!(engine.get(b"b").await, None);
    assert_eq!(engine.get(b"c").await, None);
    assert_eq!(engine.get(b"d").await, Some(b"x".to_vec()));
}

#[async_std::test]
async fn log_engine_recovers_state_after_reopen() {
    let dir = tempdir();

    {
        let engine = LogEngine::open(dir.path()).await.unwrap();
        let mut batch = WriteBatch::with_sequence(1);
        batch.put(b"k".to_vec(), b"v".to_vec());
        engine.write(batch).await.unwrap();
    }

    let reopened = LogEngine::open(dir.path()).await.unwrap();
    assert_eq!(reopened.get(b"k").await, Some(b"v".to_vec()));
    assert_eq!(reopened.last_flushed_sequence().await, 1);
}

fn tempdir() -> TempDir {
    TempDir::new()
}

struct TempDir {
    path: std::path::PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("storage-engine-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
