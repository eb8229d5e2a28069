//! End-to-end scenarios against a single-node, in-memory `Metastore`:
//! exactly the client-observable request sequences a protocol adapter would
//! drive, run here directly against the library surface instead.

use std::time::Duration;

use metastore::store::open_in_memory_single_node;
use metastore::{MetastoreError, NodeConfig};

fn config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.shard_count = 4;
    config.lease.check_interval = Duration::from_millis(50);
    config
}

#[async_std::test]
async fn s1_put_then_scan_reports_create_and_mod_revisions() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"a", b"1", 0).await.unwrap();
    store.put(b"b", b"2", 0).await.unwrap();

    let result = store
        .get_range(b"", b"\0", 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();

    assert_eq!(result.kvs.len(), 2);
    assert_eq!(result.kvs[0].key, b"a");
    assert_eq!(result.kvs[0].create_revision, 1);
    assert_eq!(result.kvs[0].mod_revision, 1);
    assert_eq!(result.kvs[0].version, 1);
    assert_eq!(result.kvs[1].key, b"b");
    assert_eq!(result.kvs[1].create_revision, 2);
    assert_eq!(result.header.revision, 2);
}

#[async_std::test]
async fn s2_repeated_put_bumps_version_and_keeps_create_revision() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"k", b"v1", 0).await.unwrap();
    store.put(b"k", b"v2", 0).await.unwrap();

    let result = store
        .get_range(b"k", &[], 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();

    assert_eq!(result.kvs.len(), 1);
    let kv = &result.kvs[0];
    assert_eq!(kv.value, b"v2");
    assert_eq!(kv.create_revision, 1);
    assert_eq!(kv.mod_revision, 2);
    assert_eq!(kv.version, 2);
    assert_eq!(result.header.revision, 2);
}

#[async_std::test]
async fn s3_put_after_delete_resets_create_revision_and_version() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"k", b"v", 0).await.unwrap();
    store.delete_range(b"k", &[]).await.unwrap();
    store.put(b"k", b"v2", 0).await.unwrap();

    let result = store
        .get_range(b"k", &[], 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();

    assert_eq!(result.kvs.len(), 1);
    let kv = &result.kvs[0];
    assert_eq!(kv.value, b"v2");
    assert_eq!(kv.create_revision, 3);
    assert_eq!(kv.mod_revision, 3);
    assert_eq!(kv.version, 1);
}

#[async_std::test]
async fn s4_lease_expiry_cascades_key_deletion_and_notifies_watchers() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    let (_, lease_id, _) = store.lease_grant(Duration::from_secs(1), None).await.unwrap();

    let (_, rx) = store.create_watch(b"k".to_vec(), None, 1).await.unwrap();

    store.put(b"k", b"v", lease_id).await.unwrap();

    let first = async_std::future::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match first {
        metastore::watch::WatchMessage::Event(event) => {
            // `LeaseGrant` consumes rev=1 on its own, so this Put lands at
            // rev=2.
            assert_eq!(event.rev, 2);
            assert_eq!(event.kv.value, b"v");
        }
        other => panic!("unexpected message: {:?}", other),
    }

    // The lease-expiry loop polls every 50ms (see `config()`); a 1s TTL
    // leaves ample margin over both the poll interval and the raft apply
    // loop's own latency.
    async_std::task::sleep(Duration::from_secs(2)).await;

    let second = async_std::future::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match second {
        metastore::watch::WatchMessage::Event(event) => {
            assert_eq!(event.rev, 3);
        }
        other => panic!("unexpected message: {:?}", other),
    }

    let result = store
        .get_range(b"k", &[], 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();
    assert!(result.kvs.is_empty());
}

#[async_std::test]
async fn s5_watch_replays_history_then_delivers_live_events_in_order() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"a", b"1", 0).await.unwrap();

    let (_, rx) = store.create_watch(b"a".to_vec(), None, 1).await.unwrap();

    let first = async_std::future::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match first {
        metastore::watch::WatchMessage::Event(event) => {
            assert_eq!(event.kv.value, b"1");
            assert_eq!(event.kv.mod_revision, 1);
        }
        other => panic!("unexpected message: {:?}", other),
    }

    store.put(b"a", b"2", 0).await.unwrap();

    let second = async_std::future::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    match second {
        metastore::watch::WatchMessage::Event(event) => {
            assert_eq!(event.kv.value, b"2");
            assert_eq!(event.kv.mod_revision, 2);
            assert_eq!(event.prev_kv.unwrap().value, b"1");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[async_std::test]
async fn s6_txn_compares_mod_revision_and_runs_then_branch() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"x", b"1", 0).await.unwrap();

    let txn = metastore::txn::Txn {
        compares: vec![metastore::txn::Compare {
            target: metastore::txn::CompareTarget::ModRevision,
            key: b"x".to_vec(),
            result: metastore::txn::CompareResult::Equal,
            operand: metastore::txn::CompareOperand::Int(1),
        }],
        then_ops: vec![metastore::txn::Op::Put {
            key: b"x".to_vec(),
            value: b"2".to_vec(),
            lease_id: 0,
        }],
        else_ops: vec![metastore::txn::Op::Put {
            key: b"x".to_vec(),
            value: b"3".to_vec(),
            lease_id: 0,
        }],
    };

    let (_, result) = store.txn(txn).await.unwrap();
    assert!(result.succeeded);

    let get = store
        .get_range(b"x", &[], 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();
    assert_eq!(get.kvs[0].value, b"2");
    assert_eq!(get.kvs[0].mod_revision, 2);
}

#[async_std::test]
async fn s8_bounded_delete_range_only_removes_keys_in_the_range() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"a", b"1", 0).await.unwrap();
    store.put(b"b", b"2", 0).await.unwrap();
    store.put(b"c", b"3", 0).await.unwrap();

    // `range_end = b"c"` bounds the delete to `[a, c)`, leaving `c` itself
    // untouched; an empty `range_end` would instead address only `a`.
    let (_, deleted, _) = store.delete_range(b"a", b"c").await.unwrap();
    assert_eq!(deleted, 2);

    let remaining = store
        .get_range(b"", b"\0", 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();
    assert_eq!(remaining.kvs.len(), 1);
    assert_eq!(remaining.kvs[0].key, b"c");
}

#[async_std::test]
async fn s9_single_key_delete_leaves_other_keys_untouched() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"a", b"1", 0).await.unwrap();
    store.put(b"b", b"2", 0).await.unwrap();

    let (_, deleted, prev_kvs) = store.delete_range(b"a", &[]).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(prev_kvs[0].key, b"a");

    let remaining = store
        .get_range(b"", b"\0", 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();
    assert_eq!(remaining.kvs.len(), 1);
    assert_eq!(remaining.kvs[0].key, b"b");
}

#[async_std::test]
async fn s7_compact_makes_old_revisions_unreadable_but_keeps_live_state() {
    let store = open_in_memory_single_node(config()).await.unwrap();

    store.put(b"a", b"1", 0).await.unwrap();
    store.put(b"b", b"2", 0).await.unwrap();
    store.compact(2).await.unwrap();

    let err = store
        .get_range(b"a", &[], 1, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap_err();
    match err.downcast_ref::<MetastoreError>().expect("should be a MetastoreError") {
        MetastoreError::Compacted { requested, compact_rev } => {
            assert_eq!(*requested, 1);
            assert_eq!(*compact_rev, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let live = store
        .get_range(b"a", &[], 0, 0, metastore::mvcc::SortOrder::Ascend, false)
        .await
        .unwrap();
    assert_eq!(live.kvs[0].value, b"1");
}
