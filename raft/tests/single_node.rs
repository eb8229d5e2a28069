use std::sync::Arc;
use std::time::Duration;

use async_std::sync::Mutex;
use common::errors::*;
use raft::{LogIndex, LoopbackTransport, MemLogStore, Node, NodeOptions, PendingExecutionResult, StateMachineSnapshot};

struct RecordingStateMachine {
    applied: Mutex<Vec<(LogIndex, Vec<u8>)>>,
}

impl RecordingStateMachine {
    fn new() -> Self {
        Self {
            applied: Mutex::new(vec![]),
        }
    }
}

#[async_trait::async_trait]
impl raft::StateMachine for RecordingStateMachine {
    async fn apply(&self, index: LogIndex, op: &[u8]) -> Result<()> {
        self.applied.lock().await.push((index, op.to_vec()));
        Ok(())
    }

    async fn last_flushed(&self) -> LogIndex {
        self.applied
            .lock()
            .await
            .last()
            .map(|(index, _)| *index)
            .unwrap_or(LogIndex::ZERO)
    }

    async fn wait_for_flush(&self, _index: LogIndex) {}

    async fn snapshot(&self) -> Option<StateMachineSnapshot> {
        None
    }

    async fn restore(&self, _snapshot: StateMachineSnapshot) -> Result<()> {
        Ok(())
    }
}

#[async_std::test]
async fn single_node_becomes_leader_immediately() {
    let log = Arc::new(MemLogStore::new());
    let sm = Arc::new(RecordingStateMachine::new());
    let transport = Arc::new(LoopbackTransport::new());

    let node = Node::create(NodeOptions::default(), log, sm, transport).await.unwrap();

    // Quorum of one cluster member is itself; no election round trip needed.
    assert!(node.currently_leader().await.is_ok());
}

#[async_std::test]
async fn single_node_commits_proposals_without_peers() {
    let log = Arc::new(MemLogStore::new());
    let sm = Arc::new(RecordingStateMachine::new());
    let transport = Arc::new(LoopbackTransport::new());

    let node = Node::create(NodeOptions::default(), log, sm.clone(), transport).await.unwrap();
    let bundle = node.run();

    let pending = node.propose(b"hello".to_vec()).await.unwrap();
    let result = async_std::future::timeout(Duration::from_secs(2), pending.wait())
        .await
        .expect("proposal should resolve quickly in a single-node cluster");

    match result {
        PendingExecutionResult::Committed { log_index, .. } => assert_eq!(log_index, LogIndex(1)),
        PendingExecutionResult::Cancelled => panic!("proposal was cancelled"),
    }

    let applied = sm.applied.lock().await;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1, b"hello");

    drop(bundle);
}

#[async_std::test]
async fn begin_read_lease_fast_path_after_self_election() {
    let log = Arc::new(MemLogStore::new());
    let sm = Arc::new(RecordingStateMachine::new());
    let transport = Arc::new(LoopbackTransport::new());

    let node = Node::create(NodeOptions::default(), log, sm, transport).await.unwrap();
    let read_index = node.begin_read(true).await.unwrap();
    assert_eq!(read_index.index(), LogIndex::ZERO);
}
