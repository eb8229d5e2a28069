use std::collections::HashMap;
use std::sync::Arc;

use async_std::sync::Mutex;
use common::errors::*;

use crate::types::{LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Set for a pre-vote round: the responder must not record this as a
    /// real vote, only answer whether it would grant one (§4.1's guard
    /// against a partitioned node bumping the cluster term pointlessly).
    pub pre_vote: bool,
}

#[derive(Debug, Clone)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Hint for the leader's next retry point on rejection: the index just
    /// past the end of the responder's log, so the leader can back off in
    /// one round trip instead of walking down one index at a time.
    pub conflict_index: LogIndex,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Abstracts the wire between raft peers. A production deployment would
/// implement this over an RPC client; tests and single-node deployments use
/// `LoopbackTransport`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, peer: NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

    async fn append_entries(&self, peer: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(&self, peer: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;
}

/// An in-process transport that dispatches directly to other `Node`
/// instances registered in the same address space. Used for single-node
/// deployments (where it never has any peers to call) and for in-process
/// multi-node tests.
pub struct LoopbackTransport {
    peers: Mutex<HashMap<NodeId, Arc<dyn LoopbackTarget>>>,
}

#[async_trait::async_trait]
pub trait LoopbackTarget: Send + Sync {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse;
    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;
    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse;
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, id: NodeId, target: Arc<dyn LoopbackTarget>) {
        self.peers.lock().await.insert(id, target);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn request_vote(&self, peer: NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let target = self
            .peers
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or_else(|| err_msg("unknown peer"))?;
        Ok(target.handle_request_vote(req).await)
    }

    async fn append_entries(&self, peer: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let target = self
            .peers
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or_else(|| err_msg("unknown peer"))?;
        Ok(target.handle_append_entries(req).await)
    }

    async fn install_snapshot(&self, peer: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let target = self
            .peers
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or_else(|| err_msg("unknown peer"))?;
        Ok(target.handle_install_snapshot(req).await)
    }
}
