use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::channel;
use async_std::sync::Mutex;
use async_std::task;
use common::errors::*;
use rand::Rng;

use crate::log::LogStore;
use crate::state_machine::StateMachine;
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, LoopbackTarget,
    RequestVoteRequest, RequestVoteResponse, Transport,
};
use crate::types::{
    ConfState, HardState, LogEntry, LogIndex, NodeId, NodeStatus, PendingExecutionResult, RaftState, ReadIndex, Term,
};

#[derive(Clone)]
pub struct NodeOptions {
    pub node_id: NodeId,
    pub cluster_id: u64,
    pub peers: Vec<NodeId>,
    pub election_timeout: (Duration, Duration),
    pub heartbeat_interval: Duration,
    /// Safety margin subtracted from the leader-lease duration to absorb
    /// clock drift between nodes (§4.8). Never lets the lease duration fall
    /// to zero or below on a pathological configuration.
    pub clock_drift_margin: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            cluster_id: 1,
            peers: vec![],
            election_timeout: (Duration::from_millis(300), Duration::from_millis(600)),
            heartbeat_interval: Duration::from_millis(100),
            clock_drift_margin: Duration::from_millis(100),
        }
    }
}

/// Leader-lease duration per §4.8:
/// `min(election_timeout/2, heartbeat_interval * 3) - clock_drift_margin`,
/// floored so a pathological configuration never yields a zero or negative
/// lease.
fn lease_duration(election_timeout: (Duration, Duration), heartbeat_interval: Duration, clock_drift_margin: Duration) -> Duration {
    const FLOOR: Duration = Duration::from_millis(10);
    let election_bound = election_timeout.0 / 2;
    let heartbeat_bound = heartbeat_interval * 3;
    let raw = if heartbeat_bound < election_bound { heartbeat_bound } else { election_bound };
    raw.checked_sub(clock_drift_margin).filter(|d| *d >= FLOOR).unwrap_or(FLOOR)
}

#[derive(Default, Clone, Copy)]
struct PeerProgress {
    next_index: LogIndex,
    match_index: LogIndex,
}

struct NodeState {
    role: RaftState,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    peers_progress: HashMap<NodeId, PeerProgress>,
    votes_received: HashSet<NodeId>,
    pre_votes_received: HashSet<NodeId>,
    election_deadline: Instant,
    last_quorum_ack: Instant,
    leader_lease_until: Option<Instant>,
}

/// A single raft consensus participant.
///
/// This is the `ConsensusFacade` side of the dual-trait injection: `Node`
/// owns elections, log replication, and commit tracking, and drives a
/// caller-supplied `StateMachine` (the `ApplyFacade`) strictly in commit
/// order. Neither side owns the other, which is what lets the state
/// machine also expose its own facade back to callers (e.g. for reads)
/// without a reference cycle.
///
/// Single-node clusters are not a special case: with zero peers, quorum is
/// `1`, so a node satisfies its own quorum the instant it votes for itself.
pub struct Node<S> {
    id: NodeId,
    cluster_id: u64,
    peer_ids: Vec<NodeId>,
    election_timeout: (Duration, Duration),
    heartbeat_interval: Duration,
    clock_drift_margin: Duration,
    transport: Arc<dyn Transport>,
    log: Arc<dyn LogStore>,
    state_machine: Arc<S>,
    state: Mutex<NodeState>,
    pending: Mutex<HashMap<u64, Vec<channel::Sender<PendingExecutionResult>>>>,
    apply_wake: (channel::Sender<()>, channel::Receiver<()>),
}

pub struct PendingProposal {
    log_index: LogIndex,
    term: Term,
    receiver: channel::Receiver<PendingExecutionResult>,
}

impl PendingProposal {
    pub fn log_index(&self) -> LogIndex {
        self.log_index
    }

    pub async fn wait(self) -> PendingExecutionResult {
        self.receiver
            .recv()
            .await
            .unwrap_or(PendingExecutionResult::Cancelled)
    }
}

fn random_election_timeout(range: (Duration, Duration)) -> Duration {
    let lo = range.0.as_millis() as u64;
    let hi = range.1.as_millis() as u64;
    let millis = if hi > lo {
        rand::thread_rng().gen_range(lo..hi)
    } else {
        lo
    };
    Duration::from_millis(millis)
}

impl<S: StateMachine + 'static> Node<S> {
    pub async fn create(
        options: NodeOptions,
        log: Arc<dyn LogStore>,
        state_machine: Arc<S>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let hard_state = log.load_hard_state().await;
        let now = Instant::now();

        let mut peers_progress = HashMap::new();
        for peer in &options.peers {
            peers_progress.insert(*peer, PeerProgress::default());
        }

        let node = Arc::new(Self {
            id: options.node_id,
            cluster_id: options.cluster_id,
            peer_ids: options.peers.clone(),
            election_timeout: options.election_timeout,
            heartbeat_interval: options.heartbeat_interval,
            clock_drift_margin: options.clock_drift_margin,
            transport,
            log,
            state_machine,
            state: Mutex::new(NodeState {
                role: RaftState::Follower,
                current_term: hard_state.term,
                voted_for: hard_state.voted_for,
                commit_index: hard_state.commit_index,
                last_applied: LogIndex::ZERO,
                leader_id: None,
                peers_progress,
                votes_received: HashSet::new(),
                pre_votes_received: HashSet::new(),
                election_deadline: now + random_election_timeout(options.election_timeout),
                last_quorum_ack: now,
                leader_lease_until: None,
            }),
            pending: Mutex::new(HashMap::new()),
            apply_wake: channel::bounded(1),
        });

        if node.peer_ids.is_empty() {
            // A cluster of one satisfies its own quorum immediately; there
            // is no useful follower period to wait out.
            node.become_leader().await;
        }

        Ok(node)
    }

    fn quorum(&self) -> usize {
        (self.peer_ids.len() + 1) / 2 + 1
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            node_id: self.id,
            cluster_id: self.cluster_id,
            term: state.current_term,
            leader_id: state.leader_id,
            state: state.role,
            applied_index: state.last_applied,
            commit_index: state.commit_index,
        }
    }

    pub async fn currently_leader(&self) -> Result<Term> {
        let state = self.state.lock().await;
        if state.role == RaftState::Leader {
            Ok(state.current_term)
        } else {
            Err(err_msg("not the leader"))
        }
    }

    /// Spawns the background tasks that keep this node alive: the
    /// election/heartbeat ticker and the serial apply loop. Returns a
    /// bundle the caller joins on for the node's lifetime.
    pub fn run(self: &Arc<Self>) -> common::bundle::TaskBundle {
        let mut bundle = common::bundle::TaskBundle::new();

        let tick_node = self.clone();
        bundle.add("raft-tick", async move {
            loop {
                tick_node.tick().await;
                task::sleep(Duration::from_millis(20)).await;
            }
        });

        let apply_node = self.clone();
        bundle.add("raft-apply", async move {
            apply_node.apply_loop().await;
        });

        bundle
    }

    async fn tick(&self) {
        let now = Instant::now();
        let (role, should_elect, should_heartbeat) = {
            let mut state = self.state.lock().await;
            match state.role {
                RaftState::Leader => {
                    let due = now >= state.last_quorum_ack + self.heartbeat_interval;
                    (state.role, false, due)
                }
                _ => {
                    let due = now >= state.election_deadline;
                    if due {
                        state.election_deadline = now + random_election_timeout(self.election_timeout);
                    }
                    (state.role, due, false)
                }
            }
        };

        if role != RaftState::Leader && should_elect {
            self.start_election().await;
        }
        if role == RaftState::Leader && should_heartbeat {
            self.broadcast_append_entries().await;
        }
    }

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = RaftState::Candidate;
            state.current_term = state.current_term.next();
            state.voted_for = Some(self.id);
            state.votes_received.clear();
            state.votes_received.insert(self.id);
            state.leader_id = None;
            (
                state.current_term,
                self.log.last_index().await,
                self.log.term(self.log.last_index().await).await.unwrap_or(Term::ZERO),
            )
        };

        self.log
            .save_hard_state(HardState {
                term,
                voted_for: Some(self.id),
                commit_index: self.state.lock().await.commit_index,
            })
            .await
            .ok();

        if self.peer_ids.is_empty() {
            self.become_leader().await;
            return;
        }

        for peer in self.peer_ids.clone() {
            let transport = self.transport.clone();
            let req = RequestVoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
                pre_vote: false,
            };
            if let Ok(resp) = transport.request_vote(peer, req).await {
                self.handle_vote_response(term, peer, resp).await;
            }
        }
    }

    async fn handle_vote_response(&self, requested_term: Term, peer: NodeId, resp: RequestVoteResponse) {
        let mut state = self.state.lock().await;
        if resp.term > state.current_term {
            drop(state);
            self.step_down(resp.term).await;
            return;
        }
        if state.current_term != requested_term || state.role != RaftState::Candidate {
            return;
        }
        if resp.vote_granted {
            state.votes_received.insert(peer);
            if state.votes_received.len() >= self.quorum() {
                drop(state);
                self.become_leader().await;
            }
        }
    }

    async fn become_leader(&self) {
        let last_index = self.log.last_index().await;
        let mut state = self.state.lock().await;
        state.role = RaftState::Leader;
        state.leader_id = Some(self.id);
        if state.current_term == Term::ZERO {
            state.current_term = Term(1);
        }
        for progress in state.peers_progress.values_mut() {
            progress.next_index = LogIndex(last_index.value() + 1);
            progress.match_index = LogIndex::ZERO;
        }
        state.last_quorum_ack = Instant::now();
        if self.peer_ids.is_empty() {
            state.leader_lease_until =
                Some(Instant::now() + lease_duration(self.election_timeout, self.heartbeat_interval, self.clock_drift_margin));
        }
        eprintln!("[raft] node {:?} became leader in term {:?}", self.id, state.current_term);
    }

    async fn step_down(&self, new_term: Term) {
        let mut state = self.state.lock().await;
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
        }
        state.role = RaftState::Follower;
        state.leader_lease_until = None;
    }

    async fn broadcast_append_entries(&self) {
        let mut acked = 1usize; // self
        for peer in self.peer_ids.clone() {
            if self.replicate_to_peer(peer).await {
                acked += 1;
            }
        }
        if acked >= self.quorum() {
            let mut state = self.state.lock().await;
            state.last_quorum_ack = Instant::now();
            state.leader_lease_until =
                Some(Instant::now() + lease_duration(self.election_timeout, self.heartbeat_interval, self.clock_drift_margin));
        }
    }

    async fn replicate_to_peer(&self, peer: NodeId) -> bool {
        let (term, prev_index, prev_term, entries, leader_commit, next_index) = {
            let state = self.state.lock().await;
            if state.role != RaftState::Leader {
                return false;
            }
            let progress = state.peers_progress.get(&peer).copied().unwrap_or_default();
            let prev_index = LogIndex(progress.next_index.value().saturating_sub(1));
            let prev_term = self.log.term(prev_index).await.unwrap_or(Term::ZERO);
            let entries = self.log.entries(progress.next_index, LogIndex(self.log.last_index().await.value() + 1), 1 << 20).await;
            (
                state.current_term,
                prev_index,
                prev_term,
                entries,
                state.commit_index,
                progress.next_index,
            )
        };

        let req = AppendEntriesRequest {
            term,
            leader_id: self.id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: entries.clone(),
            leader_commit,
        };

        let resp = match self.transport.append_entries(peer, req).await {
            Ok(resp) => resp,
            Err(_) => return false,
        };

        let mut state = self.state.lock().await;
        if resp.term > state.current_term {
            drop(state);
            self.step_down(resp.term).await;
            return false;
        }
        if state.role != RaftState::Leader || state.current_term != term {
            return false;
        }

        if resp.success {
            let new_match = LogIndex(next_index.value() + entries.len() as u64 - 1);
            if let Some(progress) = state.peers_progress.get_mut(&peer) {
                if !entries.is_empty() {
                    progress.match_index = new_match;
                    progress.next_index = LogIndex(new_match.value() + 1);
                } else {
                    progress.match_index = LogIndex(prev_index.value());
                }
            }
            self.advance_commit_index(&mut state).await;
            true
        } else {
            if let Some(progress) = state.peers_progress.get_mut(&peer) {
                progress.next_index = LogIndex(resp.conflict_index.value().max(1));
            }
            false
        }
    }

    async fn advance_commit_index(&self, state: &mut NodeState) {
        let mut match_indices: Vec<LogIndex> = state.peers_progress.values().map(|p| p.match_index).collect();
        match_indices.push(self.log.last_index().await);
        match_indices.sort_by_key(|i| std::cmp::Reverse(i.value()));
        let candidate = match_indices[self.quorum() - 1];

        if candidate.value() > state.commit_index.value() {
            if let Some(term) = self.log.term(candidate).await {
                if term == state.current_term {
                    state.commit_index = candidate;
                    let _ = self.apply_wake.0.try_send(());
                }
            }
        }
    }

    pub async fn propose(&self, data: Vec<u8>) -> Result<PendingProposal> {
        let term = self.currently_leader().await?;
        let index = LogIndex(self.log.last_index().await.value() + 1);

        self.log
            .append(vec![LogEntry {
                term,
                index,
                data,
            }])
            .await?;

        let (tx, rx) = channel::bounded(1);
        self.pending.lock().await.entry(index.value()).or_default().push(tx);

        if self.peer_ids.is_empty() {
            let mut state = self.state.lock().await;
            self.advance_commit_index(&mut state).await;
        } else {
            self.broadcast_append_entries().await;
        }

        Ok(PendingProposal {
            log_index: index,
            term,
            receiver: rx,
        })
    }

    pub async fn begin_read(&self, optimistic: bool) -> Result<ReadIndex> {
        let term = self.currently_leader().await?;

        if optimistic {
            let state = self.state.lock().await;
            if let Some(lease_until) = state.leader_lease_until {
                if Instant::now() < lease_until {
                    return Ok(ReadIndex::new(term, state.commit_index));
                }
            }
        }

        // Slow path: confirm leadership against a live quorum before
        // serving the read, per the ReadIndex protocol.
        self.broadcast_append_entries().await;
        let state = self.state.lock().await;
        if state.role != RaftState::Leader || state.current_term != term {
            return Err(err_msg("lost leadership while confirming read index"));
        }
        Ok(ReadIndex::new(term, state.commit_index))
    }

    pub async fn transfer_leadership(&self, target: NodeId) -> Result<()> {
        let term = self.currently_leader().await?;
        if !self.peer_ids.contains(&target) {
            return Err(err_msg("transfer target is not a cluster member"));
        }
        self.replicate_to_peer(target).await;
        self.transport
            .request_vote(
                target,
                RequestVoteRequest {
                    term,
                    candidate_id: target,
                    last_log_index: self.log.last_index().await,
                    last_log_term: self.log.term(self.log.last_index().await).await.unwrap_or(Term::ZERO),
                    pre_vote: true,
                },
            )
            .await
            .ok();
        self.step_down(term).await;
        Ok(())
    }

    async fn apply_loop(&self) {
        loop {
            let (commit_index, last_applied) = {
                let state = self.state.lock().await;
                (state.commit_index, state.last_applied)
            };

            if commit_index.value() > last_applied.value() {
                let next = LogIndex(last_applied.value() + 1);
                if let Some(entry) = self.log.entry(next).await {
                    if self.state_machine.apply(next, &entry.data).await.is_ok() {
                        self.state.lock().await.last_applied = next;
                        self.resolve_waiters(next, PendingExecutionResult::Committed {
                            log_index: next,
                            term: entry.term,
                        })
                        .await;
                    }
                } else {
                    self.state.lock().await.last_applied = next;
                }
                continue;
            }

            let _ = self.apply_wake.1.recv().await;
        }
    }

    async fn resolve_waiters(&self, index: LogIndex, result: PendingExecutionResult) {
        if let Some(waiters) = self.pending.lock().await.remove(&index.value()) {
            for waiter in waiters {
                let _ = waiter.send(result.clone()).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl<S: StateMachine + 'static> LoopbackTarget for Node<S> {
    async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock().await;

        if req.term < state.current_term {
            return RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        if req.term > state.current_term && !req.pre_vote {
            state.current_term = req.term;
            state.voted_for = None;
            state.role = RaftState::Follower;
            state.leader_lease_until = None;
        }

        let our_last_index = self.log.last_index().await;
        let our_last_term = self.log.term(our_last_index).await.unwrap_or(Term::ZERO);
        let log_ok = req.last_log_term > our_last_term
            || (req.last_log_term == our_last_term && req.last_log_index.value() >= our_last_index.value());

        let can_vote = state.voted_for.is_none() || state.voted_for == Some(req.candidate_id);

        let granted = log_ok && can_vote && req.term >= state.current_term;
        if granted && !req.pre_vote {
            state.voted_for = Some(req.candidate_id);
            state.election_deadline = Instant::now() + random_election_timeout(self.election_timeout);
        }

        RequestVoteResponse {
            term: state.current_term,
            vote_granted: granted,
        }
    }

    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;

        if req.term < state.current_term {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_index: self.log.last_index().await,
            };
        }

        state.current_term = req.term;
        state.role = RaftState::Follower;
        state.leader_id = Some(req.leader_id);
        state.voted_for = Some(req.leader_id);
        state.leader_lease_until = None;
        state.election_deadline = Instant::now() + random_election_timeout(self.election_timeout);
        let term = state.current_term;
        drop(state);

        let our_prev_term = self.log.term(req.prev_log_index).await;
        if req.prev_log_index.value() > 0 && our_prev_term != Some(req.prev_log_term) {
            return AppendEntriesResponse {
                term,
                success: false,
                conflict_index: self.log.last_index().await,
            };
        }

        if !req.entries.is_empty() {
            let from = req.entries[0].index;
            if self.log.truncate_and_append(from, req.entries.clone()).await.is_err() {
                return AppendEntriesResponse {
                    term,
                    success: false,
                    conflict_index: self.log.last_index().await,
                };
            }
        }

        let last_new_index = self.log.last_index().await;
        let mut state = self.state.lock().await;
        if req.leader_commit.value() > state.commit_index.value() {
            state.commit_index = LogIndex(req.leader_commit.value().min(last_new_index.value()));
            let _ = self.apply_wake.0.try_send(());
        }

        AppendEntriesResponse {
            term,
            success: true,
            conflict_index: LogIndex(last_new_index.value() + 1),
        }
    }

    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let term = {
            let mut state = self.state.lock().await;
            if req.term < state.current_term {
                return InstallSnapshotResponse { term: state.current_term };
            }
            state.current_term = req.term;
            state.role = RaftState::Follower;
            state.leader_id = Some(req.leader_id);
            state.current_term
        };

        let snapshot = crate::types::StateMachineSnapshot {
            applied_index: req.last_included_index,
            term: req.last_included_term,
            conf_state: ConfState { voters: vec![] },
            data: req.data,
        };

        if self.state_machine.restore(snapshot).await.is_ok() {
            self.log.compact(req.last_included_index).await.ok();
            let mut state = self.state.lock().await;
            state.commit_index = req.last_included_index;
            state.last_applied = req.last_included_index;
        }

        InstallSnapshotResponse { term }
    }
}
