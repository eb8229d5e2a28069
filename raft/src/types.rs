use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }
}

impl From<u64> for LogIndex {
    fn from(v: u64) -> Self {
        LogIndex(v)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

/// Raft role, per spec.md's `status() -> {state}` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub cluster_id: u64,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub state: RaftState,
    pub applied_index: LogIndex,
    pub commit_index: LogIndex,
}

/// A byte blob produced by `StateMachine::snapshot` and consumed by
/// `StateMachine::restore`. Opaque to the raft core (§4.9, §6 "Encoding").
#[derive(Debug, Clone, Default)]
pub struct StateMachineSnapshot {
    pub applied_index: LogIndex,
    pub term: Term,
    pub conf_state: ConfState,
    pub data: Vec<u8>,
}

/// The outcome of a single proposal, as seen by its original caller.
///
/// This is the "typed result crossing the proposal boundary" from spec.md
/// §9: no exception can cross an asynchronous proposal, so every waiter
/// resolves to one of these instead.
#[derive(Debug, Clone)]
pub enum PendingExecutionResult {
    Committed {
        log_index: LogIndex,
        term: Term,
    },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIndex {
    term: Term,
    index: LogIndex,
}

impl ReadIndex {
    pub fn new(term: Term, index: LogIndex) -> Self {
        Self { term, index }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn index(&self) -> LogIndex {
        self.index
    }
}
