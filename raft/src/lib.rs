pub mod log;
pub mod node;
pub mod state_machine;
pub mod transport;
pub mod types;

pub use log::{FileLogStore, LogStore, MemLogStore};
pub use node::{Node, NodeOptions, PendingProposal};
pub use state_machine::StateMachine;
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, LoopbackTarget,
    LoopbackTransport, RequestVoteRequest, RequestVoteResponse, Transport,
};
pub use types::{
    ConfState, HardState, LogEntry, LogIndex, LogPosition, NodeId, NodeStatus, PendingExecutionResult, RaftState,
    ReadIndex, StateMachineSnapshot, Term,
};
