use serde::{Deserialize, Serialize};

pub mod kvstore;
pub mod net;
pub mod raft;
pub mod storage;

/// A single entry in the replicated log. Indices are dense and 1-based;
/// `index` always equals the entry's position in the log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: String,
}

/// The durable part of a node's state. Every field here must reach disk
/// before a decision based on it becomes visible to any other node.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Follower,
    Candidate,
    Leader,
}

// --- RPC MESSAGE TYPES ---

/// Every frame on the wire is one of these. Peers exchange the vote and
/// append variants; clients use SubmitCommand and (in tests) Isolate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RpcMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
    },
    SubmitCommand {
        command: String,
    },
    SubmitCommandResponse {
        success: bool,
        message: String,
        leader_id: String,
    },
    Isolate {
        isolated_nodes: Vec<String>,
    },
    IsolateResponse {
        success: bool,
        message: String,
    },
}
