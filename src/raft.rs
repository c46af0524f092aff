use crate::kvstore::KeyValueStore;
use crate::net;
use crate::storage::StateStore;
use crate::{LogEntry, PersistentState, RpcMessage, ServerRole};
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deadline for a single outbound peer RPC. Kept well under the election
/// timeout so a dead peer never stalls a round.
const RPC_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a client submission may wait for its entry to commit.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Backstop cadence for the apply loop when no commit notification arrives.
const APPLY_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub bind_addr: String,
    /// Peer id -> host:port for every other member. Fixed at startup.
    pub peers: HashMap<String, String>,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min > self.election_timeout_max {
            bail!(
                "election timeout range {}..{}ms is inverted",
                self.election_timeout_min,
                self.election_timeout_max
            );
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval * 3 > self.election_timeout_min
        {
            bail!(
                "heartbeat interval {}ms must be at most a third of the minimum election timeout {}ms",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        Ok(())
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

/// All Raft state, persistent and volatile, guarded by one mutex on the node.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,

    pub role: ServerRole,
    pub current_leader: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub election_deadline: Instant,
    /// Length of the log image currently on disk. A leader only offers
    /// entries up to this point for replication; counting itself toward a
    /// commit quorum is only sound for entries it has already persisted.
    pub durable_index: u64,

    // Leader-only, rebuilt on every election win.
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    /// Peers whose traffic is dropped both ways, set via the Isolate RPC.
    pub isolated: HashSet<String>,

    // Client submissions parked on the index their entry occupies. Dropping
    // a sender tells the waiter the entry will not commit under this leader.
    waiters: HashMap<u64, oneshot::Sender<String>>,
}

impl RaftState {
    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn persistent(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }

    /// Fall back to follower, adopting `term` if it is newer. The election
    /// deadline is deliberately left alone here; only accepted contact from
    /// the current leader or a granted vote refreshes it.
    fn step_down(&mut self, term: u64, leader: Option<String>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = ServerRole::Follower;
        self.current_leader = leader;
        self.next_index.clear();
        self.match_index.clear();
        self.waiters.clear();
    }
}

enum TimerStep {
    Leading,
    SleepUntil(Instant),
    Campaign {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
}

pub struct RaftNode {
    pub config: NodeConfig,
    pub state: Arc<Mutex<RaftState>>,
    pub kv: KeyValueStore,
    store: StateStore,
    /// Serializes snapshot+write pairs so a later state snapshot can never
    /// be overwritten on disk by an earlier one.
    persist_lock: Mutex<()>,
    replicate: Notify,
    apply: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let store = StateStore::new(&config.data_dir, &config.node_id);
        let kv = KeyValueStore::new(&config.data_dir, &config.node_id);

        let persistent = match store.load()? {
            Some(loaded) => {
                info!(
                    "[{}] restored state: term={}, voted_for={:?}, {} log entries",
                    config.node_id,
                    loaded.current_term,
                    loaded.voted_for,
                    loaded.log.len()
                );
                loaded
            }
            None => PersistentState::default(),
        };

        let deadline = Instant::now() + random_timeout(&config);
        let durable_index = persistent.log.len() as u64;
        let state = RaftState {
            current_term: persistent.current_term,
            voted_for: persistent.voted_for,
            log: persistent.log,
            role: ServerRole::Follower,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            election_deadline: deadline,
            durable_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            isolated: HashSet::new(),
            waiters: HashMap::new(),
        };

        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            kv,
            store,
            persist_lock: Mutex::new(()),
            replicate: Notify::new(),
            apply: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the election, replication and apply drivers.
    pub fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(&self).run_election_timer()));
        tasks.push(tokio::spawn(Arc::clone(&self).run_replication()));
        tasks.push(tokio::spawn(Arc::clone(&self).run_apply()));
    }

    /// Stop all drivers. Parked submissions observe their waiters being
    /// dropped and report failure to their clients.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.waiters.clear();
    }

    fn random_election_timeout(&self) -> Duration {
        random_timeout(&self.config)
    }

    /// Snapshot the persistent fields and write them through. Must complete
    /// before whatever decision the caller made becomes externally visible.
    /// A failed write is fatal: serving state that is not on disk would let
    /// this node forget a vote or a log entry it already promised to keep.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock().await;
            state.persistent()
        };
        if let Err(e) = self.store.save(&snapshot).await {
            error!("[{}] failed to persist raft state: {:#}", self.config.node_id, e);
            process::exit(1);
        }
        let mut state = self.state.lock().await;
        state.durable_index = snapshot.log.len() as u64;
    }

    // ==================== Election Driver ====================

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            let step = {
                let mut state = self.state.lock().await;
                if state.role == ServerRole::Leader {
                    TimerStep::Leading
                } else if Instant::now() < state.election_deadline {
                    TimerStep::SleepUntil(state.election_deadline)
                } else {
                    // Candidacy is entered here, under the lock, so the
                    // deadline is already reset when the next iteration
                    // looks at it.
                    state.role = ServerRole::Candidate;
                    state.current_term += 1;
                    state.voted_for = Some(self.config.node_id.clone());
                    state.current_leader = None;
                    state.election_deadline = Instant::now() + self.random_election_timeout();
                    info!(
                        "[{}] election timeout, becoming candidate for term {}",
                        self.config.node_id, state.current_term
                    );
                    TimerStep::Campaign {
                        term: state.current_term,
                        last_log_index: state.last_log_index(),
                        last_log_term: state.last_log_term(),
                    }
                }
            };

            match step {
                TimerStep::Leading => {
                    tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval))
                        .await;
                }
                TimerStep::SleepUntil(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                }
                TimerStep::Campaign {
                    term,
                    last_log_index,
                    last_log_term,
                } => {
                    // The vote for self must be durable before any ballot
                    // goes out.
                    self.persist().await;
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        node.campaign(term, last_log_index, last_log_term).await;
                    });
                }
            }
        }
    }

    /// Conduct one term of voting: ballots go out to every reachable peer in
    /// parallel and replies are tallied as they arrive. A reply for a term we
    /// have already left is discarded.
    async fn campaign(self: Arc<Self>, term: u64, last_log_index: u64, last_log_term: u64) {
        let targets: Vec<(String, String)> = {
            let state = self.state.lock().await;
            self.config
                .peers
                .iter()
                .filter(|(id, _)| !state.isolated.contains(*id))
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .collect()
        };

        let (tx, mut rx) = mpsc::channel(self.config.peers.len().max(1));
        for (peer_id, addr) in targets {
            let request = RpcMessage::RequestVote {
                term,
                candidate_id: self.config.node_id.clone(),
                last_log_index,
                last_log_term,
            };
            let tx = tx.clone();
            let node_id = self.config.node_id.clone();
            tokio::spawn(async move {
                match net::call(&addr, &request, RPC_TIMEOUT).await {
                    Ok(RpcMessage::RequestVoteResponse { term, vote_granted }) => {
                        let _ = tx.send((peer_id, term, vote_granted)).await;
                    }
                    Ok(other) => {
                        warn!("[{}] unexpected reply to ballot: {:?}", node_id, other)
                    }
                    Err(e) => debug!("[{}] no vote from {}: {}", node_id, peer_id, e),
                }
            });
        }
        drop(tx);

        let mut votes = 1; // our own
        let majority = self.config.majority();
        while let Some((peer_id, reply_term, granted)) = rx.recv().await {
            let won = {
                let mut state = self.state.lock().await;
                if reply_term > state.current_term {
                    info!(
                        "[{}] stepping down: {} answered the ballot with term {}",
                        self.config.node_id, peer_id, reply_term
                    );
                    state.step_down(reply_term, None);
                    drop(state);
                    self.persist().await;
                    return;
                }
                if state.role != ServerRole::Candidate || state.current_term != term {
                    // This election is over; a later term or an accepted
                    // leader superseded it while the ballot was in flight.
                    return;
                }
                if granted {
                    votes += 1;
                    debug!(
                        "[{}] vote from {} ({}/{})",
                        self.config.node_id, peer_id, votes, majority
                    );
                }
                if votes >= majority {
                    self.become_leader(&mut state);
                    true
                } else {
                    false
                }
            };
            if won {
                // First heartbeat goes out ahead of the regular cadence.
                Arc::clone(&self).broadcast_append_entries().await;
                return;
            }
        }
        debug!(
            "[{}] election for term {} ended without quorum",
            self.config.node_id, term
        );
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = ServerRole::Leader;
        state.current_leader = Some(self.config.node_id.clone());
        let next = state.last_log_index() + 1;
        for peer_id in self.config.peers.keys() {
            state.next_index.insert(peer_id.clone(), next);
            state.match_index.insert(peer_id.clone(), 0);
        }
        info!(
            "[{}] won election, leading term {}",
            self.config.node_id, state.current_term
        );
    }

    // ==================== Replication Driver ====================

    async fn run_replication(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.replicate.notified() => {}
            }
            Arc::clone(&self).broadcast_append_entries().await;
        }
    }

    /// One round of AppendEntries to every reachable peer. Snapshots each
    /// peer's slice under the lock, then fans the RPCs out in parallel.
    async fn broadcast_append_entries(self: Arc<Self>) {
        let (term, leader_commit, batches) = {
            let state = self.state.lock().await;
            if state.role != ServerRole::Leader {
                return;
            }
            let mut batches = Vec::new();
            for (peer_id, addr) in &self.config.peers {
                if state.isolated.contains(peer_id) {
                    continue;
                }
                let next = state
                    .next_index
                    .get(peer_id)
                    .copied()
                    .unwrap_or(state.last_log_index() + 1);
                let prev_log_index = next - 1;
                let prev_log_term = if prev_log_index > 0 {
                    state.log[prev_log_index as usize - 1].term
                } else {
                    0
                };
                let last_durable = state.durable_index.min(state.last_log_index());
                let entries: Vec<LogEntry> = if next <= last_durable {
                    state.log[next as usize - 1..last_durable as usize].to_vec()
                } else {
                    Vec::new()
                };
                batches.push((
                    peer_id.clone(),
                    addr.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                ));
            }
            (state.current_term, state.commit_index, batches)
        };

        for (peer_id, addr, prev_log_index, prev_log_term, entries) in batches {
            let node = Arc::clone(&self);
            let leader_id = self.config.node_id.clone();
            tokio::spawn(async move {
                let replicated_to = prev_log_index + entries.len() as u64;
                let request = RpcMessage::AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                };
                match net::call(&addr, &request, RPC_TIMEOUT).await {
                    Ok(RpcMessage::AppendEntriesResponse {
                        term: reply_term,
                        success,
                    }) => {
                        node.handle_append_reply(&peer_id, term, reply_term, success, replicated_to)
                            .await;
                    }
                    Ok(other) => warn!(
                        "[{}] unexpected reply to AppendEntries: {:?}",
                        node.config.node_id, other
                    ),
                    Err(e) => debug!(
                        "[{}] no AppendEntries reply from {}: {}",
                        node.config.node_id, peer_id, e
                    ),
                }
            });
        }
    }

    /// Fold one AppendEntries reply back into leader state. `sent_term` is
    /// the term the request carried; the reply is dropped if we have moved
    /// on since, so a stale round can never corrupt a newer one.
    async fn handle_append_reply(
        &self,
        peer_id: &str,
        sent_term: u64,
        reply_term: u64,
        success: bool,
        replicated_to: u64,
    ) {
        let mut committed = false;
        {
            let mut state = self.state.lock().await;
            if reply_term > state.current_term {
                info!(
                    "[{}] stepping down: {} replied to AppendEntries with term {}",
                    self.config.node_id, peer_id, reply_term
                );
                state.step_down(reply_term, None);
                drop(state);
                self.persist().await;
                return;
            }
            if state.role != ServerRole::Leader || state.current_term != sent_term {
                return;
            }
            if success {
                let matched = state
                    .match_index
                    .get(peer_id)
                    .copied()
                    .unwrap_or(0)
                    .max(replicated_to);
                state.match_index.insert(peer_id.to_string(), matched);
                state.next_index.insert(peer_id.to_string(), matched + 1);
                committed = self.advance_commit_index(&mut state);
            } else {
                let next = state.next_index.get(peer_id).copied().unwrap_or(1);
                let backed = next.saturating_sub(1).max(1);
                state.next_index.insert(peer_id.to_string(), backed);
                debug!(
                    "[{}] log mismatch on {}, next_index backed off to {}",
                    self.config.node_id, peer_id, backed
                );
            }
        }
        if committed {
            self.apply.notify_one();
        } else if !success {
            // Retry the decremented probe promptly instead of waiting out
            // the heartbeat interval.
            self.replicate.notify_one();
        }
    }

    /// Raise commit_index to the highest entry of the current term that a
    /// majority holds. Entries from earlier terms only commit transitively.
    fn advance_commit_index(&self, state: &mut RaftState) -> bool {
        let mut advanced = false;
        for n in (state.commit_index + 1)..=state.last_log_index() {
            if state.log[n as usize - 1].term != state.current_term {
                continue;
            }
            let replicas = 1 + self
                .config
                .peers
                .keys()
                .filter(|peer_id| state.match_index.get(*peer_id).copied().unwrap_or(0) >= n)
                .count();
            if replicas >= self.config.majority() {
                state.commit_index = n;
                advanced = true;
                info!("[{}] advanced commit index to {}", self.config.node_id, n);
            }
        }
        advanced
    }

    // ==================== Apply Driver ====================

    /// Single consumer feeding the state machine: strictly in index order,
    /// exactly once per index per process lifetime.
    async fn run_apply(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(APPLY_TICK) => {}
                _ = self.apply.notified() => {}
            }
            loop {
                let (index, command, waiter) = {
                    let mut state = self.state.lock().await;
                    if state.last_applied >= state.commit_index {
                        break;
                    }
                    state.last_applied += 1;
                    let index = state.last_applied;
                    let command = state.log[index as usize - 1].command.clone();
                    let waiter = state.waiters.remove(&index);
                    (index, command, waiter)
                };
                let result = self.kv.apply_command(&command);
                debug!(
                    "[{}] applied {} ({}) -> {}",
                    self.config.node_id, index, command, result
                );
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                }
            }
        }
    }

    // ==================== Client Submission ====================

    /// Append a client command as a log entry and wait for it to commit and
    /// apply, bounded by a server-side timeout.
    pub async fn submit(&self, command: String) -> (bool, String, String) {
        let (index, rx) = {
            let mut state = self.state.lock().await;
            if state.role != ServerRole::Leader {
                let leader = state
                    .current_leader
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                return (false, "Not the leader".to_string(), leader);
            }
            let index = state.last_log_index() + 1;
            let term = state.current_term;
            info!(
                "[{}] accepted command at index {}: {}",
                self.config.node_id, index, command
            );
            state.log.push(LogEntry {
                term,
                index,
                command,
            });
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(index, tx);
            (index, rx)
        };

        // The entry must be on disk before followers can be asked to store it.
        self.persist().await;
        self.replicate.notify_one();

        match tokio::time::timeout(SUBMIT_TIMEOUT, rx).await {
            Ok(Ok(result)) => (true, result, self.config.node_id.clone()),
            Ok(Err(_)) => {
                // Waiter dropped: we stopped leading before the entry
                // committed. It may still commit under a successor.
                let state = self.state.lock().await;
                let leader = state
                    .current_leader
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                (false, "No longer leader".to_string(), leader)
            }
            Err(_) => {
                let mut state = self.state.lock().await;
                state.waiters.remove(&index);
                (
                    false,
                    "Timeout waiting for commit".to_string(),
                    self.config.node_id.clone(),
                )
            }
        }
    }

    // ==================== RPC Handlers ====================

    /// Dispatch one inbound frame. Returns the response frame, or `None`
    /// when the message takes no reply (or the sender is isolated).
    pub async fn handle_message(&self, message: RpcMessage) -> Option<RpcMessage> {
        if let Some(sender) = sender_of(&message) {
            let state = self.state.lock().await;
            if state.isolated.contains(sender) {
                debug!(
                    "[{}] dropping frame from isolated peer {}",
                    self.config.node_id, sender
                );
                return None;
            }
        }

        match message {
            RpcMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => Some(
                self.handle_request_vote(term, candidate_id, last_log_index, last_log_term)
                    .await,
            ),
            RpcMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => Some(
                self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )
                .await,
            ),
            RpcMessage::SubmitCommand { command } => {
                let (success, message, leader_id) = self.submit(command).await;
                Some(RpcMessage::SubmitCommandResponse {
                    success,
                    message,
                    leader_id,
                })
            }
            RpcMessage::Isolate { isolated_nodes } => {
                Some(self.handle_isolate(isolated_nodes).await)
            }
            // Responses ride back on the request's connection; one arriving
            // inbound is a confused peer, not a request.
            _ => None,
        }
    }

    async fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RpcMessage {
        let (reply, dirty) = {
            let mut state = self.state.lock().await;
            let mut dirty = false;
            if term > state.current_term {
                info!(
                    "[{}] ballot from {} carries term {}, adopting it",
                    self.config.node_id, candidate_id, term
                );
                state.step_down(term, None);
                dirty = true;
            }

            let mut vote_granted = false;
            if term < state.current_term {
                debug!(
                    "[{}] refusing vote for {}: stale term {}",
                    self.config.node_id, candidate_id, term
                );
            } else if state.voted_for.is_none()
                || state.voted_for.as_deref() == Some(candidate_id.as_str())
            {
                let up_to_date = last_log_term > state.last_log_term()
                    || (last_log_term == state.last_log_term()
                        && last_log_index >= state.last_log_index());
                if up_to_date {
                    state.voted_for = Some(candidate_id.clone());
                    state.election_deadline = Instant::now() + self.random_election_timeout();
                    vote_granted = true;
                    dirty = true;
                    info!(
                        "[{}] granting vote to {} for term {}",
                        self.config.node_id, candidate_id, state.current_term
                    );
                } else {
                    debug!(
                        "[{}] refusing vote for {}: candidate log ({}, {}) behind ours ({}, {})",
                        self.config.node_id,
                        candidate_id,
                        last_log_term,
                        last_log_index,
                        state.last_log_term(),
                        state.last_log_index()
                    );
                }
            } else {
                debug!(
                    "[{}] refusing vote for {}: already voted for {:?} this term",
                    self.config.node_id, candidate_id, state.voted_for
                );
            }

            (
                RpcMessage::RequestVoteResponse {
                    term: state.current_term,
                    vote_granted,
                },
                dirty,
            )
        };

        // The vote (and any adopted term) is durable before the reply leaves.
        if dirty {
            self.persist().await;
        }
        reply
    }

    async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RpcMessage {
        let (reply, dirty, committed) = {
            let mut state = self.state.lock().await;
            let mut dirty = false;
            let mut success = false;
            let mut committed = false;

            if term < state.current_term {
                debug!(
                    "[{}] rejecting AppendEntries from {}: stale term {}",
                    self.config.node_id, leader_id, term
                );
            } else {
                if term > state.current_term {
                    dirty = true;
                }
                // Whatever we were, this term has a live leader.
                state.step_down(term, Some(leader_id.clone()));
                state.election_deadline = Instant::now() + self.random_election_timeout();

                let prev_ok = prev_log_index == 0
                    || (prev_log_index <= state.last_log_index()
                        && state.log[prev_log_index as usize - 1].term == prev_log_term);
                if !prev_ok {
                    debug!(
                        "[{}] rejecting AppendEntries from {}: no entry matching ({}, {}) in log of length {}",
                        self.config.node_id,
                        leader_id,
                        prev_log_index,
                        prev_log_term,
                        state.last_log_index()
                    );
                } else {
                    success = true;

                    // Walk the batch: keep entries that already match, cut
                    // the log at the first conflict, append what is missing.
                    let mut last_new = prev_log_index;
                    for (k, entry) in entries.iter().enumerate() {
                        let index = prev_log_index + k as u64 + 1;
                        if index <= state.last_log_index() {
                            if state.log[index as usize - 1].term != entry.term {
                                warn!(
                                    "[{}] conflict at index {}, truncating {} entries",
                                    self.config.node_id,
                                    index,
                                    state.last_log_index() - index + 1
                                );
                                state.log.truncate(index as usize - 1);
                                state.log.push(entry.clone());
                                dirty = true;
                            }
                        } else {
                            state.log.push(entry.clone());
                            dirty = true;
                        }
                        last_new = index;
                    }
                    if !entries.is_empty() {
                        debug!(
                            "[{}] log now has {} entries after append from {}",
                            self.config.node_id,
                            state.last_log_index(),
                            leader_id
                        );
                    }

                    let ceiling = if entries.is_empty() {
                        state.last_log_index()
                    } else {
                        last_new
                    };
                    if leader_commit > state.commit_index {
                        state.commit_index = leader_commit.min(ceiling);
                        committed = true;
                        debug!(
                            "[{}] commit index now {}",
                            self.config.node_id, state.commit_index
                        );
                    }
                }
            }

            (
                RpcMessage::AppendEntriesResponse {
                    term: state.current_term,
                    success,
                },
                dirty,
                committed,
            )
        };

        // Log mutations and adopted terms are durable before success is
        // reported back; heartbeats touch nothing and persist nothing.
        if dirty {
            self.persist().await;
        }
        if committed {
            self.apply.notify_one();
        }
        reply
    }

    /// Replace this node's isolation set. An empty list heals the node.
    async fn handle_isolate(&self, isolated_nodes: Vec<String>) -> RpcMessage {
        let mut state = self.state.lock().await;
        state.isolated = isolated_nodes.into_iter().collect();
        let message = if state.isolated.is_empty() {
            "isolation cleared".to_string()
        } else {
            format!("isolated from {} peers", state.isolated.len())
        };
        info!("[{}] {}", self.config.node_id, message);
        RpcMessage::IsolateResponse {
            success: true,
            message,
        }
    }
}

/// The peer a frame claims to come from, for isolation filtering. Client
/// frames have no peer identity and are never filtered.
fn sender_of(message: &RpcMessage) -> Option<&str> {
    match message {
        RpcMessage::RequestVote { candidate_id, .. } => Some(candidate_id),
        RpcMessage::AppendEntries { leader_id, .. } => Some(leader_id),
        _ => None,
    }
}

fn random_timeout(config: &NodeConfig) -> Duration {
    let millis = rand::thread_rng()
        .gen_range(config.election_timeout_min..=config.election_timeout_max);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(node_id: &str, peer_ids: &[&str]) -> NodeConfig {
        let data_dir = std::env::temp_dir().join(format!(
            "raft-kv-core-{}-{}-{}",
            node_id,
            std::process::id(),
            rand::random::<u32>()
        ));
        NodeConfig {
            node_id: node_id.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            // Never dialed by these tests; handlers are driven directly.
            peers: peer_ids
                .iter()
                .map(|id| (id.to_string(), "127.0.0.1:0".to_string()))
                .collect(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            data_dir,
        }
    }

    fn test_node(node_id: &str, peer_ids: &[&str]) -> Arc<RaftNode> {
        Arc::new(RaftNode::new(test_config(node_id, peer_ids)).unwrap())
    }

    fn entry(term: u64, index: u64, command: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            command: command.to_string(),
        }
    }

    async fn request_vote(
        node: &RaftNode,
        term: u64,
        candidate: &str,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (u64, bool) {
        match node
            .handle_message(RpcMessage::RequestVote {
                term,
                candidate_id: candidate.to_string(),
                last_log_index,
                last_log_term,
            })
            .await
        {
            Some(RpcMessage::RequestVoteResponse { term, vote_granted }) => (term, vote_granted),
            other => panic!("expected RequestVoteResponse, got {:?}", other),
        }
    }

    async fn append_entries(
        node: &RaftNode,
        term: u64,
        leader: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (u64, bool) {
        match node
            .handle_message(RpcMessage::AppendEntries {
                term,
                leader_id: leader.to_string(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            })
            .await
        {
            Some(RpcMessage::AppendEntriesResponse { term, success }) => (term, success),
            other => panic!("expected AppendEntriesResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_log_grants_vote_to_empty_log_candidate() {
        let node = test_node("n1", &["n2", "n3"]);
        let (term, granted) = request_vote(&node, 1, "n2", 0, 0).await;
        assert_eq!(term, 1);
        assert!(granted);
        let state = node.state.lock().await;
        assert_eq!(state.voted_for.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn vote_is_refused_when_candidate_log_is_behind() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            state.log = vec![entry(1, 1, "SET a 1"), entry(2, 2, "SET b 2")];
        }
        // Shorter log at the same last term loses.
        let (_, granted) = request_vote(&node, 3, "n2", 1, 2).await;
        assert!(!granted);
        // Longer log at an older last term loses too.
        let (_, granted) = request_vote(&node, 4, "n3", 5, 1).await;
        assert!(!granted);
        // Equal term and length is good enough.
        let (_, granted) = request_vote(&node, 5, "n2", 2, 2).await;
        assert!(granted);
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let node = test_node("n1", &["n2", "n3"]);
        let (_, granted) = request_vote(&node, 1, "n2", 0, 0).await;
        assert!(granted);
        let (_, granted) = request_vote(&node, 1, "n3", 0, 0).await;
        assert!(!granted);
        // Re-asking from the same candidate is idempotent.
        let (_, granted) = request_vote(&node, 1, "n2", 0, 0).await;
        assert!(granted);
    }

    #[tokio::test]
    async fn stale_term_ballot_is_refused_with_current_term() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 5;
        }
        let (term, granted) = request_vote(&node, 3, "n2", 9, 3).await;
        assert_eq!(term, 5);
        assert!(!granted);
    }

    #[tokio::test]
    async fn higher_term_ballot_demotes_a_leader() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            state.role = ServerRole::Leader;
        }
        let (term, granted) = request_vote(&node, 3, "n2", 0, 0).await;
        assert_eq!(term, 3);
        assert!(granted);
        let state = node.state.lock().await;
        assert_eq!(state.role, ServerRole::Follower);
    }

    #[tokio::test]
    async fn stale_term_append_is_rejected_without_touching_state() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 5;
            state.log = vec![entry(5, 1, "SET a 1")];
            state.commit_index = 1;
        }
        let (term, success) =
            append_entries(&node, 3, "n2", 0, 0, vec![entry(3, 1, "SET a 9")], 1).await;
        assert_eq!(term, 5);
        assert!(!success);
        let state = node.state.lock().await;
        assert_eq!(state.log, vec![entry(5, 1, "SET a 1")]);
        assert_eq!(state.commit_index, 1);
        assert!(state.current_leader.is_none());
    }

    #[tokio::test]
    async fn append_at_prev_zero_overwrites_a_conflicting_log() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 1;
            state.log = vec![entry(1, 1, "SET a 1"), entry(1, 2, "SET b 2")];
        }
        let (_, success) = append_entries(
            &node,
            2,
            "n2",
            0,
            0,
            vec![entry(2, 1, "SET c 3"), entry(2, 2, "SET d 4")],
            0,
        )
        .await;
        assert!(success);
        let state = node.state.lock().await;
        assert_eq!(
            state.log,
            vec![entry(2, 1, "SET c 3"), entry(2, 2, "SET d 4")]
        );
    }

    #[tokio::test]
    async fn conflict_truncates_from_first_divergence_only() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            state.log = vec![
                entry(1, 1, "SET a 1"),
                entry(1, 2, "SET b 2"),
                entry(2, 3, "SET c 3"),
            ];
        }
        // Entry 2 matches and must survive; entry 3 conflicts and is replaced.
        let (_, success) = append_entries(
            &node,
            3,
            "n2",
            1,
            1,
            vec![entry(1, 2, "SET b 2"), entry(3, 3, "SET z 9")],
            0,
        )
        .await;
        assert!(success);
        let state = node.state.lock().await;
        assert_eq!(
            state.log,
            vec![
                entry(1, 1, "SET a 1"),
                entry(1, 2, "SET b 2"),
                entry(3, 3, "SET z 9"),
            ]
        );
    }

    #[tokio::test]
    async fn append_rejects_gap_beyond_log_end() {
        let node = test_node("n1", &["n2", "n3"]);
        let (_, success) =
            append_entries(&node, 1, "n2", 4, 1, vec![entry(1, 5, "SET a 1")], 0).await;
        assert!(!success);
        let state = node.state.lock().await;
        assert_eq!(state.last_log_index(), 0);
    }

    #[tokio::test]
    async fn heartbeat_never_regresses_commit_index() {
        let node = test_node("n1", &["n2", "n3"]);
        let (_, success) = append_entries(
            &node,
            1,
            "n2",
            0,
            0,
            vec![entry(1, 1, "SET a 1"), entry(1, 2, "SET b 2")],
            2,
        )
        .await;
        assert!(success);
        assert_eq!(node.state.lock().await.commit_index, 2);

        // A heartbeat carrying an older leader_commit must not move it back.
        let (_, success) = append_entries(&node, 1, "n2", 2, 1, vec![], 1).await;
        assert!(success);
        assert_eq!(node.state.lock().await.commit_index, 2);
    }

    #[tokio::test]
    async fn heartbeat_resets_the_deadline_and_persists_nothing() {
        let node = test_node("n1", &["n2", "n3"]);
        let (_, success) =
            append_entries(&node, 1, "n2", 0, 0, vec![entry(1, 1, "SET a 1")], 0).await;
        assert!(success);

        // The append above wrote the state file; remove it so any further
        // persist would be visible as the file reappearing.
        let state_file = node.config.data_dir.join("node_n1_state.json");
        assert!(state_file.exists());
        std::fs::remove_file(&state_file).unwrap();

        let sentinel = Instant::now();
        {
            let mut state = node.state.lock().await;
            state.election_deadline = sentinel;
        }

        let (_, success) = append_entries(&node, 1, "n2", 1, 1, vec![], 0).await;
        assert!(success);

        let state = node.state.lock().await;
        assert!(
            state.election_deadline > sentinel,
            "an accepted heartbeat must push the election deadline out"
        );
        drop(state);
        assert!(
            !state_file.exists(),
            "a pure heartbeat must not rewrite the state file"
        );
    }

    #[tokio::test]
    async fn follower_commit_is_capped_by_its_own_log() {
        let node = test_node("n1", &["n2", "n3"]);
        let (_, success) =
            append_entries(&node, 1, "n2", 0, 0, vec![entry(1, 1, "SET a 1")], 7).await;
        assert!(success);
        assert_eq!(node.state.lock().await.commit_index, 1);
    }

    #[tokio::test]
    async fn append_from_current_term_demotes_a_candidate() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 4;
            state.role = ServerRole::Candidate;
        }
        let (_, success) = append_entries(&node, 4, "n2", 0, 0, vec![], 0).await;
        assert!(success);
        let state = node.state.lock().await;
        assert_eq!(state.role, ServerRole::Follower);
        assert_eq!(state.current_leader.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn leader_only_commits_entries_of_its_own_term() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            state.log = vec![entry(1, 1, "SET a 1"), entry(2, 2, "SET b 2")];
            node.become_leader(&mut state);
        }

        // Majority holds only the term-1 entry: nothing may commit.
        node.handle_append_reply("n2", 2, 2, true, 1).await;
        assert_eq!(node.state.lock().await.commit_index, 0);

        // Once the term-2 entry reaches a majority, both commit together.
        node.handle_append_reply("n2", 2, 2, true, 2).await;
        assert_eq!(node.state.lock().await.commit_index, 2);
    }

    #[tokio::test]
    async fn stale_append_reply_is_ignored() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 3;
            state.log = vec![entry(3, 1, "SET a 1")];
            node.become_leader(&mut state);
        }
        // A reply to a term-2 round must not move match_index in term 3.
        node.handle_append_reply("n2", 2, 2, true, 1).await;
        let state = node.state.lock().await;
        assert_eq!(state.match_index.get("n2").copied(), Some(0));
        assert_eq!(state.commit_index, 0);
    }

    #[tokio::test]
    async fn failed_append_reply_backs_next_index_off_to_a_floor_of_one() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 1;
            state.log = vec![entry(1, 1, "SET a 1")];
            node.become_leader(&mut state);
        }
        node.handle_append_reply("n2", 1, 1, false, 0).await;
        assert_eq!(node.state.lock().await.next_index.get("n2").copied(), Some(1));
        node.handle_append_reply("n2", 1, 1, false, 0).await;
        assert_eq!(node.state.lock().await.next_index.get("n2").copied(), Some(1));
    }

    #[tokio::test]
    async fn higher_term_append_reply_demotes_the_leader() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_term = 2;
            node.become_leader(&mut state);
        }
        node.handle_append_reply("n2", 2, 6, false, 0).await;
        let state = node.state.lock().await;
        assert_eq!(state.role, ServerRole::Follower);
        assert_eq!(state.current_term, 6);
        assert!(state.voted_for.is_none());
    }

    #[tokio::test]
    async fn submit_on_follower_names_the_known_leader() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.current_leader = Some("n2".to_string());
        }
        let (success, message, leader) = node.submit("SET a 1".to_string()).await;
        assert!(!success);
        assert_eq!(message, "Not the leader");
        assert_eq!(leader, "n2");
    }

    #[tokio::test]
    async fn submit_without_a_known_leader_reports_unknown() {
        let node = test_node("n1", &["n2", "n3"]);
        let (success, _, leader) = node.submit("SET a 1".to_string()).await;
        assert!(!success);
        assert_eq!(leader, "unknown");
    }

    #[tokio::test]
    async fn isolated_peer_frames_are_dropped_at_the_boundary() {
        let node = test_node("n1", &["n2", "n3"]);
        let reply = node
            .handle_message(RpcMessage::Isolate {
                isolated_nodes: vec!["n2".to_string()],
            })
            .await;
        assert!(matches!(
            reply,
            Some(RpcMessage::IsolateResponse { success: true, .. })
        ));

        let reply = node
            .handle_message(RpcMessage::RequestVote {
                term: 9,
                candidate_id: "n2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(reply.is_none());
        assert_eq!(node.state.lock().await.current_term, 0);

        // Healing lets the same frame through again.
        node.handle_message(RpcMessage::Isolate {
            isolated_nodes: vec![],
        })
        .await;
        let (_, granted) = request_vote(&node, 9, "n2", 0, 0).await;
        assert!(granted);
    }

    #[tokio::test]
    async fn term_adoption_alone_does_not_refresh_the_election_deadline() {
        let node = test_node("n1", &["n2", "n3"]);
        {
            let mut state = node.state.lock().await;
            state.log = vec![entry(1, 1, "SET a 1")];
            state.current_term = 1;
        }
        let before = node.state.lock().await.election_deadline;
        // Higher term but stale log: term is adopted, vote refused, and the
        // deadline stays where it was.
        let (term, granted) = request_vote(&node, 7, "n2", 0, 0).await;
        assert_eq!(term, 7);
        assert!(!granted);
        assert_eq!(node.state.lock().await.election_deadline, before);
    }

    #[test]
    fn config_rejects_heartbeat_crowding_the_election_timeout() {
        let mut config = test_config("n1", &["n2", "n3"]);
        config.heartbeat_interval = 60;
        assert!(config.validate().is_err());
        config.heartbeat_interval = 50;
        assert!(config.validate().is_ok());
    }
}
