use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Election state of one node. Lives for the process lifetime only.
///
/// # Election Safety
///
/// At most one leader can be elected in a given term:
/// - a node grants at most one vote per term (`voted_for` is only cleared
///   when the term advances)
/// - a candidate needs votes from a strict majority of the static cluster,
///   its own included
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub role: RaftRole,

    // Known leader (if any) and the client address it advertises
    pub leader_id: Option<u64>,
    pub leader_client_addr: Option<String>,

    // Votes received in the current election, self included
    pub votes: HashSet<u64>,

    // Last successful contact per peer
    pub peer_last_seen: HashMap<u64, Instant>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: RaftRole::Follower,
            leader_id: None,
            leader_client_addr: None,
            votes: HashSet::new(),
            peer_last_seen: HashMap::new(),
        }
    }

    /// Votes needed to win in a cluster of `cluster_size` nodes.
    pub fn quorum(cluster_size: usize) -> usize {
        cluster_size / 2 + 1
    }

    /// Transition to follower state. The vote is only forgotten when the term
    /// actually advances.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.leader_client_addr = None;
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes.clear();
        self.votes.insert(my_id);
        self.leader_id = None;
        self.leader_client_addr = None;
    }

    /// Transition to leader state. Returns false if already leader for the
    /// current term.
    pub fn become_leader(&mut self, my_id: u64, client_addr: &str) -> bool {
        if self.role == RaftRole::Leader && self.leader_id == Some(my_id) {
            return false;
        }
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.leader_client_addr = Some(client_addr.to_string());
        true
    }

    /// Accepts `leader_id` as leader of `term`, stepping down if needed.
    pub fn adopt_leader(&mut self, term: u64, leader_id: u64, client_addr: &str) {
        self.become_follower(term);
        self.leader_id = Some(leader_id);
        self.leader_client_addr = (!client_addr.is_empty()).then(|| client_addr.to_string());
    }

    /// Records a granted vote and returns the tally.
    pub fn record_vote(&mut self, voter: u64) -> usize {
        self.votes.insert(voter);
        self.votes.len()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
