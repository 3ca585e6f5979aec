use crate::proto::{
    HeartbeatRequest, HeartbeatResponse, LeaderElectedRequest, LeadershipAcknowledged,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState};

/// What a vote response did to a running election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Stale or irrelevant response
    Ignored,
    /// Counted, majority not reached yet
    Pending(usize),
    /// Majority reached for the given term
    Won(u64),
    /// A higher term was seen
    SteppedDown(u64),
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let (vote_granted, reason) = if req.term < state.current_term {
        (false, format!("stale term {} < {}", req.term, state.current_term))
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        (
            false,
            format!("already voted for {:?} in term {}", state.voted_for, state.current_term),
        )
    } else {
        state.voted_for = Some(req.candidate_id);
        (true, String::new())
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
        reason,
    }
}

/// Handle a vote response for the election started in `election_term`.
pub fn handle_vote_response(
    state: &mut RaftState,
    election_term: u64,
    voter: u64,
    resp: &VoteResponse,
    cluster_size: usize,
) -> VoteOutcome {
    if resp.term > state.current_term {
        state.become_follower(resp.term);
        return VoteOutcome::SteppedDown(resp.term);
    }
    if state.role != RaftRole::Candidate || state.current_term != election_term {
        return VoteOutcome::Ignored;
    }
    if !resp.vote_granted {
        return VoteOutcome::Pending(state.votes.len());
    }
    let votes = state.record_vote(voter);
    if votes >= RaftState::quorum(cluster_size) {
        VoteOutcome::Won(election_term)
    } else {
        VoteOutcome::Pending(votes)
    }
}

/// Handle Heartbeat RPC
pub fn handle_heartbeat(
    state: &mut RaftState,
    req: &HeartbeatRequest,
    my_id: u64,
) -> HeartbeatResponse {
    // Reject if request term is less than our current term
    if req.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            leader = req.leader_id,
            term = req.term,
            current_term = state.current_term,
            "Ignoring stale heartbeat"
        );
        return HeartbeatResponse {
            term: state.current_term,
            success: false,
        };
    }

    state.adopt_leader(req.term, req.leader_id, &req.leader_client_addr);
    state
        .peer_last_seen
        .insert(req.leader_id, std::time::Instant::now());

    HeartbeatResponse {
        term: state.current_term,
        success: true,
    }
}

/// Handle LeaderElected RPC
pub fn handle_leader_elected(
    state: &mut RaftState,
    req: &LeaderElectedRequest,
    my_id: u64,
) -> LeadershipAcknowledged {
    let accepted = req.term >= state.current_term;
    if accepted {
        state.adopt_leader(req.term, req.leader_id, &req.leader_client_addr);
        tracing::info!(
            node_id = my_id,
            leader = req.leader_id,
            term = req.term,
            "Acknowledged new leader"
        );
    }

    LeadershipAcknowledged {
        term: state.current_term,
        node_id: my_id,
        accepted,
    }
}
