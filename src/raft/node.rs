use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::grpc::peers::PeerClients;
use crate::proto::{
    HeartbeatRequest, HeartbeatResponse, LeaderElectedRequest, LeadershipAcknowledged,
    VoteRequest, VoteResponse,
};
use crate::raft::rpc::{
    handle_heartbeat, handle_leader_elected, handle_request_vote, handle_vote_response,
    VoteOutcome,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Heartbeat received from leader (resets election timeout)
    HeartbeatReceived,
    /// A peer answered one of our vote requests
    VoteReceived {
        term: u64,
        peer_id: u64,
        response: VoteResponse,
    },
    /// A peer reported a term newer than ours
    HigherTermSeen { term: u64 },
    /// Trigger election
    TriggerElection,
}

/// Election state as seen by the rest of the node. Published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleView {
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub leader_client_addr: Option<String>,
}

impl RoleView {
    fn of(state: &RaftState) -> Self {
        Self {
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            leader_client_addr: state.leader_client_addr.clone(),
        }
    }
}

/// A configured peer and when it was last heard from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub node_id: u64,
    pub address: String,
    pub last_seen_ms: Option<u64>,
    pub is_alive: bool,
}

/// Term-based leader election over a fixed set of peers.
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: PeerClients,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    heartbeat_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    heartbeat_timers_started: AtomicU64,
    role_tx: watch::Sender<RoleView>,
}

impl RaftNode {
    pub fn new(config: NodeConfig, peers: PeerClients) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (message_tx, message_rx) = mpsc::channel(100);
        let state = RaftState::new();
        let (role_tx, _) = watch::channel(RoleView::of(&state));

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            config,
            peers,
            message_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            heartbeat_timer: Mutex::new(None),
            heartbeat_timers_started: AtomicU64::new(0),
            role_tx,
        };

        (node, message_rx)
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Receives a fresh [`RoleView`] whenever role, term or leader changes.
    pub fn subscribe(&self) -> watch::Receiver<RoleView> {
        self.role_tx.subscribe()
    }

    pub fn role_view(&self) -> RoleView {
        self.role_tx.borrow().clone()
    }

    /// How many heartbeat timers this node has started over its lifetime.
    pub fn heartbeat_timers_started(&self) -> u64 {
        self.heartbeat_timers_started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerClients {
        &self.peers
    }

    fn publish(&self, state: &RaftState) {
        let view = RoleView::of(state);
        self.role_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    /// Run the Raft node main loop until `shutdown` is cancelled
    pub async fn run(&self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.stop_heartbeat_timer().await;
                    tracing::info!(node_id = self.id, "Election loop stopped");
                    break;
                }

                // Handle incoming messages
                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::HeartbeatReceived => {
                            *self.last_heartbeat.write().await = Instant::now();
                            election_timeout = random_election_timeout(
                                self.config.election_timeout_min_ms,
                                self.config.election_timeout_max_ms,
                            );
                        }
                        RaftMessage::VoteReceived { term, peer_id, response } => {
                            self.handle_vote_response(term, peer_id, response).await;
                        }
                        RaftMessage::HigherTermSeen { term } => {
                            self.step_down(term).await;
                        }
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                        }
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }
            }
        }
    }

    /// Start a new election
    async fn start_election(&self) {
        let term = {
            let mut state = self.state.write().await;
            state.become_candidate(self.id);
            self.publish(&state);
            state.current_term
        };
        *self.last_heartbeat.write().await = Instant::now();

        tracing::info!(node_id = self.id, term, "Starting election");

        if RaftState::quorum(self.config.cluster_size()) <= 1 {
            self.become_leader(term).await;
            return;
        }

        // Request votes from all peers; answers come back through the event loop
        let req = VoteRequest {
            term,
            candidate_id: self.id,
        };
        for (peer_id, mut client) in self.peers.all() {
            let req = req.clone();
            let message_tx = self.message_tx.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                match timeout(rpc_timeout, client.request_vote(req)).await {
                    Ok(Ok(response)) => {
                        let _ = message_tx
                            .send(RaftMessage::VoteReceived {
                                term,
                                peer_id,
                                response: response.into_inner(),
                            })
                            .await;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(peer_id, error = %e, "Vote request failed");
                    }
                    Err(_) => {
                        tracing::debug!(peer_id, "Vote request timed out");
                    }
                }
            });
        }
    }

    async fn handle_vote_response(&self, term: u64, peer_id: u64, response: VoteResponse) {
        let outcome = {
            let mut state = self.state.write().await;
            let outcome = handle_vote_response(
                &mut state,
                term,
                peer_id,
                &response,
                self.config.cluster_size(),
            );
            self.publish(&state);
            outcome
        };

        match outcome {
            VoteOutcome::Won(term) => {
                self.become_leader(term).await;
            }
            VoteOutcome::Pending(votes) => {
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    term,
                    votes,
                    granted = response.vote_granted,
                    "Vote received"
                );
            }
            VoteOutcome::SteppedDown(newer) => {
                tracing::info!(node_id = self.id, term = newer, "Saw newer term, stepping down");
            }
            VoteOutcome::Ignored => {}
        }
    }

    /// Takes leadership for `term`. Only a candidate (or the current leader)
    /// of that exact term may do so. Calling it again for the same term is a
    /// no-op and never starts a second heartbeat timer.
    pub async fn become_leader(&self, term: u64) -> bool {
        let became = {
            let mut state = self.state.write().await;
            if state.current_term != term || state.role == RaftRole::Follower {
                return false;
            }
            let became = state.become_leader(self.id, &self.config.advertise_client_addr);
            self.publish(&state);
            became
        };

        self.start_heartbeat_timer(term).await;

        if became {
            tracing::info!(node_id = self.id, term, "Became leader");
            self.announce_leadership(term);
        }
        became
    }

    async fn step_down(&self, term: u64) {
        let mut state = self.state.write().await;
        if term <= state.current_term {
            return;
        }
        state.become_follower(term);
        self.publish(&state);
        drop(state);
        *self.last_heartbeat.write().await = Instant::now();
        tracing::info!(node_id = self.id, term, "Stepped down to follower");
    }

    async fn start_heartbeat_timer(&self, term: u64) {
        let mut timer = self.heartbeat_timer.lock().await;
        if let Some((running_term, handle)) = timer.as_ref() {
            if *running_term == term && !handle.is_finished() {
                return;
            }
        }
        if let Some((_, handle)) = timer.take() {
            handle.abort();
        }

        self.heartbeat_timers_started.fetch_add(1, Ordering::SeqCst);
        let sender = HeartbeatSender {
            node_id: self.id,
            term,
            client_addr: self.config.advertise_client_addr.clone(),
            interval: Duration::from_millis(self.config.heartbeat_interval_ms),
            rpc_timeout: self.config.rpc_timeout(),
            state: self.state.clone(),
            peers: self.peers.clone(),
            message_tx: self.message_tx.clone(),
        };
        *timer = Some((term, tokio::spawn(sender.run())));
    }

    async fn stop_heartbeat_timer(&self) {
        if let Some((_, handle)) = self.heartbeat_timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Tell every peer about the new leader
    fn announce_leadership(&self, term: u64) {
        let req = LeaderElectedRequest {
            term,
            leader_id: self.id,
            leader_client_addr: self.config.advertise_client_addr.clone(),
        };
        for (peer_id, mut client) in self.peers.all() {
            let req = req.clone();
            let message_tx = self.message_tx.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                match timeout(rpc_timeout, client.leader_elected(req)).await {
                    Ok(Ok(ack)) => {
                        let ack = ack.into_inner();
                        if ack.term > term {
                            let _ = message_tx
                                .send(RaftMessage::HigherTermSeen { term: ack.term })
                                .await;
                        }
                        tracing::debug!(peer_id, accepted = ack.accepted, "Leadership acknowledged");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(peer_id, error = %e, "LeaderElected failed");
                    }
                    Err(_) => {
                        tracing::debug!(peer_id, "LeaderElected timed out");
                    }
                }
            });
        }
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let response = handle_request_vote(&mut state, &req, self.id);
        self.publish(&state);
        drop(state);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming Heartbeat RPC
    pub async fn handle_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let mut state = self.state.write().await;
        let response = handle_heartbeat(&mut state, &req, self.id);
        self.publish(&state);
        drop(state);

        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
            let _ = self.message_tx.try_send(RaftMessage::HeartbeatReceived);
        }

        response
    }

    /// Handle incoming LeaderElected RPC
    pub async fn handle_leader_elected(&self, req: LeaderElectedRequest) -> LeadershipAcknowledged {
        let mut state = self.state.write().await;
        let ack = handle_leader_elected(&mut state, &req, self.id);
        self.publish(&state);
        drop(state);

        if ack.accepted {
            *self.last_heartbeat.write().await = Instant::now();
            let _ = self.message_tx.try_send(RaftMessage::HeartbeatReceived);
        }

        ack
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// The current term if this node leads it.
    pub async fn leader_term(&self) -> Option<u64> {
        let state = self.state.read().await;
        state.is_leader().then_some(state.current_term)
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Liveness of every configured peer, as observed from this node. A peer
    /// is alive if heard from within two maximum election timeouts.
    pub async fn peer_status(&self) -> Vec<PeerStatus> {
        let state = self.state.read().await;
        let alive_within = self.config.election_timeout_max_ms * 2;
        self.config
            .peers
            .iter()
            .map(|peer| {
                let last_seen_ms = state
                    .peer_last_seen
                    .get(&peer.node_id)
                    .map(|at| at.elapsed().as_millis() as u64);
                PeerStatus {
                    node_id: peer.node_id,
                    address: peer.addr.clone(),
                    last_seen_ms,
                    is_alive: last_seen_ms.is_some_and(|ms| ms <= alive_within),
                }
            })
            .collect()
    }
}

/// Periodic heartbeat broadcast for one leadership term. Exits as soon as
/// the node no longer leads that term.
struct HeartbeatSender {
    node_id: u64,
    term: u64,
    client_addr: String,
    interval: Duration,
    rpc_timeout: Duration,
    state: Arc<RwLock<RaftState>>,
    peers: PeerClients,
    message_tx: mpsc::Sender<RaftMessage>,
}

impl HeartbeatSender {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            {
                let state = self.state.read().await;
                if state.role != RaftRole::Leader || state.current_term != self.term {
                    break;
                }
            }
            self.send_round();
        }
        tracing::debug!(node_id = self.node_id, term = self.term, "Heartbeat timer stopped");
    }

    fn send_round(&self) {
        let req = HeartbeatRequest {
            term: self.term,
            leader_id: self.node_id,
            leader_client_addr: self.client_addr.clone(),
        };

        for (peer_id, mut client) in self.peers.all() {
            let req = req.clone();
            let term = self.term;
            let rpc_timeout = self.rpc_timeout;
            let state = self.state.clone();
            let message_tx = self.message_tx.clone();

            tokio::spawn(async move {
                match timeout(rpc_timeout, client.heartbeat(req)).await {
                    Ok(Ok(response)) => {
                        let resp = response.into_inner();
                        if resp.term > term {
                            let _ = message_tx
                                .send(RaftMessage::HigherTermSeen { term: resp.term })
                                .await;
                            return;
                        }
                        if resp.success {
                            state
                                .write()
                                .await
                                .peer_last_seen
                                .insert(peer_id, std::time::Instant::now());
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "Heartbeat failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "Heartbeat timed out");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_node() -> (RaftNode, mpsc::Receiver<RaftMessage>) {
        let config = NodeConfig::default();
        RaftNode::new(config, PeerClients::default())
    }

    #[tokio::test]
    async fn test_become_leader_twice_starts_one_timer() {
        let (node, _rx) = single_node();
        let term = {
            let mut state = node.state.write().await;
            state.become_candidate(node.id);
            state.current_term
        };

        assert!(node.become_leader(term).await);
        assert!(!node.become_leader(term).await);

        assert_eq!(node.heartbeat_timers_started(), 1);
        assert!(node.is_leader().await);
        node.stop_heartbeat_timer().await;
    }

    #[tokio::test]
    async fn test_become_leader_rejected_for_other_term() {
        let (node, _rx) = single_node();
        node.state.write().await.become_candidate(node.id);

        assert!(!node.become_leader(7).await);
        assert_eq!(node.heartbeat_timers_started(), 0);
        assert!(!node.is_leader().await);
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let (node, rx) = single_node();
        let node = Arc::new(node);
        let shutdown = CancellationToken::new();
        let mut roles = node.subscribe();

        let runner = node.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(rx, token).await });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if roles.borrow_and_update().role == RaftRole::Leader {
                    break;
                }
                roles.changed().await.unwrap();
            }
        })
        .await
        .expect("single node should elect itself");

        let view = node.role_view();
        assert_eq!(view.leader_id, Some(node.id));
        assert_eq!(view.term, 1);
        assert_eq!(node.heartbeat_timers_started(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_steps_leader_down() {
        let (node, _rx) = single_node();
        let term = {
            let mut state = node.state.write().await;
            state.become_candidate(node.id);
            state.current_term
        };
        node.become_leader(term).await;

        let resp = node
            .handle_heartbeat(HeartbeatRequest {
                term: term + 1,
                leader_id: 9,
                leader_client_addr: "10.0.0.9:3000".to_string(),
            })
            .await;

        assert!(resp.success);
        let view = node.role_view();
        assert_eq!(view.role, RaftRole::Follower);
        assert_eq!(view.leader_id, Some(9));
        assert_eq!(view.leader_client_addr.as_deref(), Some("10.0.0.9:3000"));
        node.stop_heartbeat_timer().await;
    }
}
