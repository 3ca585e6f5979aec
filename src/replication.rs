//! Room replication between the leader and its followers.
//!
//! The leader pushes a full room snapshot after every mutation, tagged with
//! `(term, sequence)`. Followers keep those snapshots as read-only replicas,
//! fan them out to their own clients and relay client writes to the leader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::commands::RoomChange;
use crate::config::NodeConfig;
use crate::error::{Result, ServerError};
use crate::gateway::hub::ClientHub;
use crate::game::room::Room;
use crate::grpc::peers::{PeerClient, PeerClients};
use crate::proto::{
    ClientRequest, RoomRequest, RoomResponse, StateUpdateRequest, StateUpdateResponse,
};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::raft::RaftMessage;
use crate::registry::{RoomRegistry, RoomVersion};

/// Updates queued per peer before new ones are dropped.
pub const PEER_QUEUE_CAPACITY: usize = 1024;

/// Room events kept per parked update while a peer is unreachable.
const MAX_PARKED_EVENTS: usize = 64;

pub struct Replicator {
    node_id: u64,
    registry: Arc<RoomRegistry>,
    hub: Arc<ClientHub>,
    peers: PeerClients,
    outbound: HashMap<u64, mpsc::Sender<StateUpdateRequest>>,
    relay_timeout: Duration,
}

impl Replicator {
    /// Starts one ordered sender task per peer. The tasks exit on `shutdown`
    /// or when the replicator is dropped.
    pub fn new(
        config: &NodeConfig,
        registry: Arc<RoomRegistry>,
        hub: Arc<ClientHub>,
        peers: PeerClients,
        raft_tx: mpsc::Sender<RaftMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut outbound = HashMap::new();
        for (peer_id, client) in peers.all() {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
            let sender = PeerSender {
                peer_id,
                client,
                rx,
                raft_tx: raft_tx.clone(),
                rpc_timeout: config.rpc_timeout(),
                retry_delay: Duration::from_millis(config.heartbeat_interval_ms),
                pending: Vec::new(),
            };
            tokio::spawn(sender.run(shutdown.clone()));
            outbound.insert(peer_id, tx);
        }

        Self {
            node_id: config.node_id,
            registry,
            hub,
            peers,
            outbound,
            relay_timeout: config.room_request_timeout(),
        }
    }

    /// Publishes a leader-side change: local clients first, then every peer.
    pub async fn replicate(&self, change: RoomChange) {
        let version = RoomVersion {
            term: change.term,
            sequence: change.sequence,
        };
        self.hub
            .broadcast_room(&change.code, version, &change.events, change.room.as_ref())
            .await;

        if self.outbound.is_empty() {
            return;
        }
        let req = match encode_update(self.node_id, &change) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(room_code = %change.code, error = %e, "Failed to encode room snapshot");
                return;
            }
        };
        for (peer_id, tx) in &self.outbound {
            match tx.try_send(req.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(peer_id, room_code = %change.code, "Replication queue full, dropping update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(peer_id, "Replication sender stopped");
                }
            }
        }
    }

    /// Applies a snapshot pushed by the leader, unless it is from an older
    /// term than `current_term` or older than what this node already holds.
    pub async fn apply_state_update(
        &self,
        req: StateUpdateRequest,
        current_term: u64,
    ) -> Result<StateUpdateResponse> {
        if req.term < current_term {
            tracing::debug!(
                leader = req.leader_id,
                term = req.term,
                current_term,
                "Ignoring state update from stale leader"
            );
            return Ok(StateUpdateResponse {
                term: current_term,
                applied: false,
            });
        }

        let room: Option<Room> = if req.removed {
            None
        } else {
            Some(serde_json::from_slice(&req.room)?)
        };
        let events = req
            .events
            .iter()
            .map(|frame| ServerEvent::decode(frame))
            .collect::<Result<Vec<_>>>()?;
        let version = RoomVersion {
            term: req.term,
            sequence: req.sequence,
        };

        let applied = self
            .registry
            .apply_snapshot(&req.room_code, version, room.clone())
            .await;
        if applied {
            tracing::trace!(room_code = %req.room_code, term = req.term, sequence = req.sequence, "Applied room snapshot");
            self.hub
                .broadcast_room(&req.room_code, version, &events, room.as_ref())
                .await;
        } else {
            tracing::debug!(room_code = %req.room_code, term = req.term, sequence = req.sequence, "Dropped stale room snapshot");
        }

        Ok(StateUpdateResponse {
            term: req.term.max(current_term),
            applied,
        })
    }

    /// Relays a client event to the leader and returns the replies addressed
    /// to the client.
    pub async fn forward_to_leader(
        &self,
        leader_id: Option<u64>,
        connection_id: &str,
        event: &ClientEvent,
    ) -> Result<Vec<ServerEvent>> {
        let (leader, mut client) = self.leader_client(leader_id)?;
        let req = ClientRequest {
            origin_node: self.node_id,
            connection_id: connection_id.to_string(),
            payload: event.encode()?,
        };

        tracing::debug!(leader, connection_id, "Forwarding client event to leader");
        let response = timeout(self.relay_timeout, client.forward_client_request(req))
            .await
            .map_err(|_| ServerError::ReplicationTimeout(format!("leader {leader} did not answer")))??
            .into_inner();

        response
            .replies
            .iter()
            .map(|frame| ServerEvent::decode(frame))
            .collect()
    }

    /// Fetches a room this node has no replica of from the leader. Returns
    /// whether the leader knows the room.
    pub async fn request_room_from_leader(&self, leader_id: Option<u64>, code: &str) -> Result<bool> {
        let (leader, mut client) = self.leader_client(leader_id)?;
        let req = RoomRequest {
            room_code: code.to_string(),
        };

        let response = timeout(self.relay_timeout, client.request_room(req))
            .await
            .map_err(|_| {
                ServerError::ReplicationTimeout(format!("room {code} not received from leader {leader}"))
            })??
            .into_inner();
        if !response.found {
            return Ok(false);
        }

        let room: Room = serde_json::from_slice(&response.room)?;
        let version = RoomVersion {
            term: response.term,
            sequence: response.sequence,
        };
        self.registry.apply_snapshot(code, version, Some(room)).await;
        tracing::debug!(room_code = code, leader, "Fetched room from leader");
        Ok(true)
    }

    /// Answers a follower's room request with a fresh snapshot numbered in
    /// `term`.
    pub async fn serve_room_request(&self, term: u64, code: &str) -> Result<RoomResponse> {
        let Some(shared) = self.registry.get(code).await else {
            return Ok(RoomResponse {
                found: false,
                term,
                sequence: 0,
                room: Vec::new(),
            });
        };
        let room = shared.lock().await;
        Ok(RoomResponse {
            found: true,
            term,
            sequence: self.registry.next_sequence(),
            room: serde_json::to_vec(&*room)?,
        })
    }

    fn leader_client(&self, leader_id: Option<u64>) -> Result<(u64, PeerClient)> {
        let leader = leader_id.ok_or(ServerError::NoLeader)?;
        let client = self
            .peers
            .get(leader)
            .ok_or_else(|| ServerError::Internal(format!("leader {leader} is not a configured peer")))?;
        Ok((leader, client))
    }
}

fn encode_update(leader_id: u64, change: &RoomChange) -> Result<StateUpdateRequest> {
    let room = match &change.room {
        Some(room) => serde_json::to_vec(room)?,
        None => Vec::new(),
    };
    let events = change
        .events
        .iter()
        .map(ServerEvent::encode)
        .collect::<Result<Vec<_>>>()?;
    Ok(StateUpdateRequest {
        term: change.term,
        leader_id,
        sequence: change.sequence,
        room_code: change.code.clone(),
        room,
        removed: change.room.is_none(),
        events,
    })
}

/// Collapses queued updates so each room is sent once with its newest
/// snapshot. Events of the collapsed updates are kept, in order.
fn coalesce(batch: Vec<StateUpdateRequest>) -> Vec<StateUpdateRequest> {
    let mut merged: Vec<StateUpdateRequest> = Vec::with_capacity(batch.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for req in batch {
        match index.get(&req.room_code) {
            Some(&i) => {
                let mut events = std::mem::take(&mut merged[i].events);
                events.extend(req.events.iter().cloned());
                merged[i] = StateUpdateRequest { events, ..req };
            }
            None => {
                index.insert(req.room_code.clone(), merged.len());
                merged.push(req);
            }
        }
    }
    merged
}

/// What one push attempt tells the sender to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Peer unreachable; keep the update for the next round.
    Retry,
    /// Peer is in a newer term; this node no longer leads.
    Superseded,
}

/// Delivers updates to one peer in order.
///
/// Updates the peer did not take are kept (newest per room) and retried
/// every `retry_delay` until they land or a newer update replaces them.
/// Resending is safe: the follower drops versions it already applied.
struct PeerSender {
    peer_id: u64,
    client: PeerClient,
    rx: mpsc::Receiver<StateUpdateRequest>,
    raft_tx: mpsc::Sender<RaftMessage>,
    rpc_timeout: Duration,
    retry_delay: Duration,
    pending: Vec<StateUpdateRequest>,
}

impl PeerSender {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let mut batch = std::mem::take(&mut self.pending);
            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = self.rx.recv() => match next {
                        Some(req) => batch.push(req),
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
            while let Ok(req) = self.rx.try_recv() {
                batch.push(req);
            }

            self.push_batch(coalesce(batch)).await;
        }
        tracing::debug!(peer_id = self.peer_id, "Replication sender stopped");
    }

    /// Sends a coalesced batch in order. On the first unreachable send the
    /// rest is parked in `pending`.
    async fn push_batch(&mut self, batch: Vec<StateUpdateRequest>) {
        let mut updates = batch.into_iter();
        while let Some(req) = updates.next() {
            match self.send(&req).await {
                Delivery::Sent => {}
                Delivery::Retry => {
                    self.pending.push(req);
                    self.pending.extend(updates);
                    for parked in &mut self.pending {
                        let excess = parked.events.len().saturating_sub(MAX_PARKED_EVENTS);
                        parked.events.drain(..excess);
                    }
                    tracing::debug!(peer_id = self.peer_id, pending = self.pending.len(), "Parked room updates for retry");
                    return;
                }
                Delivery::Superseded => return,
            }
        }
    }

    async fn send(&mut self, req: &StateUpdateRequest) -> Delivery {
        let term = req.term;
        match timeout(self.rpc_timeout, self.client.state_update(req.clone())).await {
            Ok(Ok(response)) => {
                let resp = response.into_inner();
                if resp.term > term {
                    let _ = self
                        .raft_tx
                        .send(RaftMessage::HigherTermSeen { term: resp.term })
                        .await;
                    return Delivery::Superseded;
                }
                Delivery::Sent
            }
            Ok(Err(e)) => {
                tracing::debug!(peer_id = self.peer_id, room_code = %req.room_code, error = %e, "State update failed");
                Delivery::Retry
            }
            Err(_) => {
                tracing::debug!(peer_id = self.peer_id, room_code = %req.room_code, "State update timed out");
                Delivery::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;

    fn replicator() -> (Replicator, Arc<RoomRegistry>, Arc<ClientHub>) {
        let registry = Arc::new(RoomRegistry::new());
        let hub = Arc::new(ClientHub::new());
        let (raft_tx, _raft_rx) = mpsc::channel(8);
        let replicator = Replicator::new(
            &NodeConfig::default(),
            registry.clone(),
            hub.clone(),
            PeerClients::default(),
            raft_tx,
            CancellationToken::new(),
        );
        (replicator, registry, hub)
    }

    fn change(term: u64, sequence: u64, room: Option<Room>) -> RoomChange {
        RoomChange {
            code: "ABCDEF".to_string(),
            term,
            sequence,
            room,
            events: vec![ServerEvent::HostAssigned {
                player_id: "p1".to_string(),
            }],
        }
    }

    fn leader_room() -> Room {
        let mut room = Room::new("ABCDEF", &GameConfig::default());
        room.add_player("p1", "ann", 8).unwrap();
        room.add_player("p2", "bob", 8).unwrap();
        room.set_ready("p1", true).unwrap();
        room
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_matches_leader() {
        let (follower, registry, _hub) = replicator();
        let room = leader_room();
        let req = encode_update(1, &change(3, 7, Some(room.clone()))).unwrap();

        let resp = follower.apply_state_update(req, 3).await.unwrap();

        assert!(resp.applied);
        let replica = registry.get("ABCDEF").await.unwrap();
        assert_eq!(*replica.lock().await, room);
        assert_eq!(registry.room_of("p2").await.as_deref(), Some("ABCDEF"));
    }

    #[tokio::test]
    async fn test_stale_snapshots_rejected() {
        let (follower, registry, _hub) = replicator();
        let mut newer = leader_room();
        newer.set_ready("p2", true).unwrap();

        let req = encode_update(1, &change(2, 10, Some(newer.clone()))).unwrap();
        assert!(follower.apply_state_update(req, 2).await.unwrap().applied);

        // Older sequence in the same term
        let req = encode_update(1, &change(2, 9, Some(leader_room()))).unwrap();
        assert!(!follower.apply_state_update(req, 2).await.unwrap().applied);

        // Leader of an older term
        let req = encode_update(1, &change(1, 50, Some(leader_room()))).unwrap();
        let resp = follower.apply_state_update(req, 2).await.unwrap();
        assert!(!resp.applied);
        assert_eq!(resp.term, 2);

        let replica = registry.get("ABCDEF").await.unwrap();
        assert_eq!(*replica.lock().await, newer);
    }

    #[tokio::test]
    async fn test_tombstone_removes_replica() {
        let (follower, registry, _hub) = replicator();
        let req = encode_update(1, &change(1, 1, Some(leader_room()))).unwrap();
        follower.apply_state_update(req, 1).await.unwrap();

        let req = encode_update(1, &change(1, 2, None)).unwrap();
        assert!(req.removed);
        assert!(follower.apply_state_update(req, 1).await.unwrap().applied);
        assert!(!registry.contains("ABCDEF").await);
    }

    #[tokio::test]
    async fn test_applied_update_reaches_local_members() {
        let (follower, _registry, hub) = replicator();
        let (id, mut rx) = hub.register().await;
        hub.apply_membership(
            &id,
            &ServerEvent::RoomJoined {
                room_code: "ABCDEF".to_string(),
                player_id: id.clone(),
            },
        )
        .await;

        let req = encode_update(1, &change(1, 1, Some(leader_room()))).unwrap();
        follower.apply_state_update(req, 1).await.unwrap();

        let first = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        let second = ServerEvent::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(first, ServerEvent::HostAssigned { .. }));
        assert!(matches!(second, ServerEvent::GameState(_)));
    }

    #[tokio::test]
    async fn test_serve_room_request() {
        let (leader, registry, _hub) = replicator();
        let room = leader_room();
        registry.insert(room.clone()).await;

        let resp = leader.serve_room_request(4, "ABCDEF").await.unwrap();
        assert!(resp.found);
        assert_eq!(resp.term, 4);
        let back: Room = serde_json::from_slice(&resp.room).unwrap();
        assert_eq!(back, room);

        let missing = leader.serve_room_request(4, "ZZZZZZ").await.unwrap();
        assert!(!missing.found);
    }

    #[tokio::test]
    async fn test_forward_without_leader_fails() {
        let (follower, _registry, _hub) = replicator();
        let err = follower
            .forward_to_leader(None, "c1", &ClientEvent::StartGame)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NoLeader));
    }

    #[test]
    fn test_coalesce_keeps_latest_snapshot_and_all_events() {
        let a1 = encode_update(1, &change(1, 1, Some(leader_room()))).unwrap();
        let mut b = encode_update(1, &change(1, 2, Some(leader_room()))).unwrap();
        b.room_code = "BBBBBB".to_string();
        let a2 = encode_update(1, &change(1, 3, None)).unwrap();

        let merged = coalesce(vec![a1, b, a2]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].room_code, "ABCDEF");
        assert_eq!(merged[0].sequence, 3);
        assert!(merged[0].removed);
        assert_eq!(merged[0].events.len(), 2);
        assert_eq!(merged[1].room_code, "BBBBBB");
    }

    #[tokio::test]
    async fn test_unreachable_peer_keeps_updates_for_retry() {
        let channel = tonic::transport::Channel::from_static("http://127.0.0.1:1").connect_lazy();
        let (_tx, rx) = mpsc::channel(8);
        let (raft_tx, _raft_rx) = mpsc::channel(8);
        let mut sender = PeerSender {
            peer_id: 2,
            client: PeerClient::new(channel),
            rx,
            raft_tx,
            rpc_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(10),
            pending: Vec::new(),
        };

        let a = encode_update(1, &change(1, 1, Some(leader_room()))).unwrap();
        let mut b = encode_update(1, &change(1, 2, Some(leader_room()))).unwrap();
        b.room_code = "BBBBBB".to_string();
        sender.push_batch(vec![a, b]).await;

        assert_eq!(sender.pending.len(), 2);
        assert_eq!(sender.pending[0].room_code, "ABCDEF");
        assert_eq!(sender.pending[1].room_code, "BBBBBB");

        // A newer update for a parked room replaces it on the next round
        let a2 = encode_update(1, &change(1, 3, Some(leader_room()))).unwrap();
        let mut batch = std::mem::take(&mut sender.pending);
        batch.push(a2);
        sender.push_batch(coalesce(batch)).await;

        assert_eq!(sender.pending.len(), 2);
        assert_eq!(sender.pending[0].room_code, "ABCDEF");
        assert_eq!(sender.pending[0].sequence, 3);
    }
}
