use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::ServerError;
use crate::proto::cluster_service_server::ClusterService;
use crate::proto::{
    ClientRequest, ClientResponse, ClusterStatusRequest, ClusterStatusResponse, HeartbeatRequest,
    HeartbeatResponse, LeaderElectedRequest, LeadershipAcknowledged, NodeInfo, RoomRequest,
    RoomResponse, RoomSummary, StateUpdateRequest, StateUpdateResponse, VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;
use crate::registry::RoomRegistry;
use crate::replication::Replicator;
use crate::router::ClientRouter;

/// gRPC service for node-to-node communication
pub struct ClusterServiceImpl {
    raft_node: Arc<RaftNode>,
    registry: Arc<RoomRegistry>,
    replicator: Arc<Replicator>,
    router: Arc<ClientRouter>,
}

impl ClusterServiceImpl {
    pub fn new(
        raft_node: Arc<RaftNode>,
        registry: Arc<RoomRegistry>,
        replicator: Arc<Replicator>,
        router: Arc<ClientRouter>,
    ) -> Self {
        Self {
            raft_node,
            registry,
            replicator,
            router,
        }
    }
}

fn to_status(err: ServerError) -> Status {
    match err {
        ServerError::NotLeader(Some(id)) => {
            Status::failed_precondition(format!("Not the leader. Redirect to node {}", id))
        }
        ServerError::NotLeader(None) | ServerError::NoLeader => {
            Status::unavailable("Not the leader. Leader unknown, retry later")
        }
        ServerError::Serialization(e) => Status::invalid_argument(e.to_string()),
        ServerError::Protocol(msg) => Status::invalid_argument(msg),
        ServerError::Grpc(status) => status,
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.raft_node.handle_vote_request(req).await;
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(leader = req.leader_id, term = req.term, "Received Heartbeat");

        let response = self.raft_node.handle_heartbeat(req).await;
        Ok(Response::new(response))
    }

    async fn leader_elected(
        &self,
        request: Request<LeaderElectedRequest>,
    ) -> Result<Response<LeadershipAcknowledged>, Status> {
        let req = request.into_inner();
        tracing::debug!(leader = req.leader_id, term = req.term, "Received LeaderElected");

        let ack = self.raft_node.handle_leader_elected(req).await;
        Ok(Response::new(ack))
    }

    async fn state_update(
        &self,
        request: Request<StateUpdateRequest>,
    ) -> Result<Response<StateUpdateResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            sequence = req.sequence,
            room_code = %req.room_code,
            "Received StateUpdate"
        );

        let current_term = self.raft_node.current_term().await;
        let response = self
            .replicator
            .apply_state_update(req, current_term)
            .await
            .map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn forward_client_request(
        &self,
        request: Request<ClientRequest>,
    ) -> Result<Response<ClientResponse>, Status> {
        let req = request.into_inner();
        let response = self.router.handle_forwarded(req).await.map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn request_room(
        &self,
        request: Request<RoomRequest>,
    ) -> Result<Response<RoomResponse>, Status> {
        let req = request.into_inner();
        let Some(term) = self.raft_node.leader_term().await else {
            let leader = self.raft_node.get_leader_id().await;
            return Err(to_status(ServerError::NotLeader(leader)));
        };
        tracing::debug!(room_code = %req.room_code, "Received RequestRoom");

        let code = req.room_code.trim().to_ascii_uppercase();
        let response = self
            .replicator
            .serve_room_request(term, &code)
            .await
            .map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let view = self.raft_node.role_view();
        let leader_id = self.raft_node.get_leader_id().await;

        let mut peers: Vec<NodeInfo> = self
            .raft_node
            .peer_status()
            .await
            .into_iter()
            .map(|peer| NodeInfo {
                node_id: peer.node_id,
                address: peer.address,
                is_alive: peer.is_alive,
            })
            .collect();
        // Sort by node_id for consistent ordering
        peers.sort_by_key(|n| n.node_id);

        let rooms = self
            .registry
            .summaries()
            .await
            .into_iter()
            .map(|room| RoomSummary {
                code: room.code,
                phase: room.phase.to_string(),
                players: room.players as u32,
                active_players: room.active_players as u32,
            })
            .collect();

        Ok(Response::new(ClusterStatusResponse {
            node_id: self.raft_node.id,
            role: view.role.to_string(),
            term: view.term,
            leader_id,
            leader_client_addr: view.leader_client_addr.unwrap_or_default(),
            peers,
            rooms,
        }))
    }
}
