//! Routes client events to the leader and replies back to the client.
//!
//! On the leader an event is executed directly. A follower relays it over
//! the cluster link and only delivers the replies; room broadcasts reach
//! its clients through replication.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::commands::CommandHandler;
use crate::error::{Result, ServerError};
use crate::gateway::hub::ClientHub;
use crate::proto::{ClientRequest, ClientResponse};
use crate::protocol::{ClientEvent, Membership, ServerEvent};
use crate::raft::{RaftNode, RaftRole};
use crate::registry::RoomRegistry;
use crate::replication::Replicator;
use crate::ticker::TickScheduler;

pub struct ClientRouter {
    raft_node: Arc<RaftNode>,
    commands: CommandHandler,
    registry: Arc<RoomRegistry>,
    replicator: Arc<Replicator>,
    ticker: Arc<TickScheduler>,
    hub: Arc<ClientHub>,
}

impl ClientRouter {
    pub fn new(
        raft_node: Arc<RaftNode>,
        commands: CommandHandler,
        registry: Arc<RoomRegistry>,
        replicator: Arc<Replicator>,
        ticker: Arc<TickScheduler>,
        hub: Arc<ClientHub>,
    ) -> Self {
        Self {
            raft_node,
            commands,
            registry,
            replicator,
            ticker,
            hub,
        }
    }

    /// `leaderInfo` as seen from this node.
    pub fn leader_info(&self) -> ServerEvent {
        let view = self.raft_node.role_view();
        ServerEvent::LeaderInfo {
            is_leader: view.role == RaftRole::Leader,
            leader_address: view.leader_client_addr,
        }
    }

    /// Registers a new client and greets it with `init` and `leaderInfo`.
    pub async fn connect(&self) -> (String, mpsc::Receiver<String>) {
        let (id, rx) = self.hub.register().await;
        self.hub.send(&id, &ServerEvent::Init { id: id.clone() }).await;
        self.hub.send(&id, &self.leader_info()).await;
        (id, rx)
    }

    /// Handles one text frame from a local client. Failures are reported to
    /// that client only.
    pub async fn handle_frame(&self, connection_id: &str, frame: &str) {
        let result = match ClientEvent::decode(frame) {
            // Only the gateway may report a dropped connection
            Ok(ClientEvent::Disconnect) => Err(ServerError::Protocol(
                "disconnect is not a client event".to_string(),
            )),
            Ok(event) => self.dispatch(connection_id, event).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(replies) => self.deliver(connection_id, replies).await,
            Err(e) => {
                tracing::debug!(connection_id, error = %e, "Client event rejected");
                self.hub.send(connection_id, &ServerEvent::error(&e)).await;
            }
        }
    }

    /// Cleans up after a local client went away.
    pub async fn disconnect(&self, connection_id: &str) {
        let in_room = self.hub.room_of(connection_id).await.is_some();
        self.hub.unregister(connection_id).await;
        if !in_room && self.registry.room_of(connection_id).await.is_none() {
            return;
        }
        if let Err(e) = self.dispatch(connection_id, ClientEvent::Disconnect).await {
            tracing::warn!(connection_id, error = %e, "Failed to process disconnect");
        }
    }

    /// Executes a request relayed by a follower. Game errors are returned to
    /// the client as `error` replies; only leadership problems fail the call.
    pub async fn handle_forwarded(&self, req: ClientRequest) -> Result<ClientResponse> {
        let Some(term) = self.raft_node.leader_term().await else {
            return Err(ServerError::NotLeader(self.raft_node.get_leader_id().await));
        };
        tracing::debug!(origin = req.origin_node, connection_id = %req.connection_id, "Forwarded client event");

        let replies = match ClientEvent::decode(&req.payload) {
            Ok(event) => match self.execute(term, &req.connection_id, event).await {
                Ok(replies) => replies,
                Err(e) => vec![ServerEvent::error(&e)],
            },
            Err(e) => vec![ServerEvent::error(&e)],
        };
        let replies = replies
            .iter()
            .map(ServerEvent::encode)
            .collect::<Result<Vec<_>>>()?;
        Ok(ClientResponse { replies })
    }

    async fn dispatch(&self, connection_id: &str, event: ClientEvent) -> Result<Vec<ServerEvent>> {
        if let Some(term) = self.raft_node.leader_term().await {
            return self.execute(term, connection_id, event).await;
        }

        let leader = self.raft_node.get_leader_id().await;
        if let ClientEvent::RejoinRoom { room_code, .. } = &event {
            let code = room_code.trim().to_ascii_uppercase();
            if !self.registry.contains(&code).await
                && !self.replicator.request_room_from_leader(leader, &code).await?
            {
                return Err(ServerError::RoomNotFound(code));
            }
        }
        self.replicator
            .forward_to_leader(leader, connection_id, &event)
            .await
    }

    /// Leader-side execution: mutate, replicate, start loops.
    async fn execute(
        &self,
        term: u64,
        connection_id: &str,
        event: ClientEvent,
    ) -> Result<Vec<ServerEvent>> {
        let outcome = self.commands.handle(term, connection_id, event).await?;
        for change in outcome.changes {
            self.replicator.replicate(change).await;
        }
        if let Some(code) = outcome.start_loop {
            self.ticker.start(&code).await;
        }
        Ok(outcome.replies)
    }

    /// Sends replies to their client. Entering a room also sends the local
    /// copy of its state, which may have been broadcast before the client
    /// was a member.
    async fn deliver(&self, connection_id: &str, replies: Vec<ServerEvent>) {
        for reply in &replies {
            self.hub.apply_membership(connection_id, reply).await;
            self.hub.send(connection_id, reply).await;

            if let Some(Membership::Entered(code)) = reply.membership() {
                if let Some(shared) = self.registry.get(code).await {
                    let room = shared.lock().await.clone();
                    self.hub
                        .send(connection_id, &ServerEvent::GameState(Box::new(room)))
                        .await;
                }
            }
        }
    }
}
