use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::config::NodeConfig;
use crate::game::engine::Engine;
use crate::gateway::{run_gateway, ClientHub, GatewayState};
use crate::grpc::{ClusterServiceImpl, GrpcServer, PeerClients};
use crate::raft::{RaftMessage, RaftNode, RaftRole};
use crate::registry::RoomRegistry;
use crate::replication::Replicator;
use crate::router::ClientRouter;
use crate::ticker::TickScheduler;

/// Main node that orchestrates all components
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub registry: Arc<RoomRegistry>,
    pub hub: Arc<ClientHub>,
    pub replicator: Arc<Replicator>,
    pub ticker: Arc<TickScheduler>,
    pub router: Arc<ClientRouter>,
    shutdown: CancellationToken,
}

impl Node {
    /// Builds every component. Must be called from within a Tokio runtime:
    /// peer channels and replication senders are created here.
    pub fn new(config: NodeConfig, shutdown: CancellationToken) -> (Self, mpsc::Receiver<RaftMessage>) {
        let peers = PeerClients::connect_lazy(&config);
        let (raft_node, raft_rx) = RaftNode::new(config.clone(), peers.clone());
        let raft_node = Arc::new(raft_node);

        let registry = Arc::new(RoomRegistry::new());
        let hub = Arc::new(ClientHub::new());
        let engine = Arc::new(Engine::new(config.game.clone()));
        let replicator = Arc::new(Replicator::new(
            &config,
            registry.clone(),
            hub.clone(),
            peers,
            raft_node.message_sender(),
            shutdown.clone(),
        ));
        let ticker = Arc::new(TickScheduler::new(
            registry.clone(),
            engine.clone(),
            replicator.clone(),
            raft_node.clone(),
            shutdown.clone(),
        ));
        let router = Arc::new(ClientRouter::new(
            raft_node.clone(),
            CommandHandler::new(registry.clone(), engine),
            registry.clone(),
            replicator.clone(),
            ticker.clone(),
            hub.clone(),
        ));

        let node = Self {
            config,
            raft_node,
            registry,
            hub,
            replicator,
            ticker,
            router,
            shutdown,
        };

        (node, raft_rx)
    }

    /// Run the node with all components.
    ///
    /// Spawns the election loop, the role watcher and the client gateway,
    /// then runs the cluster gRPC server until the shutdown token fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to start or encounters a fatal error.
    /// The gateway runs as a spawned task and logs its own errors.
    pub async fn run(
        self,
        raft_rx: mpsc::Receiver<RaftMessage>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Spawn election loop
        let raft_node = self.raft_node.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            raft_node.run(raft_rx, token).await;
        });

        // React to leadership changes
        tokio::spawn(Self::watch_roles(
            self.raft_node.clone(),
            self.ticker.clone(),
            self.hub.clone(),
            self.router.clone(),
            self.shutdown.clone(),
        ));

        // Client gateway
        let gateway_state = GatewayState {
            raft_node: self.raft_node.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
        };
        let client_addr = self.config.client_addr;
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_gateway(client_addr, gateway_state, token).await {
                tracing::error!(addr = %client_addr, error = %e, "Client gateway failed");
            }
        });

        // Run gRPC server (blocks until shutdown)
        let service = ClusterServiceImpl::new(
            self.raft_node.clone(),
            self.registry.clone(),
            self.replicator.clone(),
            self.router.clone(),
        );
        let server = GrpcServer::new(self.config.listen_addr, service);
        server.run(self.shutdown.clone()).await?;

        self.ticker.stop_all().await;
        tracing::info!(node_id = self.config.node_id, "Node stopped");
        Ok(())
    }

    /// Starts tick loops on winning an election, stops them on losing
    /// leadership, and keeps every local client's `leaderInfo` current.
    async fn watch_roles(
        raft_node: Arc<RaftNode>,
        ticker: Arc<TickScheduler>,
        hub: Arc<ClientHub>,
        router: Arc<ClientRouter>,
        shutdown: CancellationToken,
    ) {
        let mut roles = raft_node.subscribe();
        let mut was_leader = false;
        let mut announced: Option<(bool, Option<String>)> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let view = roles.borrow_and_update().clone();
            let is_leader = view.role == RaftRole::Leader;

            if is_leader && !was_leader {
                let started = ticker.start_playing_rooms().await;
                tracing::info!(node_id = raft_node.id, term = view.term, rooms = started, "Resumed rooms as leader");
            } else if !is_leader && was_leader {
                ticker.stop_all().await;
            }
            was_leader = is_leader;

            let current = (is_leader, view.leader_client_addr.clone());
            if announced.as_ref() != Some(&current) {
                hub.broadcast_all(&router.leader_info()).await;
                announced = Some(current);
            }
        }
    }
}
