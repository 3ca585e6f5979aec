//! Test harness for multi-node game cluster integration tests.
//!
//! Provides utilities for spawning, managing, and testing multi-node clusters,
//! plus in-process game clients attached to a node's router.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tetris_cluster::config::{NodeConfig, PeerConfig};
use tetris_cluster::gateway::ClientHub;
use tetris_cluster::node::Node;
use tetris_cluster::protocol::ServerEvent;
use tetris_cluster::raft::{RaftNode, RaftRole};
use tetris_cluster::registry::RoomRegistry;
use tetris_cluster::router::ClientRouter;
use tetris_cluster::ticker::TickScheduler;

/// Offset between a node's cluster port and its client port.
const CLIENT_PORT_OFFSET: u16 = 1000;

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64, port: u16, peers: Vec<(u64, u16)>) -> NodeConfig {
    let peer_configs: Vec<PeerConfig> = peers
        .into_iter()
        .map(|(id, p)| PeerConfig {
            node_id: id,
            addr: format!("127.0.0.1:{}", p),
        })
        .collect();

    let client_addr = format!("127.0.0.1:{}", port + CLIENT_PORT_OFFSET)
        .parse()
        .unwrap();

    let mut config = NodeConfig::new(node_id, format!("127.0.0.1:{}", port).parse().unwrap())
        .with_client_addr(client_addr);
    config.peers = peer_configs;
    // Shorter timeouts for faster tests
    config.election_timeout_min_ms = 50;
    config.election_timeout_max_ms = 100;
    config.heartbeat_interval_ms = 20;
    config
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub port: u16,
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    pub registry: Arc<RoomRegistry>,
    pub hub: Arc<ClientHub>,
    pub ticker: Arc<TickScheduler>,
    pub router: Arc<ClientRouter>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestNode {
    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        let state = self.raft_node.state.read().await;
        state.role == RaftRole::Leader
    }

    /// Get the current term
    pub async fn current_term(&self) -> u64 {
        self.raft_node.state.read().await.current_term
    }

    /// Get the known leader ID
    pub async fn leader_id(&self) -> Option<u64> {
        self.raft_node.state.read().await.leader_id
    }

    /// Client address this node serves WebSocket and status traffic on
    pub fn client_addr(&self) -> String {
        self.config.client_addr.to_string()
    }

    /// Attach a new in-process client to this node
    pub async fn connect_client(&self) -> TestClient {
        let (id, rx) = self.router.connect().await;
        TestClient {
            id,
            rx,
            router: self.router.clone(),
        }
    }

    /// Phase and player count of a room in this node's registry
    pub async fn room_info(&self, code: &str) -> Option<(String, usize)> {
        let shared = self.registry.get(code).await?;
        let room = shared.lock().await;
        Some((room.phase.to_string(), room.players.len()))
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        // Cancelling stops the election loop, both servers and all tick loops
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// A game client talking to one node through its router, as the WebSocket
/// handler would.
pub struct TestClient {
    pub id: String,
    rx: mpsc::Receiver<String>,
    router: Arc<ClientRouter>,
}

impl TestClient {
    /// Send one raw JSON frame
    pub async fn send(&self, frame: &str) {
        self.router.handle_frame(&self.id, frame).await;
    }

    /// Next event, or None if nothing arrives in time
    pub async fn next_event(&mut self, timeout_duration: Duration) -> Option<ServerEvent> {
        let frame = tokio::time::timeout(timeout_duration, self.rx.recv())
            .await
            .ok()??;
        Some(ServerEvent::decode(&frame).unwrap())
    }

    /// Skip events until one matches, or give up after the timeout
    pub async fn wait_for_event<F>(
        &mut self,
        predicate: F,
        timeout_duration: Duration,
    ) -> Option<ServerEvent>
    where
        F: Fn(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout_duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let event = self.next_event(remaining).await?;
            if predicate(&event) {
                return Some(event);
            }
        }
    }

    /// Create a room and return its code
    pub async fn create_room(&mut self, name: &str) -> String {
        self.send(&format!(
            r#"{{"event":"createRoom","payload":{{"playerName":"{}"}}}}"#,
            name
        ))
        .await;
        match self
            .wait_for_event(
                |e| matches!(e, ServerEvent::RoomCreated { .. } | ServerEvent::Error { .. }),
                Duration::from_secs(2),
            )
            .await
        {
            Some(ServerEvent::RoomCreated { room_code, .. }) => room_code,
            other => panic!("createRoom failed: {:?}", other),
        }
    }

    /// Mark ready and start the game as host
    pub async fn ready_and_start(&self) {
        self.send(r#"{"event":"playerReady","payload":{"ready":true}}"#)
            .await;
        self.send(r#"{"event":"startGame"}"#).await;
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    /// Configs of nodes taken down, kept for restart
    stopped: HashMap<u64, NodeConfig>,
    base_port: u16,
}

impl TestCluster {
    /// Create and start a cluster with n nodes
    pub async fn new(num_nodes: usize, base_port: u16) -> Self {
        let mut cluster = Self {
            nodes: HashMap::new(),
            stopped: HashMap::new(),
            base_port,
        };

        // Calculate all peer configurations
        let all_peers: Vec<(u64, u16)> = (0..num_nodes)
            .map(|i| ((i + 1) as u64, base_port + i as u16))
            .collect();

        for i in 0..num_nodes {
            let node_id = (i + 1) as u64;
            let port = base_port + i as u16;

            // Get peers (all nodes except self)
            let peers: Vec<(u64, u16)> = all_peers
                .iter()
                .filter(|(id, _)| *id != node_id)
                .copied()
                .collect();

            let config = test_node_config(node_id, port, peers);
            let test_node = Self::start_node(config);
            cluster.nodes.insert(node_id, test_node);
        }

        // Wait briefly for all nodes to start their servers
        tokio::time::sleep(Duration::from_millis(100)).await;

        cluster
    }

    /// Start a single node. Peer channels connect lazily, so start order
    /// does not matter.
    fn start_node(config: NodeConfig) -> TestNode {
        let shutdown = CancellationToken::new();
        let (node, raft_rx) = Node::new(config.clone(), shutdown.clone());

        let raft_node = node.raft_node.clone();
        let registry = node.registry.clone();
        let hub = node.hub.clone();
        let ticker = node.ticker.clone();
        let router = node.router.clone();

        let node_id = config.node_id;
        let handle = tokio::spawn(async move {
            if let Err(e) = node.run(raft_rx).await {
                tracing::error!(node_id, error = %e, "Test node failed");
            }
        });

        TestNode {
            node_id,
            port: config.listen_addr.port(),
            config,
            raft_node,
            registry,
            hub,
            ticker,
            router,
            shutdown,
            handle,
        }
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let result = wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Wait until every live node agrees on the same leader
    pub async fn wait_for_agreed_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let agreed = wait_for(
            || async {
                let Some(leader) = self.get_leader_id().await else {
                    return false;
                };
                for node in self.nodes.values() {
                    if node.node_id != leader && node.leader_id().await != Some(leader) {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if agreed {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Wait for a leader other than `old_leader`
    pub async fn wait_for_new_leader(
        &self,
        old_leader: u64,
        timeout_duration: Duration,
    ) -> Option<u64> {
        let result = wait_for(
            || async {
                matches!(self.get_leader_id().await, Some(id) if id != old_leader)
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Get current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    /// Get a reference to a specific node
    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    /// Any live node that is not the leader
    pub async fn get_follower(&self) -> Option<&TestNode> {
        let leader = self.get_leader_id().await;
        self.nodes.values().find(|n| Some(n.node_id) != leader)
    }

    /// Count nodes that currently think they are leader
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Leaders per term across live nodes
    pub async fn leaders_by_term(&self) -> HashMap<u64, Vec<u64>> {
        let mut by_term: HashMap<u64, Vec<u64>> = HashMap::new();
        for node in self.nodes.values() {
            let state = node.raft_node.state.read().await;
            if state.role == RaftRole::Leader {
                by_term
                    .entry(state.current_term)
                    .or_default()
                    .push(node.node_id);
            }
        }
        by_term
    }

    /// Wait until a room exists on every live node
    pub async fn wait_for_room_everywhere(&self, code: &str, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if !node.registry.contains(code).await {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Crash a node. Its servers and loops stop, peers see it go silent.
    pub fn shutdown_node(&mut self, node_id: u64) -> bool {
        match self.nodes.remove(&node_id) {
            Some(node) => {
                self.stopped.insert(node_id, node.config.clone());
                true
            }
            None => false,
        }
    }

    /// Start a previously shut down node again with empty state and the
    /// same addresses
    pub async fn restart_node(&mut self, node_id: u64) -> bool {
        let Some(config) = self.stopped.remove(&node_id) else {
            return false;
        };
        // Let the old task release its ports
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.nodes.insert(node_id, Self::start_node(config));
        tokio::time::sleep(Duration::from_millis(50)).await;
        true
    }

    /// IDs of nodes still running
    pub fn active_node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Base cluster port of this cluster
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Shutdown all nodes
    pub async fn shutdown(self) {
        drop(self);
        // Give tasks a moment to release their ports
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
