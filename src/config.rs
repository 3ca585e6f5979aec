use std::net::SocketAddr;
use std::time::Duration;

/// Simulation tunables. Every timer is a number of ticks, advanced once per
/// simulation step, so the engine never reads the wall clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameConfig {
    pub rows: usize,
    pub cols: usize,
    /// Simulation steps per second for each room being played.
    pub tick_rate_hz: u32,
    /// Ticks between gravity steps in `classic` mode.
    pub fall_speed: u32,
    /// Ticks between gravity steps in `turbo` mode.
    pub turbo_fall_speed: u32,
    /// Ticks between gravity steps while soft dropping.
    pub soft_drop_speed: u32,
    /// Ticks a resting piece waits before it locks.
    pub lock_delay: u32,
    /// How many times moving or rotating may restart the lock delay.
    pub max_lock_resets: u32,
    /// Ticks a direction must be held before auto-shift starts.
    pub das_delay: u32,
    /// Ticks between auto-shift repeats.
    pub das_repeat: u32,
    /// Ticks between a lock and the next spawn.
    pub entry_delay: u32,
    /// Ticks the room freezes while completed rows are animated.
    pub line_clear_ticks: u32,
    pub max_players: usize,
    /// Ticks a disconnected player's record is kept during a game.
    pub reconnect_window_ticks: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            rows: 20,
            cols: 10,
            tick_rate_hz: 60,
            fall_speed: 48,
            turbo_fall_speed: 24,
            soft_drop_speed: 2,
            lock_delay: 30,
            max_lock_resets: 15,
            das_delay: 10,
            das_repeat: 2,
            entry_delay: 10,
            line_clear_ticks: 30,
            max_players: 8,
            reconnect_window_ticks: 60 * 60,
        }
    }
}

impl GameConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick_rate_hz.max(1)))
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Cluster (gRPC) listen address.
    pub listen_addr: SocketAddr,
    /// Client-facing HTTP/WebSocket listen address.
    pub client_addr: SocketAddr,
    /// Client address announced to clients through `leaderInfo`.
    pub advertise_client_addr: String,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Deadline for vote, heartbeat and replication calls.
    pub rpc_timeout_ms: u64,
    /// Deadline for requests relayed to the leader: forwarded client
    /// events and room fetches.
    pub room_request_timeout_ms: u64,
    pub game: GameConfig,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: These are hardcoded valid addresses that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            client_addr: "127.0.0.1:3000"
                .parse()
                .expect("default client address is valid"),
            advertise_client_addr: "127.0.0.1:3000".to_string(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            room_request_timeout_ms: 1000,
            game: GameConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_client_addr(mut self, client_addr: SocketAddr) -> Self {
        self.client_addr = client_addr;
        self.advertise_client_addr = client_addr.to_string();
        self
    }

    /// Number of voting members, this node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn room_request_timeout(&self) -> Duration {
        Duration::from_millis(self.room_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_config_default() {
        let cfg = GameConfig::default();
        assert_eq!(cfg.rows, 20);
        assert_eq!(cfg.cols, 10);
        assert_eq!(cfg.tick_rate_hz, 60);
        assert_eq!(cfg.line_clear_ticks, 30);
        assert!(cfg.soft_drop_speed < cfg.fall_speed);
        assert!(cfg.turbo_fall_speed < cfg.fall_speed);
    }

    #[test]
    fn test_tick_interval_matches_rate() {
        let cfg = GameConfig {
            tick_rate_hz: 50,
            ..GameConfig::default()
        };
        assert_eq!(cfg.tick_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert_eq!(cfg.client_addr.to_string(), "127.0.0.1:3000");
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.cluster_size(), 1);
    }

    #[test]
    fn test_heartbeat_is_fraction_of_election_timeout() {
        let cfg = NodeConfig::default();
        assert!(cfg.heartbeat_interval_ms * 3 <= cfg.election_timeout_min_ms);
    }

    #[test]
    fn test_node_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(42, addr);
        assert_eq!(cfg.node_id, 42);
        assert_eq!(cfg.listen_addr, addr);
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn test_node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer(2, "127.0.0.1:50052".to_string())
            .with_peer(3, "127.0.0.1:50053".to_string());
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].node_id, 2);
        assert_eq!(cfg.peers[1].addr, "127.0.0.1:50053");
        assert_eq!(cfg.cluster_size(), 3);
    }

    #[test]
    fn test_with_client_addr_updates_advertised_address() {
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let cfg = NodeConfig::default().with_client_addr(addr);
        assert_eq!(cfg.client_addr, addr);
        assert_eq!(cfg.advertise_client_addr, "127.0.0.1:4001");
    }
}
