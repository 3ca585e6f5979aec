use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use tetris_cluster::config::{NodeConfig, PeerConfig};
use tetris_cluster::node::Node;
use tetris_cluster::proto::cluster_service_client::ClusterServiceClient;
use tetris_cluster::proto::ClusterStatusRequest;
use tetris_cluster::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "tetris-cluster")]
#[command(version)]
#[command(about = "A fault-tolerant multiplayer falling-block game server")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a game server node
    Server(ServerArgs),

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for cluster gRPC traffic
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for game clients (WebSocket and status API)
    #[arg(long, default_value = "3000")]
    client_port: u16,

    /// Client address announced to players in leaderInfo
    /// (defaults to 127.0.0.1:<client-port>)
    #[arg(long)]
    advertise: Option<String>,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Simulation steps per second for rooms being played
    #[arg(long, default_value = "60")]
    tick_rate: u32,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Cluster address of any node
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Cluster Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Show role, term, peers and rooms as seen by one node
    Status,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeInfoOutput {
    node_id: u64,
    address: String,
    is_alive: bool,
}

#[derive(Serialize)]
struct RoomOutput {
    code: String,
    phase: String,
    players: u32,
    active_players: u32,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    node_id: u64,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    leader_address: String,
    peers: Vec<NodeInfoOutput>,
    rooms: Vec<RoomOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error + Send + Sync>> {
    Ok(Channel::from_shared(addr.to_string())?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await?)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let client_addr: SocketAddr = format!("0.0.0.0:{}", args.client_port).parse()?;

    let mut config = NodeConfig::new(args.node_id, listen_addr).with_client_addr(client_addr);
    config.advertise_client_addr = args
        .advertise
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.client_port));
    config.peers = parse_peers(&args.peers);
    config.election_timeout_min_ms = args.election_timeout_min_ms;
    config.election_timeout_max_ms = args.election_timeout_max_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.game.tick_rate_hz = args.tick_rate;

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        client_addr = %config.client_addr,
        advertise = %config.advertise_client_addr,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting game server node"
    );

    let shutdown = install_shutdown_handler();
    let (node, raft_rx) = Node::new(config, shutdown);
    node.run(raft_rx).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_cluster_status(
    client: &mut ClusterServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let response = client
        .get_cluster_status(ClusterStatusRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = ClusterStatusOutput {
                node_id: response.node_id,
                role: response.role,
                term: response.term,
                leader_id: response.leader_id,
                leader_address: response.leader_client_addr,
                peers: response
                    .peers
                    .into_iter()
                    .map(|n| NodeInfoOutput {
                        node_id: n.node_id,
                        address: n.address,
                        is_alive: n.is_alive,
                    })
                    .collect(),
                rooms: response
                    .rooms
                    .into_iter()
                    .map(|r| RoomOutput {
                        code: r.code,
                        phase: r.phase,
                        players: r.players,
                        active_players: r.active_players,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let leader = response
                .leader_id
                .map(|id| format!("Node {}", id))
                .unwrap_or_else(|| "unknown".to_string());

            println!("Cluster Status (node {})", response.node_id);
            println!("{}", "=".repeat(40));
            println!("Role:   {}", response.role);
            println!("Term:   {}", response.term);
            println!("Leader: {}", leader);
            if !response.leader_client_addr.is_empty() {
                println!("Client: {}", response.leader_client_addr);
            }
            println!();
            println!("Peers:");
            println!("{:<8} {:<25} STATUS", "ID", "ADDRESS");
            println!("{}", "-".repeat(45));
            for node in response.peers {
                let status = if node.is_alive { "alive" } else { "dead" };
                let status_icon = if node.is_alive { "[+]" } else { "[-]" };
                println!(
                    "{:<8} {:<25} {} {}",
                    node.node_id, node.address, status_icon, status
                );
            }
            println!();
            println!("Rooms:");
            println!("{:<8} {:<10} {:<8} ACTIVE", "CODE", "PHASE", "PLAYERS");
            println!("{}", "-".repeat(35));
            for room in response.rooms {
                println!(
                    "{:<8} {:<10} {:<8} {}",
                    room.code, room.phase, room.players, room.active_players
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Cluster { client, command } => {
            let channel = connect(&client.addr).await?;
            let mut grpc_client = ClusterServiceClient::new(channel);

            match command {
                ClusterCommands::Status => {
                    handle_cluster_status(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
