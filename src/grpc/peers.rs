use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::proto::cluster_service_client::ClusterServiceClient;

pub type PeerClient = ClusterServiceClient<Channel>;

/// gRPC clients for every configured peer.
///
/// Channels connect lazily and reconnect on their own, so a peer that is
/// down at startup is picked up once it comes back.
#[derive(Clone, Default)]
pub struct PeerClients {
    clients: HashMap<u64, PeerClient>,
}

impl PeerClients {
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(config: &NodeConfig) -> Self {
        let mut clients = HashMap::new();
        for peer in &config.peers {
            let uri = format!("http://{}", peer.addr);
            match Endpoint::from_shared(uri.clone()) {
                Ok(endpoint) => {
                    let channel = endpoint
                        .connect_timeout(Duration::from_millis(config.rpc_timeout_ms.max(50)))
                        .connect_lazy();
                    clients.insert(peer.node_id, ClusterServiceClient::new(channel));
                }
                Err(e) => {
                    tracing::warn!(peer_id = peer.node_id, addr = %uri, error = %e, "Invalid peer address");
                }
            }
        }
        Self { clients }
    }

    pub fn get(&self, peer_id: u64) -> Option<PeerClient> {
        self.clients.get(&peer_id).cloned()
    }

    /// Clones of every client, for fan-out from spawned tasks.
    pub fn all(&self) -> Vec<(u64, PeerClient)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect()
    }
}
