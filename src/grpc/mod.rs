pub mod cluster_service;
pub mod peers;
pub mod server;

pub use cluster_service::ClusterServiceImpl;
pub use peers::{PeerClient, PeerClients};
pub use server::GrpcServer;
