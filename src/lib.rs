pub mod commands;
pub mod config;
pub mod error;
pub mod game;
pub mod gateway;
pub mod grpc;
pub mod node;
pub mod protocol;
pub mod raft;
pub mod registry;
pub mod replication;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod ticker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("cluster");
}
