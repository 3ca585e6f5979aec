use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::cluster_service::ClusterServiceImpl;
use crate::proto::cluster_service_server::ClusterServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    service: ClusterServiceImpl,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, service: ClusterServiceImpl) -> Self {
        Self { addr, service }
    }

    /// Serve the cluster service until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(ClusterServiceServer::new(self.service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
