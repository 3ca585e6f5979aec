//! Client-facing HTTP server: the `/ws` game channel and status endpoints.

pub mod hub;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::raft::{PeerStatus, RaftNode};
use crate::registry::{RoomRegistry, RoomSummary};
use crate::router::ClientRouter;

pub use hub::ClientHub;

#[derive(Clone)]
pub struct GatewayState {
    pub raft_node: Arc<RaftNode>,
    pub registry: Arc<RoomRegistry>,
    pub router: Arc<ClientRouter>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterStatusResponse {
    node_id: u64,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    leader_address: Option<String>,
    peers: Vec<PeerStatus>,
}

/// Routes served on the client address.
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/rooms", get(list_rooms_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_gateway(
    addr: SocketAddr,
    state: GatewayState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting client gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One client connection: frames are handled in arrival order, outbound
/// frames are written by a separate task.
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (id, mut outbound) = state.router.connect().await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => state.router.handle_frame(&id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    state.router.disconnect(&id).await;
    writer.abort();
}

async fn cluster_status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let view = state.raft_node.role_view();

    Json(ClusterStatusResponse {
        node_id: state.raft_node.id,
        role: view.role.to_string(),
        term: view.term,
        leader_id: state.raft_node.get_leader_id().await,
        leader_address: view.leader_client_addr,
        peers: state.raft_node.peer_status().await,
    })
}

async fn list_rooms_handler(State(state): State<GatewayState>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.summaries().await)
}
