use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use tokio_util::sync::CancellationToken;

use tetris_cluster::config::NodeConfig;
use tetris_cluster::game::room::Room;
use tetris_cluster::gateway::{self, GatewayState};
use tetris_cluster::node::Node;

/// Helper to create test state from an unstarted node
fn create_test_node(config: NodeConfig) -> Node {
    let (node, _raft_rx) = Node::new(config, CancellationToken::new());
    node
}

fn state_of(node: &Node) -> GatewayState {
    GatewayState {
        raft_node: node.raft_node.clone(),
        registry: node.registry.clone(),
        router: node.router.clone(),
    }
}

async fn get_json(node: &Node, uri: &str) -> (StatusCode, Value) {
    let app = gateway::router(state_of(node));
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn make_leader(node: &Node) {
    let term = {
        let mut state = node.raft_node.state.write().await;
        state.become_candidate(node.raft_node.id);
        state.current_term
    };
    assert!(node.raft_node.become_leader(term).await);
}

#[tokio::test]
async fn test_cluster_status_for_follower() {
    let config = NodeConfig::default().with_peer(2, "127.0.0.1:59999".to_string());
    let node = create_test_node(config);

    let (status, json) = get_json(&node, "/api/cluster").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["nodeId"], 1);
    assert_eq!(json["role"], "follower");
    assert_eq!(json["term"], 0);
    assert!(json["leaderId"].is_null());
    assert!(json["leaderAddress"].is_null());

    let peers = json["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["nodeId"], 2);
    assert_eq!(peers[0]["address"], "127.0.0.1:59999");
    assert_eq!(peers[0]["isAlive"], false);
}

#[tokio::test]
async fn test_cluster_status_for_leader() {
    let node = create_test_node(NodeConfig::default());
    make_leader(&node).await;

    let (status, json) = get_json(&node, "/api/cluster").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["role"], "leader");
    assert_eq!(json["term"], 1);
    assert_eq!(json["leaderId"], 1);
    assert_eq!(json["leaderAddress"], "127.0.0.1:3000");
}

#[tokio::test]
async fn test_list_rooms() {
    let node = create_test_node(NodeConfig::default());

    let (status, json) = get_json(&node, "/api/rooms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(Vec::new()));

    let mut room = Room::new("ABCDEF", &node.config.game);
    room.add_player("p1", "ann", node.config.game.max_players)
        .unwrap();
    node.registry.insert(room).await;

    let (_, json) = get_json(&node, "/api/rooms").await;
    let rooms = json.as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["code"], "ABCDEF");
    assert_eq!(rooms[0]["phase"], "lobby");
    assert_eq!(rooms[0]["players"], 1);
    assert_eq!(rooms[0]["activePlayers"], 1);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let node = create_test_node(NodeConfig::default());
    let app = gateway::router(state_of(&node));

    let response = app
        .oneshot(Request::builder().uri("/api/players").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
