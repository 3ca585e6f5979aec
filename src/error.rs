use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    Protocol(String),

    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("No leader available, retry later")]
    NoLeader,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room is full")]
    RoomFull,

    #[error("Game already in progress")]
    GameInProgress,

    #[error("Only the host can do that")]
    NotHost,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Not all players are ready")]
    NotReady,

    #[error("Timed out waiting for the leader: {0}")]
    ReplicationTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Text surfaced to a client in an `error` event.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Grpc(status) => status.message().to_string(),
            ServerError::Transport(_) => "Leader unreachable, retry later".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
