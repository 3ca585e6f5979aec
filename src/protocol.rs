//! JSON events exchanged with game clients over the WebSocket.
//!
//! Every frame is `{"event": <name>, "payload": {...}}`. The same encoding is
//! used when a follower forwards a client event to the leader and when room
//! broadcasts ride along with a replicated snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::game::engine::Action;
use crate::game::room::Room;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateRoom { player_name: String },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_code: String,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RejoinRoom {
        room_code: String,
        player_name: String,
        #[serde(default)]
        previous_id: Option<String>,
        #[serde(default)]
        was_ready: bool,
    },
    LeaveRoom,
    PlayerReady { ready: bool },
    SetGameMode { mode: String },
    StartGame,
    PlayerAction(Action),
    /// Sent by a follower when one of its clients drops.
    Disconnect,
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ServerError::Protocol(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    Init {
        id: String,
    },
    GameState(Box<Room>),
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_code: String,
        player_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_code: String,
        player_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomRejoined {
        room_code: String,
        player_id: String,
        restored: bool,
    },
    #[serde(rename_all = "camelCase")]
    RoomLeft {
        room_code: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: String,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_id: String,
        player_name: String,
    },
    #[serde(rename_all = "camelCase")]
    HostAssigned {
        player_id: String,
    },
    #[serde(rename_all = "camelCase")]
    GameOver {
        player_id: String,
        score: u64,
        total_score: u64,
        is_multiplayer: bool,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaderInfo {
        is_leader: bool,
        leader_address: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &ServerError) -> Self {
        ServerEvent::Error {
            message: err.client_message(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Room membership change this event implies for the receiving client.
    pub fn membership(&self) -> Option<Membership<'_>> {
        match self {
            ServerEvent::RoomCreated { room_code, .. }
            | ServerEvent::RoomJoined { room_code, .. }
            | ServerEvent::RoomRejoined { room_code, .. } => Some(Membership::Entered(room_code)),
            ServerEvent::RoomLeft { .. } => Some(Membership::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership<'a> {
    Entered(&'a str),
    Left,
}
