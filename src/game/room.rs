use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GameConfig;
use crate::error::{Result, ServerError};
use crate::game::board::Board;
use crate::game::player::{DisconnectedPlayer, Player};
use crate::game::set::OrderedSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomPhase {
    #[serde(rename = "lobby")]
    Lobby,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "playing")]
    Playing,
    #[serde(rename = "gameover")]
    GameOver,
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomPhase::Lobby => write!(f, "lobby"),
            RoomPhase::Ready => write!(f, "ready"),
            RoomPhase::Playing => write!(f, "playing"),
            RoomPhase::GameOver => write!(f, "gameover"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    #[default]
    Classic,
    Turbo,
}

impl GameMode {
    pub fn fall_speed(self, config: &GameConfig) -> u32 {
        match self {
            GameMode::Classic => config.fall_speed,
            GameMode::Turbo => config.turbo_fall_speed,
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Classic => write!(f, "classic"),
            GameMode::Turbo => write!(f, "turbo"),
        }
    }
}

impl FromStr for GameMode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(GameMode::Classic),
            "turbo" => Ok(GameMode::Turbo),
            other => Err(ServerError::Protocol(format!("Unknown game mode: {other}"))),
        }
    }
}

/// Line-clear animation. While active the room's simulation is frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineClear {
    pub active: bool,
    pub timer: u32,
    pub rows_to_clear: Vec<usize>,
}

impl LineClear {
    /// Starts (or extends) the animation with more rows.
    pub fn begin(&mut self, rows: &[usize]) {
        for &row in rows {
            if !self.rows_to_clear.contains(&row) {
                self.rows_to_clear.push(row);
            }
        }
        self.rows_to_clear.sort_unstable();
        if !self.active {
            self.active = true;
            self.timer = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub code: String,
    pub phase: RoomPhase,
    pub mode: GameMode,
    pub board: Board,
    pub players: BTreeMap<String, Player>,
    pub active_players: OrderedSet,
    pub ready_players: OrderedSet,
    pub disconnected_players: BTreeMap<String, DisconnectedPlayer>,
    pub line_clear: LineClear,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(code: impl Into<String>, config: &GameConfig) -> Self {
        Self {
            code: code.into(),
            phase: RoomPhase::Lobby,
            mode: GameMode::default(),
            board: Board::new(config.rows, config.cols),
            players: BTreeMap::new(),
            active_players: OrderedSet::new(),
            ready_players: OrderedSet::new(),
            disconnected_players: BTreeMap::new(),
            line_clear: LineClear::default(),
            created_at: Utc::now(),
        }
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn player_mut(&mut self, id: &str) -> Option<&mut Player> {
        self.players.get_mut(id)
    }

    pub fn host_id(&self) -> Option<&str> {
        self.players
            .values()
            .find(|p| p.is_host)
            .map(|p| p.id.as_str())
    }

    pub fn is_host(&self, id: &str) -> bool {
        self.player(id).is_some_and(|p| p.is_host)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Player> {
        self.players.values().find(|p| p.name == name)
    }

    /// Smallest positive number not held by a present or disconnected player.
    pub fn next_player_number(&self) -> u32 {
        let mut taken: Vec<u32> = self
            .players
            .values()
            .map(|p| p.player_number)
            .chain(self.disconnected_players.values().map(|d| d.player_number))
            .collect();
        taken.sort_unstable();
        let mut candidate = 1;
        for number in taken {
            if number == candidate {
                candidate += 1;
            } else if number > candidate {
                break;
            }
        }
        candidate
    }

    /// Adds a new player to the room; the first player becomes host.
    pub fn add_player(&mut self, id: &str, name: &str, max_players: usize) -> Result<&Player> {
        if self.players.len() >= max_players {
            return Err(ServerError::RoomFull);
        }
        let mut player = Player::new(id, name, self.next_player_number());
        player.is_host = self.host_id().is_none();
        self.insert_player(player);
        self.refresh_phase();
        self.players
            .get(id)
            .ok_or_else(|| ServerError::Internal("player vanished after insert".to_string()))
    }

    pub(crate) fn insert_player(&mut self, player: Player) {
        self.active_players.insert(player.id.clone());
        if player.is_ready {
            self.ready_players.insert(player.id.clone());
        }
        self.players.insert(player.id.clone(), player);
    }

    /// Removes a player from every collection. Does not touch the board.
    pub fn remove_player(&mut self, id: &str) -> Option<Player> {
        self.active_players.remove(id);
        self.ready_players.remove(id);
        self.players.remove(id)
    }

    pub fn set_ready(&mut self, id: &str, ready: bool) -> Result<()> {
        match self.phase {
            RoomPhase::Playing => return Err(ServerError::GameInProgress),
            RoomPhase::GameOver => self.return_to_lobby(),
            RoomPhase::Lobby | RoomPhase::Ready => {}
        }
        let player = self.players.get_mut(id).ok_or(ServerError::NotInRoom)?;
        player.is_ready = ready;
        if ready {
            self.ready_players.insert(id);
        } else {
            self.ready_players.remove(id);
        }
        self.refresh_phase();
        Ok(())
    }

    /// Moves between `lobby` and `ready` depending on whether everyone is ready.
    pub fn refresh_phase(&mut self) {
        if !matches!(self.phase, RoomPhase::Lobby | RoomPhase::Ready) {
            return;
        }
        let all_ready = !self.active_players.is_empty()
            && self
                .active_players
                .iter()
                .all(|id| self.ready_players.contains(id));
        self.phase = if all_ready {
            RoomPhase::Ready
        } else {
            RoomPhase::Lobby
        };
    }

    pub fn set_mode(&mut self, mode: GameMode) -> Result<()> {
        if self.phase == RoomPhase::Playing {
            return Err(ServerError::GameInProgress);
        }
        self.mode = mode;
        Ok(())
    }

    /// Ends the running game: pieces are dropped and ready flags cleared.
    pub fn finish_game(&mut self) {
        self.phase = RoomPhase::GameOver;
        self.line_clear = LineClear::default();
        self.ready_players.clear();
        for player in self.players.values_mut() {
            player.is_ready = false;
            player.current_piece = None;
            player.waiting_for_entry = false;
            player.das_direction = None;
        }
    }

    pub fn return_to_lobby(&mut self) {
        self.phase = RoomPhase::Lobby;
        self.line_clear = LineClear::default();
        for player in self.players.values_mut() {
            player.current_piece = None;
            player.waiting_for_entry = false;
            player.das_direction = None;
        }
        self.refresh_phase();
    }

    /// Sum of every score in the room, including disconnected players.
    pub fn total_score(&self) -> u64 {
        self.players.values().map(|p| p.score).sum::<u64>()
            + self
                .disconnected_players
                .values()
                .map(|d| d.score)
                .sum::<u64>()
    }

    pub fn is_multiplayer(&self) -> bool {
        self.active_players.len() > 1
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active_players.to_vec()
    }

    /// True once every active player has topped out.
    pub fn all_topped_out(&self) -> bool {
        !self.active_players.is_empty()
            && self
                .active_players
                .iter()
                .all(|id| self.players.get(id).map_or(true, |p| p.game_over))
    }
}
