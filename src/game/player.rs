use serde::{Deserialize, Serialize};

use crate::game::tetromino::Tetromino;

const PLAYER_COLORS: [&str; 8] = [
    "#ff5252", "#448aff", "#69f0ae", "#ffd740", "#e040fb", "#18ffff", "#ff6e40", "#b2ff59",
];

/// Colour assigned to a player number.
pub fn player_color(player_number: u32) -> String {
    let index = (player_number.max(1) - 1) as usize % PLAYER_COLORS.len();
    PLAYER_COLORS[index].to_string()
}

/// Short display id used to key disconnected players.
pub fn short_id(player_id: &str) -> String {
    player_id.chars().take(8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn dx(self) -> i32 {
        match self {
            Direction::Left => -1,
            Direction::Right => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub player_number: u32,
    pub color: String,
    pub name: String,
    pub is_host: bool,
    pub x: i32,
    pub y: i32,
    pub current_piece: Option<Tetromino>,
    pub fall_timer: u32,
    pub fall_speed: u32,
    pub soft_dropping: bool,
    pub is_locking: bool,
    pub lock_timer: u32,
    pub lock_resets: u32,
    pub das_direction: Option<Direction>,
    pub das_timer: u32,
    pub das_repeat_timer: u32,
    pub waiting_for_entry: bool,
    pub entry_delay_timer: u32,
    /// Set after a hard drop locks; cleared when the next piece spawns.
    pub hard_drop_locked: bool,
    pub score: u64,
    pub is_ready: bool,
    pub game_over: bool,
}

impl Player {
    pub fn new(id: impl Into<String>, name: impl Into<String>, player_number: u32) -> Self {
        Self {
            id: id.into(),
            player_number,
            color: player_color(player_number),
            name: name.into(),
            is_host: false,
            x: 0,
            y: 0,
            current_piece: None,
            fall_timer: 0,
            fall_speed: 0,
            soft_dropping: false,
            is_locking: false,
            lock_timer: 0,
            lock_resets: 0,
            das_direction: None,
            das_timer: 0,
            das_repeat_timer: 0,
            waiting_for_entry: false,
            entry_delay_timer: 0,
            hard_drop_locked: false,
            score: 0,
            is_ready: false,
            game_over: false,
        }
    }

    /// True while the player holds a falling piece.
    pub fn has_piece(&self) -> bool {
        self.current_piece.is_some() && !self.waiting_for_entry && !self.game_over
    }

    pub fn reset_lock(&mut self) {
        self.is_locking = false;
        self.lock_timer = 0;
        self.lock_resets = 0;
    }

    /// Clears every per-game field, keeping identity and colour.
    pub fn reset_for_game(&mut self) {
        self.current_piece = None;
        self.x = 0;
        self.y = 0;
        self.fall_timer = 0;
        self.soft_dropping = false;
        self.reset_lock();
        self.das_direction = None;
        self.das_timer = 0;
        self.das_repeat_timer = 0;
        self.waiting_for_entry = false;
        self.entry_delay_timer = 0;
        self.hard_drop_locked = false;
        self.score = 0;
        self.game_over = false;
    }

    /// Drops the current piece and starts the entry delay.
    pub fn begin_entry_delay(&mut self) {
        self.current_piece = None;
        self.waiting_for_entry = true;
        self.entry_delay_timer = 0;
        self.fall_timer = 0;
        self.soft_dropping = false;
        self.reset_lock();
    }
}

/// What survives of a player who dropped out of a running game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedPlayer {
    pub player_number: u32,
    pub color: String,
    pub score: u64,
    pub name: String,
    pub was_host: bool,
    /// Ticks elapsed since the disconnect.
    pub idle_ticks: u32,
}

impl DisconnectedPlayer {
    pub fn from_player(player: &Player) -> Self {
        Self {
            player_number: player.player_number,
            color: player.color.clone(),
            score: player.score,
            name: player.name.clone(),
            was_host: player.is_host,
            idle_ticks: 0,
        }
    }
}
