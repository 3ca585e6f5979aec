//! Fixed-tick simulation of a shared board.
//!
//! The engine is a pure state machine over [`Room`]: it never reads the clock
//! or touches the network. Every timer (gravity, lock delay, DAS, entry delay,
//! line-clear animation) is a counter advanced by [`Engine::tick`].
//!
//! # Collision
//!
//! A placement is valid iff every cell of the piece is on the board, does not
//! overlap a locked cell and does not overlap the falling piece of any other
//! player. Players waiting out their entry delay hold no piece and never block.
//!
//! # Locking
//!
//! Locking one piece can invalidate others (for example after rows shift).
//! Those are force-locked through a work-list rather than recursion, so one
//! cascade locks each player at most once.

use std::collections::{HashSet, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::GameConfig;
use crate::game::board::Cell;
use crate::game::player::Direction;
use crate::game::room::{Room, RoomPhase};
use crate::game::tetromino::Tetromino;

const SOFT_DROP_POINTS: u64 = 1;
const HARD_DROP_POINTS: u64 = 2;
const LINE_CLEAR_POINTS: u64 = 100;

/// A player input, already decoded from the client event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    MoveLeft,
    MoveRight,
    Rotate,
    SoftDrop,
    EndSoftDrop,
    HardDrop,
    Drop,
    #[serde(rename = "startDAS")]
    StartDas { direction: Direction },
    #[serde(rename = "endDAS")]
    EndDas,
}

/// Why a one-row descent is impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    /// Floor or a locked cell.
    Board,
    /// Only another player's falling piece.
    Piece,
}

/// What happened during a tick or action.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Whether the room changed at all.
    pub changed: bool,
    /// Players whose piece locked.
    pub locked: Vec<String>,
    /// Rows removed when an animation finished.
    pub rows_cleared: usize,
    /// Players whose spawn failed.
    pub topped_out: Vec<String>,
    /// Set when the last active player topped out.
    pub game_ended: bool,
}

pub struct Engine {
    config: GameConfig,
}

impl Engine {
    pub fn new(config: GameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Resets the board and every player and spawns the first pieces.
    pub fn start_game<R: Rng + ?Sized>(&self, room: &mut Room, rng: &mut R) -> StepReport {
        let mut report = StepReport {
            changed: true,
            ..StepReport::default()
        };
        room.board = crate::game::board::Board::new(self.config.rows, self.config.cols);
        room.line_clear = Default::default();
        room.disconnected_players.clear();
        room.phase = RoomPhase::Playing;
        for player in room.players.values_mut() {
            player.reset_for_game();
            player.fall_speed = room.mode.fall_speed(&self.config);
        }
        for id in room.active_ids() {
            self.spawn_piece(room, &id, rng, &mut report);
        }
        self.check_game_end(room, &mut report);
        report
    }

    /// Advances the room by one simulation step.
    pub fn tick<R: Rng + ?Sized>(&self, room: &mut Room, rng: &mut R) -> StepReport {
        let mut report = StepReport::default();
        if room.phase != RoomPhase::Playing {
            return report;
        }
        report.changed = true;

        self.age_disconnected(room);

        if room.line_clear.active {
            room.line_clear.timer += 1;
            if room.line_clear.timer >= self.config.line_clear_ticks {
                self.finish_line_clear(room, &mut report);
            }
            return report;
        }

        for id in room.active_ids() {
            if room.line_clear.active {
                break;
            }
            let Some(player) = room.player_mut(&id) else {
                continue;
            };
            if player.game_over {
                continue;
            }
            if player.waiting_for_entry {
                player.entry_delay_timer += 1;
                if player.entry_delay_timer >= self.config.entry_delay {
                    self.spawn_piece(room, &id, rng, &mut report);
                }
                continue;
            }
            if player.current_piece.is_none() {
                continue;
            }
            self.advance_das(room, &id);
            self.advance_gravity(room, &id, &mut report);
        }

        self.check_game_end(room, &mut report);
        report
    }

    /// Applies one player input. Inputs are ignored outside a running game,
    /// during the line-clear animation and for players without a piece.
    pub fn apply_action(&self, room: &mut Room, player_id: &str, action: Action) -> StepReport {
        let mut report = StepReport::default();
        if room.phase != RoomPhase::Playing || room.line_clear.active {
            return report;
        }
        let Some(player) = room.player_mut(player_id) else {
            return report;
        };
        // Releasing inputs is always recorded, even between pieces.
        match action {
            Action::EndSoftDrop => {
                report.changed = player.soft_dropping;
                player.soft_dropping = false;
                return report;
            }
            Action::EndDas => {
                report.changed = player.das_direction.is_some();
                player.das_direction = None;
                player.das_timer = 0;
                player.das_repeat_timer = 0;
                return report;
            }
            _ => {}
        }
        if !player.has_piece() {
            return report;
        }

        report.changed = match action {
            Action::MoveLeft => self.shift(room, player_id, -1),
            Action::MoveRight => self.shift(room, player_id, 1),
            Action::Rotate => self.rotate(room, player_id),
            Action::SoftDrop => {
                if let Some(player) = room.player_mut(player_id) {
                    player.soft_dropping = true;
                }
                true
            }
            Action::Drop => self.step_down(room, player_id, SOFT_DROP_POINTS),
            Action::HardDrop => self.hard_drop(room, player_id, &mut report),
            Action::StartDas { direction } => {
                if let Some(player) = room.player_mut(player_id) {
                    player.das_direction = Some(direction);
                    player.das_timer = 0;
                    player.das_repeat_timer = 0;
                }
                self.shift(room, player_id, direction.dx());
                true
            }
            Action::EndSoftDrop | Action::EndDas => false,
        };
        report
    }

    /// Column a new piece spawns at. The board is split into equal sections,
    /// one per active player; a lone player spawns in the classic centre.
    pub fn spawn_column(&self, index: usize, count: usize, piece: &Tetromino) -> i32 {
        let cols = self.config.cols as i32;
        let width = piece.width();
        if count <= 1 {
            return (cols / 2 - width / 2).clamp(0, (cols - width).max(0));
        }
        let section = cols / count as i32;
        let start = section * index as i32;
        (start + (section - width) / 2).clamp(0, (cols - width).max(0))
    }

    /// Whether `piece` may sit at `(x, y)` for `player_id`.
    pub fn can_place(&self, room: &Room, player_id: &str, piece: &Tetromino, x: i32, y: i32) -> bool {
        self.blocker_at(room, player_id, piece, x, y).is_none()
    }

    fn blocker_at(
        &self,
        room: &Room,
        player_id: &str,
        piece: &Tetromino,
        x: i32,
        y: i32,
    ) -> Option<Blocker> {
        let cells: Vec<(i32, i32)> = piece.cells_at(x, y).collect();
        if cells
            .iter()
            .any(|&(cx, cy)| !room.board.in_bounds(cx, cy) || room.board.is_occupied(cx, cy))
        {
            return Some(Blocker::Board);
        }
        let overlaps_piece = room
            .active_players
            .iter()
            .filter(|&id| id != player_id)
            .filter_map(|id| room.player(id))
            .filter(|other| other.has_piece())
            .any(|other| {
                other
                    .current_piece
                    .as_ref()
                    .is_some_and(|p| p.cells_at(other.x, other.y).any(|c| cells.contains(&c)))
            });
        overlaps_piece.then_some(Blocker::Piece)
    }

    /// Validity of a player's current placement after moving it by `(dx, dy)`.
    fn fits_offset(&self, room: &Room, player_id: &str, dx: i32, dy: i32) -> bool {
        room.player(player_id)
            .and_then(|p| p.current_piece.as_ref().map(|piece| (piece, p.x, p.y)))
            .is_some_and(|(piece, x, y)| self.can_place(room, player_id, piece, x + dx, y + dy))
    }

    fn shift(&self, room: &mut Room, player_id: &str, dx: i32) -> bool {
        if !self.fits_offset(room, player_id, dx, 0) {
            return false;
        }
        if let Some(player) = room.player_mut(player_id) {
            player.x += dx;
            self.extend_lock_delay(player);
        }
        true
    }

    /// Next orientation, in place. No wall kicks.
    fn rotate(&self, room: &mut Room, player_id: &str) -> bool {
        let Some((rotated, x, y)) = room
            .player(player_id)
            .and_then(|p| p.current_piece.as_ref().map(|piece| (piece.rotated(), p.x, p.y)))
        else {
            return false;
        };
        if !self.can_place(room, player_id, &rotated, x, y) {
            return false;
        }
        if let Some(player) = room.player_mut(player_id) {
            player.current_piece = Some(rotated);
            self.extend_lock_delay(player);
        }
        true
    }

    fn extend_lock_delay(&self, player: &mut crate::game::player::Player) {
        if player.is_locking && player.lock_resets < self.config.max_lock_resets {
            player.lock_timer = 0;
            player.lock_resets += 1;
        }
    }

    /// Moves one row down, awarding `points` on success.
    fn step_down(&self, room: &mut Room, player_id: &str, points: u64) -> bool {
        if !self.fits_offset(room, player_id, 0, 1) {
            return false;
        }
        if let Some(player) = room.player_mut(player_id) {
            player.y += 1;
            player.fall_timer = 0;
            player.score += points;
            player.reset_lock();
        }
        true
    }

    fn hard_drop(&self, room: &mut Room, player_id: &str, report: &mut StepReport) -> bool {
        let Some(player) = room.player(player_id) else {
            return false;
        };
        if player.hard_drop_locked {
            return false;
        }
        let Some(piece) = player.current_piece.clone() else {
            return false;
        };
        let (x, start_y) = (player.x, player.y);

        let mut y = start_y;
        while self.can_place(room, player_id, &piece, x, y + 1) {
            y += 1;
        }
        let distance = (y - start_y) as u64;
        let blocker = self.blocker_at(room, player_id, &piece, x, y + 1);

        if let Some(player) = room.player_mut(player_id) {
            player.y = y;
            player.score += distance * HARD_DROP_POINTS;
            if distance > 0 {
                player.fall_timer = 0;
                player.reset_lock();
            }
        }

        if blocker == Some(Blocker::Board) {
            self.lock_cascade(room, vec![player_id.to_string()], report);
            if let Some(player) = room.player_mut(player_id) {
                player.hard_drop_locked = true;
            }
        }
        true
    }

    fn advance_das(&self, room: &mut Room, player_id: &str) {
        let Some(player) = room.player_mut(player_id) else {
            return;
        };
        let Some(direction) = player.das_direction else {
            return;
        };
        player.das_timer += 1;
        if player.das_timer <= self.config.das_delay {
            return;
        }
        player.das_repeat_timer += 1;
        if player.das_repeat_timer < self.config.das_repeat {
            return;
        }
        player.das_repeat_timer = 0;
        self.shift(room, player_id, direction.dx());
    }

    fn advance_gravity(&self, room: &mut Room, player_id: &str, report: &mut StepReport) {
        let resting = !self.fits_offset(room, player_id, 0, 1);
        let Some(player) = room.player_mut(player_id) else {
            return;
        };

        if !resting {
            player.is_locking = false;
            player.lock_timer = 0;
            player.fall_timer += 1;
            let speed = if player.soft_dropping {
                self.config.soft_drop_speed
            } else {
                player.fall_speed.max(1)
            };
            if player.fall_timer >= speed {
                let points = if player.soft_dropping {
                    SOFT_DROP_POINTS
                } else {
                    0
                };
                self.step_down(room, player_id, points);
            }
            return;
        }

        player.is_locking = true;
        player.lock_timer += 1;
        if player.lock_timer >= self.config.lock_delay {
            self.lock_cascade(room, vec![player_id.to_string()], report);
        }
    }

    /// Locks the seed pieces, then keeps force-locking any other piece whose
    /// placement became invalid, checking for full rows after every lock.
    fn lock_cascade(&self, room: &mut Room, seeds: Vec<String>, report: &mut StepReport) {
        let mut queued: HashSet<String> = seeds.iter().cloned().collect();
        let mut work: VecDeque<String> = seeds.into();

        while let Some(id) = work.pop_front() {
            if !self.lock_piece(room, &id) {
                continue;
            }
            report.changed = true;
            report.locked.push(id.clone());

            let full: Vec<usize> = room
                .board
                .full_rows()
                .into_iter()
                .filter(|row| !room.line_clear.rows_to_clear.contains(row))
                .collect();
            if !full.is_empty() {
                if let Some(player) = room.player_mut(&id) {
                    player.score += LINE_CLEAR_POINTS * full.len() as u64;
                }
                room.line_clear.begin(&full);
                tracing::debug!(room_code = %room.code, player_id = %id, rows = ?full, "Rows completed");
            }

            for other in self.invalid_pieces(room) {
                if queued.insert(other.clone()) {
                    work.push_back(other);
                }
            }
        }
    }

    /// Ids of players whose current placement is no longer valid.
    fn invalid_pieces(&self, room: &Room) -> Vec<String> {
        room.active_players
            .iter()
            .filter(|id| room.player(id).is_some_and(|p| p.has_piece()))
            .filter(|id| !self.fits_offset(room, id, 0, 0))
            .map(str::to_string)
            .collect()
    }

    /// Writes the player's piece into the board and starts the entry delay.
    /// Cells that are off the board or already locked are skipped.
    fn lock_piece(&self, room: &mut Room, player_id: &str) -> bool {
        let Some(player) = room.player_mut(player_id) else {
            return false;
        };
        let Some(piece) = player.current_piece.take() else {
            return false;
        };
        let (x, y) = (player.x, player.y);
        player.begin_entry_delay();

        let value = piece.kind.cell_value();
        for (cx, cy) in piece.cells_at(x, y) {
            if room.board.in_bounds(cx, cy) && !room.board.is_occupied(cx, cy) {
                room.board.set(
                    cx,
                    cy,
                    Cell::Occupied {
                        value,
                        owner_id: player_id.to_string(),
                    },
                );
            }
        }
        tracing::trace!(room_code = %room.code, player_id, x, y, "Piece locked");
        true
    }

    /// Removes the animated rows, then moves every falling piece up by the
    /// number of removed rows at or below it and settles any piece that still
    /// overlaps.
    fn finish_line_clear(&self, room: &mut Room, report: &mut StepReport) {
        let rows = std::mem::take(&mut room.line_clear.rows_to_clear);
        room.line_clear = Default::default();
        room.board.remove_rows(&rows);
        report.rows_cleared += rows.len();

        for id in room.active_ids() {
            let Some(player) = room.player_mut(&id) else {
                continue;
            };
            if !player.has_piece() {
                continue;
            }
            let beneath = rows.iter().filter(|&&row| row as i32 >= player.y).count() as i32;
            if beneath > 0 {
                player.y = (player.y - beneath).max(0);
            }
        }

        for id in room.active_ids() {
            while room.player(&id).is_some_and(|p| p.has_piece() && p.y > 0)
                && !self.fits_offset(room, &id, 0, 0)
            {
                if let Some(player) = room.player_mut(&id) {
                    player.y -= 1;
                }
            }
        }

        let invalid = self.invalid_pieces(room);
        if !invalid.is_empty() {
            self.lock_cascade(room, invalid, report);
        }
    }

    fn spawn_piece<R: Rng + ?Sized>(
        &self,
        room: &mut Room,
        player_id: &str,
        rng: &mut R,
        report: &mut StepReport,
    ) {
        let piece = Tetromino::random(rng);
        let index = room.active_players.position(player_id).unwrap_or(0);
        let x = self.spawn_column(index, room.active_players.len(), &piece);
        let y = 0;
        let valid = self.can_place(room, player_id, &piece, x, y);
        let fall_speed = room.mode.fall_speed(&self.config);
        let room_code = room.code.clone();

        let Some(player) = room.player_mut(player_id) else {
            return;
        };
        player.waiting_for_entry = false;
        player.entry_delay_timer = 0;
        player.hard_drop_locked = false;
        player.fall_timer = 0;
        player.fall_speed = fall_speed;
        player.reset_lock();
        player.x = x;
        player.y = y;

        if valid {
            player.current_piece = Some(piece);
        } else {
            player.current_piece = None;
            player.game_over = true;
            report.topped_out.push(player_id.to_string());
            tracing::info!(room_code = %room_code, player_id, score = player.score, "Player topped out");
        }
        report.changed = true;
    }

    fn age_disconnected(&self, room: &mut Room) {
        let window = self.config.reconnect_window_ticks;
        room.disconnected_players.retain(|_, record| {
            record.idle_ticks += 1;
            record.idle_ticks < window
        });
    }

    fn check_game_end(&self, room: &mut Room, report: &mut StepReport) {
        if room.phase == RoomPhase::Playing && room.all_topped_out() {
            room.finish_game();
            report.game_ended = true;
            report.changed = true;
            tracing::info!(room_code = %room.code, "Game over");
        }
    }
}
