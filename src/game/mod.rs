//! Authoritative game model and simulation.

pub mod board;
pub mod engine;
pub mod player;
pub mod room;
pub mod set;
pub mod tetromino;

pub use board::{Board, Cell};
pub use engine::{Action, Engine, StepReport};
pub use player::{DisconnectedPlayer, Direction, Player};
pub use room::{GameMode, LineClear, Room, RoomPhase};
pub use set::OrderedSet;
pub use tetromino::{Tetromino, TetrominoKind};
