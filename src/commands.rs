//! Leader-side handling of client events.
//!
//! Every mutation happens while holding the room's lock, and the snapshot to
//! replicate is taken (and numbered) before the lock is released.

use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::game::engine::{Engine, StepReport};
use crate::game::room::{GameMode, Room, RoomPhase};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::RoomRegistry;
use crate::session::{self, Rejoin};

/// A replicated change to one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomChange {
    pub code: String,
    pub term: u64,
    pub sequence: u64,
    /// New state; `None` when the room was removed.
    pub room: Option<Room>,
    /// Broadcast to every member before the new state.
    pub events: Vec<ServerEvent>,
}

/// Result of one client event.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Sent only to the requesting connection.
    pub replies: Vec<ServerEvent>,
    pub changes: Vec<RoomChange>,
    /// Room whose tick loop should start.
    pub start_loop: Option<String>,
}

/// `gameOver` events for players that just topped out.
pub fn top_out_events(room: &Room, report: &StepReport) -> Vec<ServerEvent> {
    report
        .topped_out
        .iter()
        .filter_map(|id| room.player(id))
        .map(|player| ServerEvent::GameOver {
            player_id: player.id.clone(),
            score: player.score,
            total_score: room.total_score(),
            is_multiplayer: room.is_multiplayer(),
        })
        .collect()
}

pub struct CommandHandler {
    registry: Arc<RoomRegistry>,
    engine: Arc<Engine>,
}

impl CommandHandler {
    pub fn new(registry: Arc<RoomRegistry>, engine: Arc<Engine>) -> Self {
        Self { registry, engine }
    }

    /// Applies `event` from connection `player_id` as leader of `term`.
    pub async fn handle(&self, term: u64, player_id: &str, event: ClientEvent) -> Result<Outcome> {
        tracing::debug!(player_id, term, event = ?event, "Handling client event");
        match event {
            ClientEvent::CreateRoom { player_name } => {
                self.create_room(term, player_id, &player_name).await
            }
            ClientEvent::JoinRoom {
                room_code,
                player_name,
            } => self.join_room(term, player_id, &room_code, &player_name).await,
            ClientEvent::RejoinRoom {
                room_code,
                player_name,
                previous_id,
                was_ready,
            } => {
                self.rejoin_room(
                    term,
                    player_id,
                    &room_code,
                    &player_name,
                    previous_id.as_deref(),
                    was_ready,
                )
                .await
            }
            ClientEvent::LeaveRoom => {
                let code = self
                    .registry
                    .room_of(player_id)
                    .await
                    .ok_or(ServerError::NotInRoom)?;
                let mut outcome = self.leave(term, player_id).await?;
                outcome.replies.push(ServerEvent::RoomLeft { room_code: code });
                Ok(outcome)
            }
            ClientEvent::Disconnect => self.leave(term, player_id).await,
            ClientEvent::PlayerReady { ready } => {
                self.with_room(term, player_id, |room, _| {
                    room.set_ready(player_id, ready)?;
                    Ok(Vec::new())
                })
                .await
            }
            ClientEvent::SetGameMode { mode } => {
                let mode: GameMode = mode.parse()?;
                self.with_room(term, player_id, |room, _| {
                    if !room.is_host(player_id) {
                        return Err(ServerError::NotHost);
                    }
                    room.set_mode(mode)?;
                    Ok(Vec::new())
                })
                .await
            }
            ClientEvent::StartGame => self.start_game(term, player_id).await,
            ClientEvent::PlayerAction(action) => {
                let code = self
                    .registry
                    .room_of(player_id)
                    .await
                    .ok_or(ServerError::NotInRoom)?;
                let shared = self
                    .registry
                    .get(&code)
                    .await
                    .ok_or_else(|| ServerError::RoomNotFound(code.clone()))?;
                let mut room = shared.lock().await;
                let report = self.engine.apply_action(&mut room, player_id, action);
                if !report.changed {
                    return Ok(Outcome::default());
                }
                let events = top_out_events(&room, &report);
                Ok(Outcome {
                    changes: vec![self.snapshot(term, &room, events)],
                    ..Outcome::default()
                })
            }
        }
    }

    fn snapshot(&self, term: u64, room: &Room, events: Vec<ServerEvent>) -> RoomChange {
        RoomChange {
            code: room.code.clone(),
            term,
            sequence: self.registry.next_sequence(),
            room: Some(room.clone()),
            events,
        }
    }

    fn tombstone(&self, term: u64, code: &str, events: Vec<ServerEvent>) -> RoomChange {
        RoomChange {
            code: code.to_string(),
            term,
            sequence: self.registry.next_sequence(),
            room: None,
            events,
        }
    }

    /// Runs `mutate` on the caller's room and snapshots the result.
    async fn with_room<F>(&self, term: u64, player_id: &str, mutate: F) -> Result<Outcome>
    where
        F: FnOnce(&mut Room, &Engine) -> Result<Vec<ServerEvent>>,
    {
        let code = self
            .registry
            .room_of(player_id)
            .await
            .ok_or(ServerError::NotInRoom)?;
        let shared = self
            .registry
            .get(&code)
            .await
            .ok_or_else(|| ServerError::RoomNotFound(code.clone()))?;
        let mut room = shared.lock().await;
        let events = mutate(&mut room, &self.engine)?;
        Ok(Outcome {
            changes: vec![self.snapshot(term, &room, events)],
            ..Outcome::default()
        })
    }

    /// Called once the player already holds a seat in another room: takes
    /// it out of `previous` and answers with `roomLeft` for that room.
    async fn leave_previous(&self, term: u64, player_id: &str, previous: Option<String>) -> Outcome {
        let Some(code) = previous else {
            return Outcome::default();
        };
        let mut outcome = self.depart(term, player_id, &code).await;
        outcome.replies.push(ServerEvent::RoomLeft { room_code: code });
        outcome
    }

    async fn create_room(&self, term: u64, player_id: &str, name: &str) -> Result<Outcome> {
        let name = validate_name(name)?;
        let previous = self.registry.room_of(player_id).await;

        let code = self.registry.generate_code().await;
        let mut room = Room::new(code.clone(), self.engine.config());
        room.add_player(player_id, name, self.engine.config().max_players)?;
        let change = self.snapshot(term, &room, Vec::new());
        self.registry.insert(room).await;
        let mut outcome = self.leave_previous(term, player_id, previous).await;

        tracing::info!(room_code = %code, player_id, "Room created");
        outcome.replies.push(ServerEvent::RoomCreated {
            room_code: code,
            player_id: player_id.to_string(),
        });
        outcome.changes.push(change);
        Ok(outcome)
    }

    async fn join_room(
        &self,
        term: u64,
        player_id: &str,
        code: &str,
        name: &str,
    ) -> Result<Outcome> {
        let name = validate_name(name)?;
        let code = code.trim().to_ascii_uppercase();
        let shared = self
            .registry
            .get(&code)
            .await
            .ok_or_else(|| ServerError::RoomNotFound(code.clone()))?;

        let previous = self.registry.room_of(player_id).await;
        if previous.as_deref() == Some(code.as_str()) {
            return Err(ServerError::Protocol(format!("Already in room {code}")));
        }

        // The new seat is taken before the old one is given up, so a refused
        // join leaves the player where it was.
        let change = {
            let mut room = shared.lock().await;
            if room.phase == RoomPhase::Playing {
                return Err(ServerError::GameInProgress);
            }
            room.add_player(player_id, name, self.engine.config().max_players)?;
            self.registry.bind(player_id, &code).await;

            let events = vec![ServerEvent::PlayerJoined {
                player_id: player_id.to_string(),
                player_name: name.to_string(),
            }];
            self.snapshot(term, &room, events)
        };

        let mut outcome = self.leave_previous(term, player_id, previous).await;
        outcome.changes.push(change);
        outcome.replies.push(ServerEvent::RoomJoined {
            room_code: code,
            player_id: player_id.to_string(),
        });
        Ok(outcome)
    }

    async fn rejoin_room(
        &self,
        term: u64,
        player_id: &str,
        code: &str,
        name: &str,
        previous_id: Option<&str>,
        was_ready: bool,
    ) -> Result<Outcome> {
        let name = validate_name(name)?;
        let code = code.trim().to_ascii_uppercase();
        let shared = self
            .registry
            .get(&code)
            .await
            .ok_or_else(|| ServerError::RoomNotFound(code.clone()))?;
        let previous = self
            .registry
            .room_of(player_id)
            .await
            .filter(|current| *current != code);

        let (rejoin, change, playing) = {
            let mut room = shared.lock().await;
            let rejoin = session::rejoin(
                &mut room,
                player_id,
                name,
                previous_id,
                was_ready,
                self.engine.config().max_players,
            )?;
            if let Rejoin::Migrated { previous_id } = &rejoin {
                self.registry.unbind(previous_id).await;
            }
            self.registry.bind(player_id, &code).await;

            let events = vec![ServerEvent::PlayerJoined {
                player_id: player_id.to_string(),
                player_name: name.to_string(),
            }];
            let change = self.snapshot(term, &room, events);
            (rejoin, change, room.phase == RoomPhase::Playing)
        };

        let mut outcome = self.leave_previous(term, player_id, previous).await;
        outcome.changes.push(change);
        outcome.replies.push(ServerEvent::RoomRejoined {
            room_code: code.clone(),
            player_id: player_id.to_string(),
            restored: rejoin != Rejoin::Joined,
        });
        outcome.start_loop = playing.then_some(code);
        Ok(outcome)
    }

    /// Removes the player from its room; empties rooms are deleted.
    async fn leave(&self, term: u64, player_id: &str) -> Result<Outcome> {
        let Some(code) = self.registry.room_of(player_id).await else {
            return Ok(Outcome::default());
        };
        self.registry.unbind(player_id).await;
        Ok(self.depart(term, player_id, &code).await)
    }

    /// Takes the player out of room `code` without touching its binding.
    async fn depart(&self, term: u64, player_id: &str, code: &str) -> Outcome {
        let Some(shared) = self.registry.get(code).await else {
            return Outcome::default();
        };

        let mut room = shared.lock().await;
        let Some(departure) = session::depart(&mut room, player_id) else {
            return Outcome::default();
        };

        let mut events = vec![ServerEvent::PlayerLeft {
            player_id: departure.player_id.clone(),
            player_name: departure.name.clone(),
        }];
        if let Some(host) = departure.new_host {
            events.push(ServerEvent::HostAssigned { player_id: host });
        }

        let change = if departure.room_empty {
            drop(room);
            self.registry.remove(code).await;
            self.tombstone(term, code, events)
        } else {
            self.snapshot(term, &room, events)
        };
        Outcome {
            changes: vec![change],
            ..Outcome::default()
        }
    }

    async fn start_game(&self, term: u64, player_id: &str) -> Result<Outcome> {
        let mut start_loop = None;
        let mut outcome = self
            .with_room(term, player_id, |room, engine| {
                if !room.is_host(player_id) {
                    return Err(ServerError::NotHost);
                }
                match room.phase {
                    RoomPhase::Ready => {}
                    RoomPhase::Playing => return Err(ServerError::GameInProgress),
                    RoomPhase::Lobby | RoomPhase::GameOver => return Err(ServerError::NotReady),
                }
                let report = engine.start_game(room, &mut rand::thread_rng());
                tracing::info!(room_code = %room.code, mode = %room.mode, players = room.active_players.len(), "Game started");
                if room.phase == RoomPhase::Playing {
                    start_loop = Some(room.code.clone());
                }
                Ok(top_out_events(room, &report))
            })
            .await?;
        outcome.start_loop = start_loop;
        Ok(outcome)
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServerError::Protocol("Player name is required".to_string()));
    }
    Ok(name)
}
