//! Player departure and return.
//!
//! A player who drops out of a running game keeps a [`DisconnectedPlayer`]
//! record (number, colour, score, name) so a later `rejoinRoom` with the same
//! name can pick up where they left off. Outside gameplay a departing player
//! is simply removed.

use crate::error::{Result, ServerError};
use crate::game::player::{short_id, DisconnectedPlayer, Player};
use crate::game::room::{Room, RoomPhase};

/// What happened when a player left the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub player_id: String,
    pub name: String,
    /// True if a disconnected record was kept for a later rejoin.
    pub preserved: bool,
    pub new_host: Option<String>,
    /// No active player remains; the room should be discarded.
    pub room_empty: bool,
    /// The departure ended the running game.
    pub game_ended: bool,
}

/// How a rejoin was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejoin {
    /// An active player with the same name moved onto the new connection.
    Migrated { previous_id: String },
    /// A disconnected record was turned back into an active player.
    Restored,
    /// Nothing matched; joined as a new player.
    Joined,
}

/// Removes a player after a disconnect or `leaveRoom`.
pub fn depart(room: &mut Room, player_id: &str) -> Option<Departure> {
    let player = room.remove_player(player_id)?;
    let preserved = room.phase == RoomPhase::Playing;

    if preserved {
        room.board.scrub_owner(player_id);
        room.disconnected_players
            .insert(short_id(player_id), DisconnectedPlayer::from_player(&player));
    }

    let new_host = promote_host(room);
    let room_empty = room.active_players.is_empty();

    let mut game_ended = false;
    if room_empty {
        room.return_to_lobby();
    } else if room.phase == RoomPhase::Playing && room.all_topped_out() {
        room.finish_game();
        game_ended = true;
    } else {
        room.refresh_phase();
    }

    tracing::info!(
        room_code = %room.code,
        player_id,
        preserved,
        remaining = room.active_players.len(),
        "Player left room"
    );

    Some(Departure {
        player_id: player.id,
        name: player.name,
        preserved,
        new_host,
        room_empty,
        game_ended,
    })
}

/// Makes the first active player host if nobody holds the flag.
/// Returns the id of the promoted player.
pub fn promote_host(room: &mut Room) -> Option<String> {
    if room.host_id().is_some() {
        return None;
    }
    let next = room.active_players.first()?.to_string();
    let player = room.player_mut(&next)?;
    player.is_host = true;
    tracing::info!(room_code = %room.code, player_id = %next, "Host reassigned");
    Some(next)
}

/// Attaches connection `new_id` to the room under `name`.
///
/// Resolution order: an active player with the same name (or with id
/// `previous_id`) is migrated onto the new id, a disconnected record with the
/// same name is restored, otherwise the player joins fresh.
pub fn rejoin(
    room: &mut Room,
    new_id: &str,
    name: &str,
    previous_id: Option<&str>,
    was_ready: bool,
    max_players: usize,
) -> Result<Rejoin> {
    let existing = previous_id
        .filter(|id| room.players.contains_key(*id))
        .map(str::to_string)
        .or_else(|| room.find_by_name(name).map(|p| p.id.clone()));

    let outcome = if let Some(old_id) = existing {
        migrate(room, &old_id, new_id)?;
        Rejoin::Migrated {
            previous_id: old_id,
        }
    } else if let Some(key) = disconnected_key(room, name) {
        restore(room, &key, new_id)?;
        Rejoin::Restored
    } else {
        if room.players.len() >= max_players {
            return Err(ServerError::RoomFull);
        }
        let number = room.next_player_number();
        let mut player = Player::new(new_id, name, number);
        player.is_host = room.host_id().is_none();
        if room.phase == RoomPhase::Playing {
            player.begin_entry_delay();
        }
        room.insert_player(player);
        Rejoin::Joined
    };

    if was_ready && matches!(room.phase, RoomPhase::Lobby | RoomPhase::Ready) {
        room.set_ready(new_id, true)?;
    } else {
        room.refresh_phase();
    }

    tracing::info!(room_code = %room.code, player_id = new_id, outcome = ?outcome, "Player rejoined");
    Ok(outcome)
}

fn disconnected_key(room: &Room, name: &str) -> Option<String> {
    room.disconnected_players
        .iter()
        .find(|(_, record)| record.name == name)
        .map(|(key, _)| key.clone())
}

/// Re-keys an active player, keeping position, pieces and board ownership.
fn migrate(room: &mut Room, old_id: &str, new_id: &str) -> Result<()> {
    if old_id == new_id {
        return Ok(());
    }
    let mut player = room
        .players
        .remove(old_id)
        .ok_or_else(|| ServerError::Internal(format!("player {old_id} vanished")))?;
    player.id = new_id.to_string();
    room.players.insert(new_id.to_string(), player);
    room.active_players.rename(old_id, new_id);
    room.ready_players.rename(old_id, new_id);
    room.board.transfer_owner(old_id, new_id);
    Ok(())
}

fn restore(room: &mut Room, key: &str, new_id: &str) -> Result<()> {
    let record = room
        .disconnected_players
        .remove(key)
        .ok_or_else(|| ServerError::Internal(format!("disconnected record {key} vanished")))?;

    let mut player = Player::new(new_id, record.name, record.player_number);
    player.color = record.color;
    player.score = record.score;
    player.is_host = room.host_id().is_none();
    if room.phase == RoomPhase::Playing {
        player.begin_entry_delay();
    }
    room.insert_player(player);
    Ok(())
}
