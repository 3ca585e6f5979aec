use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::game::room::{Room, RoomPhase};

/// Alphabet for room codes; omits characters that are easy to confuse.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;

pub fn random_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// A room behind its single-writer lock. Ticks and commands for the same
/// room serialize on this mutex.
pub type SharedRoom = Arc<Mutex<Room>>;

/// Position of the last snapshot applied for a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoomVersion {
    pub term: u64,
    pub sequence: u64,
}

/// Summary row for the status API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub phase: RoomPhase,
    pub players: usize,
    pub active_players: usize,
}

/// All rooms known to this node, plus the player → room index.
///
/// On the leader these are the authoritative rooms; on a follower they are
/// replicas overwritten by [`RoomRegistry::apply_snapshot`].
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    members: RwLock<HashMap<String, String>>,
    versions: Mutex<HashMap<String, RoomVersion>>,
    sequence: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a code not used by any current room.
    pub async fn generate_code(&self) -> String {
        let rooms = self.rooms.read().await;
        loop {
            let code = random_code(&mut rand::thread_rng());
            if !rooms.contains_key(&code) {
                return code;
            }
        }
    }

    /// Next replication sequence number. Called while holding the room lock
    /// so per-room snapshots are numbered in mutation order.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn insert(&self, room: Room) -> SharedRoom {
        let code = room.code.clone();
        let ids: Vec<String> = room.players.keys().cloned().collect();
        let shared = Arc::new(Mutex::new(room));
        self.rooms.write().await.insert(code.clone(), shared.clone());
        let mut members = self.members.write().await;
        for id in ids {
            members.insert(id, code.clone());
        }
        shared
    }

    pub async fn get(&self, code: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(code).cloned()
    }

    pub async fn contains(&self, code: &str) -> bool {
        self.rooms.read().await.contains_key(code)
    }

    pub async fn remove(&self, code: &str) -> Option<SharedRoom> {
        let removed = self.rooms.write().await.remove(code);
        if removed.is_some() {
            self.members.write().await.retain(|_, room| room != code);
            tracing::info!(room_code = code, "Room removed");
        }
        removed
    }

    /// Code of the room `player_id` belongs to.
    pub async fn room_of(&self, player_id: &str) -> Option<String> {
        self.members.read().await.get(player_id).cloned()
    }

    pub async fn bind(&self, player_id: &str, code: &str) {
        self.members
            .write()
            .await
            .insert(player_id.to_string(), code.to_string());
    }

    pub async fn unbind(&self, player_id: &str) {
        self.members.write().await.remove(player_id);
    }

    /// Rebuilds the membership index for one room from its player map.
    pub async fn reindex(&self, room: &Room) {
        let mut members = self.members.write().await;
        members.retain(|id, code| code != &room.code || room.players.contains_key(id));
        for id in room.players.keys() {
            members.insert(id.clone(), room.code.clone());
        }
    }

    /// Codes of every room currently in `playing`.
    pub async fn playing_codes(&self) -> Vec<String> {
        let rooms: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(code, room)| (code.clone(), room.clone()))
            .collect();
        let mut playing = Vec::new();
        for (code, room) in rooms {
            if room.lock().await.phase == RoomPhase::Playing {
                playing.push(code);
            }
        }
        playing
    }

    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let rooms: Vec<SharedRoom> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let room = room.lock().await;
            summaries.push(RoomSummary {
                code: room.code.clone(),
                phase: room.phase,
                players: room.players.len(),
                active_players: room.active_players.len(),
            });
        }
        summaries.sort_by(|a, b| a.code.cmp(&b.code));
        summaries
    }

    /// Stores a replicated snapshot unless an equal or newer one was already
    /// applied. `None` is a tombstone: the room is removed and older
    /// snapshots of it stay rejected. Returns whether it was applied.
    pub async fn apply_snapshot(
        &self,
        code: &str,
        version: RoomVersion,
        room: Option<Room>,
    ) -> bool {
        let mut versions = self.versions.lock().await;
        if let Some(last) = versions.get(code) {
            if version.term == last.term && version.sequence <= last.sequence {
                return false;
            }
            if version.term < last.term {
                return false;
            }
        }
        versions.insert(code.to_string(), version);

        match room {
            Some(room) => {
                let existing = self.rooms.read().await.get(code).cloned();
                match existing {
                    Some(shared) => {
                        *shared.lock().await = room.clone();
                    }
                    None => {
                        self.rooms
                            .write()
                            .await
                            .insert(code.to_string(), Arc::new(Mutex::new(room.clone())));
                    }
                }
                self.reindex(&room).await;
            }
            None => {
                drop(versions);
                self.remove(code).await;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn room(code: &str, players: &[&str]) -> Room {
        let mut room = Room::new(code, &GameConfig::default());
        for id in players {
            room.add_player(id, id, 8).unwrap();
        }
        room
    }

    #[test]
    fn test_codes_use_alphabet() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..50 {
            let code = random_code(&mut rng);
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('I'));
        }
    }

    #[tokio::test]
    async fn test_generated_code_is_unused() {
        let registry = RoomRegistry::new();
        let code = registry.generate_code().await;
        registry.insert(room(&code, &["p1"])).await;
        assert_ne!(registry.generate_code().await, code);
    }

    #[tokio::test]
    async fn test_insert_indexes_members() {
        let registry = RoomRegistry::new();
        registry.insert(room("AAAAAA", &["p1", "p2"])).await;

        assert_eq!(registry.room_of("p1").await.as_deref(), Some("AAAAAA"));
        assert!(registry.contains("AAAAAA").await);

        registry.remove("AAAAAA").await;
        assert!(registry.room_of("p1").await.is_none());
        assert!(registry.get("AAAAAA").await.is_none());
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let registry = RoomRegistry::new();
        let a = registry.next_sequence();
        let b = registry.next_sequence();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_apply_snapshot_rejects_stale_sequence() {
        let registry = RoomRegistry::new();
        let v = |term, sequence| RoomVersion { term, sequence };

        assert!(
            registry
                .apply_snapshot("BBBBBB", v(1, 5), Some(room("BBBBBB", &["p1"])))
                .await
        );
        assert!(
            !registry
                .apply_snapshot("BBBBBB", v(1, 4), Some(room("BBBBBB", &["p1", "p2"])))
                .await
        );
        let stored = registry.get("BBBBBB").await.unwrap();
        assert_eq!(stored.lock().await.players.len(), 1);

        // A newer term wins even with a lower sequence.
        assert!(
            registry
                .apply_snapshot("BBBBBB", v(2, 1), Some(room("BBBBBB", &["p1", "p2"])))
                .await
        );
        assert_eq!(stored.lock().await.players.len(), 2);
        assert_eq!(registry.room_of("p2").await.as_deref(), Some("BBBBBB"));

        assert!(
            !registry
                .apply_snapshot("BBBBBB", v(1, 99), Some(room("BBBBBB", &[])))
                .await
        );
    }

    #[tokio::test]
    async fn test_tombstone_removes_room_and_blocks_older_snapshots() {
        let registry = RoomRegistry::new();
        let v = |sequence| RoomVersion { term: 3, sequence };

        registry
            .apply_snapshot("CCCCCC", v(1), Some(room("CCCCCC", &["p1"])))
            .await;
        assert!(registry.apply_snapshot("CCCCCC", v(3), None).await);
        assert!(!registry.contains("CCCCCC").await);
        assert!(registry.room_of("p1").await.is_none());

        assert!(
            !registry
                .apply_snapshot("CCCCCC", v(2), Some(room("CCCCCC", &["p1"])))
                .await
        );
        assert!(!registry.contains("CCCCCC").await);
    }

    #[tokio::test]
    async fn test_reindex_drops_departed_players() {
        let registry = RoomRegistry::new();
        let mut r = room("DDDDDD", &["p1", "p2"]);
        registry.insert(r.clone()).await;

        r.remove_player("p2");
        registry.reindex(&r).await;

        assert_eq!(registry.room_of("p1").await.as_deref(), Some("DDDDDD"));
        assert!(registry.room_of("p2").await.is_none());
    }

    #[tokio::test]
    async fn test_summaries_and_playing_codes() {
        let registry = RoomRegistry::new();
        let mut playing = room("PLAYNG", &["p1"]);
        playing.phase = RoomPhase::Playing;
        registry.insert(playing).await;
        registry.insert(room("LOBBY2", &["p2", "p3"])).await;

        assert_eq!(registry.playing_codes().await, vec!["PLAYNG"]);
        let summaries = registry.summaries().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].code, "LOBBY2");
        assert_eq!(summaries[0].players, 2);
    }
}
