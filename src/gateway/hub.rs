//! Connected WebSocket clients on this node and the room each one watches.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::game::room::Room;
use crate::protocol::{Membership, ServerEvent};
use crate::registry::RoomVersion;

/// Frames queued per connection before new ones are dropped.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

struct ClientState {
    tx: mpsc::Sender<String>,
    room: Option<String>,
}

/// Local fan-out point for every client connected to this node.
///
/// Frames are pre-encoded JSON so one snapshot is serialized once per
/// broadcast, not once per client.
#[derive(Default)]
pub struct ClientHub {
    clients: RwLock<HashMap<String, ClientState>>,
    // Last room version pushed to clients, so late deliveries never rewind a view
    delivered: RwLock<HashMap<String, RoomVersion>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client; frames for it arrive on the returned receiver.
    pub async fn register(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients
            .write()
            .await
            .insert(id.clone(), ClientState { tx, room: None });
        tracing::debug!(connection_id = %id, "Client connected");
        (id, rx)
    }

    /// Remove a client
    pub async fn unregister(&self, id: &str) {
        if self.clients.write().await.remove(id).is_some() {
            tracing::debug!(connection_id = id, "Client disconnected");
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn room_of(&self, id: &str) -> Option<String> {
        self.clients
            .read()
            .await
            .get(id)
            .and_then(|client| client.room.clone())
    }

    /// Sends one event to one client. Returns false if it is gone or its
    /// queue is full.
    pub async fn send(&self, id: &str, event: &ServerEvent) -> bool {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "Failed to encode event");
                return false;
            }
        };
        let clients = self.clients.read().await;
        match clients.get(id) {
            Some(client) => push(id, &client.tx, frame),
            None => false,
        }
    }

    /// Updates which room `id` receives broadcasts for, based on a reply
    /// addressed to it.
    pub async fn apply_membership(&self, id: &str, event: &ServerEvent) {
        let Some(membership) = event.membership() else {
            return;
        };
        if let Some(client) = self.clients.write().await.get_mut(id) {
            client.room = match membership {
                Membership::Entered(code) => Some(code.to_string()),
                Membership::Left => None,
            };
        }
    }

    /// Delivers room events, then the room state, to every local member.
    /// A state older than the last one delivered for the room is skipped;
    /// the events still go out. A removal detaches the remaining members
    /// and forgets the room.
    pub async fn broadcast_room(
        &self,
        code: &str,
        version: RoomVersion,
        events: &[ServerEvent],
        room: Option<&Room>,
    ) {
        let mut frames = Vec::with_capacity(events.len() + 1);
        for event in events {
            match event.encode() {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!(room_code = code, error = %e, "Failed to encode event"),
            }
        }

        let fresh = {
            let mut delivered = self.delivered.write().await;
            match delivered.get(code) {
                Some(last) if *last >= version => false,
                _ => {
                    delivered.insert(code.to_string(), version);
                    true
                }
            }
        };
        if let (true, Some(room)) = (fresh, room) {
            match ServerEvent::GameState(Box::new(room.clone())).encode() {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!(room_code = code, error = %e, "Failed to encode room"),
            }
        }

        let removed = room.is_none() && fresh;
        if frames.is_empty() && !removed {
            return;
        }
        let mut clients = self.clients.write().await;
        for (id, client) in clients.iter_mut() {
            if client.room.as_deref() != Some(code) {
                continue;
            }
            for frame in &frames {
                push(id, &client.tx, frame.clone());
            }
            if removed {
                client.room = None;
            }
        }
        drop(clients);

        // A removed room has no members left to protect from rewinds
        if removed {
            self.delivered.write().await.remove(code);
        }
    }

    /// Send one event to every connected client.
    pub async fn broadcast_all(&self, event: &ServerEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode event");
                return;
            }
        };
        let clients = self.clients.read().await;
        for (id, client) in clients.iter() {
            push(id, &client.tx, frame.clone());
        }
    }
}

fn push(id: &str, tx: &mpsc::Sender<String>, frame: String) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(connection_id = id, "Client queue full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;

    fn version(term: u64, sequence: u64) -> RoomVersion {
        RoomVersion { term, sequence }
    }

    fn joined(code: &str) -> ServerEvent {
        ServerEvent::RoomJoined {
            room_code: code.to_string(),
            player_id: "p".to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(ServerEvent::decode(&frame).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let hub = ClientHub::new();
        let (id, _rx) = hub.register().await;
        assert_eq!(hub.client_count().await, 1);

        hub.unregister(&id).await;
        assert_eq!(hub.client_count().await, 0);
        assert!(!hub.send(&id, &ServerEvent::Init { id: id.clone() }).await);
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_members() {
        let hub = ClientHub::new();
        let (member, mut member_rx) = hub.register().await;
        let (other, mut other_rx) = hub.register().await;
        hub.apply_membership(&member, &joined("ABCDEF")).await;

        let room = Room::new("ABCDEF", &GameConfig::default());
        hub.broadcast_room("ABCDEF", version(1, 1), &[], Some(&room))
            .await;

        assert_eq!(drain(&mut member_rx).len(), 1);
        assert!(drain(&mut other_rx).is_empty());
        assert_eq!(hub.room_of(&other).await, None);
    }

    #[tokio::test]
    async fn test_stale_state_not_delivered() {
        let hub = ClientHub::new();
        let (id, mut rx) = hub.register().await;
        hub.apply_membership(&id, &joined("ABCDEF")).await;
        let room = Room::new("ABCDEF", &GameConfig::default());

        hub.broadcast_room("ABCDEF", version(1, 5), &[], Some(&room))
            .await;
        let left = ServerEvent::PlayerLeft {
            player_id: "q".to_string(),
            player_name: "q".to_string(),
        };
        hub.broadcast_room("ABCDEF", version(1, 4), &[left.clone()], Some(&room))
            .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ServerEvent::GameState(_)));
        assert_eq!(events[1], left);
    }

    #[tokio::test]
    async fn test_leaving_stops_broadcasts() {
        let hub = ClientHub::new();
        let (id, mut rx) = hub.register().await;
        hub.apply_membership(&id, &joined("ABCDEF")).await;
        hub.apply_membership(
            &id,
            &ServerEvent::RoomLeft {
                room_code: "ABCDEF".to_string(),
            },
        )
        .await;

        let room = Room::new("ABCDEF", &GameConfig::default());
        hub.broadcast_room("ABCDEF", version(1, 1), &[], Some(&room))
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_removed_room_is_forgotten() {
        let hub = ClientHub::new();
        let (id, mut rx) = hub.register().await;
        hub.apply_membership(&id, &joined("ABCDEF")).await;
        let room = Room::new("ABCDEF", &GameConfig::default());
        hub.broadcast_room("ABCDEF", version(1, 1), &[], Some(&room))
            .await;

        let left = ServerEvent::PlayerLeft {
            player_id: "q".to_string(),
            player_name: "q".to_string(),
        };
        hub.broadcast_room("ABCDEF", version(1, 2), &[left.clone()], None)
            .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], left);
        assert_eq!(hub.room_of(&id).await, None);
        assert!(hub.delivered.read().await.is_empty());
    }
}
