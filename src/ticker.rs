//! Fixed-rate simulation loops, one per room being played on the leader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::commands::{top_out_events, RoomChange};
use crate::game::engine::Engine;
use crate::game::room::RoomPhase;
use crate::raft::RaftNode;
use crate::registry::RoomRegistry;
use crate::replication::Replicator;

struct LoopHandle {
    generation: u64,
    cancel: CancellationToken,
}

/// Starts and stops per-room tick loops. Both operations are idempotent
/// and keyed by room code, so a room never has two loops.
pub struct TickScheduler {
    registry: Arc<RoomRegistry>,
    engine: Arc<Engine>,
    replicator: Arc<Replicator>,
    raft_node: Arc<RaftNode>,
    loops: Mutex<HashMap<String, LoopHandle>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl TickScheduler {
    pub fn new(
        registry: Arc<RoomRegistry>,
        engine: Arc<Engine>,
        replicator: Arc<Replicator>,
        raft_node: Arc<RaftNode>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            engine,
            replicator,
            raft_node,
            loops: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Starts the loop for `code` unless one is already running.
    pub async fn start(self: &Arc<Self>, code: &str) -> bool {
        let mut loops = self.loops.lock().await;
        if loops.contains_key(code) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();
        loops.insert(
            code.to_string(),
            LoopHandle {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(loops);

        tracing::info!(room_code = code, generation, "Starting tick loop");
        let scheduler = self.clone();
        let code = code.to_string();
        tokio::spawn(async move {
            scheduler.run_loop(&code, cancel).await;
            scheduler.finished(&code, generation).await;
        });
        true
    }

    pub async fn stop(&self, code: &str) -> bool {
        match self.loops.lock().await.remove(code) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(room_code = code, "Stopped tick loop");
                true
            }
            None => false,
        }
    }

    /// Stops every loop; used when leadership is lost.
    pub async fn stop_all(&self) {
        let mut loops = self.loops.lock().await;
        if loops.is_empty() {
            return;
        }
        tracing::info!(rooms = loops.len(), "Stopping all tick loops");
        for (_, handle) in loops.drain() {
            handle.cancel.cancel();
        }
    }

    /// Starts loops for every room in `playing`; used after winning an
    /// election.
    pub async fn start_playing_rooms(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for code in self.registry.playing_codes().await {
            if self.start(&code).await {
                started += 1;
            }
        }
        started
    }

    pub async fn is_running(&self, code: &str) -> bool {
        self.loops.lock().await.contains_key(code)
    }

    pub async fn running(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        codes.sort();
        codes
    }

    async fn finished(&self, code: &str, generation: u64) {
        let mut loops = self.loops.lock().await;
        if loops.get(code).map(|h| h.generation) == Some(generation) {
            loops.remove(code);
        }
    }

    async fn run_loop(&self, code: &str, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.engine.config().tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(term) = self.raft_node.leader_term().await else {
                tracing::debug!(room_code = code, "No longer leader, tick loop exiting");
                break;
            };
            let Some(shared) = self.registry.get(code).await else {
                break;
            };

            let (change, playing) = {
                let mut room = shared.lock().await;
                if room.phase != RoomPhase::Playing {
                    break;
                }
                let report = self.engine.tick(&mut room, &mut rand::thread_rng());
                if report.game_ended {
                    tracing::info!(room_code = code, total_score = room.total_score(), "Game over");
                }
                let change = report.changed.then(|| RoomChange {
                    code: code.to_string(),
                    term,
                    sequence: self.registry.next_sequence(),
                    room: Some(room.clone()),
                    events: top_out_events(&room, &report),
                });
                (change, room.phase == RoomPhase::Playing)
            };

            if let Some(change) = change {
                self.replicator.replicate(change).await;
            }
            if !playing {
                break;
            }
        }
        tracing::debug!(room_code = code, "Tick loop exited");
    }
}
