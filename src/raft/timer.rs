use rand::Rng;
use std::time::Duration;

/// Generates a random election timeout within the configured range.
/// A fresh value is drawn after every reset so competing candidates drift apart.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let max_ms = max_ms.max(min_ms);
    let timeout_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}
