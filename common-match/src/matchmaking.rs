//! Ranked queue and pairing policy. The queue itself is pure bookkeeping so
//! the pairing rule can be tested deterministically; the arena lobby owns the
//! tick that drives it and the sockets behind the waiters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One queued player. Unranked players queue at their provisional estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waiter {
    pub user_id: String,
    pub username: String,
    pub rating: i32,
    pub ranked: bool,
    pub joined_at: DateTime<Utc>,
}

/// How far a waiter's acceptable rating gap has grown. Starts at 100 points
/// and widens by 50 every five seconds of waiting.
pub fn expansion_window(waited_secs: i64) -> i32 {
    100 + 50 * (waited_secs.max(0) / 5) as i32
}

#[derive(Debug, Default)]
pub struct MatchQueue {
    waiters: HashMap<String, Waiter>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.waiters.contains_key(user_id)
    }

    /// Enqueue a waiter. A user can only wait once; a new join replaces the
    /// old entry (and its wait clock).
    pub fn join(&mut self, waiter: Waiter) -> bool {
        let replaced = self
            .waiters
            .insert(waiter.user_id.clone(), waiter)
            .is_some();
        if replaced {
            debug!("matchmaking: waiter re-joined, previous entry replaced");
        }
        replaced
    }

    pub fn leave(&mut self, user_id: &str) -> Option<Waiter> {
        self.waiters.remove(user_id)
    }

    /// Pair every set of waiters that fit each other's expansion windows.
    ///
    /// Deterministic for identical inputs and wait times: candidate pairs are
    /// ordered by (rating gap, earliest join, user ids) and taken greedily,
    /// so the two closest-rated waiters always pair first.
    pub fn pair_ready(&mut self, now: DateTime<Utc>) -> Vec<(Waiter, Waiter)> {
        let mut snapshot: Vec<&Waiter> = self.waiters.values().collect();
        snapshot.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut candidates = Vec::new();
        for (i, a) in snapshot.iter().enumerate() {
            for b in snapshot.iter().skip(i + 1) {
                let gap = (a.rating - b.rating).abs();
                let window_a = expansion_window((now - a.joined_at).num_seconds());
                let window_b = expansion_window((now - b.joined_at).num_seconds());
                if gap <= window_a && gap <= window_b {
                    let first_join = a.joined_at.min(b.joined_at);
                    candidates.push((gap, first_join, a.user_id.clone(), b.user_id.clone()));
                }
            }
        }
        candidates.sort();

        let mut pairs = Vec::new();
        for (_, _, a, b) in candidates {
            if self.waiters.contains_key(&a) && self.waiters.contains_key(&b) {
                let first = self.waiters.remove(&a).expect("checked");
                let second = self.waiters.remove(&b).expect("checked");
                pairs.push((first, second));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn waiter(user_id: &str, rating: i32, joined: DateTime<Utc>) -> Waiter {
        Waiter {
            user_id: user_id.into(),
            username: user_id.into(),
            rating,
            ranked: true,
            joined_at: joined,
        }
    }

    #[test]
    fn closest_ratings_pair_first() {
        let now = Utc::now();
        let mut queue = MatchQueue::new();
        queue.join(waiter("a", 1000, now));
        queue.join(waiter("b", 1040, now));
        queue.join(waiter("c", 1090, now));

        let pairs = queue.pair_ready(now);
        assert_eq!(pairs.len(), 1);
        let (x, y) = &pairs[0];
        let mut ids = [x.user_id.as_str(), y.user_id.as_str()];
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
        assert!(queue.contains("c"));
    }

    #[test]
    fn window_expands_with_wait() {
        let now = Utc::now();
        let mut queue = MatchQueue::new();
        queue.join(waiter("a", 1000, now));
        queue.join(waiter("b", 1400, now));

        // Fresh waiters are 400 apart: no pairing.
        assert!(queue.pair_ready(now).is_empty());

        // Thirty seconds later both windows reach 400.
        let later = now + Duration::seconds(30);
        let pairs = queue.pair_ready(later);
        assert_eq!(pairs.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn both_windows_must_cover_the_gap() {
        let now = Utc::now();
        let mut queue = MatchQueue::new();
        // `a` has waited long enough, `b` just arrived.
        queue.join(waiter("a", 1000, now - Duration::seconds(60)));
        queue.join(waiter("b", 1300, now));
        assert!(queue.pair_ready(now).is_empty());
    }

    #[test]
    fn pairing_is_deterministic() {
        let now = Utc::now();
        let build = || {
            let mut q = MatchQueue::new();
            q.join(waiter("p1", 1200, now - Duration::seconds(10)));
            q.join(waiter("p2", 1210, now - Duration::seconds(9)));
            q.join(waiter("p3", 1195, now - Duration::seconds(8)));
            q.join(waiter("p4", 1290, now - Duration::seconds(7)));
            q
        };
        let pairs_a: Vec<_> = build()
            .pair_ready(now)
            .into_iter()
            .map(|(x, y)| (x.user_id, y.user_id))
            .collect();
        let pairs_b: Vec<_> = build()
            .pair_ready(now)
            .into_iter()
            .map(|(x, y)| (x.user_id, y.user_id))
            .collect();
        assert_eq!(pairs_a, pairs_b);
    }

    #[test]
    fn rejoin_replaces_previous_entry() {
        let now = Utc::now();
        let mut queue = MatchQueue::new();
        queue.join(waiter("a", 1000, now - Duration::seconds(45)));
        assert!(queue.join(waiter("a", 1000, now)));
        assert_eq!(queue.len(), 1);

        // The wait clock restarted, so a 150-gap opponent is out of range.
        queue.join(waiter("b", 1150, now));
        assert!(queue.pair_ready(now).is_empty());
    }
}
