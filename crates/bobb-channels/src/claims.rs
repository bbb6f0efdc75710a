//! Short-lived claims on in-flight events
//!
//! When several agents observe the same event, the first to claim its id wins
//! the right to escalate it; everyone else backs off. Claims expire after a
//! TTL so memory stays bounded.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(60);

pub struct ClaimSet {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl Default for ClaimSet {
    fn default() -> Self {
        Self::new(DEFAULT_CLAIM_TTL)
    }
}

impl ClaimSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Atomically claim `event_id`. Returns true for exactly one caller per
    /// live claim.
    pub fn try_claim(&self, event_id: &str) -> bool {
        self.prune();
        let now = Instant::now();
        match self.entries.entry(event_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) >= self.ttl {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    pub fn is_claimed(&self, event_id: &str) -> bool {
        self.entries
            .get(event_id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Drop expired claims
    pub fn prune(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, at| at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
