//! One-time-use tracking for assertion IDs.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

/// Assertion IDs that have already been accepted, kept until the assertion
/// would have expired anyway.
#[derive(Debug, Default)]
pub struct ReplayCache {
    seen: DashMap<String, DateTime<Utc>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as used. Returns `false` if it was already recorded and
    /// has not yet expired.
    pub fn check_and_record(&self, id: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return false;
                }
                entry.insert(expires_at);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
                true
            }
        }
    }

    /// Drop entries whose assertions have expired. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
