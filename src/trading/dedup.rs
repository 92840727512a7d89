//! Time-bounded set of processed fill ids, and the exclusive poll watermark.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::models::Fill;

/// Remembers fill ids for a fixed TTL.
///
/// Expired entries are only removed once the set grows past the prune
/// threshold, so lookups and inserts stay O(1) in the common case.
#[derive(Debug)]
pub struct SeenFills {
    ttl: Duration,
    prune_threshold: usize,
    seen: HashMap<String, Instant>,
}

impl SeenFills {
    pub fn new(ttl: Duration, prune_threshold: usize) -> Self {
        Self {
            ttl,
            prune_threshold,
            seen: HashMap::new(),
        }
    }

    /// Record a fill id. Returns `false` if it was already seen within the TTL.
    pub fn insert(&mut self, fill_id: &str, now: Instant) -> bool {
        if let Some(at) = self.seen.get(fill_id) {
            if now.saturating_duration_since(*at) < self.ttl {
                return false;
            }
        }

        self.seen.insert(fill_id.to_string(), now);

        if self.seen.len() > self.prune_threshold {
            self.prune(now);
        }
        true
    }

    /// Drop every expired entry.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Exclusive watermark over polled fills.
///
/// Venues return fills at or after the requested time, so the newest fill of
/// one poll comes back on every later poll. The cursor remembers the ids seen
/// at its own timestamp and lets only strictly newer fills through.
#[derive(Debug)]
pub struct PollCursor {
    at: DateTime<Utc>,
    ids_at: HashSet<String>,
}

impl PollCursor {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            at: since,
            ids_at: HashSet::new(),
        }
    }

    /// Lower bound to request from the venue.
    pub fn since(&self) -> DateTime<Utc> {
        self.at
    }

    /// Drop fills already returned by an earlier poll, sort the rest by
    /// timestamp and advance the watermark past them.
    pub fn advance(&mut self, fills: Vec<Fill>) -> Vec<Fill> {
        let mut fresh: Vec<Fill> = fills
            .into_iter()
            .filter(|f| f.timestamp > self.at || (f.timestamp == self.at && !self.ids_at.contains(&f.id)))
            .collect();
        fresh.sort_by_key(|f| f.timestamp);

        if let Some(last) = fresh.last().map(|f| f.timestamp) {
            if last > self.at {
                self.at = last;
                self.ids_at.clear();
            }
            for fill in fresh.iter().filter(|f| f.timestamp == last) {
                self.ids_at.insert(fill.id.clone());
            }
        }

        fresh
    }
}
