//! Short-lived fingerprint cache for duplicate suppression.
//!
//! Maps a dedup key to the instant its window closes. Expired entries are
//! purged lazily on lookup and by a sweep that runs from `admit` at most
//! once per window, so memory stays bounded without a background task.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest window kept. Longer windows are clamped so expiries stay
/// representable as an `Instant`.
pub const MAX_WINDOW: Duration = Duration::from_secs(30 * 365 * 86_400);

struct Entries {
    expiry: HashMap<String, Instant>,
    last_sweep: Instant,
}

pub struct DedupIndex {
    window: Duration,
    entries: Mutex<Entries>,
}

impl DedupIndex {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.min(MAX_WINDOW),
            entries: Mutex::new(Entries {
                expiry: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// True if `key` wasn't seen within the active window, in which case it is
    /// recorded with a fresh expiry. A rejected key keeps its original expiry.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// [`admit`](Self::admit) against an explicit clock reading.
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.lock();

        if now.saturating_duration_since(entries.last_sweep) >= self.window {
            Self::sweep(&mut entries, now);
        }

        match entries.expiry.get(key) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                entries.expiry.insert(key.to_string(), now + self.window);
                true
            }
        }
    }

    /// Whether `key` is active at `now`.
    pub fn contains_at(&self, key: &str, now: Instant) -> bool {
        self.lock().expiry.get(key).is_some_and(|t| *t > now)
    }

    /// Drop `key` so the next admission of it succeeds.
    pub fn forget(&self, key: &str) {
        self.lock().expiry.remove(key);
    }

    /// Purge expired entries. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        Self::sweep(&mut entries, now)
    }

    /// Number of recorded keys, expired or not.
    pub fn len(&self) -> usize {
        self.lock().expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(entries: &mut Entries, now: Instant) -> usize {
        let before = entries.expiry.len();
        entries.expiry.retain(|_, expires_at| *expires_at > now);
        entries.last_sweep = now;
        before - entries.expiry.len()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
