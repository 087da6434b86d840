use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::session::SessionId;

/// Sliding window admission control, keyed by session id.
///
/// Unlike a fixed window that resets at calendar intervals, this tracks
/// individual admission timestamps and only counts those within the
/// trailing window. Entries older than the window are lazily discarded on
/// access; a periodic [`sweep`](Self::sweep) drops ids with no in-window
/// entries so memory stays bounded even without explicit resets.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    windows: HashMap<SessionId, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `capacity` frames per rolling `window`.
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            windows: HashMap::new(),
        }
    }

    fn expire_old_entries(window: Duration, entries: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit one frame for `id` if capacity remains in the trailing window.
    /// Admission records the timestamp; rejection records nothing.
    pub fn try_acquire(&mut self, id: SessionId) -> bool {
        let now = Instant::now();
        let entries = self.windows.entry(id).or_default();
        Self::expire_old_entries(self.window, entries, now);
        if entries.len() >= self.capacity as usize {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Drop all history for `id`. Called on disconnect.
    pub fn reset(&mut self, id: SessionId) {
        self.windows.remove(&id);
    }

    /// Discard ids whose every timestamp has aged out of the window.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.windows.retain(|_, entries| {
            Self::expire_old_entries(window, entries, now);
            !entries.is_empty()
        });
    }

    /// Number of ids currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
