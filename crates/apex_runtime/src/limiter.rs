//! Sliding-window rate limiter.
//!
//! Each source gets its own window of admission timestamps. A call is
//! admitted only while fewer than the configured budget fall inside the last
//! second; a rejected call leaves the window untouched. An admission is
//! evicted once it is more than 1000ms old, so it still counts at exactly
//! 1000ms.

use apex_core::{RateLimitConfig, SharedClock, SourceId, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Width of the admission window
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

const WINDOW_MS: u64 = 1_000;

#[derive(Debug, Default)]
struct SlidingWindow {
    admitted: VecDeque<Timestamp>,
}

impl SlidingWindow {
    fn evict(&mut self, now: Timestamp) {
        while let Some(oldest) = self.admitted.front() {
            if now.millis_since(*oldest) > WINDOW_MS {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Timestamp, max: usize) -> bool {
        self.evict(now);
        if self.admitted.len() < max {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    fn remaining(&mut self, now: Timestamp, max: usize) -> usize {
        self.evict(now);
        max.saturating_sub(self.admitted.len())
    }

    fn reset_in(&mut self, now: Timestamp) -> Duration {
        self.evict(now);
        self.admitted.front().map_or(Duration::ZERO, |oldest| {
            Duration::from_millis((WINDOW_MS + 1).saturating_sub(now.millis_since(*oldest)))
        })
    }
}

/// Per-source call budget
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<SourceId, Arc<Mutex<SlidingWindow>>>,
    max_per_window: usize,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            windows: DashMap::new(),
            max_per_window: config.max_requests_per_second as usize,
            clock,
        }
    }

    /// Try to spend one call for a source
    ///
    /// Returns `false` without recording anything if the budget is spent.
    pub fn acquire(&self, id: &SourceId) -> bool {
        let now = self.clock.now();
        self.window(id).lock().try_admit(now, self.max_per_window)
    }

    /// Calls left in the current window
    #[must_use]
    pub fn remaining(&self, id: &str) -> usize {
        let Some(window) = self.windows.get(id).map(|entry| Arc::clone(entry.value())) else {
            return self.max_per_window;
        };
        let now = self.clock.now();
        window.lock().remaining(now, self.max_per_window)
    }

    /// Time until the oldest admission leaves the window
    #[must_use]
    pub fn reset_in(&self, id: &str) -> Duration {
        let Some(window) = self.windows.get(id).map(|entry| Arc::clone(entry.value())) else {
            return Duration::ZERO;
        };
        let now = self.clock.now();
        window.lock().reset_in(now)
    }

    /// Forget a source's window
    pub fn reset(&self, id: &str) {
        self.windows.remove(id);
    }

    /// Forget every window
    pub fn reset_all(&self) {
        self.windows.clear();
    }

    fn window(&self, id: &SourceId) -> Arc<Mutex<SlidingWindow>> {
        if let Some(entry) = self.windows.get(id.as_str()) {
            return Arc::clone(entry.value());
        }
        let entry = self.windows.entry(id.clone()).or_default();
        Arc::clone(entry.value())
    }
}
