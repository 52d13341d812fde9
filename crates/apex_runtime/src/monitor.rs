//! Dispatch monitor for process-local metrics.
//!
//! Aggregates every [`ExecutionResult`] the dispatcher returns and keeps a
//! bounded history of recent calls for debugging.

use apex_core::{
    ExecutionResult, NoBidReason, RequestId, ResultTag, SourceId, DISPATCH_CANCELLED,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which scheduler served a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Sequential waterfall
    Waterfall,
    /// Priority-weighted tiers
    Weighted,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waterfall => f.write_str("waterfall"),
            Self::Weighted => f.write_str("weighted"),
        }
    }
}

/// Snapshot of dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    /// Dispatch calls
    pub calls: u64,
    /// Calls that returned a fill
    pub fills: u64,
    /// Calls that ended without a fill
    pub exhausted: u64,
    /// Calls ended by the caller's cancellation
    pub cancelled: u64,
    /// Loader invocations
    pub attempts: u64,
    /// Attempts skipped by an open circuit
    pub skipped_circuit_open: u64,
    /// Attempts skipped by the rate limiter
    pub skipped_rate_limited: u64,
    /// Fills discarded for being under the floor
    pub below_floor: u64,
    /// Attempts that timed out
    pub timeouts: u64,
    /// Attempts that faulted
    pub errors: u64,
    /// Sum of call durations
    pub total_duration_ms: u64,
}

impl DispatchMetrics {
    /// Share of calls that filled (0.0 - 1.0)
    #[must_use]
    pub fn fill_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.fills as f64 / self.calls as f64
    }

    /// Mean call duration
    #[must_use]
    pub fn average_duration_ms(&self) -> u64 {
        if self.calls == 0 {
            return 0;
        }
        self.total_duration_ms / self.calls
    }
}

/// One entry of the recent-call history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Call id
    pub request_id: RequestId,
    /// Scheduler used
    pub mode: DispatchMode,
    /// Winner, or `none`
    pub winning_source_id: SourceId,
    /// Attempt records produced
    pub attempts: usize,
    /// Call duration
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    fills: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
    attempts: AtomicU64,
    skipped_circuit_open: AtomicU64,
    skipped_rate_limited: AtomicU64,
    below_floor: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    total_duration_ms: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Dispatch monitor
#[derive(Debug)]
pub struct DispatchMonitor {
    counters: Counters,
    history: Mutex<VecDeque<DispatchSummary>>,
    max_history: usize,
}

impl DispatchMonitor {
    /// Create a monitor keeping `max_history` recent calls
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            counters: Counters::default(),
            history: Mutex::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
        }
    }

    /// Fold one finished call into the counters
    pub fn record(&self, mode: DispatchMode, result: &ExecutionResult) {
        let c = &self.counters;
        bump(&c.calls, 1);
        bump(&c.total_duration_ms, result.total_duration_ms);
        if result.is_fill() {
            bump(&c.fills, 1);
        } else if result.result.message() == Some(DISPATCH_CANCELLED) {
            bump(&c.cancelled, 1);
        } else {
            bump(&c.exhausted, 1);
        }

        for attempt in &result.attempts {
            if attempt.was_invoked() {
                bump(&c.attempts, 1);
            }
            match (attempt.result_tag, attempt.reason) {
                (ResultTag::Skipped, Some(NoBidReason::CircuitOpen)) => {
                    bump(&c.skipped_circuit_open, 1);
                }
                (ResultTag::Skipped, Some(NoBidReason::RateLimited)) => {
                    bump(&c.skipped_rate_limited, 1);
                }
                (_, Some(NoBidReason::BelowFloor)) => bump(&c.below_floor, 1),
                (ResultTag::Timeout, _) => bump(&c.timeouts, 1),
                (ResultTag::Error, _) => bump(&c.errors, 1),
                _ => {}
            }
        }

        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(DispatchSummary {
            request_id: result.request_id,
            mode,
            winning_source_id: result.winning_source_id.clone(),
            attempts: result.attempts_count,
            duration_ms: result.total_duration_ms,
        });
    }

    /// Current counters
    #[must_use]
    pub fn snapshot(&self) -> DispatchMetrics {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatchMetrics {
            calls: load(&c.calls),
            fills: load(&c.fills),
            exhausted: load(&c.exhausted),
            cancelled: load(&c.cancelled),
            attempts: load(&c.attempts),
            skipped_circuit_open: load(&c.skipped_circuit_open),
            skipped_rate_limited: load(&c.skipped_rate_limited),
            below_floor: load(&c.below_floor),
            timeouts: load(&c.timeouts),
            errors: load(&c.errors),
            total_duration_ms: load(&c.total_duration_ms),
        }
    }

    /// Recent calls, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<DispatchSummary> {
        self.history.lock().iter().cloned().collect()
    }

    /// Zero every counter and drop the history
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.calls,
            &c.fills,
            &c.exhausted,
            &c.cancelled,
            &c.attempts,
            &c.skipped_circuit_open,
            &c.skipped_rate_limited,
            &c.below_floor,
            &c.timeouts,
            &c.errors,
            &c.total_duration_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.history.lock().clear();
    }
}

impl Default for DispatchMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}
