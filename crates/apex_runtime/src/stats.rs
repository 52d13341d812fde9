//! Per-source performance statistics.
//!
//! One [`SourceStats`] row per source id, shared across every dispatch call.
//! Rows live behind their own lock so recording for one source never waits
//! on another.

use apex_core::{AttemptRecord, ResultTag, SharedClock, SourceId, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Accumulated counters for one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Invocations (skipped attempts excluded)
    pub attempts: u64,
    /// Fills
    pub successes: u64,
    /// No-fills, including fills under the floor
    pub no_fills: u64,
    /// Adapter faults, panics and cancelled attempts
    pub errors: u64,
    /// Timeouts
    pub timeouts: u64,
    /// Attempts rejected by the breaker or limiter
    pub skipped: u64,
    /// Sum of fill latencies
    pub total_latency_ms: u64,
    /// Sum of winning bids in micros
    pub total_bid_micros: u64,
    /// When the source last filled
    pub last_success_at: Option<Timestamp>,
}

impl SourceStats {
    /// Successes over attempts, zero before the first attempt
    #[must_use]
    pub fn fill_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    /// Mean latency of fills in milliseconds
    #[must_use]
    pub fn average_latency_ms(&self) -> u64 {
        if self.successes == 0 {
            return 0;
        }
        self.total_latency_ms / self.successes
    }

    /// Mean winning bid in currency units
    #[must_use]
    pub fn average_bid(&self) -> f64 {
        if self.successes == 0 {
            return 0.0;
        }
        self.total_bid_micros as f64 / (self.successes as f64 * 1_000_000.0)
    }

    /// Faults (errors plus timeouts) over attempts
    #[must_use]
    pub fn fault_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.errors + self.timeouts) as f64 / self.attempts as f64
    }

    fn apply(&mut self, record: &AttemptRecord, now: Timestamp) {
        if record.result_tag == ResultTag::Skipped {
            self.skipped += 1;
            return;
        }

        self.attempts += 1;
        match record.result_tag {
            ResultTag::Success => {
                self.successes += 1;
                self.total_latency_ms = self.total_latency_ms.saturating_add(record.duration_ms);
                self.total_bid_micros = self.total_bid_micros.saturating_add(record.bid_micros);
                self.last_success_at = Some(now);
            }
            ResultTag::NoFill => self.no_fills += 1,
            ResultTag::Error => self.errors += 1,
            ResultTag::Timeout => self.timeouts += 1,
            ResultTag::Skipped => {}
        }
    }
}

/// Concurrent table of per-source statistics
#[derive(Debug)]
pub struct StatsTracker {
    table: DashMap<SourceId, Arc<Mutex<SourceStats>>>,
    clock: SharedClock,
}

impl StatsTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            table: DashMap::new(),
            clock,
        }
    }

    /// Fold one attempt into its source's row
    pub fn record(&self, record: &AttemptRecord) {
        let row = self.row(&record.source_id);
        let now = self.clock.now();
        row.lock().apply(record, now);
    }

    /// Snapshot of one source's row
    #[must_use]
    pub fn get(&self, id: &str) -> Option<SourceStats> {
        let row = self.table.get(id).map(|entry| Arc::clone(entry.value()))?;
        let stats = row.lock().clone();
        Some(stats)
    }

    /// Snapshot of every row
    #[must_use]
    pub fn all(&self) -> HashMap<SourceId, SourceStats> {
        let rows: Vec<_> = self
            .table
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        rows.into_iter()
            .map(|(id, row)| {
                let stats = row.lock().clone();
                (id, stats)
            })
            .collect()
    }

    /// Drop one source's row
    pub fn reset(&self, id: &str) {
        self.table.remove(id);
    }

    /// Drop every row
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Number of tracked sources
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if no source has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    // Clone the row handle out so the shard lock is released before locking the row.
    fn row(&self, id: &SourceId) -> Arc<Mutex<SourceStats>> {
        if let Some(entry) = self.table.get(id.as_str()) {
            return Arc::clone(entry.value());
        }
        let entry = self.table.entry(id.clone()).or_default();
        Arc::clone(entry.value())
    }
}
