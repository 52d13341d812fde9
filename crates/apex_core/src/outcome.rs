//! Attempt records and the per-call execution result.

use crate::id::{RequestId, SourceId};
use crate::source::{NoBidReason, ResultTag, SourceResult};
use serde::{Deserialize, Serialize};

/// No-fill message for an empty waterfall
pub const NO_SOURCES_CONFIGURED: &str = "No sources configured";

/// No-fill message when every weighted source is disabled
pub const ALL_SOURCES_DISABLED: &str = "All sources disabled";

/// No-fill message when every weighted tier is exhausted
pub const ALL_SOURCES_EXHAUSTED: &str = "All sources exhausted";

/// No-fill message when the caller cancelled before any fill
pub const DISPATCH_CANCELLED: &str = "Dispatch cancelled";

/// No-fill message when a weighted call carries an unusable configuration
pub const INVALID_WEIGHTED_CONFIG: &str = "Invalid weighted configuration";

/// No-fill message when the waterfall tried `count` sources without a fill
#[must_use]
pub fn sources_exhausted_message(count: usize) -> String {
    format!("All {} sources exhausted", count)
}

/// Outcome of one source invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Source that was attempted
    pub source_id: SourceId,
    /// Its priority tier
    pub priority: u32,
    /// Wall time spent on the attempt
    pub duration_ms: u64,
    /// Outcome tag
    pub result_tag: ResultTag,
    /// Why it did not win, if it did not
    pub reason: Option<NoBidReason>,
    /// Winning bid in micros (fills only)
    pub bid_micros: u64,
}

impl AttemptRecord {
    /// Create a new attempt record
    #[must_use]
    pub fn new(source_id: SourceId, priority: u32, duration_ms: u64, result_tag: ResultTag) -> Self {
        Self {
            source_id,
            priority,
            duration_ms,
            result_tag,
            reason: None,
            bid_micros: 0,
        }
    }

    /// Record for a source that was never invoked
    #[must_use]
    pub fn skipped(source_id: SourceId, priority: u32, reason: NoBidReason) -> Self {
        Self::new(source_id, priority, 0, ResultTag::Skipped).with_reason(reason)
    }

    /// Set the no-bid reason
    #[must_use]
    pub fn with_reason(mut self, reason: NoBidReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Set the bid
    #[must_use]
    pub fn with_bid_micros(mut self, bid_micros: u64) -> Self {
        self.bid_micros = bid_micros;
        self
    }

    /// Whether the loader actually ran
    #[must_use]
    pub fn was_invoked(&self) -> bool {
        self.result_tag != ResultTag::Skipped
    }
}

/// Result of one dispatch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Correlation id of the call
    pub request_id: RequestId,
    /// The winning result, or the final no-fill
    pub result: SourceResult,
    /// Winner id, `none` when nothing was attempted
    pub winning_source_id: SourceId,
    /// Number of attempt records
    pub attempts_count: usize,
    /// Wall time of the whole call
    pub total_duration_ms: u64,
    /// Attempts in the order they resolved
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionResult {
    /// Build a result from its attempt log
    #[must_use]
    pub fn from_attempts(
        request_id: RequestId,
        result: SourceResult,
        winning_source_id: SourceId,
        attempts: Vec<AttemptRecord>,
        total_duration_ms: u64,
    ) -> Self {
        Self {
            request_id,
            result,
            winning_source_id,
            attempts_count: attempts.len(),
            total_duration_ms,
            attempts,
        }
    }

    /// A no-fill with no attempts at all
    #[must_use]
    pub fn empty(request_id: RequestId, message: &str) -> Self {
        Self::from_attempts(
            request_id,
            SourceResult::no_fill(message),
            SourceId::none(),
            Vec::new(),
            0,
        )
    }

    /// Whether a source filled
    #[must_use]
    pub const fn is_fill(&self) -> bool {
        self.result.is_success()
    }

    /// The winner, if any source filled
    #[must_use]
    pub fn winner(&self) -> Option<&SourceId> {
        self.is_fill().then_some(&self.winning_source_id)
    }

    /// Ids of attempted sources in order
    #[must_use]
    pub fn attempted_ids(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.source_id.as_str()).collect()
    }
}
