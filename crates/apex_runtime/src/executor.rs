//! Guarded source attempts.
//!
//! Every source call made by either scheduler goes through
//! [`AttemptExecutor::run`]: rate limiter first, then the source's circuit
//! breaker, then the loader raced against its timeout and the caller's
//! cancellation. The result is always an [`AttemptRecord`], never an error.

use crate::breaker::{BreakerRegistry, CallVerdict};
use crate::limiter::RateLimiter;
use crate::stats::StatsTracker;
use apex_core::{
    AttemptRecord, CancellationToken, NoBidReason, SharedClock, SharedLoader, Source,
    SourceResult,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What one attempt produced
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// The logged record
    pub record: AttemptRecord,
    /// The (possibly rewritten) source result
    pub result: SourceResult,
    /// The caller's cancellation ended this attempt
    pub cancelled: bool,
}

impl Attempt {
    /// Whether the attempt filled
    #[must_use]
    pub const fn is_fill(&self) -> bool {
        self.result.is_success()
    }
}

#[derive(Debug)]
enum LoadOutcome {
    Finished(SourceResult),
    Panicked(String),
    TimedOut,
    Cancelled,
}

impl LoadOutcome {
    fn verdict(&self) -> CallVerdict {
        match self {
            Self::Finished(result) if result.is_fault() => CallVerdict::Failure,
            Self::Finished(_) => CallVerdict::Success,
            Self::Panicked(_) | Self::TimedOut => CallVerdict::Failure,
            Self::Cancelled => CallVerdict::Ignore,
        }
    }
}

/// Runs single source attempts behind the shared guards
#[derive(Debug, Clone)]
pub struct AttemptExecutor {
    stats: Arc<StatsTracker>,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    clock: SharedClock,
}

impl AttemptExecutor {
    /// Create an executor over shared guard state
    #[must_use]
    pub fn new(
        stats: Arc<StatsTracker>,
        breakers: Arc<BreakerRegistry>,
        limiter: Arc<RateLimiter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            stats,
            breakers,
            limiter,
            clock,
        }
    }

    /// Shared statistics
    #[must_use]
    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    /// Clock used for attempt durations
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Attempt one source
    ///
    /// The loader gets a child of `call_cancel` that is cancelled as soon as
    /// the attempt ends, whichever way it ends.
    pub async fn run(
        &self,
        source: &Source,
        timeout: Duration,
        enforce_floor: bool,
        call_cancel: &CancellationToken,
    ) -> Attempt {
        let id = source.id();
        if !self.limiter.acquire(id) {
            warn!(source = %id, "rate limited, skipping");
            return self.skip(source, NoBidReason::RateLimited);
        }

        let breaker = self.breakers.get_or_create(id);
        let started = self.clock.now();
        let outcome = match breaker
            .execute(
                || timed_load(source.loader(), timeout, call_cancel),
                LoadOutcome::verdict,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(source = %id, retry_in_ms = err.retry_in_ms, "circuit open, skipping");
                return self.skip(source, NoBidReason::CircuitOpen);
            }
        };
        let duration_ms = self.clock.now().millis_since(started);

        let (result, reason, cancelled) = match outcome {
            LoadOutcome::Finished(SourceResult::Success { bid_value, .. })
                if enforce_floor && !source.clears_floor(bid_value) =>
            {
                debug!(source = %id, bid_value, min_bid = source.min_bid(), "bid under floor");
                (
                    SourceResult::no_fill(NoBidReason::BelowFloor.as_str()),
                    Some(NoBidReason::BelowFloor),
                    false,
                )
            }
            LoadOutcome::Finished(result) => {
                let reason = match &result {
                    SourceResult::Success { .. } => None,
                    SourceResult::NoFill { .. } => Some(NoBidReason::NoFill),
                    SourceResult::Error { .. } => Some(NoBidReason::Error),
                    SourceResult::Timeout => Some(NoBidReason::Timeout),
                };
                (result, reason, false)
            }
            LoadOutcome::Panicked(message) => {
                warn!(source = %id, %message, "loader panicked");
                (
                    SourceResult::error(format!("loader panicked: {message}")),
                    Some(NoBidReason::Error),
                    false,
                )
            }
            LoadOutcome::TimedOut => (SourceResult::Timeout, Some(NoBidReason::Timeout), false),
            LoadOutcome::Cancelled => (
                SourceResult::error(NoBidReason::Cancelled.as_str()),
                Some(NoBidReason::Cancelled),
                true,
            ),
        };

        let mut record = AttemptRecord::new(id.clone(), source.priority(), duration_ms, result.tag())
            .with_bid_micros(result.bid_micros());
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        self.stats.record(&record);
        debug!(
            source = %id,
            priority = source.priority(),
            duration_ms,
            result = %record.result_tag,
            "attempt finished"
        );

        Attempt {
            record,
            result,
            cancelled,
        }
    }

    fn skip(&self, source: &Source, reason: NoBidReason) -> Attempt {
        let record = AttemptRecord::skipped(source.id().clone(), source.priority(), reason);
        self.stats.record(&record);
        Attempt {
            record,
            result: SourceResult::no_fill(reason.as_str()),
            cancelled: false,
        }
    }
}

async fn timed_load(
    loader: &SharedLoader,
    timeout: Duration,
    call_cancel: &CancellationToken,
) -> LoadOutcome {
    let attempt_cancel = call_cancel.child_token();
    let _cancel_on_exit = attempt_cancel.clone().drop_guard();
    let load = AssertUnwindSafe(loader.load(attempt_cancel)).catch_unwind();

    // Caller cancellation outranks a loader that returns because of it.
    tokio::select! {
        biased;
        () = call_cancel.cancelled() => LoadOutcome::Cancelled,
        outcome = load => match outcome {
            Ok(result) => LoadOutcome::Finished(result),
            Err(panic) => LoadOutcome::Panicked(panic_message(panic.as_ref())),
        },
        () = tokio::time::sleep(timeout) => LoadOutcome::TimedOut,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
