//! Sequential waterfall scheduler.
//!
//! Sources are tried one at a time in ascending priority, ties kept in input
//! order. The first fill ends the call; anything else falls through to the
//! next source.

use crate::executor::AttemptExecutor;
use apex_core::{
    sources_exhausted_message, CancellationToken, ExecutionResult, RequestId, Source,
    SourceId, SourceResult, DISPATCH_CANCELLED, NO_SOURCES_CONFIGURED,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Strict priority-order executor
#[derive(Debug, Clone)]
pub struct WaterfallScheduler {
    executor: AttemptExecutor,
    enforce_floor: bool,
}

impl WaterfallScheduler {
    /// Create a scheduler over a guarded executor
    #[must_use]
    pub fn new(executor: AttemptExecutor, enforce_floor: bool) -> Self {
        Self {
            executor,
            enforce_floor,
        }
    }

    /// Enabled sources in attempt order
    ///
    /// Keyed by `(priority, input position)` so equal priorities keep the
    /// caller's order.
    #[must_use]
    pub fn order(sources: &[Source]) -> Vec<&Source> {
        let ready: BTreeMap<(u32, usize), &Source> = sources
            .iter()
            .enumerate()
            .filter(|(_, source)| source.is_enabled())
            .map(|(position, source)| ((source.priority(), position), source))
            .collect();
        ready.into_values().collect()
    }

    /// Run one waterfall
    ///
    /// On exhaustion the winner id is the last source attempted; with
    /// nothing to attempt it is `none`.
    pub async fn execute(
        &self,
        request_id: RequestId,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let ordered = Self::order(sources);
        if ordered.is_empty() {
            debug!("no enabled sources");
            return ExecutionResult::empty(request_id, NO_SOURCES_CONFIGURED);
        }

        let clock = self.executor.clock();
        let started = clock.now();
        let mut attempts = Vec::with_capacity(ordered.len());
        let mut last_attempted = SourceId::none();

        for source in ordered {
            if cancel.is_cancelled() {
                break;
            }

            let attempt = self
                .executor
                .run(source, source.timeout(), self.enforce_floor, cancel)
                .await;
            attempts.push(attempt.record);
            last_attempted = source.id().clone();

            if attempt.result.is_success() {
                info!(winner = %source.id(), attempts = attempts.len(), "waterfall filled");
                let total = clock.now().millis_since(started);
                return ExecutionResult::from_attempts(
                    request_id,
                    attempt.result,
                    last_attempted,
                    attempts,
                    total,
                );
            }
            if attempt.cancelled {
                break;
            }
        }

        let total = clock.now().millis_since(started);
        let result = if cancel.is_cancelled() {
            info!(attempts = attempts.len(), "waterfall cancelled");
            SourceResult::no_fill(DISPATCH_CANCELLED)
        } else {
            info!(attempts = attempts.len(), "waterfall exhausted");
            SourceResult::no_fill(sources_exhausted_message(attempts.len()))
        };
        ExecutionResult::from_attempts(request_id, result, last_attempted, attempts, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{executor, fill, source, CallLog};
    use apex_core::{loader_fn, DispatcherConfig, NoBidReason, ResultTag, SourceSpec};
    use std::time::Duration;

    fn scheduler() -> WaterfallScheduler {
        WaterfallScheduler::new(executor(&DispatcherConfig::default()), true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_and_first_fill_wins() {
        let log = CallLog::default();
        let sources = vec![
            source("A", 10, log.loader("A", Duration::ZERO, fill(3.0))),
            source("B", 1, log.loader("B", Duration::ZERO, SourceResult::no_fill("empty"))),
            source("C", 5, log.loader("C", Duration::ZERO, fill(1.0))),
        ];

        let result = scheduler()
            .execute(RequestId::new(), &sources, &CancellationToken::new())
            .await;

        assert_eq!(log.calls(), vec!["B", "C"]);
        assert_eq!(result.winning_source_id.as_str(), "C");
        assert_eq!(result.attempts_count, 2);
        assert_eq!(result.attempts[0].reason, Some(NoBidReason::NoFill));
        assert!(result.is_fill());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input() {
        let result = scheduler()
            .execute(RequestId::new(), &[], &CancellationToken::new())
            .await;
        assert_eq!(result.result, SourceResult::no_fill("No sources configured"));
        assert_eq!(result.attempts_count, 0);
        assert_eq!(result.winning_source_id.as_str(), "none");
        assert_eq!(result.total_duration_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_names_count_and_last_source() {
        let log = CallLog::default();
        let sources = vec![
            source("a", 0, log.loader("a", Duration::ZERO, SourceResult::no_fill("x"))),
            source("b", 1, log.loader("b", Duration::ZERO, SourceResult::error("down"))),
            source("c", 2, log.loader("c", Duration::ZERO, SourceResult::Timeout)),
        ];

        let result = scheduler()
            .execute(RequestId::new(), &sources, &CancellationToken::new())
            .await;

        assert_eq!(result.result, SourceResult::no_fill("All 3 sources exhausted"));
        assert_eq!(result.attempts_count, 3);
        assert_eq!(result.winning_source_id.as_str(), "c");
        assert_eq!(
            result.attempts.iter().map(|a| a.result_tag).collect::<Vec<_>>(),
            vec![ResultTag::NoFill, ResultTag::Error, ResultTag::Timeout]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priorities_keep_input_order() {
        let log = CallLog::default();
        let sources: Vec<_> = ["x", "y", "z"]
            .iter()
            .map(|id| source(id, 3, log.loader(id, Duration::ZERO, SourceResult::no_fill("-"))))
            .collect();

        scheduler()
            .execute(RequestId::new(), &sources, &CancellationToken::new())
            .await;
        assert_eq!(log.calls(), vec!["x", "y", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_through() {
        let log = CallLog::default();
        let slow = SourceSpec::new("slow")
            .with_timeout(Duration::from_millis(150))
            .into_source(log.hanging("slow"))
            .unwrap();
        let backup = source("backup", 1, log.loader("backup", Duration::from_millis(20), fill(0.5)));

        let result = scheduler()
            .execute(RequestId::new(), &[slow, backup], &CancellationToken::new())
            .await;

        assert_eq!(result.winning_source_id.as_str(), "backup");
        assert_eq!(result.attempts[0].result_tag, ResultTag::Timeout);
        assert_eq!(result.attempts[0].duration_ms, 150);
        assert_eq!(result.total_duration_ms, 170);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_sources_are_not_attempted() {
        let log = CallLog::default();
        let off = SourceSpec::new("off")
            .with_enabled(false)
            .into_source(log.loader("off", Duration::ZERO, fill(9.0)))
            .unwrap();
        let on = source("on", 5, log.loader("on", Duration::ZERO, fill(1.0)));

        let result = scheduler()
            .execute(RequestId::new(), &[off, on], &CancellationToken::new())
            .await;
        assert_eq!(log.calls(), vec!["on"]);
        assert_eq!(result.attempts_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_disabled_is_empty() {
        let off = SourceSpec::new("off")
            .with_enabled(false)
            .into_source(loader_fn(|_| async { SourceResult::Timeout }))
            .unwrap();
        let result = scheduler()
            .execute(RequestId::new(), &[off], &CancellationToken::new())
            .await;
        assert_eq!(result.winning_source_id.as_str(), "none");
        assert_eq!(result.attempts_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_iteration() {
        let log = CallLog::default();
        let sources = vec![
            source("first", 0, log.hanging("first")),
            source("second", 1, log.loader("second", Duration::ZERO, fill(1.0))),
        ];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = scheduler().execute(RequestId::new(), &sources, &cancel).await;

        assert_eq!(log.calls(), vec!["first"]);
        assert_eq!(result.result, SourceResult::no_fill("Dispatch cancelled"));
        assert_eq!(result.attempts_count, 1);
        assert_eq!(result.attempts[0].result_tag, ResultTag::Error);
        assert_eq!(result.attempts[0].reason, Some(NoBidReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_attempts_nothing() {
        let log = CallLog::default();
        let sources = vec![source("a", 0, log.loader("a", Duration::ZERO, fill(1.0)))];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scheduler().execute(RequestId::new(), &sources, &cancel).await;
        assert!(log.calls().is_empty());
        assert_eq!(result.attempts_count, 0);
        assert_eq!(result.winning_source_id.as_str(), "none");
    }

    proptest::proptest! {
        #[test]
        fn prop_order_is_sorted_and_stable(priorities in proptest::collection::vec(0i64..5, 0..40)) {
            let sources: Vec<Source> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let id = format!("s{i}");
                    source(&id, *p, loader_fn(|_| async { SourceResult::no_fill("-") }))
                })
                .collect();

            let ordered = WaterfallScheduler::order(&sources);
            proptest::prop_assert_eq!(ordered.len(), sources.len());
            for pair in ordered.windows(2) {
                proptest::prop_assert!(pair[0].priority() <= pair[1].priority());
                if pair[0].priority() == pair[1].priority() {
                    let a: usize = pair[0].id().as_str()[1..].parse().unwrap();
                    let b: usize = pair[1].id().as_str()[1..].parse().unwrap();
                    proptest::prop_assert!(a < b);
                }
            }
        }
    }
}
