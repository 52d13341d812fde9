//! Priority-weighted scheduler.
//!
//! Sources are grouped into priority tiers, tried lowest priority value
//! first. Inside a tier each attempt is a weighted random draw without
//! replacement, where weights and timeouts adapt to recorded statistics.
//!
//! With parallel preload, up to `lookahead` tiers run at once, but tier
//! outcomes are consumed strictly in priority order: a fill from a lower tier
//! is only surfaced once every higher tier has come up empty.

use crate::executor::AttemptExecutor;
use crate::stats::SourceStats;
use apex_core::{
    AttemptRecord, CancellationToken, ExecutionResult, PriorityWeightedConfig, RequestId,
    Source, SourceId, SourceResult, ALL_SOURCES_DISABLED, ALL_SOURCES_EXHAUSTED,
    DISPATCH_CANCELLED,
};
use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Lower bound for adapted timeouts
pub const MIN_ADAPTIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// A chronically failing source keeps at least this share of its weight
pub const MIN_WEIGHT_FACTOR: f64 = 0.1;

/// Selection weight after performance adjustment
///
/// Sources with fewer than `min_sample_size` attempts keep their base weight.
#[must_use]
pub fn effective_weight(
    base: f64,
    stats: Option<&SourceStats>,
    config: &PriorityWeightedConfig,
) -> f64 {
    match stats {
        Some(stats)
            if config.use_performance_weighting && stats.attempts >= config.min_sample_size =>
        {
            (base * (0.5 + stats.fill_rate())).max(base * MIN_WEIGHT_FACTOR)
        }
        _ => base,
    }
}

/// Timeout after latency adaptation
///
/// Twice the mean fill latency, at least one second, never above the
/// configured timeout.
#[must_use]
pub fn effective_timeout(
    configured: Duration,
    stats: Option<&SourceStats>,
    config: &PriorityWeightedConfig,
) -> Duration {
    match stats {
        Some(stats)
            if config.adaptive_timeouts_enabled && stats.successes >= config.min_sample_size =>
        {
            let observed = Duration::from_millis(stats.average_latency_ms().saturating_mul(2));
            observed.max(MIN_ADAPTIVE_TIMEOUT).min(configured)
        }
        _ => configured,
    }
}

/// Pick an index by cumulative weight
///
/// `draw` is expected in `[0, sum(weights))`; anything past the end picks the
/// last index.
#[must_use]
pub fn select_index(weights: &[f64], draw: f64) -> usize {
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if draw < cumulative {
            return index;
        }
    }
    weights.len().saturating_sub(1)
}

/// Enabled sources by tier, input order kept inside a tier
#[must_use]
pub fn group_by_priority(sources: &[Source]) -> BTreeMap<u32, Vec<&Source>> {
    let mut tiers: BTreeMap<u32, Vec<&Source>> = BTreeMap::new();
    for source in sources.iter().filter(|source| source.is_enabled()) {
        tiers.entry(source.priority()).or_default().push(source);
    }
    tiers
}

struct TierOutcome<'a> {
    winner: Option<(&'a Source, SourceResult)>,
    cancelled: bool,
}

/// Tiered, performance-weighted executor
#[derive(Debug)]
pub struct PriorityWeightedScheduler {
    executor: AttemptExecutor,
    rng: Mutex<StdRng>,
}

impl PriorityWeightedScheduler {
    /// Create a scheduler; a fixed seed makes selection reproducible
    #[must_use]
    pub fn new(executor: AttemptExecutor, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            executor,
            rng: Mutex::new(rng),
        }
    }

    /// Run one weighted dispatch
    pub async fn execute(
        &self,
        request_id: RequestId,
        sources: &[Source],
        config: &PriorityWeightedConfig,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let tiers = group_by_priority(sources);
        if tiers.is_empty() {
            debug!("no enabled sources");
            return ExecutionResult::empty(request_id, ALL_SOURCES_DISABLED);
        }

        let clock = self.executor.clock();
        let started = clock.now();
        let log = Mutex::new(Vec::new());
        let mut pending = tiers.into_iter();
        let mut running = FuturesOrdered::new();
        for (priority, tier) in pending.by_ref().take(config.lookahead()) {
            running.push_back(self.run_tier(priority, tier, config, cancel, &log));
        }

        let mut outcome = None;
        while let Some(tier) = running.next().await {
            if let Some(winner) = tier.winner {
                outcome = Some(winner);
                break;
            }
            if tier.cancelled || cancel.is_cancelled() {
                break;
            }
            if let Some((priority, next)) = pending.next() {
                running.push_back(self.run_tier(priority, next, config, cancel, &log));
            }
        }
        // Tiers still in flight are superseded; dropping them cancels their loaders.
        drop(running);

        let attempts = log.into_inner();
        let total = clock.now().millis_since(started);
        match outcome {
            Some((source, result)) => {
                info!(winner = %source.id(), priority = source.priority(), "weighted dispatch filled");
                ExecutionResult::from_attempts(
                    request_id,
                    result,
                    source.id().clone(),
                    attempts,
                    total,
                )
            }
            None => {
                let message = if cancel.is_cancelled() {
                    DISPATCH_CANCELLED
                } else {
                    ALL_SOURCES_EXHAUSTED
                };
                info!(attempts = attempts.len(), reason = message, "weighted dispatch without fill");
                ExecutionResult::from_attempts(
                    request_id,
                    SourceResult::no_fill(message),
                    SourceId::none(),
                    attempts,
                    total,
                )
            }
        }
    }

    async fn run_tier<'a>(
        &self,
        priority: u32,
        mut pool: Vec<&'a Source>,
        config: &PriorityWeightedConfig,
        cancel: &CancellationToken,
        log: &Mutex<Vec<AttemptRecord>>,
    ) -> TierOutcome<'a> {
        while !pool.is_empty() {
            if cancel.is_cancelled() {
                return TierOutcome {
                    winner: None,
                    cancelled: true,
                };
            }

            let stats: Vec<Option<SourceStats>> = pool
                .iter()
                .map(|source| self.executor.stats().get(source.id().as_str()))
                .collect();
            let weights: Vec<f64> = pool
                .iter()
                .zip(&stats)
                .map(|(source, stats)| effective_weight(source.weight(), stats.as_ref(), config))
                .collect();
            let total: f64 = weights.iter().sum();
            let draw = self.rng.lock().r#gen::<f64>() * total;
            let index = select_index(&weights, draw);

            let source = pool.remove(index);
            let timeout = effective_timeout(source.timeout(), stats[index].as_ref(), config);
            debug!(
                source = %source.id(),
                priority,
                weight = weights[index],
                timeout_ms = timeout.as_millis() as u64,
                "selected"
            );

            let attempt = self
                .executor
                .run(source, timeout, config.bid_floor_enabled, cancel)
                .await;
            log.lock().push(attempt.record);

            if attempt.result.is_success() {
                return TierOutcome {
                    winner: Some((source, attempt.result)),
                    cancelled: false,
                };
            }
            if attempt.cancelled {
                return TierOutcome {
                    winner: None,
                    cancelled: true,
                };
            }
        }

        debug!(priority, "tier exhausted");
        TierOutcome {
            winner: None,
            cancelled: false,
        }
    }
}
