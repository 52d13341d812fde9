//! Mediation dispatcher.
//!
//! The host-facing entry point. Owns every piece of cross-call state (source
//! statistics, breakers, rate windows, metrics) and hands the same guarded
//! executor to both schedulers.

use crate::breaker::{BreakerListener, BreakerRegistry, BreakerSnapshot, CircuitState};
use crate::executor::AttemptExecutor;
use crate::limiter::RateLimiter;
use crate::monitor::{DispatchMetrics, DispatchMode, DispatchMonitor};
use crate::stats::{SourceStats, StatsTracker};
use crate::waterfall::WaterfallScheduler;
use crate::weighted::PriorityWeightedScheduler;
use apex_core::{
    CancellationToken, CoreResult, DispatcherConfig, ExecutionResult, MonotonicClock,
    PriorityWeightedConfig, RequestId, SharedClock, Source, SourceId, INVALID_WEIGHTED_CONFIG,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info_span, warn, Instrument};

/// Composition root of the mediation engine
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct MediationDispatcher {
    config: DispatcherConfig,
    stats: Arc<StatsTracker>,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    waterfall: WaterfallScheduler,
    weighted: PriorityWeightedScheduler,
    monitor: DispatchMonitor,
}

impl MediationDispatcher {
    /// Create a dispatcher on the tokio clock
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: DispatcherConfig) -> CoreResult<Self> {
        Self::with_clock(config, MonotonicClock::shared())
    }

    /// Create a dispatcher on an injected clock
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn with_clock(config: DispatcherConfig, clock: SharedClock) -> CoreResult<Self> {
        config.validate()?;

        let stats = Arc::new(StatsTracker::new(Arc::clone(&clock)));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), Arc::clone(&clock)));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, Arc::clone(&clock)));
        let executor = AttemptExecutor::new(
            Arc::clone(&stats),
            Arc::clone(&breakers),
            Arc::clone(&limiter),
            clock,
        );

        Ok(Self {
            waterfall: WaterfallScheduler::new(executor.clone(), config.bid_floor_enabled),
            weighted: PriorityWeightedScheduler::new(executor, config.seed),
            monitor: DispatchMonitor::default(),
            config,
            stats,
            breakers,
            limiter,
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Waterfall dispatch: strict priority order, first fill wins
    ///
    /// Never fails; per-source faults show up in the attempt log.
    pub async fn execute(
        &self,
        sources: &[Source],
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        let request_id = RequestId::new();
        let span = info_span!(
            "dispatch",
            request = %request_id,
            mode = %DispatchMode::Waterfall,
            sources = sources.len()
        );
        let sources = unique_sources(sources);
        let cancel = call_token(cancel);

        let result = self
            .waterfall
            .execute(request_id, &sources, &cancel)
            .instrument(span)
            .await;
        self.monitor.record(DispatchMode::Waterfall, &result);
        result
    }

    /// Priority-weighted dispatch
    ///
    /// Never fails; per-source faults show up in the attempt log. A config
    /// that fails [`PriorityWeightedConfig::validate`] attempts nothing and
    /// returns a no-fill carrying [`INVALID_WEIGHTED_CONFIG`].
    pub async fn execute_weighted(
        &self,
        sources: &[Source],
        config: &PriorityWeightedConfig,
        cancel: Option<&CancellationToken>,
    ) -> ExecutionResult {
        let request_id = RequestId::new();
        if let Err(err) = config.validate() {
            warn!(request = %request_id, error = %err, "rejecting weighted dispatch");
            let result = ExecutionResult::empty(request_id, INVALID_WEIGHTED_CONFIG);
            self.monitor.record(DispatchMode::Weighted, &result);
            return result;
        }
        let span = info_span!(
            "dispatch",
            request = %request_id,
            mode = %DispatchMode::Weighted,
            sources = sources.len()
        );
        let sources = unique_sources(sources);
        let cancel = call_token(cancel);

        let result = self
            .weighted
            .execute(request_id, &sources, config, &cancel)
            .instrument(span)
            .await;
        self.monitor.record(DispatchMode::Weighted, &result);
        result
    }

    /// Statistics for one source
    #[must_use]
    pub fn get_stats(&self, id: &str) -> Option<SourceStats> {
        self.stats.get(id)
    }

    /// Statistics for every source seen so far
    #[must_use]
    pub fn get_all_stats(&self) -> HashMap<SourceId, SourceStats> {
        self.stats.all()
    }

    /// Forget one source's statistics
    pub fn reset_stats(&self, id: &str) {
        self.stats.reset(id);
    }

    /// Forget all statistics
    pub fn clear_stats(&self) {
        self.stats.clear();
    }

    /// Breaker state for a source
    #[must_use]
    pub fn breaker_state(&self, id: &str) -> CircuitState {
        self.breakers.state(id)
    }

    /// Breaker counters for a source
    #[must_use]
    pub fn breaker_snapshot(&self, id: &str) -> Option<BreakerSnapshot> {
        self.breakers.snapshot(id)
    }

    /// Force a source's breaker closed
    pub fn reset_breaker(&self, id: &str) {
        self.breakers.reset(id);
    }

    /// Force every breaker closed
    pub fn reset_all_breakers(&self) {
        self.breakers.reset_all();
    }

    /// Observe breaker transitions for every source
    pub fn add_breaker_listener(&self, listener: impl BreakerListener + 'static) {
        self.breakers.add_listener(listener);
    }

    /// Calls a source may still make in the current window
    #[must_use]
    pub fn rate_limit_remaining(&self, id: &str) -> usize {
        self.limiter.remaining(id)
    }

    /// Clear a source's rate window
    pub fn reset_rate_limit(&self, id: &str) {
        self.limiter.reset(id);
    }

    /// Dispatch counters
    #[must_use]
    pub fn metrics(&self) -> DispatchMetrics {
        self.monitor.snapshot()
    }

    /// Dispatch monitor, including recent-call history
    #[must_use]
    pub fn monitor(&self) -> &DispatchMonitor {
        &self.monitor
    }
}

fn call_token(parent: Option<&CancellationToken>) -> CancellationToken {
    parent.map_or_else(CancellationToken::new, CancellationToken::child_token)
}

fn unique_sources(sources: &[Source]) -> Vec<Source> {
    let mut unique: IndexMap<SourceId, Source> = IndexMap::with_capacity(sources.len());
    for source in sources {
        if unique.contains_key(source.id()) {
            warn!(source = %source.id(), "duplicate source id, keeping first");
            continue;
        }
        unique.insert(source.id().clone(), source.clone());
    }
    unique.into_values().collect()
}
