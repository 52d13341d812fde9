//! Simulation harness that drives a dispatcher through mediation rounds.
//!
//! Run it under a paused tokio runtime (`start_paused = true`) and every
//! latency, timeout, cooldown and rate window resolves deterministically.

use crate::error::{SimError, SimResult};
use crate::failure::{FailureSchedule, OutcomeModel, ProbabilisticLoader, ScheduledLoader};
use crate::record::{RoundRecord, SimRecord, TransitionRecord};
use crate::seed::SimSeed;
use apex_core::{
    DispatcherConfig, ExecutionResult, MediationError, PriorityWeightedConfig, SharedLoader,
    Source, SourceSpec,
};
use apex_runtime::{BreakerTransition, DispatchMode, MediationDispatcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Scheduler exercised by a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimMode {
    /// Sequential waterfall
    Waterfall,
    /// Priority-weighted tiers with the given settings
    Weighted(PriorityWeightedConfig),
}

impl SimMode {
    /// Dispatch mode reported in the record
    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        match self {
            Self::Waterfall => DispatchMode::Waterfall,
            Self::Weighted(_) => DispatchMode::Weighted,
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Seed for reproducibility
    pub seed: SimSeed,
    /// Rounds per run
    pub rounds: u64,
    /// Simulated pause between rounds
    pub round_gap_ms: u64,
    /// Scheduler under test
    pub mode: SimMode,
    /// Dispatcher settings; the seed is filled from `seed` when absent
    pub dispatcher: DispatcherConfig,
}

impl SimConfig {
    /// Create a waterfall simulation config
    #[must_use]
    pub fn new(seed: SimSeed) -> Self {
        Self {
            seed,
            rounds: 100,
            round_gap_ms: 100,
            mode: SimMode::Waterfall,
            dispatcher: DispatcherConfig::default(),
        }
    }

    /// Set rounds per run
    #[must_use]
    pub fn with_rounds(mut self, rounds: u64) -> Self {
        self.rounds = rounds;
        self
    }

    /// Set the pause between rounds
    #[must_use]
    pub fn with_round_gap(mut self, gap_ms: u64) -> Self {
        self.round_gap_ms = gap_ms;
        self
    }

    /// Drive the weighted scheduler
    #[must_use]
    pub fn weighted(mut self, config: PriorityWeightedConfig) -> Self {
        self.mode = SimMode::Weighted(config);
        self
    }

    /// Set dispatcher settings
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(SimSeed::default())
    }
}

/// Simulation harness
pub struct SimHarness {
    config: SimConfig,
    dispatcher: MediationDispatcher,
    sources: Vec<Source>,
    schedule: Arc<RwLock<FailureSchedule>>,
    round: Arc<AtomicU64>,
    transitions: Arc<Mutex<Vec<TransitionRecord>>>,
}

impl SimHarness {
    /// Create a harness and its dispatcher
    ///
    /// # Errors
    ///
    /// Returns error if the dispatcher configuration is invalid
    pub fn new(config: SimConfig) -> SimResult<Self> {
        let mut dispatcher_config = config.dispatcher.clone();
        if dispatcher_config.seed.is_none() {
            dispatcher_config.seed = Some(config.seed.derive("dispatcher").seed);
        }
        let dispatcher = MediationDispatcher::new(dispatcher_config)?;

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        dispatcher.add_breaker_listener(move |t: &BreakerTransition| {
            sink.lock().push(TransitionRecord::from(t));
        });

        Ok(Self {
            config,
            dispatcher,
            sources: Vec::new(),
            schedule: Arc::new(RwLock::new(FailureSchedule::new())),
            round: Arc::new(AtomicU64::new(0)),
            transitions,
        })
    }

    /// Register a source backed by any loader
    ///
    /// # Errors
    ///
    /// Returns error if the spec is invalid or its id is already registered
    pub fn add_source(&mut self, spec: SourceSpec, loader: SharedLoader) -> SimResult<()> {
        if self.sources.iter().any(|s| s.id().as_str() == spec.id) {
            return Err(MediationError::DuplicateSource { id: spec.id }.into());
        }
        let gated = Arc::new(ScheduledLoader {
            source_id: spec.id.clone(),
            inner: loader,
            schedule: Arc::clone(&self.schedule),
            round: Arc::clone(&self.round),
        });
        self.sources.push(spec.into_source(gated)?);
        Ok(())
    }

    /// Register a source that samples `model` from a seed derived from its id
    ///
    /// # Errors
    ///
    /// Returns error if the model or spec is invalid
    pub fn add_model_source(
        &mut self,
        spec: SourceSpec,
        model: OutcomeModel,
    ) -> SimResult<Arc<ProbabilisticLoader>> {
        let loader = ProbabilisticLoader::new(model, &self.config.seed.derive(&spec.id))?;
        self.add_source(spec, loader.clone())?;
        Ok(loader)
    }

    /// Replace the outage schedule
    pub fn set_schedule(&self, schedule: FailureSchedule) {
        *self.schedule.write() = schedule;
    }

    /// Play one round; outages are evaluated for `round`
    pub async fn run_round(&self, round: u64) -> ExecutionResult {
        self.round.store(round, Ordering::SeqCst);
        match &self.config.mode {
            SimMode::Waterfall => self.dispatcher.execute(&self.sources, None).await,
            SimMode::Weighted(config) => {
                self.dispatcher
                    .execute_weighted(&self.sources, config, None)
                    .await
            }
        }
    }

    /// Play rounds `0..rounds`
    ///
    /// Dispatcher state (stats, breakers, limiter) carries over between
    /// runs; call [`SimHarness::reset`] for a clean slate.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NoSources`] when nothing is registered
    pub async fn run(&self) -> SimResult<SimRecord> {
        if self.sources.is_empty() {
            return Err(SimError::NoSources);
        }

        let mut record = SimRecord::new(self.config.seed.clone(), self.config.mode.dispatch_mode());
        let gap = Duration::from_millis(self.config.round_gap_ms);

        for round in 0..self.config.rounds {
            let result = self.run_round(round).await;
            debug!(
                round,
                winner = %result.winning_source_id,
                attempts = result.attempts_count,
                "round finished"
            );
            record.push_round(RoundRecord::from_result(round, &result));
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
        }

        record.transitions = std::mem::take(&mut *self.transitions.lock());
        record.metrics = self.dispatcher.metrics();
        info!(
            rounds = record.round_count(),
            fill_rate = record.fill_rate(),
            transitions = record.transitions.len(),
            "simulation finished"
        );
        Ok(record)
    }

    /// Clear stats, breakers, rate windows, metrics and pending transitions
    pub fn reset(&self) {
        self.dispatcher.clear_stats();
        self.dispatcher.reset_all_breakers();
        for source in &self.sources {
            self.dispatcher.reset_rate_limit(source.id().as_str());
        }
        self.dispatcher.monitor().reset();
        self.transitions.lock().clear();
    }

    /// The dispatcher under test
    #[must_use]
    pub fn dispatcher(&self) -> &MediationDispatcher {
        &self.dispatcher
    }

    /// Registered sources
    #[must_use]
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}
