//! Simulated demand sources and failure injection.
//!
//! Every loader here honours its cancellation token: a pending delay or hang
//! ends as soon as the token fires.

use crate::error::{SimError, SimResult};
use crate::seed::SimSeed;
use apex_core::{CancellationToken, Loader, SharedLoader, SourceResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creative bytes returned by simulated fills
pub const SIM_CREATIVE: &[u8] = b"<sim-creative/>";

/// What a simulated source does on one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Fill at `bid` after `latency_ms`
    Fill {
        /// Bid value
        bid: f64,
        /// Response latency
        latency_ms: u64,
    },
    /// No inventory after `latency_ms`
    NoFill {
        /// Response latency
        latency_ms: u64,
    },
    /// Adapter error after `latency_ms`
    Error {
        /// Response latency
        latency_ms: u64,
    },
    /// Adapter reports its own timeout after `latency_ms`
    Timeout {
        /// Response latency
        latency_ms: u64,
    },
    /// Never responds
    Hang,
    /// Panics inside the adapter
    Panic,
}

impl Behavior {
    /// Immediate fill
    #[must_use]
    pub fn fill(bid: f64) -> Self {
        Self::Fill { bid, latency_ms: 0 }
    }

    /// Immediate no-fill
    #[must_use]
    pub fn no_fill() -> Self {
        Self::NoFill { latency_ms: 0 }
    }

    /// Immediate error
    #[must_use]
    pub fn error() -> Self {
        Self::Error { latency_ms: 0 }
    }

    /// Same behavior, answered after `latency_ms`
    #[must_use]
    pub fn after(self, latency_ms: u64) -> Self {
        match self {
            Self::Fill { bid, .. } => Self::Fill { bid, latency_ms },
            Self::NoFill { .. } => Self::NoFill { latency_ms },
            Self::Error { .. } => Self::Error { latency_ms },
            Self::Timeout { .. } => Self::Timeout { latency_ms },
            other => other,
        }
    }

    /// Act out this behavior
    pub async fn play(&self, cancel: CancellationToken) -> SourceResult {
        let (latency_ms, result) = match self {
            Self::Fill { bid, latency_ms } => (
                *latency_ms,
                SourceResult::success(Bytes::from_static(SIM_CREATIVE), *bid),
            ),
            Self::NoFill { latency_ms } => (*latency_ms, SourceResult::no_fill("no inventory")),
            Self::Error { latency_ms } => (*latency_ms, SourceResult::error("injected error")),
            Self::Timeout { latency_ms } => (*latency_ms, SourceResult::Timeout),
            Self::Hang => {
                cancel.cancelled().await;
                return SourceResult::error("cancelled");
            }
            Self::Panic => panic!("injected adapter panic"),
        };

        if latency_ms > 0 {
            tokio::select! {
                () = cancel.cancelled() => return SourceResult::error("cancelled"),
                () = tokio::time::sleep(Duration::from_millis(latency_ms)) => {}
            }
        }
        result
    }
}

/// Probabilistic description of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeModel {
    /// Chance of a fill
    pub fill_probability: f64,
    /// Chance of an adapter error
    pub error_probability: f64,
    /// Chance of never answering
    pub hang_probability: f64,
    /// Inclusive bid range for fills
    pub bid_range: (f64, f64),
    /// Inclusive latency range in milliseconds
    pub latency_ms: (u64, u64),
}

impl OutcomeModel {
    /// Model that fills with probability `fill_probability`
    #[must_use]
    pub fn new(fill_probability: f64) -> Self {
        Self {
            fill_probability,
            ..Self::default()
        }
    }

    /// Set error probability
    #[must_use]
    pub fn with_error_probability(mut self, p: f64) -> Self {
        self.error_probability = p;
        self
    }

    /// Set hang probability
    #[must_use]
    pub fn with_hang_probability(mut self, p: f64) -> Self {
        self.hang_probability = p;
        self
    }

    /// Set bid range
    #[must_use]
    pub fn with_bid_range(mut self, low: f64, high: f64) -> Self {
        self.bid_range = (low, high);
        self
    }

    /// Set latency range
    #[must_use]
    pub fn with_latency(mut self, low_ms: u64, high_ms: u64) -> Self {
        self.latency_ms = (low_ms, high_ms);
        self
    }

    /// Check probabilities and ranges
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidModel`] when a probability is outside
    /// `[0, 1]`, the probabilities sum above 1, or a range is inverted.
    pub fn validate(&self) -> SimResult<()> {
        let probabilities = [
            self.fill_probability,
            self.error_probability,
            self.hang_probability,
        ];
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(SimError::InvalidModel("probability outside [0, 1]".into()));
        }
        if probabilities.iter().sum::<f64>() > 1.0 + f64::EPSILON {
            return Err(SimError::InvalidModel("probabilities sum above 1".into()));
        }
        let (low, high) = self.bid_range;
        if !low.is_finite() || !high.is_finite() || low < 0.0 || low > high {
            return Err(SimError::InvalidModel("bad bid range".into()));
        }
        if self.latency_ms.0 > self.latency_ms.1 {
            return Err(SimError::InvalidModel("bad latency range".into()));
        }
        Ok(())
    }

    /// Draw one behavior
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Behavior {
        let roll = rng.r#gen::<f64>();
        let latency_ms = rng.gen_range(self.latency_ms.0..=self.latency_ms.1);

        let mut edge = self.hang_probability;
        if roll < edge {
            return Behavior::Hang;
        }
        edge += self.error_probability;
        if roll < edge {
            return Behavior::Error { latency_ms };
        }
        edge += self.fill_probability;
        if roll < edge {
            let bid = rng.gen_range(self.bid_range.0..=self.bid_range.1);
            return Behavior::Fill { bid, latency_ms };
        }
        Behavior::NoFill { latency_ms }
    }
}

impl Default for OutcomeModel {
    fn default() -> Self {
        Self {
            fill_probability: 0.5,
            error_probability: 0.0,
            hang_probability: 0.0,
            bid_range: (0.5, 2.0),
            latency_ms: (10, 50),
        }
    }
}

/// Loader that plays a fixed script, one step per call
///
/// Past the end the last step repeats, or the script restarts when built
/// with [`ScriptedLoader::cycle`]. An empty script answers no-fill.
#[derive(Debug)]
pub struct ScriptedLoader {
    steps: Vec<Behavior>,
    cycle: bool,
    invocations: AtomicU64,
}

impl ScriptedLoader {
    /// Script whose last step repeats
    #[must_use]
    pub fn new(steps: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            steps,
            cycle: false,
            invocations: AtomicU64::new(0),
        })
    }

    /// Script that restarts after its last step
    #[must_use]
    pub fn cycle(steps: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            steps,
            cycle: true,
            invocations: AtomicU64::new(0),
        })
    }

    /// Script of one behavior, forever
    #[must_use]
    pub fn always(behavior: Behavior) -> Arc<Self> {
        Self::new(vec![behavior])
    }

    /// Times the loader has been called
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn step(&self, call: u64) -> Behavior {
        let Some(last) = self.steps.len().checked_sub(1) else {
            return Behavior::no_fill();
        };
        let call = usize::try_from(call).unwrap_or(usize::MAX);
        let index = if self.cycle {
            call % self.steps.len()
        } else {
            call.min(last)
        };
        self.steps[index].clone()
    }
}

#[async_trait]
impl Loader for ScriptedLoader {
    async fn load(&self, cancel: CancellationToken) -> SourceResult {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst);
        self.step(call).play(cancel).await
    }
}

/// Loader that samples an [`OutcomeModel`] from its own seeded RNG
#[derive(Debug)]
pub struct ProbabilisticLoader {
    model: OutcomeModel,
    rng: Mutex<ChaCha8Rng>,
    invocations: AtomicU64,
}

impl ProbabilisticLoader {
    /// Create a loader
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidModel`] if the model does not validate.
    pub fn new(model: OutcomeModel, seed: &SimSeed) -> SimResult<Arc<Self>> {
        model.validate()?;
        Ok(Arc::new(Self {
            model,
            rng: Mutex::new(seed.rng()),
            invocations: AtomicU64::new(0),
        }))
    }

    /// The model being sampled
    #[must_use]
    pub fn model(&self) -> &OutcomeModel {
        &self.model
    }

    /// Times the loader has been called
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for ProbabilisticLoader {
    async fn load(&self, cancel: CancellationToken) -> SourceResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let behavior = self.model.sample(&mut self.rng.lock());
        behavior.play(cancel).await
    }
}

/// A window of rounds during which a source misbehaves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outage {
    /// Affected source
    pub source_id: String,
    /// First affected round
    pub from_round: u64,
    /// First round after the outage
    pub until_round: u64,
    /// What the source does instead of its normal behavior
    pub behavior: Behavior,
}

impl Outage {
    /// Whether `round` falls inside the window
    #[must_use]
    pub fn covers(&self, round: u64) -> bool {
        (self.from_round..self.until_round).contains(&round)
    }
}

/// Planned outages for a simulation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSchedule {
    /// Outages, earliest registered first
    pub outages: Vec<Outage>,
}

impl FailureSchedule {
    /// Create an empty schedule
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an outage for `rounds`
    #[must_use]
    pub fn outage(mut self, source_id: &str, rounds: Range<u64>, behavior: Behavior) -> Self {
        self.outages.push(Outage {
            source_id: source_id.to_string(),
            from_round: rounds.start,
            until_round: rounds.end,
            behavior,
        });
        self
    }

    /// Injected behavior for `source_id` in `round`, first match wins
    #[must_use]
    pub fn injected(&self, source_id: &str, round: u64) -> Option<&Behavior> {
        self.outages
            .iter()
            .find(|o| o.source_id == source_id && o.covers(round))
            .map(|o| &o.behavior)
    }

    /// Whether nothing is scheduled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outages.is_empty()
    }
}

/// Wraps a loader so scheduled outages override it
pub(crate) struct ScheduledLoader {
    pub(crate) source_id: String,
    pub(crate) inner: SharedLoader,
    pub(crate) schedule: Arc<RwLock<FailureSchedule>>,
    pub(crate) round: Arc<AtomicU64>,
}

#[async_trait]
impl Loader for ScheduledLoader {
    async fn load(&self, cancel: CancellationToken) -> SourceResult {
        let round = self.round.load(Ordering::SeqCst);
        let injected = self.schedule.read().injected(&self.source_id, round).cloned();
        match injected {
            Some(behavior) => behavior.play(cancel).await,
            None => self.inner.load(cancel).await,
        }
    }
}
