//! Per-source circuit breaker.
//!
//! Three states: `Closed` passes calls through, `Open` rejects them without
//! invoking the source until the cooldown elapses, and `HalfOpen` admits a
//! bounded number of probes. Only calls classified as [`CallVerdict::Failure`]
//! count against the source; a no-fill is a healthy response.

use apex_core::{BreakerConfig, SharedClock, SourceId, Timestamp};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,
    /// Calls are rejected
    Open,
    /// Probe calls are admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// How a finished call counts against the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallVerdict {
    /// Healthy response
    Success,
    /// Genuine fault
    Failure,
    /// Neither; releases a half-open slot
    Ignore,
}

/// Rejection returned while the circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for source {source_id} (retry in {retry_in_ms}ms)")]
pub struct CircuitOpenError {
    /// Rejected source
    pub source_id: SourceId,
    /// Time left on the cooldown, zero while half-open probes are in flight
    pub retry_in_ms: u64,
}

/// A state change, handed to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    /// Source whose breaker moved
    pub source_id: SourceId,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// When it happened
    pub at: Timestamp,
}

/// Observer of breaker transitions
///
/// Listeners run synchronously after the state lock is released. A panicking
/// listener is logged and skipped.
pub trait BreakerListener: Send + Sync {
    /// Called once per transition
    fn on_transition(&self, transition: &BreakerTransition);
}

impl<F> BreakerListener for F
where
    F: Fn(&BreakerTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &BreakerTransition) {
        (self)(transition);
    }
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn BreakerListener>>>>;

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Source id
    pub source_id: SourceId,
    /// Current state
    pub state: CircuitState,
    /// Faults since the last success while closed
    pub consecutive_failures: u32,
    /// Successful probes in the current half-open period
    pub half_open_successes: u32,
    /// Last recorded fault
    pub last_failure_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_admitted: u32,
    last_failure_at: Option<Timestamp>,
    // Bumped on every entry into half-open so stale permits cannot settle probes.
    epoch: u64,
}

impl BreakerCell {
    fn trip(&mut self, now: Timestamp) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
        self.half_open_successes = 0;
        self.half_open_admitted = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_admitted = 0;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
        self.half_open_admitted = 0;
        self.epoch += 1;
    }
}

/// Breaker guarding one source
pub struct CircuitBreaker {
    source_id: SourceId,
    config: BreakerConfig,
    clock: SharedClock,
    cell: Mutex<BreakerCell>,
    listeners: RwLock<Vec<Arc<dyn BreakerListener>>>,
    shared: ListenerList,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(source_id: SourceId, config: BreakerConfig, clock: SharedClock) -> Self {
        Self::with_shared(source_id, config, clock, ListenerList::default())
    }

    /// `shared` holds listeners registered for every breaker of a registry
    fn with_shared(
        source_id: SourceId,
        config: BreakerConfig,
        clock: SharedClock,
        shared: ListenerList,
    ) -> Self {
        Self {
            source_id,
            config,
            clock,
            cell: Mutex::new(BreakerCell::default()),
            listeners: RwLock::new(Vec::new()),
            shared,
        }
    }

    /// Source this breaker guards
    #[must_use]
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Current state
    ///
    /// An open breaker whose cooldown has elapsed still reports `Open` until
    /// the next call moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.cell.lock().state
    }

    /// Current counters
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let cell = self.cell.lock();
        BreakerSnapshot {
            source_id: self.source_id.clone(),
            state: cell.state,
            consecutive_failures: cell.consecutive_failures,
            half_open_successes: cell.half_open_successes,
            last_failure_at: cell.last_failure_at,
        }
    }

    /// Register a transition listener on this breaker only
    pub fn add_listener(&self, listener: impl BreakerListener + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Ask to make one call
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] if the call must not reach the source
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut transition = None;
        let admitted = {
            let mut cell = self.cell.lock();
            match cell.state {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => {
                    let elapsed = cell
                        .last_failure_at
                        .map_or(u64::MAX, |at| now.millis_since(at));
                    if elapsed >= self.config.reset_timeout_ms {
                        cell.half_open();
                        cell.half_open_admitted = 1;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(Some(cell.epoch))
                    } else {
                        Err(self.config.reset_timeout_ms - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if cell.half_open_admitted < self.config.half_open_max_attempts {
                        cell.half_open_admitted += 1;
                        Ok(Some(cell.epoch))
                    } else {
                        Err(0)
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.emit(from, to, now);
        }

        match admitted {
            Ok(probe_epoch) => Ok(BreakerPermit {
                breaker: self,
                probe_epoch,
                settled: false,
            }),
            Err(retry_in_ms) => Err(CircuitOpenError {
                source_id: self.source_id.clone(),
                retry_in_ms,
            }),
        }
    }

    /// Run one call through the breaker
    ///
    /// `action` is never invoked while the circuit is open. `classify` decides
    /// how the returned value counts; a call dropped before it finishes counts
    /// as [`CallVerdict::Ignore`].
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] if the call was rejected
    pub async fn execute<T, F, Fut, C>(&self, action: F, classify: C) -> Result<T, CircuitOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        C: FnOnce(&T) -> CallVerdict,
    {
        let permit = self.try_acquire()?;
        let value = action().await;
        permit.complete(classify(&value));
        Ok(value)
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let now = self.clock.now();
        let previous = {
            let mut cell = self.cell.lock();
            let previous = cell.state;
            let epoch = cell.epoch;
            *cell = BreakerCell {
                epoch: epoch + 1,
                ..BreakerCell::default()
            };
            previous
        };
        if previous != CircuitState::Closed {
            self.emit(previous, CircuitState::Closed, now);
        }
    }

    fn settle(&self, probe_epoch: Option<u64>, verdict: CallVerdict) {
        let now = self.clock.now();
        let transition = {
            let mut cell = self.cell.lock();
            let state = cell.state;
            let is_probe = state == CircuitState::HalfOpen && probe_epoch == Some(cell.epoch);
            match (state, verdict) {
                (CircuitState::Closed, CallVerdict::Success) => {
                    cell.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, CallVerdict::Failure) => {
                    cell.consecutive_failures += 1;
                    cell.last_failure_at = Some(now);
                    if cell.consecutive_failures >= self.config.failure_threshold {
                        cell.trip(now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, CallVerdict::Success) if is_probe => {
                    cell.half_open_successes += 1;
                    if cell.half_open_successes >= self.config.half_open_max_attempts {
                        cell.close();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, CallVerdict::Failure) => {
                    cell.trip(now);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                (CircuitState::HalfOpen, CallVerdict::Ignore) if is_probe => {
                    cell.half_open_admitted = cell.half_open_admitted.saturating_sub(1);
                    None
                }
                _ => None,
            }
        };

        if let Some((from, to)) = transition {
            self.emit(from, to, now);
        }
    }

    fn emit(&self, from: CircuitState, to: CircuitState, at: Timestamp) {
        info!(source = %self.source_id, %from, %to, "circuit state changed");

        let transition = BreakerTransition {
            source_id: self.source_id.clone(),
            from,
            to,
            at,
        };
        let mut listeners: Vec<_> = self.listeners.read().clone();
        listeners.extend(self.shared.read().iter().cloned());
        for listener in listeners {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_transition(&transition);
            }));
            if outcome.is_err() {
                warn!(source = %self.source_id, "breaker listener panicked, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("source_id", &self.source_id)
            .field("config", &self.config)
            .field("cell", &*self.cell.lock())
            .finish_non_exhaustive()
    }
}

/// Admission to make one call
///
/// Settle it with [`BreakerPermit::complete`]; dropping it unsettled counts
/// as [`CallVerdict::Ignore`].
#[must_use = "a permit should be completed with the call's verdict"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this call is a half-open probe
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe_epoch.is_some()
    }

    /// Report how the call went
    pub fn complete(mut self, verdict: CallVerdict) {
        self.settled = true;
        self.breaker.settle(self.probe_epoch, verdict);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.probe_epoch, CallVerdict::Ignore);
        }
    }
}

/// Lazily created breakers keyed by source id
pub struct BreakerRegistry {
    breakers: DashMap<SourceId, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    clock: SharedClock,
    listeners: ListenerList,
}

impl BreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
            listeners: ListenerList::default(),
        }
    }

    /// Breaker for a source, created closed on first use
    #[must_use]
    pub fn get_or_create(&self, id: &SourceId) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.breakers.get(id.as_str()) {
            return Arc::clone(entry.value());
        }
        let entry = self.breakers.entry(id.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_shared(
                id.clone(),
                self.config.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.listeners),
            ))
        });
        Arc::clone(entry.value())
    }

    /// State of a source's breaker; `Closed` if it has none yet
    #[must_use]
    pub fn state(&self, id: &str) -> CircuitState {
        self.breakers
            .get(id)
            .map_or(CircuitState::Closed, |entry| entry.value().state())
    }

    /// Counters of a source's breaker
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.get(id).map(|entry| Arc::clone(entry.value()))?;
        Some(breaker.snapshot())
    }

    /// Force one breaker closed
    pub fn reset(&self, id: &str) {
        let breaker = self.breakers.get(id).map(|entry| Arc::clone(entry.value()));
        if let Some(breaker) = breaker {
            breaker.reset();
        }
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Register a listener for every breaker, existing and future
    pub fn add_listener(&self, listener: impl BreakerListener + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}
