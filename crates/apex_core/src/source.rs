//! Demand sources and the loader contract.
//!
//! A [`Source`] is built per mediation request from a validated
//! [`SourceSpec`] plus the adapter's [`Loader`]. Only its id outlives the
//! call.

use crate::error::{CoreResult, MediationError};
use crate::id::SourceId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timeout applied when a spec does not set one
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bid values are accounted in micros
pub const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Outcome reported by a loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SourceResult {
    /// The source filled the request
    Success {
        /// Opaque adapter payload (creative, markup, handle)
        payload: Bytes,
        /// Bid value in currency units
        bid_value: f64,
    },
    /// Nothing to serve
    NoFill {
        /// Why the source declined
        reason: String,
    },
    /// Adapter-reported fault
    Error {
        /// Fault description
        cause: String,
    },
    /// The source ran out of time
    Timeout,
}

impl SourceResult {
    /// Create a fill
    #[must_use]
    pub fn success(payload: impl Into<Bytes>, bid_value: f64) -> Self {
        Self::Success {
            payload: payload.into(),
            bid_value,
        }
    }

    /// Create a no-fill
    #[must_use]
    pub fn no_fill(reason: impl Into<String>) -> Self {
        Self::NoFill {
            reason: reason.into(),
        }
    }

    /// Create an error
    #[must_use]
    pub fn error(cause: impl Into<String>) -> Self {
        Self::Error {
            cause: cause.into(),
        }
    }

    /// Check if this is a fill
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Check if this counts as a fault against the source
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Timeout)
    }

    /// Tag of the active variant
    #[must_use]
    pub const fn tag(&self) -> ResultTag {
        match self {
            Self::Success { .. } => ResultTag::Success,
            Self::NoFill { .. } => ResultTag::NoFill,
            Self::Error { .. } => ResultTag::Error,
            Self::Timeout => ResultTag::Timeout,
        }
    }

    /// Bid in micros, zero unless this is a fill
    #[must_use]
    pub fn bid_micros(&self) -> u64 {
        match self {
            Self::Success { bid_value, .. } if bid_value.is_finite() && *bid_value > 0.0 => {
                (bid_value * MICROS_PER_UNIT).round() as u64
            }
            _ => 0,
        }
    }

    /// Message carried by a no-fill or error
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::NoFill { reason } => Some(reason),
            Self::Error { cause } => Some(cause),
            _ => None,
        }
    }
}

/// Outcome tag of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTag {
    /// Filled
    Success,
    /// Declined
    NoFill,
    /// Faulted
    Error,
    /// Ran out of time
    Timeout,
    /// Not invoked (breaker open or rate limited)
    Skipped,
}

impl std::fmt::Display for ResultTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NoFill => "no_fill",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Normalized no-bid reason for analytics and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoBidReason {
    /// Source had nothing to serve
    NoFill,
    /// Bid came in under the source's floor
    BelowFloor,
    /// Breaker rejected the call
    CircuitOpen,
    /// Rate limiter rejected the call
    RateLimited,
    /// Source exceeded its timeout
    Timeout,
    /// Adapter fault
    Error,
    /// Caller cancelled the dispatch
    Cancelled,
}

impl NoBidReason {
    /// Stable string form
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoFill => "no_fill",
            Self::BelowFloor => "below_floor",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for NoBidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter entry point
///
/// Implementations must return promptly once `cancel` fires and must report
/// expected outcomes (including no-fill) as values, never by panicking.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Request fill from the source
    async fn load(&self, cancel: CancellationToken) -> SourceResult;
}

/// Shared loader handle
pub type SharedLoader = Arc<dyn Loader>;

/// Loader backed by an async closure
pub struct FnLoader<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = SourceResult> + Send,
{
    async fn load(&self, cancel: CancellationToken) -> SourceResult {
        (self.f)(cancel).await
    }
}

/// Wrap an async closure as a shared loader
pub fn loader_fn<F, Fut>(f: F) -> SharedLoader
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SourceResult> + Send + 'static,
{
    Arc::new(FnLoader { f })
}

/// Serializable description of a source, as supplied by external config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    /// Source id, unique within one call
    pub id: String,
    /// Lower is tried first; must be non-negative
    pub priority: i64,
    /// Relative selection weight within the priority tier
    pub weight: f64,
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,
    /// Whether the source takes part at all
    pub enabled: bool,
    /// Bid floor in currency units
    pub min_bid: f64,
}

impl SourceSpec {
    /// Create a spec with default settings
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set weight
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set bid floor
    #[must_use]
    pub fn with_min_bid(mut self, min_bid: f64) -> Self {
        self.min_bid = min_bid;
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check all construction invariants
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(MediationError::EmptySourceId);
        }
        if self.priority < 0 || u32::try_from(self.priority).is_err() {
            return Err(MediationError::InvalidPriority {
                id: self.id.clone(),
                priority: self.priority,
            });
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(MediationError::InvalidWeight {
                id: self.id.clone(),
                weight: self.weight,
            });
        }
        if self.timeout_ms == 0 {
            return Err(MediationError::InvalidTimeout { id: self.id.clone() });
        }
        if !self.min_bid.is_finite() || self.min_bid < 0.0 {
            return Err(MediationError::InvalidBidFloor {
                id: self.id.clone(),
                min_bid: self.min_bid,
            });
        }
        Ok(())
    }

    /// Validate and attach a loader
    ///
    /// # Errors
    ///
    /// Returns error if the spec is invalid
    pub fn into_source(self, loader: SharedLoader) -> CoreResult<Source> {
        Source::new(self, loader)
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            priority: 0,
            weight: 1.0,
            timeout_ms: DEFAULT_SOURCE_TIMEOUT.as_millis() as u64,
            enabled: true,
            min_bid: 0.0,
        }
    }
}

/// One demand source to try during a single dispatch
#[derive(Clone)]
pub struct Source {
    id: SourceId,
    priority: u32,
    weight: f64,
    timeout: Duration,
    enabled: bool,
    min_bid: f64,
    loader: SharedLoader,
}

impl Source {
    /// Build a source from a validated spec
    ///
    /// # Errors
    ///
    /// Returns error if the spec violates an invariant
    pub fn new(spec: SourceSpec, loader: SharedLoader) -> CoreResult<Self> {
        spec.validate()?;
        let priority = u32::try_from(spec.priority).map_err(|_| MediationError::InvalidPriority {
            id: spec.id.clone(),
            priority: spec.priority,
        })?;
        Ok(Self {
            id: SourceId::from(spec.id),
            priority,
            weight: spec.weight,
            timeout: Duration::from_millis(spec.timeout_ms),
            enabled: spec.enabled,
            min_bid: spec.min_bid,
            loader,
        })
    }

    /// Source id
    #[must_use]
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    /// Priority tier (lower first)
    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    /// Base weight
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Configured timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the source takes part
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bid floor
    #[must_use]
    pub const fn min_bid(&self) -> f64 {
        self.min_bid
    }

    /// Adapter loader
    #[must_use]
    pub fn loader(&self) -> &SharedLoader {
        &self.loader
    }

    /// Check a bid against this source's floor
    #[must_use]
    pub fn clears_floor(&self, bid_value: f64) -> bool {
        bid_value >= self.min_bid
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .field("min_bid", &self.min_bid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_fill_loader() -> SharedLoader {
        loader_fn(|_cancel| async { SourceResult::no_fill("empty") })
    }

    #[test]
    fn test_source_result_tags() {
        assert_eq!(SourceResult::success(Bytes::new(), 1.0).tag(), ResultTag::Success);
        assert_eq!(SourceResult::no_fill("x").tag(), ResultTag::NoFill);
        assert_eq!(SourceResult::error("x").tag(), ResultTag::Error);
        assert_eq!(SourceResult::Timeout.tag(), ResultTag::Timeout);
    }

    #[test]
    fn test_source_result_fault() {
        assert!(SourceResult::error("boom").is_fault());
        assert!(SourceResult::Timeout.is_fault());
        assert!(!SourceResult::no_fill("none").is_fault());
        assert!(!SourceResult::success(Bytes::new(), 0.5).is_fault());
    }

    #[test]
    fn test_bid_micros() {
        assert_eq!(SourceResult::success(Bytes::new(), 2.5).bid_micros(), 2_500_000);
        assert_eq!(SourceResult::success(Bytes::new(), f64::NAN).bid_micros(), 0);
        assert_eq!(SourceResult::no_fill("x").bid_micros(), 0);
    }

    #[test]
    fn test_source_result_serde() {
        let json = serde_json::to_string(&SourceResult::Timeout).unwrap();
        assert_eq!(json, r#"{"result":"timeout"}"#);

        let parsed: SourceResult = serde_json::from_str(r#"{"result":"no_fill","reason":"empty"}"#).unwrap();
        assert_eq!(parsed, SourceResult::no_fill("empty"));
    }

    #[test]
    fn test_no_bid_reason_strings() {
        assert_eq!(NoBidReason::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(NoBidReason::BelowFloor.to_string(), "below_floor");
    }

    #[test]
    fn test_spec_defaults() {
        let spec = SourceSpec::new("admob");
        assert_eq!(spec.weight, 1.0);
        assert_eq!(spec.timeout_ms, 5_000);
        assert!(spec.enabled);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_rejects_bad_weight() {
        for weight in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let spec = SourceSpec::new("a").with_weight(weight);
            assert!(matches!(spec.validate(), Err(MediationError::InvalidWeight { .. })));
        }
    }

    #[test]
    fn test_spec_rejects_negative_priority() {
        let spec = SourceSpec::new("a").with_priority(-1);
        assert!(matches!(spec.validate(), Err(MediationError::InvalidPriority { .. })));
    }

    #[test]
    fn test_spec_rejects_zero_timeout() {
        let spec = SourceSpec::new("a").with_timeout(Duration::ZERO);
        assert!(matches!(spec.validate(), Err(MediationError::InvalidTimeout { .. })));
    }

    #[test]
    fn test_spec_rejects_empty_id() {
        assert_eq!(SourceSpec::new("").validate(), Err(MediationError::EmptySourceId));
    }

    #[test]
    fn test_spec_rejects_negative_floor() {
        let spec = SourceSpec::new("a").with_min_bid(-0.01);
        assert!(matches!(spec.validate(), Err(MediationError::InvalidBidFloor { .. })));
    }

    #[test]
    fn test_spec_from_json_uses_defaults() {
        let spec: SourceSpec = serde_json::from_str(r#"{"id":"unity","priority":2}"#).unwrap();
        assert_eq!(spec.id, "unity");
        assert_eq!(spec.priority, 2);
        assert_eq!(spec.weight, 1.0);
    }

    #[test]
    fn test_source_new() {
        let source = SourceSpec::new("applovin")
            .with_priority(3)
            .with_weight(2.0)
            .with_timeout(Duration::from_millis(750))
            .with_min_bid(0.5)
            .into_source(no_fill_loader())
            .unwrap();

        assert_eq!(source.id().as_str(), "applovin");
        assert_eq!(source.priority(), 3);
        assert_eq!(source.weight(), 2.0);
        assert_eq!(source.timeout(), Duration::from_millis(750));
        assert!(source.is_enabled());
        assert!(source.clears_floor(0.5));
        assert!(!source.clears_floor(0.49));
    }

    proptest::proptest! {
        #[test]
        fn prop_positive_weight_and_priority_validate(
            priority in 0i64..=i64::from(u32::MAX),
            weight in 0.001f64..1_000.0,
        ) {
            let spec = SourceSpec::new("src").with_priority(priority).with_weight(weight);
            proptest::prop_assert!(spec.validate().is_ok());
        }

        #[test]
        fn prop_negative_priority_rejected(priority in i64::MIN..0) {
            let spec = SourceSpec::new("src").with_priority(priority);
            let rejected = matches!(spec.validate(), Err(MediationError::InvalidPriority { .. }));
            proptest::prop_assert!(rejected);
        }
    }

    #[tokio::test]
    async fn test_loader_fn_receives_token() {
        let loader = loader_fn(|cancel: CancellationToken| async move {
            if cancel.is_cancelled() {
                SourceResult::error("cancelled")
            } else {
                SourceResult::success(Bytes::from_static(b"ad"), 1.25)
            }
        });

        let result = loader.load(CancellationToken::new()).await;
        assert!(result.is_success());

        let token = CancellationToken::new();
        token.cancel();
        let result = loader.load(token).await;
        assert_eq!(result, SourceResult::error("cancelled"));
    }
}
