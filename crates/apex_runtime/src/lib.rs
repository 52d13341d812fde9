//! Apex Mediation Runtime
//!
//! Dispatch engine that decides which demand sources to call, in what order
//! and with what timeout. Each source sits behind its own rate limiter and
//! circuit breaker; outcomes feed shared statistics that steer later calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod dispatcher;
pub mod executor;
pub mod limiter;
pub mod monitor;
pub mod stats;
pub mod waterfall;
pub mod weighted;

#[cfg(test)]
mod test_support;

pub use breaker::{
    BreakerListener, BreakerPermit, BreakerRegistry, BreakerSnapshot, BreakerTransition,
    CallVerdict, CircuitBreaker, CircuitOpenError, CircuitState,
};
pub use dispatcher::MediationDispatcher;
pub use executor::{Attempt, AttemptExecutor};
pub use limiter::{RateLimiter, RATE_WINDOW};
pub use monitor::{DispatchMetrics, DispatchMode, DispatchMonitor, DispatchSummary};
pub use stats::{SourceStats, StatsTracker};
pub use waterfall::WaterfallScheduler;
pub use weighted::{
    effective_timeout, effective_weight, group_by_priority, select_index,
    PriorityWeightedScheduler,
};
