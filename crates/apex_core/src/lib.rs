//! Apex Mediation Core Types
//!
//! Pure types shared by the mediation engine: source descriptors, the loader
//! contract, outcomes, clocks and configuration. No I/O happens here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod outcome;
pub mod source;
pub mod time;

// Re-exports
pub use config::{BreakerConfig, DispatcherConfig, PriorityWeightedConfig, RateLimitConfig};
pub use error::{CoreResult, MediationError};
pub use id::{RequestId, SourceId, NO_WINNER};
pub use outcome::{
    sources_exhausted_message, AttemptRecord, ExecutionResult, ALL_SOURCES_DISABLED,
    ALL_SOURCES_EXHAUSTED, DISPATCH_CANCELLED, INVALID_WEIGHTED_CONFIG, NO_SOURCES_CONFIGURED,
};
pub use source::{
    loader_fn, FnLoader, Loader, NoBidReason, ResultTag, SharedLoader, Source, SourceResult,
    SourceSpec, DEFAULT_SOURCE_TIMEOUT,
};
pub use time::{Clock, ManualClock, MonotonicClock, SharedClock, Timestamp};

pub use tokio_util::sync::CancellationToken;
