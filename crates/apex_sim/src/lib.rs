//! Apex Mediation Deterministic Simulation
//!
//! Seeded demand sources, failure injection and a harness that drives the
//! dispatcher through many mediation rounds. Every run is reproducible from
//! its seed when executed on a paused tokio clock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod failure;
pub mod harness;
pub mod record;
pub mod seed;

#[cfg(test)]
mod scenarios;

pub use error::{SimError, SimResult};
pub use failure::{
    Behavior, FailureSchedule, Outage, OutcomeModel, ProbabilisticLoader, ScriptedLoader,
    SIM_CREATIVE,
};
pub use harness::{SimConfig, SimHarness, SimMode};
pub use record::{RoundRecord, SimRecord, TransitionRecord};
pub use seed::{SeedSource, SimSeed};

use tracing_subscriber::EnvFilter;

/// Route engine logs to the test writer
///
/// Honours `RUST_LOG`, defaulting to `warn`. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
