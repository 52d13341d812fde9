//! Shared fixtures for the runtime's unit tests.

use crate::breaker::BreakerRegistry;
use crate::executor::AttemptExecutor;
use crate::limiter::RateLimiter;
use crate::stats::StatsTracker;
use apex_core::{
    loader_fn, DispatcherConfig, MonotonicClock, SharedLoader, Source, SourceResult, SourceSpec,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Executor over fresh guard state on a tokio-driven clock
pub fn executor(config: &DispatcherConfig) -> AttemptExecutor {
    let clock = MonotonicClock::shared();
    AttemptExecutor::new(
        Arc::new(StatsTracker::new(Arc::clone(&clock))),
        Arc::new(BreakerRegistry::new(config.breaker.clone(), Arc::clone(&clock))),
        Arc::new(RateLimiter::new(&config.rate_limit, Arc::clone(&clock))),
        clock,
    )
}

/// Order in which loaders were entered
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Loader that logs its id, waits `delay`, then returns `result`
    pub fn loader(&self, id: &str, delay: Duration, result: SourceResult) -> SharedLoader {
        let log = Arc::clone(&self.0);
        let id = id.to_string();
        loader_fn(move |_cancel| {
            log.lock().push(id.clone());
            let result = result.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
        })
    }

    /// Loader that logs its id and never resolves
    pub fn hanging(&self, id: &str) -> SharedLoader {
        let log = Arc::clone(&self.0);
        let id = id.to_string();
        loader_fn(move |_cancel| {
            log.lock().push(id.clone());
            std::future::pending::<SourceResult>()
        })
    }
}

pub fn fill(bid: f64) -> SourceResult {
    SourceResult::success(Bytes::from_static(b"creative"), bid)
}

pub fn source(id: &str, priority: i64, loader: SharedLoader) -> Source {
    SourceSpec::new(id).with_priority(priority).into_source(loader).unwrap()
}
