//! Recording of simulation runs for reproducibility.

use crate::error::SimResult;
use crate::seed::SimSeed;
use apex_core::{ExecutionResult, ResultTag};
use apex_runtime::{BreakerTransition, CircuitState, DispatchMetrics, DispatchMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mediation round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round index, from zero
    pub round: u64,
    /// Winning source, if the round filled
    pub winner: Option<String>,
    /// Winning bid in micros, zero without a fill
    pub bid_micros: u64,
    /// Sources in the order their attempts resolved
    pub attempted: Vec<String>,
    /// Result tag of each attempt, aligned with `attempted`
    pub tags: Vec<ResultTag>,
    /// Wall time of the round
    pub duration_ms: u64,
}

impl RoundRecord {
    /// Summarize one dispatch call
    #[must_use]
    pub fn from_result(round: u64, result: &ExecutionResult) -> Self {
        Self {
            round,
            winner: result.winner().map(|id| id.as_str().to_string()),
            bid_micros: result.result.bid_micros(),
            attempted: result.attempted_ids().into_iter().map(str::to_string).collect(),
            tags: result.attempts.iter().map(|a| a.result_tag).collect(),
            duration_ms: result.total_duration_ms,
        }
    }
}

/// A breaker transition seen during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Source whose breaker moved
    pub source_id: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Clock reading in milliseconds
    pub at_ms: u64,
}

impl From<&BreakerTransition> for TransitionRecord {
    fn from(t: &BreakerTransition) -> Self {
        Self {
            source_id: t.source_id.as_str().to_string(),
            from: t.from,
            to: t.to,
            at_ms: t.at.as_millis(),
        }
    }
}

/// Record of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Seed used for the run
    pub seed: SimSeed,
    /// Scheduler under test
    pub mode: DispatchMode,
    /// Rounds in execution order
    pub rounds: Vec<RoundRecord>,
    /// Fills per source
    pub wins: BTreeMap<String, u64>,
    /// Breaker transitions in the order they fired
    pub transitions: Vec<TransitionRecord>,
    /// Dispatcher counters at the end of the run
    pub metrics: DispatchMetrics,
}

impl SimRecord {
    /// Create an empty record
    #[must_use]
    pub fn new(seed: SimSeed, mode: DispatchMode) -> Self {
        Self {
            seed,
            mode,
            rounds: Vec::new(),
            wins: BTreeMap::new(),
            transitions: Vec::new(),
            metrics: DispatchMetrics::default(),
        }
    }

    /// Append a round and credit its winner
    pub fn push_round(&mut self, round: RoundRecord) {
        if let Some(winner) = &round.winner {
            *self.wins.entry(winner.clone()).or_default() += 1;
        }
        self.rounds.push(round);
    }

    /// Number of rounds played
    #[must_use]
    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }

    /// Winner of every round, `None` for unfilled rounds
    #[must_use]
    pub fn winners(&self) -> Vec<Option<&str>> {
        self.rounds.iter().map(|r| r.winner.as_deref()).collect()
    }

    /// Fills credited to one source
    #[must_use]
    pub fn win_count(&self, source_id: &str) -> u64 {
        self.wins.get(source_id).copied().unwrap_or(0)
    }

    /// Share of rounds that filled (0.0 - 1.0)
    #[must_use]
    pub fn fill_rate(&self) -> f64 {
        if self.rounds.is_empty() {
            return 0.0;
        }
        let filled = self.rounds.iter().filter(|r| r.winner.is_some()).count();
        filled as f64 / self.rounds.len() as f64
    }

    /// Rounds in which `source_id` was attempted
    #[must_use]
    pub fn rounds_attempting(&self, source_id: &str) -> Vec<u64> {
        self.rounds
            .iter()
            .filter(|r| r.attempted.iter().any(|id| id == source_id))
            .map(|r| r.round)
            .collect()
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails
    pub fn from_json(json: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
