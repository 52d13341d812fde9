//! End-to-end scenarios: dispatcher, guards and simulated sources together.

use crate::failure::{Behavior, OutcomeModel, ScriptedLoader};
use crate::harness::{SimConfig, SimHarness};
use crate::init_test_tracing;
use crate::seed::SimSeed;
use apex_core::{
    BreakerConfig, DispatcherConfig, PriorityWeightedConfig, RateLimitConfig, ResultTag,
    SourceSpec,
};
use apex_runtime::CircuitState;
use std::time::Duration;

fn spec(id: &str, priority: i64) -> SourceSpec {
    SourceSpec::new(id).with_priority(priority)
}

#[tokio::test(start_paused = true)]
async fn scenario_waterfall_skips_ahead_in_priority_order() {
    init_test_tracing();
    let mut harness = SimHarness::new(SimConfig::default().with_rounds(1)).unwrap();
    let a = ScriptedLoader::always(Behavior::fill(3.0));
    let b = ScriptedLoader::always(Behavior::no_fill());
    let c = ScriptedLoader::always(Behavior::fill(1.0));
    harness.add_source(spec("A", 10), a.clone()).unwrap();
    harness.add_source(spec("B", 1), b.clone()).unwrap();
    harness.add_source(spec("C", 5), c.clone()).unwrap();

    let record = harness.run().await.unwrap();

    let round = &record.rounds[0];
    assert_eq!(round.attempted, vec!["B", "C"]);
    assert_eq!(round.tags, vec![ResultTag::NoFill, ResultTag::Success]);
    assert_eq!(round.winner.as_deref(), Some("C"));
    assert_eq!(round.bid_micros, 1_000_000);
    assert_eq!(a.invocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_timeout_falls_through_and_releases_loader() {
    init_test_tracing();
    let mut harness = SimHarness::new(SimConfig::default().with_rounds(3)).unwrap();
    let slow = ScriptedLoader::always(Behavior::Hang);
    harness
        .add_source(spec("slow", 0).with_timeout(Duration::from_millis(200)), slow.clone())
        .unwrap();
    harness
        .add_source(spec("backup", 1), ScriptedLoader::always(Behavior::fill(0.4).after(30)))
        .unwrap();

    let record = harness.run().await.unwrap();

    for round in &record.rounds {
        assert_eq!(round.tags, vec![ResultTag::Timeout, ResultTag::Success]);
        assert_eq!(round.duration_ms, 230);
        assert_eq!(round.winner.as_deref(), Some("backup"));
    }
    assert_eq!(slow.invocations(), 3);
    assert_eq!(record.metrics.timeouts, 3);

    let stats = harness.dispatcher().get_stats("slow").unwrap();
    assert_eq!(stats.timeouts, 3);
    assert_eq!(stats.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn scenario_no_fill_never_trips_breaker() {
    let mut harness = SimHarness::new(SimConfig::default().with_rounds(100)).unwrap();
    let quiet = ScriptedLoader::always(Behavior::no_fill().after(5));
    harness.add_source(spec("quiet", 0), quiet.clone()).unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(quiet.invocations(), 100);
    assert_eq!(record.fill_rate(), 0.0);
    assert!(record.transitions.is_empty());
    assert_eq!(record.metrics.exhausted, 100);
    assert_eq!(harness.dispatcher().breaker_state("quiet"), CircuitState::Closed);

    let stats = harness.dispatcher().get_stats("quiet").unwrap();
    assert_eq!(stats.no_fills, 100);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_panicking_adapter_is_isolated() {
    let mut harness = SimHarness::new(SimConfig::default().with_rounds(10)).unwrap();
    let broken = ScriptedLoader::always(Behavior::Panic);
    harness.add_source(spec("broken", 0), broken.clone()).unwrap();
    harness
        .add_source(spec("steady", 1), ScriptedLoader::always(Behavior::fill(0.8)))
        .unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(record.win_count("steady"), 10);
    assert_eq!(broken.invocations(), 5);
    assert!(record.rounds[..5].iter().all(|r| r.tags[0] == ResultTag::Error));
    assert!(record.rounds[5..].iter().all(|r| r.tags[0] == ResultTag::Skipped));
    assert_eq!(record.transitions.len(), 1);
    assert_eq!(record.transitions[0].to, CircuitState::Open);
    assert_eq!(record.metrics.errors, 5);
    assert_eq!(record.metrics.skipped_circuit_open, 5);
}

#[tokio::test(start_paused = true)]
async fn scenario_rate_limit_sheds_bursts() {
    let dispatcher = DispatcherConfig::default()
        .with_rate_limit(RateLimitConfig::default().with_max_requests_per_second(4));
    let config = SimConfig::default()
        .with_rounds(10)
        .with_round_gap(0)
        .with_dispatcher(dispatcher);
    let mut harness = SimHarness::new(config).unwrap();
    let hot = ScriptedLoader::always(Behavior::fill(1.0));
    harness.add_source(spec("hot", 0), hot.clone()).unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(hot.invocations(), 4);
    assert_eq!(record.win_count("hot"), 4);
    assert_eq!(record.metrics.skipped_rate_limited, 6);
    assert!(record.rounds[4..].iter().all(|r| r.tags == vec![ResultTag::Skipped]));
}

#[tokio::test(start_paused = true)]
async fn scenario_breaker_failures_then_recovery() {
    let dispatcher = DispatcherConfig::default().with_breaker(
        BreakerConfig::default()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(1))
            .with_half_open_max_attempts(2),
    );
    let config = SimConfig::default()
        .with_rounds(20)
        .with_round_gap(250)
        .with_dispatcher(dispatcher);
    let mut harness = SimHarness::new(config).unwrap();
    let flaky = ScriptedLoader::new(vec![
        Behavior::error(),
        Behavior::error(),
        Behavior::fill(1.0),
    ]);
    harness.add_source(spec("flaky", 0), flaky.clone()).unwrap();

    let record = harness.run().await.unwrap();

    let states: Vec<_> = record.transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        states,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    // Opened at 250ms, probes from 1250ms (round 5), closed after two fills.
    assert_eq!(record.rounds_attempting("flaky").len(), 20);
    assert!(record.rounds[2..5].iter().all(|r| r.winner.is_none()));
    assert!(record.rounds[5..].iter().all(|r| r.winner.as_deref() == Some("flaky")));
    assert_eq!(flaky.invocations(), 17);
}

#[tokio::test(start_paused = true)]
async fn scenario_weighted_share_follows_weights() {
    let dispatcher = DispatcherConfig::default()
        .with_rate_limit(RateLimitConfig::default().with_max_requests_per_second(100));
    let config = SimConfig::new(SimSeed::from_string("weights"))
        .with_rounds(400)
        .with_dispatcher(dispatcher)
        .weighted(PriorityWeightedConfig::default());
    let mut harness = SimHarness::new(config).unwrap();
    harness
        .add_source(spec("heavy", 0).with_weight(3.0), ScriptedLoader::always(Behavior::fill(1.0)))
        .unwrap();
    harness
        .add_source(spec("light", 0).with_weight(1.0), ScriptedLoader::always(Behavior::fill(1.0)))
        .unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(record.fill_rate(), 1.0);
    let heavy = record.win_count("heavy") as f64 / 400.0;
    assert!((0.6..0.9).contains(&heavy), "heavy share {heavy}");
    assert_eq!(record.win_count("heavy") + record.win_count("light"), 400);
}

#[tokio::test(start_paused = true)]
async fn scenario_preload_keeps_priority_over_speed() {
    let weighted = PriorityWeightedConfig::default().with_parallel_preload(true);
    let config = SimConfig::default().with_rounds(5).weighted(weighted);
    let mut harness = SimHarness::new(config).unwrap();
    harness
        .add_source(spec("premium", 0), ScriptedLoader::always(Behavior::fill(2.0).after(300)))
        .unwrap();
    let fast = ScriptedLoader::always(Behavior::fill(0.3).after(10));
    harness.add_source(spec("fast", 1), fast.clone()).unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(record.win_count("premium"), 5);
    assert_eq!(record.win_count("fast"), 0);
    assert!(record.rounds.iter().all(|r| r.duration_ms == 300));
    assert_eq!(fast.invocations(), 5);
}

#[tokio::test(start_paused = true)]
async fn scenario_seeded_runs_replay_exactly() {
    async fn play(seed: &str) -> crate::record::SimRecord {
        let config = SimConfig::new(SimSeed::from_string(seed))
            .with_rounds(60)
            .weighted(PriorityWeightedConfig::default());
        let mut harness = SimHarness::new(config).unwrap();
        harness
            .add_model_source(
                spec("net-a", 0).with_weight(2.0),
                OutcomeModel::new(0.6).with_error_probability(0.05),
            )
            .unwrap();
        harness
            .add_model_source(spec("net-b", 0), OutcomeModel::new(0.4))
            .unwrap();
        harness
            .add_model_source(spec("house", 1), OutcomeModel::new(1.0).with_bid_range(0.1, 0.1))
            .unwrap();
        harness.run().await.unwrap()
    }

    let first = play("replay").await;
    let second = play("replay").await;
    assert_eq!(first.rounds, second.rounds);
    assert_eq!(first.wins, second.wins);
    assert_eq!(first.metrics, second.metrics);
}

#[tokio::test(start_paused = true)]
async fn scenario_model_fill_rate_converges() {
    let mut harness = SimHarness::new(SimConfig::default().with_rounds(500)).unwrap();
    let loader = harness
        .add_model_source(spec("sampled", 0), OutcomeModel::new(0.7))
        .unwrap();

    let record = harness.run().await.unwrap();

    assert_eq!(loader.invocations(), 500);
    assert!((0.6..0.8).contains(&record.fill_rate()), "fill rate {}", record.fill_rate());
    let stats = harness.dispatcher().get_stats("sampled").unwrap();
    assert_eq!(stats.successes, record.win_count("sampled"));
}
