//! End-to-end scenarios against the stub core binary.

use relaytest_common::{Protocol, ProxyConfig, TestResult};
use relaytest_e2e::{scenario_config, socks_candidates, StubEnv};
use relaytest_metrics::Metrics;
use relaytest_tester::{BatchDriver, DriverOutcome, ShutdownSupervisor, Tester};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn happy_path_three_candidates_succeed() {
    let _env = StubEnv::lock();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = scenario_config(&scratch, 25000, 25010);
    config.max_workers = 2;

    let metrics = Arc::new(Metrics::new());
    let tester = Tester::new(config, Arc::clone(&metrics)).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, socks_candidates(3)).await;

    assert_eq!(results.len(), 3);
    for r in &results {
        assert_eq!(r.result, TestResult::Success, "message: {}", r.message);
        assert!(r.config.local_port.is_some());
    }
    assert_eq!(tester.ports().outstanding(), 0);
    assert_eq!(metrics.active_processes(), 0);

    let snap = metrics.snapshot();
    assert_eq!(snap.total_tests, 3);
    assert_eq!(snap.successful_tests, 3);
    assert!(snap.avg_response_time_seconds >= 0.0);
}

#[tokio::test]
async fn single_port_range_serializes_but_all_succeed() {
    let _env = StubEnv::lock();
    let scratch = tempfile::tempdir().unwrap();
    let config = scenario_config(&scratch, 25020, 25021);

    let metrics = Arc::new(Metrics::new());
    let tester = Tester::new(config, metrics).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, socks_candidates(5)).await;

    assert_eq!(results.len(), 5);
    for r in &results {
        assert_eq!(r.result, TestResult::Success, "message: {}", r.message);
        assert_eq!(r.config.local_port, Some(25020));
    }
    assert_eq!(tester.ports().outstanding(), 0);
}

#[tokio::test]
async fn slow_probe_is_classified_timeout() {
    let env = StubEnv::lock();
    env.set("STUB_RESPONSE_DELAY_MS", "10000");
    let scratch = tempfile::tempdir().unwrap();
    let mut config = scenario_config(&scratch, 25030, 25035);
    config.timeout = Duration::from_secs(1);

    let metrics = Arc::new(Metrics::new());
    let tester = Tester::new(config, Arc::clone(&metrics)).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, socks_candidates(1)).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, TestResult::Timeout);
    assert_eq!(results[0].response_time_ms, 0);
    assert_eq!(tester.ports().outstanding(), 0);
    assert_eq!(metrics.active_processes(), 0);
}

#[tokio::test]
async fn exiting_core_is_classified_launch_failed() {
    let env = StubEnv::lock();
    env.set("STUB_EXIT_EARLY", "1");
    let scratch = tempfile::tempdir().unwrap();
    let config = scenario_config(&scratch, 25040, 25045);

    let metrics = Arc::new(Metrics::new());
    let tester = Tester::new(config, Arc::clone(&metrics)).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, socks_candidates(2)).await;

    assert_eq!(results.len(), 2);
    for r in &results {
        assert_eq!(r.result, TestResult::LaunchFailed, "message: {}", r.message);
        // The stub's stderr tail surfaces in the failure message.
        assert!(r.message.contains("exiting early"), "message: {}", r.message);
    }
    assert_eq!(metrics.active_processes(), 0);
}

#[tokio::test]
async fn never_binding_core_is_classified_port_conflict() {
    let env = StubEnv::lock();
    env.set("STUB_STARTUP_DELAY_MS", "5000");
    let scratch = tempfile::tempdir().unwrap();
    let config = scenario_config(&scratch, 25050, 25055);

    let metrics = Arc::new(Metrics::new());
    let tester = Tester::new(config, Arc::clone(&metrics)).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, socks_candidates(1)).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, TestResult::PortConflict, "message: {}", results[0].message);
    assert_eq!(tester.ports().outstanding(), 0);
    assert_eq!(metrics.active_processes(), 0);
}

#[tokio::test]
async fn drain_returns_full_slice_of_success_or_cancelled() {
    let env = StubEnv::lock();
    env.set("STUB_RESPONSE_DELAY_MS", "2000");
    let scratch = tempfile::tempdir().unwrap();
    let mut config = scenario_config(&scratch, 25060, 25080);
    config.max_workers = 12;
    config.graceful_timeout = Duration::from_secs(1);

    let metrics = Arc::new(Metrics::new());
    let supervisor = ShutdownSupervisor::new(config.graceful_timeout);
    let tester = Tester::new(config, Arc::clone(&metrics))
        .unwrap()
        .with_abort_token(supervisor.abort_token());

    let drain_trigger = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            supervisor.begin_drain();
        })
    };

    let started = Instant::now();
    let results = tester
        .test_batch(&supervisor.batch_token(), 1, socks_candidates(12))
        .await;
    let elapsed = started.elapsed();
    drain_trigger.await.unwrap();

    assert_eq!(results.len(), 12);
    for r in &results {
        assert!(
            matches!(r.result, TestResult::Success | TestResult::Cancelled),
            "unexpected result {:?}: {}",
            r.result,
            r.message
        );
    }
    // Cancellation at 0.5 s plus a 1 s drain window, with startup slack.
    assert!(elapsed < Duration::from_secs(4), "drain took {:?}", elapsed);
    assert_eq!(tester.ports().outstanding(), 0);
    assert_eq!(metrics.active_processes(), 0);
    assert!(supervisor.interrupted());
}

#[tokio::test]
async fn driver_persists_each_batch_file() {
    let _env = StubEnv::lock();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = scenario_config(&scratch, 25090, 25100);
    config.batch_size = 2;

    let results_dir = config.results_dir();
    let tester = Tester::new(config, Arc::new(Metrics::new())).unwrap();
    let driver = BatchDriver::new(tester);
    let token = CancellationToken::new();

    let report = driver.run(&token, socks_candidates(4)).await.unwrap();

    assert_eq!(report.outcome, DriverOutcome::Completed);
    assert_eq!(report.batches, 2);
    assert_eq!(report.total, 4);
    assert_eq!(report.successful, 4);

    for id in 1..=2 {
        let path = results_dir.join(format!("result_{}.json", id));
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["result"], "success");
    }
}

#[tokio::test]
async fn mixed_protocol_batch_uses_matching_inbounds() {
    let _env = StubEnv::lock();
    let scratch = tempfile::tempdir().unwrap();
    let config = scenario_config(&scratch, 25110, 25120);

    let mut candidates = socks_candidates(1);
    candidates.push(ProxyConfig::new(
        "http-node",
        Protocol::Http,
        "192.0.2.11",
        8080,
    ));

    let tester = Tester::new(config, Arc::new(Metrics::new())).unwrap();
    let token = CancellationToken::new();

    let results = tester.test_batch(&token, 1, candidates).await;

    assert_eq!(results.len(), 2);
    for r in &results {
        assert_eq!(r.result, TestResult::Success, "{}: {}", r.config.tag, r.message);
    }
}
