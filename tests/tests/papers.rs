mod utils;
use utils::*;

use demos::Script;
use mock_service::AppState;
use std::time::Duration;
use trapeze::prelude::*;

fn quick_run() -> RunConfig {
    RunConfig::default()
        .tick_interval(Duration::from_millis(250))
        .bucket_width(Duration::from_secs(1))
        .drain_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn generate_test_papers_passes() {
    let base = serve(AppState::with_generate_latency(Duration::from_millis(20))).await;
    let scenario = demos::scenario(
        Script::GenerateTestPapers,
        &base,
        Some("http://127.0.0.1:8081"),
        "token",
    )
    .unwrap();

    let config = ScenarioConfig::new(
        "generate-test-papers",
        LoadProfile::trapezoidal(4, 4., Duration::from_secs(2)),
    );
    let stats = Engine::new(config)
        .config(quick_run())
        .start(scenario)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(stats.fail_count, 0, "{stats}");
    assert_eq!(stats.aborted_count, 0);
    assert_eq!(stats.abandoned_users, 0);
    assert_eq!(stats.peak_users, 4);

    let summary = stats.transaction("Generate_test_papers").unwrap();
    assert!(summary.pass > 0);
    assert!(summary.latency.min >= Duration::from_millis(5));
}

#[tokio::test]
async fn missing_token_fails_every_transaction() {
    let base = serve(AppState::default()).await;
    let action = Action::builder("papers")
        .transaction(1, demos::generate_paper(&base))
        .build()
        .unwrap();
    let scenario = Scenario::builder("anonymous").action(1, action).build().unwrap();

    let config = ScenarioConfig::new("anonymous", LoadProfile::constant(2, Duration::from_secs(1)));
    let stats = Engine::new(config)
        .config(quick_run().think_time(Duration::from_millis(50)))
        .start(scenario)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(stats.pass_count, 0);
    assert!(stats.fail_count > 0);
    assert_eq!(stats.error_rate(), 1.);
}

#[tokio::test]
async fn failing_setup_retires_users() {
    let base = serve(AppState::default()).await;
    let login = TransactionSpec::new("login").task(TaskSpec::get(format!("{base}/status/500")));
    let action = Action::builder("papers")
        .transaction(1, demos::generate_paper(&base))
        .build()
        .unwrap();
    let scenario = Scenario::builder("login_first")
        .bearer_token("token")
        .setup(login)
        .action(1, action)
        .build()
        .unwrap();

    let config = ScenarioConfig::new("login_first", LoadProfile::constant(3, Duration::from_secs(1)));
    let stats = Engine::new(config)
        .config(quick_run())
        .start(scenario)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(stats.spawned_users, 3);
    assert_eq!(stats.spawn_failures, 3);
    assert_eq!(stats.transaction("generate_paper"), None);
    // The failed setup transaction itself is still recorded.
    assert_eq!(stats.transaction("login").unwrap().fail, 3);
}

#[tokio::test]
async fn slow_transactions_are_abandoned_after_drain_timeout() {
    let base = serve(AppState::default()).await;
    let slow = TransactionSpec::new("slow").task(TaskSpec::get(format!("{base}/delay/ms/5000")));
    let scenario = Scenario::builder("slow")
        .action(1, Action::builder("slow").transaction(1, slow).build().unwrap())
        .build()
        .unwrap();

    let config = ScenarioConfig::new("slow", LoadProfile::constant(2, Duration::from_secs(1)));
    let stats = Engine::new(config)
        .config(quick_run().drain_timeout(Duration::from_millis(500)))
        .start(scenario)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(stats.abandoned_users, 2);
    assert_eq!(stats.aborted_count, 2);
    assert_eq!(stats.pass_count, 0);
    assert!(stats.elapsed < Duration::from_secs(4));
}

#[tokio::test]
async fn stop_interrupts_a_long_profile() {
    let base = serve(AppState::default()).await;
    let scenario = demos::scenario(Script::GeneratePaper, &base, None, "token").unwrap();

    let config = ScenarioConfig::new(
        "long",
        LoadProfile::trapezoidal(200, 5., Duration::from_secs(600)),
    );
    let handle = Engine::new(config).config(quick_run()).start(scenario).unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let status = handle.status();
    assert!(status.live_users >= 5);
    assert!(status.live_users <= 10);

    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.abandoned_users, 0);
    assert!(stats.elapsed < Duration::from_secs(10));
    assert!(stats.pass_count > 0);
}

#[cfg(feature = "integration")]
mod integration {
    use super::*;
    use std::num::NonZeroU32;

    #[tokio::test]
    async fn rate_capped_run_stays_under_service_limit() {
        let base = serve(AppState::default()).await;
        let limited = TransactionSpec::new("limited")
            .task(TaskSpec::get(format!("{base}/limited/50/delay/ms/5")));
        let scenario = Scenario::builder("limited")
            .action(1, Action::builder("limited").transaction(1, limited).build().unwrap())
            .build()
            .unwrap();

        let config = ScenarioConfig::new(
            "limited",
            LoadProfile::trapezoidal(20, 10., Duration::from_secs(30)),
        );
        let stats = Engine::new(config)
            .config(RunConfig::default().max_tps(NonZeroU32::new(40).unwrap()))
            .start(scenario)
            .unwrap()
            .await
            .unwrap();

        assert!(stats.pass_count > 500);
        assert!(dbg!(stats.error_rate()) < 0.01);
    }

    #[tokio::test]
    async fn sustained_generate_load() {
        let base = serve(AppState::with_generate_latency(Duration::from_millis(50))).await;
        let scenario = demos::scenario(Script::GenerateTestPapers, &base, None, "token").unwrap();

        let config = ScenarioConfig::new(
            "sustained",
            LoadProfile::trapezoidal(50, 5., Duration::from_secs(60)),
        );
        let stats = Engine::new(config).start(scenario).unwrap().await.unwrap();

        assert_eq!(stats.fail_count, 0, "{stats}");
        assert_eq!(stats.peak_users, 50);
        let summary = stats.transaction("Generate_test_papers").unwrap();
        assert!(summary.latency.p99 >= summary.latency.p50);
    }
}
