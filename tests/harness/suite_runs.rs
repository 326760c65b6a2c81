use std::path::Path;
use std::sync::Arc;

use seatunnel_e2e::environment::{FakeResources, InProcessEnvironment};
use seatunnel_e2e::suite::{EXIT_ALL_PASSED, EXIT_HARNESS_ERROR, EXIT_SCENARIO_FAILED};
use seatunnel_e2e::{
    EnvironmentReuse, HarnessConfig, Scenario, ScenarioManifest, Suite, Verdict,
    FAKE_SOURCE_TO_FILE_JOB,
};

use crate::common::{
    init_logging, quick_config, scripted_cluster, STUCK_JOB, UNREACHABLE_SINK_JOB,
};

fn suite_over_shared_counters(
    config: HarnessConfig,
    failing_starts: u32,
) -> (Suite<InProcessEnvironment>, Arc<FakeResources>) {
    let resources = Arc::new(FakeResources::default());
    let counters = resources.clone();
    let suite = Suite::new(config, move || {
        Ok(scripted_cluster()
            .with_resources(counters.clone())
            .with_failing_starts(failing_starts))
    });
    (suite, resources)
}

fn both_pipelines() -> Vec<Scenario> {
    vec![
        Scenario::new("fake source to file", FAKE_SOURCE_TO_FILE_JOB),
        Scenario::new("unreachable sink", UNREACHABLE_SINK_JOB).expecting(1),
    ]
}

#[tokio::test]
async fn test_shared_environment_is_started_once() {
    init_logging();
    let (mut suite, resources) = suite_over_shared_counters(quick_config(), 0);

    let report = suite.run_all(&both_pipelines()).await;
    assert_eq!(report.count(Verdict::Passed), 2);
    assert_eq!(resources.starts(), 1);
    assert!(resources.is_live());

    suite.teardown().await.unwrap();
    assert_eq!(resources.stops(), 1);
    assert!(!resources.is_live());
    assert_eq!(report.exit_code(), EXIT_ALL_PASSED);
}

#[tokio::test]
async fn test_per_scenario_environments_are_fresh() {
    init_logging();
    let config = HarnessConfig {
        environment_reuse: EnvironmentReuse::PerScenario,
        ..quick_config()
    };
    let (mut suite, resources) = suite_over_shared_counters(config, 0);

    let report = suite.run_all(&both_pipelines()).await;
    assert_eq!(report.count(Verdict::Passed), 2);
    assert_eq!(resources.starts(), 2);
    assert_eq!(resources.stops(), 2);
    assert!(!resources.is_live());

    suite.teardown().await.unwrap();
    assert_eq!(resources.stops(), 2);
}

#[tokio::test]
async fn test_shared_start_failure_errors_every_scenario() {
    init_logging();
    let (mut suite, resources) = suite_over_shared_counters(quick_config(), 1);

    let report = suite.run_all(&both_pipelines()).await;
    assert_eq!(report.count(Verdict::Errored), 2);
    assert_eq!(report.count(Verdict::Failed), 0);
    assert_eq!(resources.starts(), 1);
    assert!(report.scenarios[1]
        .message
        .as_deref()
        .unwrap()
        .contains("shared environment failed to start"));
    assert_eq!(report.exit_code(), EXIT_HARNESS_ERROR);

    suite.teardown().await.unwrap();
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_wrong_status_is_failed_not_errored() {
    let (mut suite, _resources) = suite_over_shared_counters(quick_config(), 0);

    let scenario = Scenario::new("unreachable sink expected to succeed", UNREACHABLE_SINK_JOB);
    let report = suite.run_all(&[scenario]).await;
    suite.teardown().await.unwrap();

    let scenario = &report.scenarios[0];
    assert_eq!(scenario.verdict, Verdict::Failed);
    assert_eq!(scenario.status_code, Some(1));
    assert_eq!(scenario.expected_status, 0);
    assert_eq!(report.exit_code(), EXIT_SCENARIO_FAILED);
}

#[tokio::test]
async fn test_timeout_is_errored_and_later_scenarios_still_run() {
    init_logging();
    let (mut suite, resources) = suite_over_shared_counters(quick_config(), 0);

    let report = suite
        .run_all(&[
            Scenario::new("stuck", STUCK_JOB),
            Scenario::new("fake source to file", FAKE_SOURCE_TO_FILE_JOB),
        ])
        .await;
    suite.teardown().await.unwrap();

    assert_eq!(report.scenarios[0].verdict, Verdict::Errored);
    assert_eq!(report.scenarios[1].verdict, Verdict::Passed);
    assert_eq!(resources.results(), 1);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_shared_environment_is_replaced_after_unabortable_job() {
    init_logging();
    let resources = Arc::new(FakeResources::default());
    let counters = resources.clone();
    let mut suite = Suite::new(quick_config(), move || {
        Ok(scripted_cluster()
            .with_resources(counters.clone())
            .with_failing_abort())
    });

    let report = suite
        .run_all(&[
            Scenario::new("stuck", STUCK_JOB),
            Scenario::new("fake source to file", FAKE_SOURCE_TO_FILE_JOB),
        ])
        .await;
    suite.teardown().await.unwrap();

    assert_eq!(report.scenarios[0].verdict, Verdict::Errored);
    assert_eq!(report.scenarios[1].verdict, Verdict::Passed);
    assert_eq!(resources.starts(), 2);
    assert_eq!(resources.stops(), 2);
    assert_eq!(resources.overlapping_submits(), 0);
    assert!(report.teardown_errors.is_empty());
}

#[tokio::test]
async fn test_per_scenario_stop_failure_is_a_harness_error() {
    init_logging();
    let config = HarnessConfig {
        environment_reuse: EnvironmentReuse::PerScenario,
        ..quick_config()
    };
    let mut suite = Suite::new(config, || Ok(scripted_cluster().with_failing_stop()));

    let report = suite
        .run_all(&[Scenario::new("fake source to file", FAKE_SOURCE_TO_FILE_JOB)])
        .await;
    suite.teardown().await.unwrap();

    assert_eq!(report.count(Verdict::Passed), 1);
    assert_eq!(report.teardown_errors.len(), 1);
    assert!(report.teardown_errors[0].starts_with("fake source to file: "));
    assert_eq!(report.exit_code(), EXIT_HARNESS_ERROR);
}

#[tokio::test]
async fn test_scenarios_after_teardown_are_errored() {
    let (mut suite, resources) = suite_over_shared_counters(quick_config(), 0);
    suite.teardown().await.unwrap();

    let report = suite.run_all(&both_pipelines()).await;
    assert_eq!(report.count(Verdict::Errored), 2);
    assert_eq!(resources.starts(), 0);
}

#[tokio::test]
async fn test_bundled_manifest_runs_against_scripted_cluster() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("resources/scenarios.toml");
    let manifest = ScenarioManifest::load(&path).unwrap();
    assert!(manifest
        .scenarios
        .iter()
        .any(|s| s.job.as_str() == FAKE_SOURCE_TO_FILE_JOB));

    let mut suite = Suite::new(quick_config(), || Ok(scripted_cluster()));
    let report = suite.run_all(&manifest.scenarios).await;
    suite.teardown().await.unwrap();

    assert_eq!(report.count(Verdict::Passed), manifest.scenarios.len());
}

#[tokio::test]
async fn test_scenario_check_maps_to_test_semantics() {
    let mut suite = Suite::new(quick_config(), || Ok(InProcessEnvironment::new()));
    let fixture = suite.shared_fixture().await.unwrap();

    let outcome = Scenario::new("unknown job", "/file/unknown.conf")
        .run(&*fixture)
        .await;
    assert_eq!(outcome.verdict(), Verdict::Errored);
    assert!(outcome.check().is_err());

    suite.teardown().await.unwrap();
}
