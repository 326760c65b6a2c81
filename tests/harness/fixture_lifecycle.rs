use std::sync::Arc;
use std::time::{Duration, Instant};

use seatunnel_e2e::environment::{FakeJob, InProcessEnvironment};
use seatunnel_e2e::{
    assert_job_succeeded, ClusterFixture, HarnessConfig, HarnessError, LifecycleState,
    FAKE_SOURCE_TO_FILE_JOB,
};

use crate::common::{
    init_logging, quick_config, scripted_cluster, STUCK_JOB, UNREACHABLE_SINK_JOB,
};

#[tokio::test]
async fn test_fake_source_to_file_succeeds() {
    init_logging();
    let env = scripted_cluster();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());

    fixture.start().await.unwrap();
    let result = fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.unwrap();
    fixture.stop().await.unwrap();

    assert_eq!(result.status_code, 0);
    assert_eq!(result.job.as_str(), FAKE_SOURCE_TO_FILE_JOB);
    assert_job_succeeded(&result);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_failing_pipeline_reports_nonzero_status() {
    init_logging();
    let fixture = ClusterFixture::new(scripted_cluster(), quick_config());

    fixture.start().await.unwrap();
    let result = fixture.submit(UNREACHABLE_SINK_JOB).await.unwrap();
    fixture.stop().await.unwrap();

    assert_ne!(result.status_code, 0);
    assert!(result.stderr.contains("Mkdirs failed"));
}

#[tokio::test]
#[should_panic(expected = "exited with status 1 (expected 0)")]
async fn test_failed_assertion_surfaces_status_code() {
    let fixture = ClusterFixture::new(scripted_cluster(), quick_config());
    fixture.start().await.unwrap();
    let result = fixture.submit(UNREACHABLE_SINK_JOB).await.unwrap();
    fixture.stop().await.unwrap();

    assert_job_succeeded(&result);
}

#[tokio::test]
async fn test_start_then_stop_leaves_nothing_allocated() {
    init_logging();
    let env = scripted_cluster();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());

    fixture.start().await.unwrap();
    assert!(resources.is_live());
    fixture.stop().await.unwrap();

    assert!(!resources.is_live());
    assert_eq!(resources.starts(), 1);
    assert_eq!(resources.stops(), 1);
    assert_eq!(resources.submits(), 0);

    // A second stop is a no-op and does not touch the environment again.
    fixture.stop().await.unwrap();
    assert_eq!(resources.stops(), 1);
    assert_eq!(fixture.state().await, LifecycleState::Stopped);
}

#[tokio::test]
async fn test_stuck_job_times_out_within_bound() {
    init_logging();
    let env = scripted_cluster();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());
    fixture.start().await.unwrap();

    let started = Instant::now();
    let err = fixture.submit(STUCK_JOB).await.unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(err.to_string().contains(STUCK_JOB));
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(5), "submit waited {waited:?}");
    assert_eq!(resources.results(), 0);

    // The stuck job was aborted, so the next one runs alone.
    assert_eq!(resources.aborts(), 1);
    assert_eq!(resources.running_jobs(), 0);
    assert_eq!(fixture.state().await, LifecycleState::JobTerminated);
    assert!(fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.unwrap().is_success());
    assert_eq!(resources.overlapping_submits(), 0);
    fixture.stop().await.unwrap();
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_unabortable_job_blocks_further_submits() {
    init_logging();
    let env = scripted_cluster().with_failing_abort();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());
    fixture.start().await.unwrap();

    assert!(fixture.submit(STUCK_JOB).await.unwrap_err().is_timeout());
    assert_eq!(resources.aborts(), 1);
    assert_eq!(resources.running_jobs(), 1);
    assert_eq!(fixture.state().await, LifecycleState::JobSubmitted);

    let err = fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            state: LifecycleState::JobSubmitted,
            ..
        }
    ));
    assert_eq!(resources.submits(), 1);
    assert_eq!(resources.overlapping_submits(), 0);

    fixture.stop().await.unwrap();
    assert_eq!(resources.running_jobs(), 0);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_failed_stop_is_a_teardown_error() {
    init_logging();
    let env = scripted_cluster().with_failing_stop();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());
    fixture.start().await.unwrap();

    let err = fixture.stop().await.unwrap_err();
    assert!(matches!(err, HarnessError::Teardown(_)));
    assert_eq!(fixture.state().await, LifecycleState::Stopped);

    // The failure is reported once; later stops do not retry it.
    fixture.stop().await.unwrap();
    assert_eq!(resources.stops(), 1);
}

#[tokio::test]
async fn test_hung_stop_is_bounded_by_stop_timeout() {
    init_logging();
    let config = HarnessConfig {
        stop_timeout_secs: 1,
        ..quick_config()
    };
    let env = scripted_cluster().with_stop_duration(Duration::from_secs(30));
    let fixture = ClusterFixture::new(env, config);
    fixture.start().await.unwrap();

    let started = Instant::now();
    let err = fixture.stop().await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, HarnessError::Teardown(ref m) if m.contains("did not stop within")));
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(5), "stop waited {waited:?}");
    assert_eq!(fixture.state().await, LifecycleState::Stopped);
}

#[tokio::test]
async fn test_each_submit_yields_exactly_one_result() {
    let env = scripted_cluster();
    let resources = env.resources();
    let fixture = ClusterFixture::new(env, quick_config());
    fixture.start().await.unwrap();

    let jobs = [
        FAKE_SOURCE_TO_FILE_JOB,
        UNREACHABLE_SINK_JOB,
        FAKE_SOURCE_TO_FILE_JOB,
    ];
    let mut results = Vec::new();
    for job in jobs {
        results.push(fixture.submit(job).await.unwrap());
    }
    fixture.stop().await.unwrap();

    assert_eq!(resources.submits(), jobs.len());
    assert_eq!(resources.results(), jobs.len());
    let observed: Vec<(&str, i64)> = results
        .iter()
        .map(|r| (r.job.as_str(), r.status_code))
        .collect();
    assert_eq!(
        observed,
        vec![
            (FAKE_SOURCE_TO_FILE_JOB, 0),
            (UNREACHABLE_SINK_JOB, 1),
            (FAKE_SOURCE_TO_FILE_JOB, 0),
        ]
    );
}

#[tokio::test]
async fn test_submit_outside_ready_states_is_rejected() {
    let fixture = ClusterFixture::new(scripted_cluster(), quick_config());

    let err = fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            state: LifecycleState::NotStarted,
            ..
        }
    ));

    fixture.start().await.unwrap();
    fixture.stop().await.unwrap();

    let err = fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::InvalidState {
            state: LifecycleState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_submission_fault_is_an_infrastructure_error() {
    let env = InProcessEnvironment::new()
        .with_job("/file/broken_launcher.conf", FakeJob::Fault("exec failed".into()));
    let fixture = ClusterFixture::new(env, quick_config());
    fixture.start().await.unwrap();

    let err = fixture.submit("/file/broken_launcher.conf").await.unwrap_err();
    assert!(matches!(err, HarnessError::Submission(_)));
    assert!(!err.is_timeout());

    let err = fixture.submit("/file/not_there.conf").await.unwrap_err();
    assert!(matches!(err, HarnessError::JobDefinitionNotFound(_)));

    fixture.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_are_serialized() {
    init_logging();
    let env = scripted_cluster().with_job_duration(Duration::from_millis(50));
    let resources = env.resources();
    let fixture = Arc::new(ClusterFixture::new(env, quick_config()));
    fixture.start().await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let fixture = fixture.clone();
            tokio::spawn(async move { fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_success());
    }
    fixture.stop().await.unwrap();

    assert_eq!(resources.results(), 4);
    assert_eq!(resources.peak_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_outstanding_submit() {
    init_logging();
    let env = scripted_cluster().with_job_duration(Duration::from_millis(300));
    let resources = env.resources();
    let fixture = Arc::new(ClusterFixture::new(env, quick_config()));
    fixture.start().await.unwrap();

    let submitting = {
        let fixture = fixture.clone();
        tokio::spawn(async move { fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.stop().await.unwrap();

    let result = submitting.await.unwrap().unwrap();
    assert!(result.is_success());
    assert!(!resources.stopped_during_submit());
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_scoped_fixture_tears_down_after_body() {
    let env = scripted_cluster();
    let resources = env.resources();

    let status = ClusterFixture::scoped(env, quick_config(), |fixture| async move {
        assert_eq!(fixture.state().await, LifecycleState::EnvironmentReady);
        fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await.map(|r| r.status_code)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(status, 0);
    assert_eq!(resources.stops(), 1);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_scoped_fixture_tears_down_after_error() {
    let env = scripted_cluster();
    let resources = env.resources();

    let outcome = ClusterFixture::scoped(env, quick_config(), |fixture| async move {
        fixture.submit(STUCK_JOB).await
    })
    .await
    .unwrap();

    assert!(outcome.unwrap_err().is_timeout());
    assert_eq!(resources.stops(), 1);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_scoped_fixture_tears_down_after_panic() {
    let env = scripted_cluster();
    let resources = env.resources();

    let joined = tokio::spawn(async move {
        ClusterFixture::scoped(env, quick_config(), |fixture| async move {
            let result = fixture.submit(UNREACHABLE_SINK_JOB).await.unwrap();
            assert_job_succeeded(&result);
        })
        .await
    })
    .await;

    let panic = joined.unwrap_err();
    assert!(panic.is_panic());
    assert_eq!(resources.submits(), 1);
    assert_eq!(resources.stops(), 1);
    assert!(!resources.is_live());
}

#[tokio::test]
async fn test_scoped_fixture_reports_teardown_error_after_success() {
    let env = scripted_cluster().with_failing_stop();
    let resources = env.resources();

    let outcome = ClusterFixture::scoped(env, quick_config(), |fixture| async move {
        fixture.submit(FAKE_SOURCE_TO_FILE_JOB).await
    })
    .await;

    assert!(matches!(outcome, Err(HarnessError::Teardown(_))));
    assert_eq!(resources.results(), 1);
    assert_eq!(resources.stops(), 1);
}

#[tokio::test]
async fn test_scoped_fixture_start_failure_skips_body() {
    let env = scripted_cluster().with_failing_starts(1);
    let resources = env.resources();

    let outcome = ClusterFixture::scoped(env, quick_config(), |_fixture| async move {
        panic!("body must not run when the environment is unavailable");
    })
    .await;

    let err = outcome.unwrap_err();
    assert!(matches!(err, HarnessError::EnvironmentUnavailable(_)));
    assert_eq!(resources.starts(), 1);
    assert!(!resources.is_live());
}
