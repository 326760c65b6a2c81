//! Process-wide fixture ownership for a run of scenarios.
//!
//! A [`Suite`] is created when the run begins and torn down explicitly when it
//! ends; there is no hidden static. With [`EnvironmentReuse::Shared`] the
//! suite starts one environment lazily on the first scenario and keeps it
//! until [`Suite::teardown`], replacing it only if a job it could not abort
//! left it refusing submits. With [`EnvironmentReuse::PerScenario`] every
//! scenario gets a freshly started environment that is stopped right after it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{EnvironmentReuse, HarnessConfig};
use crate::environment::ClusterEnvironment;
use crate::error::{HarnessError, Result};
use crate::fixture::ClusterFixture;
use crate::scenario::{Scenario, ScenarioOutcome, ScenarioReport, Verdict};

pub type EnvironmentFactory<E> = Box<dyn Fn() -> Result<E> + Send + Sync>;

/// Process exit code when every scenario passed.
pub const EXIT_ALL_PASSED: i32 = 0;
/// Process exit code when at least one job produced the wrong status.
pub const EXIT_SCENARIO_FAILED: i32 = 1;
/// Process exit code when the harness itself broke. Takes precedence over failures.
pub const EXIT_HARNESS_ERROR: i32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub scenarios: Vec<ScenarioReport>,
    pub teardown_errors: Vec<String>,
}

impl SuiteReport {
    pub fn count(&self, verdict: Verdict) -> usize {
        self.scenarios
            .iter()
            .filter(|report| report.verdict == verdict)
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.count(Verdict::Errored) > 0 || !self.teardown_errors.is_empty() {
            EXIT_HARNESS_ERROR
        } else if self.count(Verdict::Failed) > 0 {
            EXIT_SCENARIO_FAILED
        } else {
            EXIT_ALL_PASSED
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} errored, {} teardown errors",
            self.count(Verdict::Passed),
            self.count(Verdict::Failed),
            self.count(Verdict::Errored),
            self.teardown_errors.len()
        )
    }
}

pub struct Suite<E: ClusterEnvironment> {
    config: HarnessConfig,
    factory: EnvironmentFactory<E>,
    shared: Option<Arc<ClusterFixture<E>>>,
    shared_start_failure: Option<String>,
    torn_down: bool,
}

impl<E: ClusterEnvironment> Suite<E> {
    pub fn new<F>(config: HarnessConfig, factory: F) -> Self
    where
        F: Fn() -> Result<E> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
            shared: None,
            shared_start_failure: None,
            torn_down: false,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The shared fixture, started on first use.
    ///
    /// If the shared environment failed to start once, every later call fails
    /// with the same error instead of retrying.
    pub async fn shared_fixture(&mut self) -> Result<Arc<ClusterFixture<E>>> {
        if self.torn_down {
            return Err(HarnessError::EnvironmentUnavailable(
                "suite has already been torn down".to_string(),
            ));
        }
        if let Some(reason) = &self.shared_start_failure {
            return Err(HarnessError::EnvironmentUnavailable(reason.clone()));
        }
        if let Some(fixture) = &self.shared {
            return Ok(fixture.clone());
        }

        let fixture = Arc::new(ClusterFixture::new((self.factory)()?, self.config.clone()));
        if let Err(e) = fixture.start().await {
            self.shared_start_failure = Some(format!("shared environment failed to start: {e}"));
            return Err(e);
        }
        self.shared = Some(fixture.clone());
        Ok(fixture)
    }

    /// Stops the shared fixture if it can no longer accept submits, so the next
    /// call to [`Suite::shared_fixture`] starts a fresh one.
    async fn replace_stuck_shared(&mut self) -> Option<HarnessError> {
        let state = self.shared.as_ref()?.state().await;
        if state.accepts_submit() {
            return None;
        }
        log::warn!("Shared environment is stuck in state {state}; replacing it");
        let fixture = self.shared.take()?;
        fixture.stop().await.err()
    }

    pub async fn run_scenario(
        &mut self,
        scenario: &Scenario,
    ) -> (ScenarioOutcome, Option<HarnessError>) {
        match self.config.environment_reuse {
            EnvironmentReuse::Shared => {
                let teardown_error = self.replace_stuck_shared().await;
                match self.shared_fixture().await {
                    Ok(fixture) => (scenario.run(&*fixture).await, teardown_error),
                    Err(error) => (ScenarioOutcome::Errored { error }, teardown_error),
                }
            }
            EnvironmentReuse::PerScenario => {
                if self.torn_down {
                    let error = HarnessError::EnvironmentUnavailable(
                        "suite has already been torn down".to_string(),
                    );
                    return (ScenarioOutcome::Errored { error }, None);
                }
                let environment = match (self.factory)() {
                    Ok(environment) => environment,
                    Err(error) => return (ScenarioOutcome::Errored { error }, None),
                };
                let fixture = ClusterFixture::new(environment, self.config.clone());
                if let Err(error) = fixture.start().await {
                    return (ScenarioOutcome::Errored { error }, None);
                }
                let outcome = scenario.run(&fixture).await;
                (outcome, fixture.stop().await.err())
            }
        }
    }

    /// Runs every scenario in order. Does not tear the suite down.
    pub async fn run_all(&mut self, scenarios: &[Scenario]) -> SuiteReport {
        let mut report = SuiteReport::default();
        for scenario in scenarios {
            let (outcome, teardown_error) = self.run_scenario(scenario).await;
            report.scenarios.push(outcome.report(scenario));
            if let Some(e) = teardown_error {
                report
                    .teardown_errors
                    .push(format!("{}: {e}", scenario.name));
            }
        }
        log::info!("Suite finished: {}", report.summary());
        report
    }

    /// Ends the suite, stopping the shared environment if one was started.
    pub async fn teardown(&mut self) -> Result<()> {
        self.torn_down = true;
        match self.shared.take() {
            Some(fixture) => fixture.stop().await,
            None => Ok(()),
        }
    }
}

impl<E: ClusterEnvironment> Drop for Suite<E> {
    fn drop(&mut self) {
        if self.shared.is_some() {
            log::warn!("Suite dropped without teardown(); shared environment was not stopped");
        }
    }
}
