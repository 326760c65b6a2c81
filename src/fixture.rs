use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::HarnessConfig;
use crate::environment::ClusterEnvironment;
use crate::error::{HarnessError, Result};
use crate::job::{ExecutionResult, JobDefinitionReference};

/// Where a fixture is in its life.
///
/// `NotStarted -> EnvironmentStarting -> EnvironmentReady -> JobSubmitted ->
/// JobTerminated -> EnvironmentStopping -> Stopped`, with repeated submits
/// cycling between `JobTerminated` and `JobSubmitted`. A timed-out job that
/// could not be aborted leaves the fixture in `JobSubmitted`, where only
/// `stop` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    NotStarted,
    EnvironmentStarting,
    EnvironmentReady,
    JobSubmitted,
    JobTerminated,
    EnvironmentStopping,
    Stopped,
}

impl LifecycleState {
    pub fn accepts_submit(self) -> bool {
        matches!(
            self,
            LifecycleState::EnvironmentReady | LifecycleState::JobTerminated
        )
    }

    /// Whether the environment may be holding resources in this state.
    pub fn holds_environment(self) -> bool {
        !matches!(self, LifecycleState::NotStarted | LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct FixtureInner<E> {
    environment: E,
    state: LifecycleState,
}

/// Owns one cluster environment and serializes everything done to it.
///
/// All three operations take the same lock, so a `stop` issued while a job is
/// running waits for that `submit` to return (or time out) before tearing the
/// environment down.
pub struct ClusterFixture<E: ClusterEnvironment> {
    inner: Mutex<FixtureInner<E>>,
    config: HarnessConfig,
}

impl<E: ClusterEnvironment> ClusterFixture<E> {
    pub fn new(environment: E, config: HarnessConfig) -> Self {
        Self {
            inner: Mutex::new(FixtureInner {
                environment,
                state: LifecycleState::NotStarted,
            }),
            config,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Brings the environment up, retrying up to `start_attempts` times.
    ///
    /// On failure the fixture ends in `Stopped` and every later submit is refused.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::NotStarted {
            return Err(HarnessError::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }

        inner.state = LifecycleState::EnvironmentStarting;
        let name = inner.environment.name().to_string();
        let attempts = self.config.start_attempts.max(1);
        let started = Instant::now();

        for attempt in 1..=attempts {
            log::info!("Starting {name} environment (attempt {attempt}/{attempts})");
            match inner.environment.start().await {
                Ok(()) => {
                    inner.state = LifecycleState::EnvironmentReady;
                    log::info!(
                        "{name} environment ready after {:?}",
                        started.elapsed()
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let backoff = self.retry_backoff();
                    log::warn!(
                        "{name} environment failed to start: {e}; retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    log::error!("{name} environment failed to start: {e}");
                    inner.state = LifecycleState::Stopped;
                    return Err(e);
                }
            }
        }

        unreachable!("start loop always returns on its last attempt")
    }

    /// Runs `job` to completion and returns its result.
    ///
    /// Fails with [`HarnessError::SubmitTimeout`] if the job has not terminated
    /// within `submit_timeout_secs`; the job is then aborted before the lock is
    /// released. A non-zero exit status is *not* an error.
    pub async fn submit(
        &self,
        job: impl Into<JobDefinitionReference>,
    ) -> Result<ExecutionResult> {
        let job = job.into();
        let mut inner = self.inner.lock().await;
        if !inner.state.accepts_submit() {
            return Err(HarnessError::InvalidState {
                operation: "submit to",
                state: inner.state,
            });
        }

        inner.state = LifecycleState::JobSubmitted;
        let timeout = self.config.submit_timeout();
        let outcome = tokio::time::timeout(timeout, inner.environment.submit(&job)).await;

        match outcome {
            Ok(Ok(result)) => {
                inner.state = LifecycleState::JobTerminated;
                log::info!(
                    "Job {job} terminated with status {} in {:?}",
                    result.status_code,
                    result.elapsed
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                inner.state = LifecycleState::JobTerminated;
                log::error!("Submitting {job} failed: {e}");
                Err(e)
            }
            Err(_) => {
                log::error!("Job {job} did not terminate within {timeout:?}");
                let abort_timeout = self.config.stop_timeout();
                match tokio::time::timeout(abort_timeout, inner.environment.abort(&job)).await {
                    Ok(Ok(())) => {
                        inner.state = LifecycleState::JobTerminated;
                        log::info!("Aborted {job}");
                    }
                    Ok(Err(e)) => {
                        log::error!("Failed to abort {job}: {e}; refusing further submits");
                    }
                    Err(_) => {
                        log::error!(
                            "Aborting {job} did not finish within {abort_timeout:?}; \
                             refusing further submits"
                        );
                    }
                }
                Err(HarnessError::SubmitTimeout {
                    job: job.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Tears the environment down. Calling it again, or before `start`, is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::NotStarted => {
                inner.state = LifecycleState::Stopped;
                return Ok(());
            }
            LifecycleState::EnvironmentReady | LifecycleState::JobTerminated => {}
            abandoned => {
                log::warn!(
                    "Stopping environment left in state {abandoned} by an unfinished operation"
                );
            }
        }

        inner.state = LifecycleState::EnvironmentStopping;
        let name = inner.environment.name().to_string();
        let timeout = self.config.stop_timeout();
        let outcome = tokio::time::timeout(timeout, inner.environment.stop()).await;
        inner.state = LifecycleState::Stopped;

        match outcome {
            Ok(Ok(())) => {
                log::info!("{name} environment stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                log::error!("{name} environment failed to stop cleanly: {e}");
                Err(e)
            }
            Err(_) => Err(HarnessError::Teardown(format!(
                "{name} environment did not stop within {timeout:?}"
            ))),
        }
    }

    /// Starts a fixture, runs `body` against it and stops it on every exit path.
    ///
    /// A panic inside `body` is re-raised once the environment has been torn
    /// down. If `body` completes but teardown fails, the teardown error wins.
    pub async fn scoped<F, Fut, T>(environment: E, config: HarnessConfig, body: F) -> Result<T>
    where
        F: FnOnce(Arc<ClusterFixture<E>>) -> Fut,
        Fut: Future<Output = T>,
    {
        let fixture = Arc::new(ClusterFixture::new(environment, config));
        fixture.start().await?;

        let outcome = AssertUnwindSafe(body(fixture.clone()))
            .catch_unwind()
            .await;
        let stopped = fixture.stop().await;

        match outcome {
            Ok(value) => stopped.map(|()| value),
            Err(panic) => {
                if let Err(e) = stopped {
                    log::error!("Teardown after panic failed: {e}");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn retry_backoff(&self) -> Duration {
        let base = self.config.start_retry_backoff_ms;
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

impl<E: ClusterEnvironment> Drop for ClusterFixture<E> {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if state.holds_environment() {
            log::warn!(
                "Cluster fixture dropped in state {state} without stop(); \
                 relying on container cleanup"
            );
        }
    }
}
