//! An environment that runs nothing: every job reference is scripted up front.
//!
//! Used to exercise the fixture, scenario and suite logic without Docker. The
//! shared [`FakeResources`] counters outlive the environment, so a test can
//! hand the environment to a fixture and still check what happened to it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::ClusterEnvironment;
use crate::error::{HarnessError, Result};
use crate::job::{ExecutionResult, JobDefinitionReference, EXIT_SUCCESS};

/// Scripted behavior for one job reference.
#[derive(Debug, Clone)]
pub enum FakeJob {
    /// Terminates with the given status and output.
    Exit {
        status_code: i64,
        stdout: String,
        stderr: String,
    },
    /// Never terminates.
    Hang,
    /// The submission mechanism itself breaks.
    Fault(String),
}

impl FakeJob {
    pub fn succeeds() -> Self {
        FakeJob::Exit {
            status_code: EXIT_SUCCESS,
            stdout: "Job has been submitted with JobID fake\nJob finished".to_string(),
            stderr: String::new(),
        }
    }

    pub fn fails(status_code: i64, stderr: impl Into<String>) -> Self {
        FakeJob::Exit {
            status_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Counters shared between an [`InProcessEnvironment`] and the test that built it.
#[derive(Debug, Default)]
pub struct FakeResources {
    starts: AtomicUsize,
    stops: AtomicUsize,
    submits: AtomicUsize,
    results: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    running_jobs: AtomicUsize,
    overlapping_submits: AtomicUsize,
    aborts: AtomicUsize,
    live: AtomicBool,
    stopped_during_submit: AtomicBool,
}

impl FakeResources {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of execution results handed back to the caller.
    pub fn results(&self) -> usize {
        self.results.load(Ordering::SeqCst)
    }

    /// Highest number of jobs that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Jobs still running inside the cluster, including ones nobody waits on any more.
    pub fn running_jobs(&self) -> usize {
        self.running_jobs.load(Ordering::SeqCst)
    }

    /// Submits that began while an earlier job was still running in the cluster.
    pub fn overlapping_submits(&self) -> usize {
        self.overlapping_submits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Whether the environment currently holds resources.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stopped_during_submit(&self) -> bool {
        self.stopped_during_submit.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count even when the submit future is dropped.
struct InFlight<'a>(&'a FakeResources);

impl<'a> InFlight<'a> {
    fn enter(resources: &'a FakeResources) -> Self {
        let now = resources.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        resources.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(resources)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct InProcessEnvironment {
    jobs: HashMap<PathBuf, FakeJob>,
    job_duration: Duration,
    failing_starts: u32,
    failing_abort: bool,
    failing_stop: bool,
    stop_duration: Duration,
    running: bool,
    resources: Arc<FakeResources>,
}

impl InProcessEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the behavior of `reference`.
    ///
    /// # Panics
    /// If `reference` is not a valid job reference.
    pub fn with_job(mut self, reference: &str, job: FakeJob) -> Self {
        let key = JobDefinitionReference::new(reference)
            .relative_path()
            .unwrap_or_else(|e| panic!("invalid fake job reference {reference}: {e}"));
        self.jobs.insert(key, job);
        self
    }

    /// Every job takes this long before it terminates.
    pub fn with_job_duration(mut self, duration: Duration) -> Self {
        self.job_duration = duration;
        self
    }

    /// The first `count` start attempts fail.
    pub fn with_failing_starts(mut self, count: u32) -> Self {
        self.failing_starts = count;
        self
    }

    /// Every abort fails, leaving the abandoned job running.
    pub fn with_failing_abort(mut self) -> Self {
        self.failing_abort = true;
        self
    }

    /// Every stop fails and leaves the resources allocated.
    pub fn with_failing_stop(mut self) -> Self {
        self.failing_stop = true;
        self
    }

    /// Stopping takes this long.
    pub fn with_stop_duration(mut self, duration: Duration) -> Self {
        self.stop_duration = duration;
        self
    }

    /// Reports into existing counters, so several environments can share them.
    pub fn with_resources(mut self, resources: Arc<FakeResources>) -> Self {
        self.resources = resources;
        self
    }

    pub fn resources(&self) -> Arc<FakeResources> {
        self.resources.clone()
    }
}

#[async_trait]
impl ClusterEnvironment for InProcessEnvironment {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn start(&mut self) -> Result<()> {
        self.resources.starts.fetch_add(1, Ordering::SeqCst);
        if self.failing_starts > 0 {
            self.failing_starts -= 1;
            return Err(HarnessError::EnvironmentUnavailable(
                "scripted start failure".to_string(),
            ));
        }
        self.running = true;
        self.resources.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&mut self, job: &JobDefinitionReference) -> Result<ExecutionResult> {
        if !self.running {
            return Err(HarnessError::EnvironmentUnavailable(
                "in-process environment is not running".to_string(),
            ));
        }
        self.resources.submits.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .jobs
            .get(&job.relative_path()?)
            .cloned()
            .ok_or_else(|| HarnessError::JobDefinitionNotFound(job.to_string()))?;

        if self.resources.running_jobs.fetch_add(1, Ordering::SeqCst) > 0 {
            self.resources.overlapping_submits.fetch_add(1, Ordering::SeqCst);
        }
        let _in_flight = InFlight::enter(&self.resources);
        let started = Instant::now();
        if !self.job_duration.is_zero() {
            tokio::time::sleep(self.job_duration).await;
        }

        // A dropped submit leaves its job counted as running until abort or stop.
        if !matches!(scripted, FakeJob::Hang) {
            self.resources.running_jobs.fetch_sub(1, Ordering::SeqCst);
        }

        match scripted {
            FakeJob::Exit {
                status_code,
                stdout,
                stderr,
            } => {
                self.resources.results.fetch_add(1, Ordering::SeqCst);
                Ok(ExecutionResult::new(
                    job.clone(),
                    status_code,
                    stdout,
                    stderr,
                    started.elapsed(),
                ))
            }
            FakeJob::Hang => std::future::pending().await,
            FakeJob::Fault(message) => Err(HarnessError::Submission(message)),
        }
    }

    async fn abort(&mut self, job: &JobDefinitionReference) -> Result<()> {
        self.resources.aborts.fetch_add(1, Ordering::SeqCst);
        if self.failing_abort {
            return Err(HarnessError::Submission(format!("scripted abort failure for {job}")));
        }
        self.resources.running_jobs.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.resources.stops.fetch_add(1, Ordering::SeqCst);
        if self.resources.in_flight.load(Ordering::SeqCst) > 0 {
            self.resources
                .stopped_during_submit
                .store(true, Ordering::SeqCst);
        }
        if !self.stop_duration.is_zero() {
            tokio::time::sleep(self.stop_duration).await;
        }
        if self.failing_stop {
            return Err(HarnessError::Teardown("scripted stop failure".to_string()));
        }
        self.running = false;
        self.resources.running_jobs.store(0, Ordering::SeqCst);
        self.resources.live.store(false, Ordering::SeqCst);
        Ok(())
    }
}
