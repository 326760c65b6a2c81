//! Cluster environments a fixture can drive.
//!
//! An environment only knows how to come up, run one job to completion and go
//! away again. Lifecycle ordering, serialization of submissions and the submit
//! timeout are enforced by [`ClusterFixture`](crate::fixture::ClusterFixture),
//! so implementations stay small.

pub mod flink;
pub mod in_process;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{ExecutionResult, JobDefinitionReference};

pub use flink::FlinkEnvironment;
pub use in_process::{FakeJob, FakeResources, InProcessEnvironment};

#[async_trait]
pub trait ClusterEnvironment: Send {
    /// Short label used in log lines.
    fn name(&self) -> &str;

    /// Brings the environment up. A failed start must release whatever it had
    /// already allocated before returning the error.
    async fn start(&mut self) -> Result<()>;

    /// Runs `job` and waits for it to reach a terminal state.
    async fn submit(&mut self, job: &JobDefinitionReference) -> Result<ExecutionResult>;

    /// Kills `job` after its submit was abandoned, so nothing it started keeps
    /// running when the next job is submitted.
    async fn abort(&mut self, job: &JobDefinitionReference) -> Result<()>;

    /// Releases every resource held by the environment.
    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
impl<E: ClusterEnvironment + ?Sized> ClusterEnvironment for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn submit(&mut self, job: &JobDefinitionReference) -> Result<ExecutionResult> {
        (**self).submit(job).await
    }

    async fn abort(&mut self, job: &JobDefinitionReference) -> Result<()> {
        (**self).abort(job).await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }
}
