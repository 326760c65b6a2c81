use std::time::Duration;

use thiserror::Error;

use crate::fixture::LifecycleState;

/// Faults raised by the harness itself.
///
/// A job that runs to completion with a non-zero exit status is *not* a
/// `HarnessError`; it is an [`ExecutionResult`](crate::job::ExecutionResult)
/// whose status code the scenario asserts on. Everything in this enum is
/// harness breakage and surfaces as an errored test rather than a failed one.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cluster environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("cannot {operation} cluster environment in state {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("job definition not found: {0}")]
    JobDefinitionNotFound(String),

    #[error("invalid job definition reference '{reference}': {reason}")]
    InvalidJobReference { reference: String, reason: String },

    #[error("job {job} did not terminate within {timeout:?}")]
    SubmitTimeout { job: String, timeout: Duration },

    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("cluster environment teardown failed: {0}")]
    Teardown(String),

    #[error("invalid harness configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Container(#[from] testcontainers::TestcontainersError),
}

impl HarnessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::SubmitTimeout { .. })
    }
}

impl From<::config::ConfigError> for HarnessError {
    fn from(err: ::config::ConfigError) -> Self {
        HarnessError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
