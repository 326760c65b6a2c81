pub mod config;
pub mod environment;
pub mod error;
pub mod fixture;
pub mod job;
pub mod scenario;
pub mod suite;

pub use config::{EnvironmentReuse, HarnessConfig};
pub use environment::{ClusterEnvironment, FlinkEnvironment, InProcessEnvironment};
pub use error::HarnessError;
pub use fixture::{ClusterFixture, LifecycleState};
pub use job::{assert_exit_code, assert_job_succeeded, ExecutionResult, JobDefinitionReference};
pub use scenario::{Scenario, ScenarioManifest, ScenarioOutcome, Verdict};
pub use suite::{Suite, SuiteReport};

/// Job definition exercised by the fake-source-to-file scenario.
pub const FAKE_SOURCE_TO_FILE_JOB: &str = "/file/fakesource_to_file.conf";
