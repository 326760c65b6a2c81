use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::environment::ClusterEnvironment;
use crate::error::{HarnessError, Result};
use crate::fixture::ClusterFixture;
use crate::job::{assert_exit_code, ExecutionResult, JobDefinitionReference, EXIT_SUCCESS};

/// One job-definition reference bound to the exit status it must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub job: JobDefinitionReference,
    #[serde(default)]
    pub expected_status: i64,
}

impl Scenario {
    pub fn new(name: impl Into<String>, job: impl Into<JobDefinitionReference>) -> Self {
        Self {
            name: name.into(),
            job: job.into(),
            expected_status: EXIT_SUCCESS,
        }
    }

    pub fn expecting(mut self, status: i64) -> Self {
        self.expected_status = status;
        self
    }

    pub async fn run<E: ClusterEnvironment>(&self, fixture: &ClusterFixture<E>) -> ScenarioOutcome {
        log::info!("Running scenario {} ({})", self.name, self.job);
        let outcome = self.evaluate(fixture.submit(self.job.clone()).await);
        log::info!("Scenario {} {}", self.name, outcome.verdict());
        outcome
    }

    /// Judges a submit outcome against the expected status.
    pub fn evaluate(&self, submitted: Result<ExecutionResult>) -> ScenarioOutcome {
        match submitted {
            Ok(result) if result.status_code == self.expected_status => {
                ScenarioOutcome::Passed { result }
            }
            Ok(result) => ScenarioOutcome::Failed {
                expected: self.expected_status,
                result,
            },
            Err(error) => ScenarioOutcome::Errored { error },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
    Errored,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
            Verdict::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Result of one scenario. `Failed` means the job ran and produced the wrong
/// status; `Errored` means the harness never got a status at all.
#[derive(Debug)]
pub enum ScenarioOutcome {
    Passed {
        result: ExecutionResult,
    },
    Failed {
        expected: i64,
        result: ExecutionResult,
    },
    Errored {
        error: HarnessError,
    },
}

impl ScenarioOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            ScenarioOutcome::Passed { .. } => Verdict::Passed,
            ScenarioOutcome::Failed { .. } => Verdict::Failed,
            ScenarioOutcome::Errored { .. } => Verdict::Errored,
        }
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            ScenarioOutcome::Passed { result } | ScenarioOutcome::Failed { result, .. } => {
                Some(result)
            }
            ScenarioOutcome::Errored { .. } => None,
        }
    }

    /// Maps the outcome onto test-framework semantics: `Ok` when passed, a
    /// panic carrying the observed status when failed, `Err` when errored.
    #[track_caller]
    pub fn check(self) -> Result<ExecutionResult> {
        match self {
            ScenarioOutcome::Passed { result } => Ok(result),
            ScenarioOutcome::Failed { expected, result } => {
                assert_exit_code(&result, expected);
                unreachable!("assert_exit_code panics on a status mismatch")
            }
            ScenarioOutcome::Errored { error } => Err(error),
        }
    }

    pub fn report(&self, scenario: &Scenario) -> ScenarioReport {
        let (status_code, elapsed_ms, message) = match self {
            ScenarioOutcome::Passed { result } => {
                (Some(result.status_code), Some(result.elapsed.as_millis() as u64), None)
            }
            ScenarioOutcome::Failed { result, .. } => (
                Some(result.status_code),
                Some(result.elapsed.as_millis() as u64),
                Some(result.output_tail()),
            ),
            ScenarioOutcome::Errored { error } => (None, None, Some(error.to_string())),
        };
        ScenarioReport {
            name: scenario.name.clone(),
            job: scenario.job.clone(),
            verdict: self.verdict(),
            expected_status: scenario.expected_status,
            status_code,
            elapsed_ms,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub job: JobDefinitionReference,
    pub verdict: Verdict,
    pub expected_status: i64,
    pub status_code: Option<i64>,
    pub elapsed_ms: Option<u64>,
    pub message: Option<String>,
}

/// `[[scenario]]` tables from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioManifest {
    #[serde(default, rename = "scenario")]
    pub scenarios: Vec<Scenario>,
}

impl ScenarioManifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario manifest: {}", path.display()))?;
        let manifest: ScenarioManifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse scenario manifest: {}", path.display()))?;
        if manifest.scenarios.is_empty() {
            anyhow::bail!("Scenario manifest {} lists no scenarios", path.display());
        }
        Ok(manifest)
    }
}
