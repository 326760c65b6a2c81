use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Exit status the pipeline launcher reports for a successful job.
pub const EXIT_SUCCESS: i64 = 0;

/// Maximum number of characters of captured output quoted in failure messages.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Identifier of a job-definition resource, e.g. `/file/fakesource_to_file.conf`.
///
/// The harness never interprets the file behind it. A leading `/` anchors the
/// reference at the job-definition root, the same way a classpath resource is
/// looked up; both `/file/x.conf` and `file/x.conf` name the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDefinitionReference(String);

impl JobDefinitionReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the resource relative to the job-definition root.
    ///
    /// Rejects empty references and anything that would escape the root.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let trimmed = self.0.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(self.invalid("reference is empty"));
        }

        let mut relative = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(self.invalid("parent directory components are not allowed"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(self.invalid("reference must be relative to the job root"))
                }
            }
        }
        Ok(relative)
    }

    /// Resolves the reference below `root`, failing if no file exists there.
    pub fn resolve_in(&self, root: &Path) -> Result<PathBuf> {
        let path = root.join(self.relative_path()?);
        if !path.is_file() {
            return Err(HarnessError::JobDefinitionNotFound(format!(
                "{} (looked for {})",
                self.0,
                path.display()
            )));
        }
        Ok(path)
    }

    /// Location of the resource inside an environment that mounts the job root at `mount_point`.
    pub fn path_under(&self, mount_point: &str) -> Result<String> {
        let relative = self.relative_path()?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}/{relative}", mount_point.trim_end_matches('/')))
    }

    fn invalid(&self, reason: &str) -> HarnessError {
        HarnessError::InvalidJobReference {
            reference: self.0.clone(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for JobDefinitionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobDefinitionReference {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobDefinitionReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Terminal outcome of one job run inside a cluster environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job: JobDefinitionReference,
    pub status_code: i64,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(
        job: JobDefinitionReference,
        status_code: i64,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            job,
            status_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == EXIT_SUCCESS
    }

    /// Last part of the captured output, stderr first, for failure diagnostics.
    pub fn output_tail(&self) -> String {
        let mut tail = String::new();
        for (label, stream) in [("stderr", &self.stderr), ("stdout", &self.stdout)] {
            let stream = stream.trim_end();
            if stream.is_empty() {
                continue;
            }
            tail.push_str(&format!("--- {label} ---\n{}\n", last_chars(stream, OUTPUT_TAIL_CHARS)));
        }
        if tail.is_empty() {
            tail.push_str("(no output captured)");
        }
        tail
    }
}

fn last_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let (offset, _) = text
        .char_indices()
        .nth(skip)
        .unwrap_or((0, ' '));
    &text[offset..]
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Panics unless `result` carries `expected` as its status code.
///
/// The panic message names the job, the expected and observed codes, and a
/// tail of the captured output.
#[track_caller]
pub fn assert_exit_code(result: &ExecutionResult, expected: i64) {
    if result.status_code != expected {
        panic!(
            "job {} exited with status {} (expected {expected})\n{}",
            result.job,
            result.status_code,
            result.output_tail()
        );
    }
}

#[track_caller]
pub fn assert_job_succeeded(result: &ExecutionResult) {
    assert_exit_code(result, EXIT_SUCCESS);
}
