use anyhow::Context;
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, Result};

pub const ENV_PREFIX: &str = "SEATUNNEL_E2E";

const DEFAULT_FLINK_IMAGE: &str = "flink";
const DEFAULT_FLINK_TAG: &str = "1.13.6-scala_2.11";
const DEFAULT_SEATUNNEL_HOME: &str = "/tmp/flink/seatunnel";
const DEFAULT_TASK_SLOTS: u32 = 10;
const DEFAULT_PARALLELISM: u32 = 4;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_POST_SUBMIT_SETTLE_MS: u64 = 5000;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_START_ATTEMPTS: u32 = 1;
const DEFAULT_START_RETRY_BACKOFF_MS: u64 = 2000;

/// Whether scenarios share one cluster environment or each get a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentReuse {
    Shared,
    PerScenario,
}

impl std::str::FromStr for EnvironmentReuse {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(EnvironmentReuse::Shared),
            "per_scenario" | "per-scenario" => Ok(EnvironmentReuse::PerScenario),
            other => Err(HarnessError::Config(format!(
                "unknown environment reuse policy '{other}' (expected shared or per_scenario)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub flink_image: String,
    pub flink_tag: String,
    /// Install location of the pipeline distribution inside the job manager.
    pub seatunnel_home: String,
    /// Host directory holding the staged distribution (launcher, core jar, connectors).
    pub dist_dir: PathBuf,
    /// Host directory job-definition references are resolved against.
    pub jobs_dir: PathBuf,
    pub task_slots: u32,
    pub default_parallelism: u32,
    pub startup_timeout_secs: u64,
    pub submit_timeout_secs: u64,
    pub post_submit_settle_ms: u64,
    pub stop_timeout_secs: u64,
    pub start_attempts: u32,
    pub start_retry_backoff_ms: u64,
    pub environment_reuse: EnvironmentReuse,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            flink_image: DEFAULT_FLINK_IMAGE.to_string(),
            flink_tag: DEFAULT_FLINK_TAG.to_string(),
            seatunnel_home: DEFAULT_SEATUNNEL_HOME.to_string(),
            dist_dir: PathBuf::from("dist"),
            jobs_dir: PathBuf::from("resources"),
            task_slots: DEFAULT_TASK_SLOTS,
            default_parallelism: DEFAULT_PARALLELISM,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            submit_timeout_secs: DEFAULT_SUBMIT_TIMEOUT_SECS,
            post_submit_settle_ms: DEFAULT_POST_SUBMIT_SETTLE_MS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            start_attempts: DEFAULT_START_ATTEMPTS,
            start_retry_backoff_ms: DEFAULT_START_RETRY_BACKOFF_MS,
            environment_reuse: EnvironmentReuse::Shared,
        }
    }
}

impl HarnessConfig {
    /// Loads settings: defaults, then the optional TOML file, then `SEATUNNEL_E2E__*` env vars.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = config_path {
            if path.exists() {
                log::info!("Loading harness configuration from {}", path.display());
            } else {
                log::info!("Config file not found: {}, using defaults", path.display());
            }
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let config: HarnessConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("Harness config: {config:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flink_image.is_empty() || self.flink_tag.is_empty() {
            return Err(HarnessError::Config(
                "flink_image and flink_tag must not be empty".to_string(),
            ));
        }

        if !self.seatunnel_home.starts_with('/') {
            return Err(HarnessError::Config(format!(
                "seatunnel_home must be an absolute container path, got {}",
                self.seatunnel_home
            )));
        }

        if self.task_slots == 0 {
            return Err(HarnessError::Config(
                "task_slots must be greater than 0".to_string(),
            ));
        }

        if self.default_parallelism == 0 {
            return Err(HarnessError::Config(
                "default_parallelism must be greater than 0".to_string(),
            ));
        }

        if self.submit_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "submit_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.startup_timeout_secs == 0 {
            return Err(HarnessError::Config(
                "startup_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.start_attempts == 0 {
            return Err(HarnessError::Config(
                "start_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks that the host-side directories the containerized cluster mounts exist.
    pub fn validate_host_paths(&self) -> Result<()> {
        if !self.jobs_dir.is_dir() {
            return Err(HarnessError::Config(format!(
                "job definition directory not found: {}",
                self.jobs_dir.display()
            )));
        }
        if !self.dist_dir.is_dir() {
            return Err(HarnessError::Config(format!(
                "pipeline distribution directory not found: {}",
                self.dist_dir.display()
            )));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn post_submit_settle(&self) -> Duration {
        Duration::from_millis(self.post_submit_settle_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn start_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.start_retry_backoff_ms)
    }

    pub fn image_name(&self) -> String {
        format!("{}:{}", self.flink_image, self.flink_tag)
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(dir) = matches.get_one::<String>("jobs-dir") {
            self.jobs_dir = PathBuf::from(dir);
        }

        if let Some(dir) = matches.get_one::<String>("dist-dir") {
            self.dist_dir = PathBuf::from(dir);
        }

        if let Some(timeout_str) = matches.get_one::<String>("submit-timeout") {
            match timeout_str.parse::<u64>() {
                Ok(timeout) => self.submit_timeout_secs = timeout,
                Err(e) => log::warn!("Ignoring --submit-timeout override '{timeout_str}': {e}"),
            }
        }

        if let Some(reuse_str) = matches.get_one::<String>("reuse") {
            match reuse_str.parse::<EnvironmentReuse>() {
                Ok(reuse) => self.environment_reuse = reuse,
                Err(e) => log::warn!("Ignoring --reuse override: {e}"),
            }
        }
    }
}

/// Write a configuration file holding the defaults.
pub fn create_sample_config(path: &str) -> anyhow::Result<()> {
    let config = HarnessConfig::default();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {path}"))?;

    println!("Sample configuration written to: {path}");
    Ok(())
}
