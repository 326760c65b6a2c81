use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use testcontainers::{
    core::{
        logs::consumer::logging_consumer::LoggingConsumer, AccessMode, ExecCommand,
        IntoContainerPort, Mount, WaitFor,
    },
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use super::ClusterEnvironment;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::job::{ExecutionResult, JobDefinitionReference};

/// Where the job-definition directory is mounted inside the job manager.
pub const JOBS_MOUNT_POINT: &str = "/tmp/jobs";

const LAUNCHER_SCRIPT: &str = "start-seatunnel-flink.sh";
const CORE_JAR: &str = "seatunnel-core-flink.jar";
const CONNECTOR_JAR_PREFIX: &str = "seatunnel-connector-flink";
const PLUGIN_MAPPING_FILE: &str = "plugin-mapping.properties";

const FLINK_REST_PORT: u16 = 8081;
const JOB_MANAGER_READY_MESSAGE: &str = "Rest endpoint listening at";
const TASK_MANAGER_READY_MESSAGE: &str = "Successful registration at resource manager";

const EXIT_CODE_POLL_INTERVAL_MS: u64 = 100;
const EXIT_CODE_MAX_POLLS: usize = 50;

/// A host file copied into the job manager before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub host: PathBuf,
    pub container: String,
}

/// Maps the host-side pipeline distribution onto its install layout under `seatunnel_home`.
///
/// Expects `bin/start-seatunnel-flink.sh`, `lib/seatunnel-core-flink.jar` and
/// `plugin-mapping.properties` in `dist_dir`; connector jars are picked up from
/// `dist_dir/connectors` by file-name prefix.
pub fn stage_distribution(dist_dir: &Path, seatunnel_home: &str) -> Result<Vec<StagedFile>> {
    let home = seatunnel_home.trim_end_matches('/');
    let required = [
        (
            dist_dir.join("bin").join(LAUNCHER_SCRIPT),
            format!("{home}/bin/{LAUNCHER_SCRIPT}"),
        ),
        (
            dist_dir.join("lib").join(CORE_JAR),
            format!("{home}/lib/{CORE_JAR}"),
        ),
        (
            dist_dir.join(PLUGIN_MAPPING_FILE),
            format!("{home}/connectors/{PLUGIN_MAPPING_FILE}"),
        ),
    ];

    let mut staged = Vec::new();
    for (host, container) in required {
        if !host.is_file() {
            return Err(HarnessError::Config(format!(
                "pipeline distribution is missing {}",
                host.display()
            )));
        }
        staged.push(StagedFile { host, container });
    }

    let connectors_dir = dist_dir.join("connectors");
    let mut connectors = Vec::new();
    if connectors_dir.is_dir() {
        let entries = fs::read_dir(&connectors_dir).map_err(|e| {
            HarnessError::Config(format!(
                "failed to list connectors in {}: {e}",
                connectors_dir.display()
            ))
        })?;
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(CONNECTOR_JAR_PREFIX) && file_name.ends_with(".jar") {
                connectors.push((entry.path(), file_name));
            }
        }
    }
    if connectors.is_empty() {
        log::warn!(
            "No {CONNECTOR_JAR_PREFIX}*.jar found in {}; jobs will only see built-in plugins",
            connectors_dir.display()
        );
    }
    connectors.sort();
    staged.extend(connectors.into_iter().map(|(host, file_name)| StagedFile {
        host,
        container: format!("{home}/connectors/flink/{file_name}"),
    }));

    Ok(staged)
}

/// `FLINK_PROPERTIES` handed to both cluster containers.
pub fn flink_properties(config: &HarnessConfig, job_manager_host: &str) -> String {
    [
        format!("jobmanager.rpc.address: {job_manager_host}"),
        format!("taskmanager.numberOfTaskSlots: {}", config.task_slots),
        format!("parallelism.default: {}", config.default_parallelism),
        "env.java.opts: -Doracle.jdbc.timezoneAsRegion=false".to_string(),
    ]
    .join("\n")
}

/// Quotes `value` as a single POSIX shell word.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell script run in the job manager to clean up after an abandoned submit.
///
/// Kills every process whose command line mentions the job's config path (the
/// launcher and the `flink run` client it spawned), then cancels whatever the
/// cluster still reports as running.
pub fn abort_script(config_in_container: &str) -> String {
    format!(
        r#"target={target}
for p in /proc/[0-9]*; do
  pid=${{p#/proc/}}
  [ "$pid" = "$$" ] && continue
  if tr '\0' ' ' < "$p/cmdline" 2>/dev/null | grep -qF -- "$target"; then
    kill -9 "$pid" 2>/dev/null
  fi
done
for id in $(flink list -r 2>/dev/null | awk -F' : ' '/\(RUNNING\)/ {{print $2}}'); do
  flink cancel "$id" || exit 1
done
"#,
        target = shell_quote(config_in_container)
    )
}

/// Runs `command` in `container` and waits for it to exit.
///
/// Returns the exit status with the captured stdout and stderr.
async fn exec_to_completion(
    container: &ContainerAsync<GenericImage>,
    command: &[&str],
    what: &str,
) -> Result<(i64, String, String)> {
    let mut exec = container
        .exec(ExecCommand::new(command.iter().copied()))
        .await
        .map_err(|e| HarnessError::Submission(format!("failed to exec {what}: {e}")))?;

    // Both streams reach EOF when the process exits.
    let stdout = exec
        .stdout_to_vec()
        .await
        .map_err(|e| HarnessError::Submission(format!("failed to read {what} stdout: {e}")))?;
    let stderr = exec
        .stderr_to_vec()
        .await
        .map_err(|e| HarnessError::Submission(format!("failed to read {what} stderr: {e}")))?;

    // Docker may lag a moment behind the closed streams before reporting the exit code.
    let mut status_code = None;
    for _ in 0..EXIT_CODE_MAX_POLLS {
        status_code = exec.exit_code().await?;
        if status_code.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(EXIT_CODE_POLL_INTERVAL_MS)).await;
    }
    let status_code = status_code
        .ok_or_else(|| HarnessError::Submission(format!("{what} never reported an exit code")))?;

    Ok((
        status_code,
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

struct RunningCluster {
    network: String,
    job_manager: ContainerAsync<GenericImage>,
    task_manager: ContainerAsync<GenericImage>,
}

/// A job manager and a task manager on a private Docker network, with the
/// pipeline distribution installed in the job manager.
pub struct FlinkEnvironment {
    config: HarnessConfig,
    cluster: Option<RunningCluster>,
}

impl FlinkEnvironment {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            cluster: None,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Host port the Flink web UI is published on, while running.
    pub async fn rest_port(&self) -> Result<Option<u16>> {
        match &self.cluster {
            Some(cluster) => Ok(Some(
                cluster
                    .job_manager
                    .get_host_port_ipv4(FLINK_REST_PORT.tcp())
                    .await?,
            )),
            None => Ok(None),
        }
    }

    fn launcher_path(&self) -> String {
        format!(
            "{}/bin/{LAUNCHER_SCRIPT}",
            self.config.seatunnel_home.trim_end_matches('/')
        )
    }

    async fn start_job_manager(
        &self,
        network: &str,
        container_name: &str,
        properties: &str,
        staged: Vec<StagedFile>,
    ) -> Result<ContainerAsync<GenericImage>> {
        let jobs_dir = fs::canonicalize(&self.config.jobs_dir).map_err(|e| {
            HarnessError::Config(format!(
                "cannot resolve job definition directory {}: {e}",
                self.config.jobs_dir.display()
            ))
        })?;

        let mut request = GenericImage::new(&self.config.flink_image, &self.config.flink_tag)
            .with_wait_for(WaitFor::message_on_stdout(JOB_MANAGER_READY_MESSAGE))
            .with_exposed_port(FLINK_REST_PORT.tcp())
            .with_cmd(["jobmanager"])
            .with_network(network)
            .with_container_name(container_name)
            .with_env_var("FLINK_PROPERTIES", properties)
            .with_startup_timeout(self.config.startup_timeout())
            .with_mount(
                Mount::bind_mount(jobs_dir.to_string_lossy(), JOBS_MOUNT_POINT)
                    .with_access_mode(AccessMode::ReadOnly),
            )
            .with_log_consumer(LoggingConsumer::new().with_prefix(container_name));

        for file in staged {
            log::debug!("Staging {} at {}", file.host.display(), file.container);
            request = request.with_copy_to(file.container, file.host);
        }

        request.start().await.map_err(|e| {
            HarnessError::EnvironmentUnavailable(format!("job manager failed to start: {e}"))
        })
    }

    async fn start_task_manager(
        &self,
        network: &str,
        container_name: &str,
        properties: &str,
    ) -> Result<ContainerAsync<GenericImage>> {
        GenericImage::new(&self.config.flink_image, &self.config.flink_tag)
            .with_wait_for(WaitFor::message_on_stdout(TASK_MANAGER_READY_MESSAGE))
            .with_cmd(["taskmanager"])
            .with_network(network)
            .with_container_name(container_name)
            .with_env_var("FLINK_PROPERTIES", properties)
            .with_startup_timeout(self.config.startup_timeout())
            .with_log_consumer(LoggingConsumer::new().with_prefix(container_name))
            .start()
            .await
            .map_err(|e| {
                HarnessError::EnvironmentUnavailable(format!("task manager failed to start: {e}"))
            })
    }
}

#[async_trait]
impl ClusterEnvironment for FlinkEnvironment {
    fn name(&self) -> &str {
        "flink"
    }

    async fn start(&mut self) -> Result<()> {
        if self.cluster.is_some() {
            return Err(HarnessError::EnvironmentUnavailable(
                "flink cluster is already running".to_string(),
            ));
        }

        self.config.validate()?;
        self.config.validate_host_paths()?;
        let staged = stage_distribution(&self.config.dist_dir, &self.config.seatunnel_home)?;

        let run_id = Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..12];
        let network = format!("seatunnel-e2e-{run_id}");
        let job_manager_name = format!("jobmanager-{run_id}");
        let task_manager_name = format!("taskmanager-{run_id}");
        let properties = flink_properties(&self.config, &job_manager_name);

        log::info!(
            "Starting flink cluster {} on network {network} ({} staged files)",
            self.config.image_name(),
            staged.len()
        );

        let job_manager = self
            .start_job_manager(&network, &job_manager_name, &properties, staged)
            .await?;
        log::info!("Job manager {job_manager_name} is ready");

        let task_manager = match self
            .start_task_manager(&network, &task_manager_name, &properties)
            .await
        {
            Ok(container) => container,
            Err(e) => {
                log::warn!("Removing job manager {job_manager_name} after failed cluster start");
                if let Err(rm_err) = job_manager.rm().await {
                    log::warn!("Failed to remove job manager {job_manager_name}: {rm_err}");
                }
                return Err(e);
            }
        };
        log::info!("Task manager {task_manager_name} registered with {job_manager_name}");

        self.cluster = Some(RunningCluster {
            network,
            job_manager,
            task_manager,
        });
        log::info!("Flink containers are started");
        Ok(())
    }

    async fn submit(&mut self, job: &JobDefinitionReference) -> Result<ExecutionResult> {
        let launcher = self.launcher_path();
        let cluster = self.cluster.as_ref().ok_or_else(|| {
            HarnessError::EnvironmentUnavailable("flink cluster is not running".to_string())
        })?;

        job.resolve_in(&self.config.jobs_dir)?;
        let config_in_container = job.path_under(JOBS_MOUNT_POINT)?;

        log::info!("Submitting {job} via {launcher} --config {config_in_container}");
        let started = Instant::now();

        let (status_code, stdout, stderr) = exec_to_completion(
            &cluster.job_manager,
            &["bash", launcher.as_str(), "--config", config_in_container.as_str()],
            "launcher",
        )
        .await?;

        if !stdout.is_empty() {
            log::info!("{job} stdout:\n{stdout}");
        }
        if !stderr.is_empty() {
            log::warn!("{job} stderr:\n{stderr}");
        }
        log::info!(
            "{job} exited with status {status_code} after {:?}",
            started.elapsed()
        );

        let settle = self.config.post_submit_settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        Ok(ExecutionResult::new(
            job.clone(),
            status_code,
            stdout,
            stderr,
            started.elapsed(),
        ))
    }

    async fn abort(&mut self, job: &JobDefinitionReference) -> Result<()> {
        let cluster = self.cluster.as_ref().ok_or_else(|| {
            HarnessError::EnvironmentUnavailable("flink cluster is not running".to_string())
        })?;
        let config_in_container = job.path_under(JOBS_MOUNT_POINT)?;

        log::warn!("Aborting {job}: killing its launcher and cancelling running flink jobs");
        let script = abort_script(&config_in_container);
        let (status_code, stdout, stderr) =
            exec_to_completion(&cluster.job_manager, &["bash", "-c", script.as_str()], "abort")
                .await?;
        if !stdout.is_empty() {
            log::info!("abort {job} stdout:\n{stdout}");
        }

        if status_code == 0 {
            Ok(())
        } else {
            Err(HarnessError::Submission(format!(
                "aborting {job} exited with status {status_code}: {}",
                stderr.trim()
            )))
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(cluster) = self.cluster.take() else {
            return Ok(());
        };

        log::info!("Stopping flink cluster on network {}", cluster.network);
        let mut failures = Vec::new();
        if let Err(e) = cluster.task_manager.rm().await {
            failures.push(format!("task manager: {e}"));
        }
        if let Err(e) = cluster.job_manager.rm().await {
            failures.push(format!("job manager: {e}"));
        }

        if failures.is_empty() {
            log::info!("Flink cluster on network {} removed", cluster.network);
            Ok(())
        } else {
            Err(HarnessError::Teardown(failures.join("; ")))
        }
    }
}
