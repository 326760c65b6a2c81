use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::Path;

use seatunnel_e2e::config::create_sample_config;
use seatunnel_e2e::{FlinkEnvironment, HarnessConfig, ScenarioManifest, Suite, SuiteReport};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let matches = Command::new("seatunnel-e2e")
        .version("0.1.0")
        .about("Runs pipeline job definitions against a disposable Flink cluster")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Harness configuration file path")
                .default_value("config/harness.toml"),
        )
        .arg(
            Arg::new("manifest")
                .short('m')
                .long("manifest")
                .value_name("FILE")
                .help("Scenario manifest listing the jobs to run")
                .default_value("resources/scenarios.toml"),
        )
        .arg(
            Arg::new("jobs-dir")
                .short('j')
                .long("jobs-dir")
                .value_name("DIR")
                .help("Directory job-definition references are resolved against"),
        )
        .arg(
            Arg::new("dist-dir")
                .short('d')
                .long("dist-dir")
                .value_name("DIR")
                .help("Directory holding the staged pipeline distribution"),
        )
        .arg(
            Arg::new("submit-timeout")
                .short('t')
                .long("submit-timeout")
                .value_name("SECS")
                .help("Upper bound on how long one job may run"),
        )
        .arg(
            Arg::new("reuse")
                .long("reuse")
                .value_name("POLICY")
                .help("Environment reuse policy: shared or per_scenario"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the suite report as JSON"),
        )
        .arg(
            Arg::new("write-sample-config")
                .long("write-sample-config")
                .value_name("FILE")
                .help("Write a configuration file with the defaults and exit"),
        )
        .get_matches();

    if let Some(path) = matches.get_one::<String>("write-sample-config") {
        return create_sample_config(path);
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/harness.toml");
    let mut config = HarnessConfig::load(Some(Path::new(config_path)))
        .with_context(|| format!("Failed to load harness config from {config_path}"))?;
    config.apply_cli_overrides(&matches);
    config
        .validate()
        .context("Configuration validation failed")?;

    let manifest_path = matches
        .get_one::<String>("manifest")
        .map(String::as_str)
        .unwrap_or("resources/scenarios.toml");
    let manifest = ScenarioManifest::load(Path::new(manifest_path))?;
    log::info!(
        "Running {} scenarios from {manifest_path} with {:?} environment reuse",
        manifest.scenarios.len(),
        config.environment_reuse
    );

    let env_config = config.clone();
    let mut suite = Suite::new(config, move || Ok(FlinkEnvironment::new(env_config.clone())));
    let mut report = suite.run_all(&manifest.scenarios).await;
    if let Err(e) = suite.teardown().await {
        report.teardown_errors.push(format!("shared environment: {e}"));
    }

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    std::process::exit(report.exit_code());
}

fn print_report(report: &SuiteReport) {
    for scenario in &report.scenarios {
        let status = scenario
            .status_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {} ({}) status={status} expected={}",
            scenario.verdict.to_string(),
            scenario.name,
            scenario.job,
            scenario.expected_status
        );
        if let Some(message) = &scenario.message {
            for line in message.lines() {
                println!("         {line}");
            }
        }
    }
    for error in &report.teardown_errors {
        println!("teardown error: {error}");
    }
    println!("{}", report.summary());
}
