use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{ArgAction, Parser};
use penguin_metrics::{
    config::Config,
    core::{publisher::MqttConnector, Orchestrator},
    logger::{cli_level, LoggerManager},
    print_error, print_info,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "penguin-metrics", version, about = "Linux host telemetry over MQTT")]
struct Cli {
    /// Configuration file. Defaults to $PENGUIN_METRICS_CONFIG, then
    /// /etc/penguin-metrics/config.toml.
    config: Option<PathBuf>,

    /// More logging; repeat for trace.
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only warnings and errors.
    #[arg(short, long)]
    quiet: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn source_rows(config: &Config) -> Vec<(String, bool)> {
    let mut rows = Vec::with_capacity(config.source_count());
    let mut add = |section: &str, name: &str, enabled: bool| {
        rows.push((format!("{section}/{name}"), enabled));
    };

    config.system.iter().for_each(|s| add("system", &s.name, s.enabled));
    config.temperature.iter().for_each(|s| add("temperature", &s.name, s.enabled));
    config.process.iter().for_each(|s| add("process", &s.name, s.enabled));
    config.service.iter().for_each(|s| add("service", &s.name, s.enabled));
    config.container.iter().for_each(|s| add("container", &s.name, s.enabled));
    config.battery.iter().for_each(|s| add("battery", &s.name, s.enabled));
    config.ac_power.iter().for_each(|s| add("ac_power", &s.name, s.enabled));
    config.disk.iter().for_each(|s| add("disk", &s.name, s.enabled));
    config.network.iter().for_each(|s| add("network", &s.name, s.enabled));
    config.fan.iter().for_each(|s| add("fan", &s.name, s.enabled));
    config.custom.iter().for_each(|s| add("custom", &s.name, s.enabled));
    config
        .binary_sensor
        .iter()
        .for_each(|s| add("binary_sensor", &s.name, s.enabled));
    rows
}

fn log_sources_table(config: &Config) {
    let rows = source_rows(config);
    let name_width = rows
        .iter()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or(10)
        .max("Source".len());

    info!("{:<width$} | Status", "Source", width = name_width);
    info!("{}-+-{}", "-".repeat(name_width), "-".repeat(8));
    for (name, enabled) in rows {
        let status = if enabled { "ENABLED" } else { "DISABLED" };
        info!("{:<width$} | {}", name, status, width = name_width);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::new(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            print_error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        print_info!(
            "Configuration is valid: {} sources, broker {}:{}, topic prefix '{}'",
            config.source_count(),
            config.mqtt.host,
            config.mqtt.port,
            config.mqtt.topic_prefix
        );
        return ExitCode::SUCCESS;
    }

    let logger = match LoggerManager::new(config.logger.clone()) {
        Ok(logger) => logger.with_level(cli_level(&config.logger.level, cli.verbose, cli.quiet)),
        Err(e) => {
            print_error!("Failed to setup Log Manager: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger.init() {
        print_error!("Failed to init Log Manager: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting penguin-metrics version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", logger.level());
    log_sources_table(&config);
    if config.auto.any_enabled() {
        info!(
            "Auto-discovery enabled, refresh interval {}s",
            config.auto.refresh_interval
        );
    }

    let connector = Arc::new(MqttConnector::new(config.mqtt.clone()));
    let mut orchestrator = Orchestrator::new(config, connector);

    match orchestrator.run().await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
