//! Application configuration loading and validation.
//!
//! One TOML file describes the logger, the MQTT transport, Home Assistant
//! discovery and every monitored source. Every section has defaults, so an
//! empty file is a valid configuration (it just monitors nothing).
//!
//! The configuration is loaded once at startup and is immutable thereafter.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::model::sanitize_id;

pub mod auto;
pub mod homeassistant;
pub mod logger;
pub mod sources;

use auto::AutoConfig;
use homeassistant::HomeAssistantConfig;
use logger::LoggerConfig;
use sources::{
    AcPowerSourceConfig, BatterySourceConfig, BinarySensorSourceConfig, ContainerSourceConfig,
    CustomSourceConfig, DefaultsConfig, DiskSourceConfig, FanSourceConfig, NetworkSourceConfig,
    ProcessSourceConfig, ServiceSourceConfig, SystemSourceConfig, TemperatureSourceConfig,
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PENGUIN_METRICS_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/penguin-metrics/config.toml";

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// UTC timestamp for the pre-logger macros. Empty if formatting fails.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
#[validate(schema(function = "validate_unique_sources"))]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub mqtt: penguin_metrics_mqtt::Config,

    #[validate(nested)]
    pub homeassistant: HomeAssistantConfig,

    #[validate(nested)]
    pub defaults: DefaultsConfig,

    #[validate(nested)]
    pub system: Vec<SystemSourceConfig>,

    #[validate(nested)]
    pub temperature: Vec<TemperatureSourceConfig>,

    #[validate(nested)]
    pub process: Vec<ProcessSourceConfig>,

    #[validate(nested)]
    pub service: Vec<ServiceSourceConfig>,

    #[validate(nested)]
    pub container: Vec<ContainerSourceConfig>,

    #[validate(nested)]
    pub battery: Vec<BatterySourceConfig>,

    #[validate(nested)]
    pub disk: Vec<DiskSourceConfig>,

    #[validate(nested)]
    pub custom: Vec<CustomSourceConfig>,

    #[validate(nested)]
    pub binary_sensor: Vec<BinarySensorSourceConfig>,

    #[validate(nested)]
    pub network: Vec<NetworkSourceConfig>,

    #[validate(nested)]
    pub fan: Vec<FanSourceConfig>,

    #[validate(nested)]
    pub ac_power: Vec<AcPowerSourceConfig>,

    #[validate(nested)]
    pub auto: AutoConfig,
}

fn check_unique<'a>(
    section: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for name in names {
        let id = sanitize_id(name);
        if !seen.insert(id.clone()) {
            return Err(ValidationError::new("duplicate_source").with_message(
                format!("Duplicate [[{section}]] source '{name}' (id '{id}')").into(),
            ));
        }
    }
    Ok(())
}

fn validate_unique_sources(config: &Config) -> Result<(), ValidationError> {
    // Host metrics always publish on `{topic_prefix}/system`.
    if config.system.len() > 1 {
        return Err(ValidationError::new("multiple_system_sources")
            .with_message("Only one [[system]] source may be configured".into()));
    }
    // Implicit temperature collectors share the id space with explicit ones.
    check_unique(
        "temperature",
        config
            .temperature
            .iter()
            .map(|s| s.name.as_str())
            .chain(
                config
                    .system
                    .iter()
                    .filter(|s| s.temperature)
                    .map(|s| s.name.as_str()),
            ),
    )?;
    check_unique("process", config.process.iter().map(|s| s.name.as_str()))?;
    check_unique("service", config.service.iter().map(|s| s.name.as_str()))?;
    check_unique("container", config.container.iter().map(|s| s.name.as_str()))?;
    check_unique("battery", config.battery.iter().map(|s| s.name.as_str()))?;
    check_unique("disk", config.disk.iter().map(|s| s.name.as_str()))?;
    check_unique("custom", config.custom.iter().map(|s| s.name.as_str()))?;
    check_unique(
        "binary_sensor",
        config.binary_sensor.iter().map(|s| s.name.as_str()),
    )?;
    check_unique("network", config.network.iter().map(|s| s.name.as_str()))?;
    check_unique("fan", config.fan.iter().map(|s| s.name.as_str()))?;
    check_unique("ac_power", config.ac_power.iter().map(|s| s.name.as_str()))?;
    Ok(())
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path(cli_path)?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. Path given on the command line
    /// 2. `PENGUIN_METRICS_CONFIG` environment variable
    /// 3. `/etc/penguin-metrics/config.toml`
    fn get_config_path(cli_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = cli_path {
            return Ok(path.to_path_buf());
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file given and {} does not exist",
            DEFAULT_CONFIG_PATH
        )))
    }

    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }

    /// Number of configured sources; implicit temperature and GPU collectors
    /// and auto-discovered sources are not counted.
    pub fn source_count(&self) -> usize {
        self.system.len()
            + self.temperature.len()
            + self.process.len()
            + self.service.len()
            + self.container.len()
            + self.battery.len()
            + self.disk.len()
            + self.custom.len()
            + self.binary_sensor.len()
            + self.network.len()
            + self.fan.len()
            + self.ac_power.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::sources::ProcessMatch;

    #[test]
    fn test_empty_file_is_valid() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.queue_capacity, 1000);
        assert_eq!(config.homeassistant.discovery_prefix, "homeassistant");
        assert_eq!(config.source_count(), 0);
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            r#"
            [logger]
            level = "debug"

            [mqtt]
            host = "broker.lan"
            topic_prefix = "lab"
            retain = "online"

            [homeassistant]
            device_grouping = "host"

            [defaults]
            update_interval = 30

            [[system]]
            name = "server"
            temperature = true

            [[process]]
            name = "nginx"
            match = { type = "name", value = "nginx" }
            aggregate = true

            [[binary_sensor]]
            name = "vpn up"
            command = "ip link show wg0"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.topic_prefix, "lab");
        assert_eq!(config.mqtt.retain, penguin_metrics_mqtt::RetainMode::Online);
        assert_eq!(config.defaults.update_interval, 30.0);
        assert!(config.system[0].temperature);
        assert_eq!(config.process[0].match_rule, ProcessMatch::Name("nginx".into()));
        assert_eq!(config.source_count(), 3);
    }

    #[test]
    fn test_hardware_and_auto_sections() {
        let config = Config::parse(
            r#"
            [[network]]
            name = "eth0"

            [[fan]]
            name = "case"
            hwmon = "hwmon3"

            [[ac_power]]
            name = "mains"
            supply = "AC"

            [auto]
            refresh_interval = 60

            [auto.services]
            enabled = true
            filter = ["docker*"]
            "#,
        )
        .unwrap();

        assert_eq!(config.network[0].interface(), "eth0");
        assert_eq!(config.fan[0].hwmon(), "hwmon3");
        assert_eq!(config.ac_power[0].supply(), "AC");
        assert!(config.auto.services.enabled);
        assert_eq!(config.auto.refresh_interval, 60.0);
        assert_eq!(config.source_count(), 3);

        let err = Config::parse(
            r#"
            [auto]
            refresh_interval = nan
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Config::parse(
            r#"
            [[disk]]
            name = "Root FS"

            [[disk]]
            name = "root-fs"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate [[disk]] source"));
    }

    #[test]
    fn test_same_name_in_different_sections_allowed() {
        let config = Config::parse(
            r#"
            [[service]]
            name = "docker"
            match = { type = "unit", value = "docker" }

            [[process]]
            name = "docker"
            match = { type = "name", value = "dockerd" }
            "#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_implicit_temperature_collides_with_explicit() {
        let err = Config::parse(
            r#"
            [[system]]
            name = "server"
            temperature = true

            [[temperature]]
            name = "server"
            zone = "thermal_zone0"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_single_system_source() {
        let err = Config::parse(
            r#"
            [[system]]
            name = "a"

            [[system]]
            name = "b"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Only one [[system]] source"));
    }

    #[test]
    fn test_non_finite_seconds_rejected() {
        for text in [
            "[[custom]]\nname = \"c\"\ncommand = \"true\"\nupdate_interval = nan",
            "[[custom]]\nname = \"c\"\ncommand = \"true\"\ntimeout = nan",
            "[[binary_sensor]]\nname = \"b\"\ncommand = \"true\"\ntimeout = inf",
            "[defaults]\nupdate_interval = -inf",
            "[[disk]]\nname = \"root\"\nupdate_interval = 0.01",
        ] {
            let err = Config::parse(text).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{text}");
        }
        assert!(Config::parse("[[disk]]\nname = \"root\"\nupdate_interval = 0.1").is_ok());
    }

    #[test]
    fn test_invalid_topic_prefix_rejected() {
        let err = Config::parse(
            r#"
            [mqtt]
            topic_prefix = "a/#"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[mqtt]\nport = 8883").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mqtt.port, 8883);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/penguin.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = Config::parse("[mqtt\nhost =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_cli_path_wins() {
        let path = Config::get_config_path(Some(Path::new("/tmp/x.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
    }
}
