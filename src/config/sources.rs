//! Monitored sources: `[defaults]` plus one array of tables per source type.
//!
//! ```toml
//! [defaults]
//! update_interval = 10
//!
//! [[system]]
//! name = "server"
//! temperature = true
//!
//! [[process]]
//! name = "nginx"
//! match = { type = "name", value = "nginx" }
//! aggregate = true
//!
//! [[service]]
//! name = "docker"
//! match = { type = "unit", value = "docker.service" }
//!
//! [[network]]
//! name = "wan"
//! interface = "eth0"
//! ```
//!
//! Toggles left out of a source fall back to the matching `[defaults.*]`
//! table; `update_interval` falls back to `defaults.update_interval`.

use std::{path::PathBuf, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::model::sanitize_id;

fn default_true() -> bool {
    true
}

fn default_mountpoint() -> String {
    "/".to_string()
}

fn default_scale() -> f64 {
    1.0
}

fn default_command_timeout() -> f64 {
    5.0
}

fn validate_source_name(name: &str) -> Result<(), ValidationError> {
    if sanitize_id(name).is_empty() {
        return Err(ValidationError::new("invalid_source_name").with_message(
            format!("Source name '{name}' must contain at least one letter or digit").into(),
        ));
    }
    Ok(())
}

fn validate_regex(pattern: &str) -> Result<(), ValidationError> {
    Regex::new(pattern).map(|_| ()).map_err(|e| {
        ValidationError::new("invalid_pattern")
            .with_message(format!("Invalid pattern '{pattern}': {e}").into())
    })
}

fn validate_seconds(value: f64, max: f64, code: &'static str) -> Result<(), ValidationError> {
    // NaN fails the containment check as well
    if (0.1..=max).contains(&value) {
        return Ok(());
    }
    Err(ValidationError::new(code)
        .with_message(format!("Must be between 0.1 and {max} seconds, got {value}").into()))
}

fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        return Ok(());
    }
    Err(ValidationError::new("not_finite").with_message("Must be a finite number".into()))
}

pub(crate) fn validate_interval(value: f64) -> Result<(), ValidationError> {
    validate_seconds(value, 86400.0, "invalid_interval")
}

fn validate_timeout(value: f64) -> Result<(), ValidationError> {
    validate_seconds(value, 300.0, "invalid_timeout")
}

/// Interval of a source, falling back to the global default.
pub fn resolve_interval(own: Option<f64>, defaults: &DefaultsConfig) -> Duration {
    Duration::from_secs_f64(own.unwrap_or(defaults.update_interval))
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DefaultsConfig {
    #[validate(custom(function = "validate_interval"))]
    pub update_interval: f64,

    pub process: ProcessToggles,
    pub service: ServiceToggles,
    pub container: ContainerToggles,
    pub battery: BatteryToggles,
    pub network: NetworkToggles,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            update_interval: 10.0,
            process: ProcessToggles::default(),
            service: ServiceToggles::default(),
            container: ContainerToggles::default(),
            battery: BatteryToggles::default(),
            network: NetworkToggles::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessToggles {
    pub cpu: bool,
    pub memory: bool,
    pub threads: bool,
    pub fds: bool,
}

impl Default for ProcessToggles {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            threads: false,
            fds: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceToggles {
    pub cpu: bool,
    pub memory: bool,
    pub restart_count: bool,
}

impl Default for ServiceToggles {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            restart_count: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerToggles {
    pub cpu: bool,
    pub memory: bool,
    pub health: bool,
    pub uptime: bool,
}

impl Default for ContainerToggles {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            health: false,
            uptime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryToggles {
    pub voltage: bool,
    pub current: bool,
    pub power: bool,
    pub health: bool,
    pub cycles: bool,
}

impl Default for BatteryToggles {
    fn default() -> Self {
        Self {
            voltage: true,
            current: false,
            power: true,
            health: false,
            cycles: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkToggles {
    pub bytes: bool,
    pub packets: bool,
    pub errors: bool,
    pub drops: bool,
    /// KiB/s derived from the byte counters.
    pub rate: bool,
    pub packets_rate: bool,
    pub isup: bool,
    pub speed: bool,
    pub mtu: bool,
    pub duplex: bool,
    /// Wi-Fi signal through `iw`, falling back to `iwconfig`.
    pub rssi: bool,
}

impl Default for NetworkToggles {
    fn default() -> Self {
        Self {
            bytes: true,
            packets: false,
            errors: false,
            drops: false,
            rate: true,
            packets_rate: false,
            isup: true,
            speed: false,
            mtu: false,
            duplex: false,
            rssi: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SystemSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    #[serde(default = "default_true")]
    pub cpu: bool,
    #[serde(default)]
    pub cpu_per_core: bool,
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default = "default_true")]
    pub swap: bool,
    #[serde(default = "default_true")]
    pub load: bool,
    #[serde(default = "default_true")]
    pub uptime: bool,
    /// Adds a temperature collector covering every thermal zone, on the host device.
    #[serde(default)]
    pub temperature: bool,
    /// Adds a `{name}_gpu` collector over devfreq and DRM cards, on the host device.
    #[serde(default)]
    pub gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_temperature_source"))]
pub struct TemperatureSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Thermal zone directory name, e.g. `thermal_zone0`.
    pub zone: Option<String>,

    /// Any file holding millidegrees Celsius, e.g. a hwmon `temp1_input`.
    pub path: Option<PathBuf>,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

fn validate_temperature_source(source: &TemperatureSourceConfig) -> Result<(), ValidationError> {
    if source.zone.is_some() && source.path.is_some() {
        return Err(ValidationError::new("ambiguous_temperature_source")
            .with_message("Set either zone or path, not both".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ProcessMatch {
    /// Exact process name (`comm`).
    Name(String),
    /// Regular expression over the full command line.
    Pattern(String),
    Pid(u32),
    /// File containing the pid.
    Pidfile(PathBuf),
    /// Substring of the full command line.
    Cmdline(String),
}

fn validate_process_match(rule: &ProcessMatch) -> Result<(), ValidationError> {
    match rule {
        ProcessMatch::Pattern(pattern) => validate_regex(pattern),
        ProcessMatch::Name(value) | ProcessMatch::Cmdline(value) if value.is_empty() => {
            Err(ValidationError::new("empty_match").with_message("Match value is empty".into()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "match")]
    #[validate(custom(function = "validate_process_match"))]
    pub match_rule: ProcessMatch,

    /// Sum the metrics of every matching process instead of using the first.
    #[serde(default)]
    pub aggregate: bool,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    pub cpu: Option<bool>,
    pub memory: Option<bool>,
    pub threads: Option<bool>,
    pub fds: Option<bool>,
}

impl ProcessSourceConfig {
    pub fn toggles(&self, defaults: &ProcessToggles) -> ProcessToggles {
        ProcessToggles {
            cpu: self.cpu.unwrap_or(defaults.cpu),
            memory: self.memory.unwrap_or(defaults.memory),
            threads: self.threads.unwrap_or(defaults.threads),
            fds: self.fds.unwrap_or(defaults.fds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ServiceMatch {
    /// Unit name; `.service` is appended when no suffix is given.
    Unit(String),
    /// Regular expression over loaded unit names; the first match is used.
    Pattern(String),
}

fn validate_service_match(rule: &ServiceMatch) -> Result<(), ValidationError> {
    match rule {
        ServiceMatch::Pattern(pattern) => validate_regex(pattern),
        ServiceMatch::Unit(unit) if unit.is_empty() => {
            Err(ValidationError::new("empty_match").with_message("Unit name is empty".into()))
        }
        ServiceMatch::Unit(_) => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServiceSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "match")]
    #[validate(custom(function = "validate_service_match"))]
    pub match_rule: ServiceMatch,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    pub cpu: Option<bool>,
    pub memory: Option<bool>,
    pub restart_count: Option<bool>,
}

impl ServiceSourceConfig {
    pub fn toggles(&self, defaults: &ServiceToggles) -> ServiceToggles {
        ServiceToggles {
            cpu: self.cpu.unwrap_or(defaults.cpu),
            memory: self.memory.unwrap_or(defaults.memory),
            restart_count: self.restart_count.unwrap_or(defaults.restart_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ContainerMatch {
    Name(String),
    /// Regular expression over container names.
    Pattern(String),
    /// Image reference, as accepted by `docker ps --filter ancestor=`.
    Image(String),
    /// `key` or `key=value`, as accepted by `docker ps --filter label=`.
    Label(String),
}

fn validate_container_match(rule: &ContainerMatch) -> Result<(), ValidationError> {
    match rule {
        ContainerMatch::Pattern(pattern) => validate_regex(pattern),
        ContainerMatch::Name(v) | ContainerMatch::Image(v) | ContainerMatch::Label(v)
            if v.is_empty() =>
        {
            Err(ValidationError::new("empty_match").with_message("Match value is empty".into()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ContainerSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "match")]
    #[validate(custom(function = "validate_container_match"))]
    pub match_rule: ContainerMatch,

    /// Sum the metrics of every matching container instead of using the first.
    #[serde(default)]
    pub aggregate: bool,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    pub cpu: Option<bool>,
    pub memory: Option<bool>,
    pub health: Option<bool>,
    pub uptime: Option<bool>,
}

impl ContainerSourceConfig {
    pub fn toggles(&self, defaults: &ContainerToggles) -> ContainerToggles {
        ContainerToggles {
            cpu: self.cpu.unwrap_or(defaults.cpu),
            memory: self.memory.unwrap_or(defaults.memory),
            health: self.health.unwrap_or(defaults.health),
            uptime: self.uptime.unwrap_or(defaults.uptime),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatterySourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Power supply directory name, e.g. `BAT0`. Defaults to the first `BAT*`.
    pub battery: Option<String>,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    pub voltage: Option<bool>,
    pub current: Option<bool>,
    pub power: Option<bool>,
    pub health: Option<bool>,
    pub cycles: Option<bool>,
}

impl BatterySourceConfig {
    pub fn toggles(&self, defaults: &BatteryToggles) -> BatteryToggles {
        BatteryToggles {
            voltage: self.voltage.unwrap_or(defaults.voltage),
            current: self.current.unwrap_or(defaults.current),
            power: self.power.unwrap_or(defaults.power),
            health: self.health.unwrap_or(defaults.health),
            cycles: self.cycles.unwrap_or(defaults.cycles),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DiskSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mountpoint")]
    #[validate(length(min = 1, message = "Mountpoint must not be empty"))]
    pub mountpoint: String,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NetworkSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interface name, e.g. `eth0`. Defaults to the source name.
    pub interface: Option<String>,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,

    pub bytes: Option<bool>,
    pub packets: Option<bool>,
    pub errors: Option<bool>,
    pub drops: Option<bool>,
    pub rate: Option<bool>,
    pub packets_rate: Option<bool>,
    pub isup: Option<bool>,
    pub speed: Option<bool>,
    pub mtu: Option<bool>,
    pub duplex: Option<bool>,
    pub rssi: Option<bool>,
}

impl NetworkSourceConfig {
    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(&self.name)
    }

    pub fn toggles(&self, defaults: &NetworkToggles) -> NetworkToggles {
        NetworkToggles {
            bytes: self.bytes.unwrap_or(defaults.bytes),
            packets: self.packets.unwrap_or(defaults.packets),
            errors: self.errors.unwrap_or(defaults.errors),
            drops: self.drops.unwrap_or(defaults.drops),
            rate: self.rate.unwrap_or(defaults.rate),
            packets_rate: self.packets_rate.unwrap_or(defaults.packets_rate),
            isup: self.isup.unwrap_or(defaults.isup),
            speed: self.speed.unwrap_or(defaults.speed),
            mtu: self.mtu.unwrap_or(defaults.mtu),
            duplex: self.duplex.unwrap_or(defaults.duplex),
            rssi: self.rssi.unwrap_or(defaults.rssi),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FanSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// hwmon directory name, e.g. `hwmon2`. Defaults to the source name.
    pub hwmon: Option<String>,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

impl FanSourceConfig {
    pub fn hwmon(&self) -> &str {
        self.hwmon.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_ac_power_source"))]
pub struct AcPowerSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Power supply directory name, e.g. `AC` or `axp22x-ac`. Defaults to the source name.
    pub supply: Option<String>,

    /// Power supply directory holding the `online` file; overrides `supply`.
    pub path: Option<PathBuf>,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

impl AcPowerSourceConfig {
    pub fn supply(&self) -> &str {
        self.supply.as_deref().unwrap_or(&self.name)
    }
}

fn validate_ac_power_source(source: &AcPowerSourceConfig) -> Result<(), ValidationError> {
    if source.supply.is_some() && source.path.is_some() {
        return Err(ValidationError::new("ambiguous_ac_power_source")
            .with_message("Set either supply or path, not both".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomValueType {
    #[default]
    Number,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CustomSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run through `sh -c`; the first line of stdout is the value.
    #[validate(length(min = 1, message = "Command must not be empty"))]
    pub command: String,

    #[serde(rename = "type", default)]
    pub value_type: CustomValueType,

    pub unit: Option<String>,
    pub device_class: Option<String>,

    /// Numeric values are multiplied by this.
    #[serde(default = "default_scale")]
    #[validate(custom(function = "validate_finite"))]
    pub scale: f64,

    #[serde(default = "default_command_timeout")]
    #[validate(custom(function = "validate_timeout"))]
    pub timeout: f64,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BinarySensorSourceConfig {
    #[validate(custom(function = "validate_source_name"))]
    pub name: String,

    /// A disabled source is neither announced nor polled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run through `sh -c`; exit code 0 means ON.
    #[validate(length(min = 1, message = "Command must not be empty"))]
    pub command: String,

    #[serde(default)]
    pub invert: bool,

    pub device_class: Option<String>,

    #[serde(default = "default_command_timeout")]
    #[validate(custom(function = "validate_timeout"))]
    pub timeout: f64,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_match_parses_each_rule() {
        let source: ProcessSourceConfig = toml::from_str(
            r#"
            name = "nginx"
            match = { type = "name", value = "nginx" }
            "#,
        )
        .unwrap();
        assert_eq!(source.match_rule, ProcessMatch::Name("nginx".into()));

        let source: ProcessSourceConfig = toml::from_str(
            r#"
            name = "init"
            match = { type = "pid", value = 1 }
            "#,
        )
        .unwrap();
        assert_eq!(source.match_rule, ProcessMatch::Pid(1));

        let source: ProcessSourceConfig = toml::from_str(
            r#"
            name = "sshd"
            match = { type = "pidfile", value = "/run/sshd.pid" }
            "#,
        )
        .unwrap();
        assert_eq!(
            source.match_rule,
            ProcessMatch::Pidfile(PathBuf::from("/run/sshd.pid"))
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let source: ProcessSourceConfig = toml::from_str(
            r#"
            name = "broken"
            match = { type = "pattern", value = "([a-z" }
            "#,
        )
        .unwrap();
        let err = source.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid pattern"));
    }

    #[test]
    fn test_toggles_fall_back_to_defaults() {
        let source: ServiceSourceConfig = toml::from_str(
            r#"
            name = "docker"
            match = { type = "unit", value = "docker.service" }
            memory = false
            "#,
        )
        .unwrap();
        let toggles = source.toggles(&ServiceToggles::default());
        assert!(toggles.cpu);
        assert!(!toggles.memory);
        assert!(!toggles.restart_count);
    }

    #[test]
    fn test_interval_resolution() {
        let defaults = DefaultsConfig::default();
        assert_eq!(resolve_interval(None, &defaults), Duration::from_secs(10));
        assert_eq!(
            resolve_interval(Some(2.5), &defaults),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_unnamed_source_rejected() {
        let source: DiskSourceConfig = toml::from_str(r#"name = "!!""#).unwrap();
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_temperature_zone_and_path_conflict() {
        let source = TemperatureSourceConfig {
            name: "cpu".into(),
            zone: Some("thermal_zone0".into()),
            path: Some(PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input")),
            update_interval: None,
            enabled: true,
        };
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_network_toggles_and_interface() {
        let source: NetworkSourceConfig = toml::from_str(
            r#"
            name = "uplink"
            interface = "eth0"
            rssi = true
            rate = false
            "#,
        )
        .unwrap();
        assert_eq!(source.interface(), "eth0");

        let toggles = source.toggles(&NetworkToggles::default());
        assert!(toggles.bytes);
        assert!(toggles.rssi);
        assert!(!toggles.rate);
        assert!(toggles.isup);
    }

    #[test]
    fn test_ac_power_supply_and_path_conflict() {
        let source: AcPowerSourceConfig = toml::from_str(
            r#"
            name = "mains"
            supply = "AC"
            path = "/sys/class/power_supply/AC"
            "#,
        )
        .unwrap();
        assert!(source.validate().is_err());

        let source: AcPowerSourceConfig = toml::from_str(r#"name = "AC""#).unwrap();
        assert_eq!(source.supply(), "AC");
        assert!(source.validate().is_ok());
    }

    #[test]
    fn test_custom_source_defaults() {
        let source: CustomSourceConfig = toml::from_str(
            r#"
            name = "queue depth"
            command = "cat /tmp/depth"
            "#,
        )
        .unwrap();
        assert_eq!(source.value_type, CustomValueType::Number);
        assert_eq!(source.scale, 1.0);
        assert_eq!(source.timeout, 5.0);
        assert!(source.validate().is_ok());
    }
}
