//! `[auto]`: sources found by scanning the host instead of being listed.
//!
//! ```toml
//! [auto]
//! refresh_interval = 60
//!
//! [auto.temperatures]
//! enabled = true
//! source = "hwmon"
//! exclude = ["nvme*"]
//!
//! [auto.services]
//! enabled = true
//! filter = ["docker*", "ssh*"]
//! ```
//!
//! `filter` and `exclude` hold shell-style globs (`*`, `?`, `[abc]`, `[!abc]`).
//! An excluded name is never picked; with filters present only matching
//! names are. Services and processes are too numerous to take all of them,
//! so they require at least one filter.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::sources::validate_interval;

/// Where temperature sensors are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureFeed {
    /// `/sys/class/thermal/thermal_zone*`
    #[default]
    Thermal,
    /// `/sys/class/hwmon/hwmon*/temp*_input`
    Hwmon,
}

/// Discovery rule of one source kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AutoRule {
    pub enabled: bool,

    /// Only names matching one of these globs are picked.
    pub filter: Vec<String>,

    /// Names matching one of these globs are never picked.
    pub exclude: Vec<String>,

    /// Temperatures only.
    pub source: TemperatureFeed,

    #[validate(custom(function = "validate_interval"))]
    pub update_interval: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AutoConfig {
    /// Seconds between re-scans of services, containers and processes.
    /// `0` scans once at startup only.
    #[validate(custom(function = "validate_refresh_interval"))]
    pub refresh_interval: f64,

    #[validate(nested)]
    pub temperatures: AutoRule,
    #[validate(nested)]
    pub batteries: AutoRule,
    #[validate(nested)]
    pub ac_power: AutoRule,
    #[validate(nested)]
    pub disks: AutoRule,
    #[validate(nested)]
    pub networks: AutoRule,
    #[validate(nested)]
    pub fans: AutoRule,
    #[validate(nested)]
    pub containers: AutoRule,
    #[validate(nested)]
    pub services: AutoRule,
    #[validate(nested)]
    pub processes: AutoRule,
}

impl AutoConfig {
    /// Whether any kind is scanned at all.
    pub fn any_enabled(&self) -> bool {
        [
            &self.temperatures,
            &self.batteries,
            &self.ac_power,
            &self.disks,
            &self.networks,
            &self.fans,
            &self.containers,
            &self.services,
            &self.processes,
        ]
        .iter()
        .any(|rule| rule.enabled)
    }
}

fn validate_refresh_interval(value: f64) -> Result<(), ValidationError> {
    if value == 0.0 {
        return Ok(());
    }
    validate_interval(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let auto = AutoConfig::default();
        assert!(!auto.any_enabled());
        assert_eq!(auto.refresh_interval, 0.0);
        assert_eq!(auto.temperatures.source, TemperatureFeed::Thermal);
        assert!(auto.validate().is_ok());
    }

    #[test]
    fn test_rules_parse() {
        let auto: AutoConfig = toml::from_str(
            r#"
            refresh_interval = 30

            [temperatures]
            enabled = true
            source = "hwmon"
            exclude = ["nvme*"]

            [services]
            enabled = true
            filter = ["docker*"]
            update_interval = 5
            "#,
        )
        .unwrap();

        assert!(auto.any_enabled());
        assert_eq!(auto.temperatures.source, TemperatureFeed::Hwmon);
        assert_eq!(auto.temperatures.exclude, vec!["nvme*"]);
        assert_eq!(auto.services.filter, vec!["docker*"]);
        assert_eq!(auto.services.update_interval, Some(5.0));
        assert!(!auto.processes.enabled);
        assert!(auto.validate().is_ok());
    }

    #[test]
    fn test_refresh_interval_bounds() {
        for bad in [0.05, -1.0, f64::NAN, f64::INFINITY] {
            let auto = AutoConfig {
                refresh_interval: bad,
                ..AutoConfig::default()
            };
            assert!(auto.validate().is_err(), "{bad}");
        }
    }
}
