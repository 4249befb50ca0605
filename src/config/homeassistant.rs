//! `[homeassistant]` section: discovery announcements and reconciliation state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Which device the entities of non-host sources are attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceGrouping {
    /// Each process/service/container/custom source gets its own device,
    /// linked to the host device through `via_device`.
    #[default]
    PerSource,
    /// Every entity is attached to the host device.
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub discovery: bool,

    #[validate(length(
        min = 1,
        max = 255,
        message = "Discovery prefix must be between 1 and 255 characters"
    ))]
    pub discovery_prefix: String,

    /// Registered entity ids of the previous run.
    #[validate(custom(function = "validate_state_file"))]
    pub state_file: PathBuf,

    pub device_grouping: DeviceGrouping,
}

fn validate_state_file(path: &PathBuf) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() || path.file_name().is_none() {
        return Err(ValidationError::new("invalid_state_file")
            .with_message("State file must be a file path".into()));
    }
    Ok(())
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        HomeAssistantConfig {
            discovery: true,
            discovery_prefix: "homeassistant".to_string(),
            state_file: PathBuf::from("/var/lib/penguin-metrics/registered_sensors.json"),
            device_grouping: DeviceGrouping::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HomeAssistantConfig::default();
        assert!(config.discovery);
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert_eq!(config.device_grouping, DeviceGrouping::PerSource);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_grouping() {
        let config: HomeAssistantConfig =
            toml::from_str(r#"device_grouping = "host""#).unwrap();
        assert_eq!(config.device_grouping, DeviceGrouping::Host);
    }

    #[test]
    fn test_directory_state_file_rejected() {
        let config = HomeAssistantConfig {
            state_file: PathBuf::from("/"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
