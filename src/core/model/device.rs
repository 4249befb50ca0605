use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::sanitize::sanitize_id;

/// Application prefix for unique ids and device identifiers.
pub const APP_ID: &str = "penguin_metrics";

pub const MANUFACTURER: &str = "Penguin Metrics";

/// Shared handle to a device. Many entities, across collectors, point at one device.
pub type DeviceRef = Arc<Device>;

/// Kind of monitored source. Decides topic layout, device model and the
/// states that count as alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    System,
    Temperature,
    Process,
    Service,
    Container,
    Battery,
    Disk,
    Custom,
    BinarySensor,
    Network,
    Fan,
    AcPower,
    Gpu,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::System => "system",
            SourceType::Temperature => "temperature",
            SourceType::Process => "process",
            SourceType::Service => "service",
            SourceType::Container => "container",
            SourceType::Battery => "battery",
            SourceType::Disk => "disk",
            SourceType::Custom => "custom",
            SourceType::BinarySensor => "binary_sensor",
            SourceType::Network => "network",
            SourceType::Fan => "fan",
            SourceType::AcPower => "ac_power",
            SourceType::Gpu => "gpu",
        }
    }

    /// `state` values meaning the source is alive.
    pub fn accepted_states(&self) -> &'static [&'static str] {
        match self {
            SourceType::Service => &["active"],
            SourceType::Container | SourceType::Process => &["running"],
            SourceType::Battery => &["charging", "discharging", "full", "not charging"],
            _ => &["online"],
        }
    }

    /// Only the host-wide source is tied to the global availability topic alone.
    pub fn is_host(&self) -> bool {
        matches!(self, SourceType::System)
    }

    fn model(&self) -> &'static str {
        match self {
            SourceType::System => "Linux Monitor",
            SourceType::Temperature => "Temperature Sensor",
            SourceType::Process => "Process Monitor",
            SourceType::Service => "Systemd Service",
            SourceType::Container => "Docker Container",
            SourceType::Battery => "Battery",
            SourceType::Disk => "Disk",
            SourceType::Custom => "Custom Sensor",
            SourceType::BinarySensor => "Binary Sensor",
            SourceType::Network => "Network Interface",
            SourceType::Fan => "Fan (hwmon)",
            SourceType::AcPower => "AC Power",
            SourceType::Gpu => "GPU Monitor",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device block of the discovery payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

impl Device {
    /// The host device every system-level entity belongs to.
    pub fn host(topic_prefix: &str, source_id: &str, name: &str) -> DeviceRef {
        Self::build(topic_prefix, SourceType::System, source_id, name, None)
    }

    /// A device of its own for a non-host source, linked to the host device.
    pub fn for_source(
        topic_prefix: &str,
        source_type: SourceType,
        source_id: &str,
        name: &str,
        via: Option<&Device>,
    ) -> DeviceRef {
        Self::build(topic_prefix, source_type, source_id, name, via)
    }

    fn build(
        topic_prefix: &str,
        source_type: SourceType,
        source_id: &str,
        name: &str,
        via: Option<&Device>,
    ) -> DeviceRef {
        let identifier = sanitize_id(&format!(
            "{APP_ID}_{topic_prefix}_{}_{source_id}",
            source_type.as_str()
        ));

        Arc::new(Device {
            identifiers: vec![identifier],
            name: name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: source_type.model().to_string(),
            via_device: via.and_then(|d| d.primary_identifier().map(str::to_string)),
        })
    }

    pub fn primary_identifier(&self) -> Option<&str> {
        self.identifiers.first().map(String::as_str)
    }
}
