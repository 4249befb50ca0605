//! Batteries under `/sys/class/power_supply`.

use std::path::PathBuf;

use tracing::debug;

use super::{
    error::CollectorError,
    fsutil::{read_optional_number, read_trimmed},
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{BatterySourceConfig, BatteryToggles},
    core::model::{CollectionResult, Entity, SourceContext, STATE_NOT_FOUND},
};

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Kernel `status` (`Charging`, `Not charging`, ...) as a payload state.
pub fn normalize_status(status: &str) -> String {
    status.trim().to_lowercase()
}

pub struct BatteryCollector {
    ctx: SourceContext,
    schedule: Schedule,
    wanted: Option<String>,
    toggles: BatteryToggles,
    root: PathBuf,
    device: Option<PathBuf>,
}

impl BatteryCollector {
    pub fn new(
        ctx: SourceContext,
        schedule: Schedule,
        config: &BatterySourceConfig,
        defaults: &BatteryToggles,
    ) -> Self {
        Self {
            ctx,
            schedule,
            wanted: config.battery.clone(),
            toggles: config.toggles(defaults),
            root: PathBuf::from(POWER_SUPPLY_ROOT),
            device: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// The configured supply, or the first one whose `type` is `Battery`.
    async fn find_device(&self) -> CollectorResult<PathBuf> {
        if let Some(name) = &self.wanted {
            let path = self.root.join(name);
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(CollectorError::SourceNotFound(format!("battery {name}")));
            }
            return Ok(path);
        }

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| CollectorError::from_io(&self.root, source))?;
        let mut candidates = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            candidates.push(entry.path());
        }
        candidates.sort();

        for path in candidates {
            if read_trimmed(&path.join("type"))
                .await
                .is_ok_and(|kind| kind == "Battery")
            {
                return Ok(path);
            }
        }
        Err(CollectorError::SourceNotFound("no battery present".into()))
    }
}

#[async_trait::async_trait]
impl Collector for BatteryCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        let device = self.find_device().await?;
        debug!("Battery collector {} reads {}", self.id(), device.display());
        self.device = Some(device);
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let mut entities = vec![
            ctx.sensor("state", "Status").icon("mdi:battery-charging"),
            ctx.sensor("capacity", "Battery")
                .unit("%")
                .device_class("battery")
                .measurement(),
        ];
        if self.toggles.voltage {
            entities.push(
                ctx.sensor("voltage", "Voltage")
                    .unit("V")
                    .device_class("voltage")
                    .measurement(),
            );
        }
        if self.toggles.current {
            entities.push(
                ctx.sensor("current", "Current")
                    .unit("A")
                    .device_class("current")
                    .measurement(),
            );
        }
        if self.toggles.power {
            entities.push(
                ctx.sensor("power", "Power")
                    .unit("W")
                    .device_class("power")
                    .measurement(),
            );
        }
        if self.toggles.health {
            entities.push(ctx.sensor("health", "Health").icon("mdi:battery-heart-variant").diagnostic());
        }
        if self.toggles.cycles {
            entities.push(
                ctx.sensor("cycles", "Charge Cycles")
                    .total_increasing()
                    .icon("mdi:battery-sync")
                    .diagnostic(),
            );
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let device = match &self.device {
            Some(device) => device.clone(),
            None => {
                let device = self.find_device().await?;
                self.device = Some(device.clone());
                device
            }
        };

        let status = match read_trimmed(&device.join("status")).await {
            Ok(status) => normalize_status(&status),
            Err(e) => {
                if e.state() == STATE_NOT_FOUND {
                    // unplugged; look again next time
                    self.device = None;
                }
                return Err(e);
            }
        };

        let mut result = CollectionResult::available(status);
        if let Some(capacity) = read_optional_number::<u32>(&device.join("capacity")).await {
            result.set("capacity", capacity);
        }

        // Kernel units are micro-volts, micro-amps and micro-watts.
        let voltage = read_optional_number::<f64>(&device.join("voltage_now"))
            .await
            .map(|uv| uv / 1e6);
        let current = read_optional_number::<f64>(&device.join("current_now"))
            .await
            .map(|ua| ua.abs() / 1e6);
        let power = match read_optional_number::<f64>(&device.join("power_now")).await {
            Some(uw) => Some(uw.abs() / 1e6),
            None => voltage.zip(current).map(|(v, a)| v * a),
        };

        if self.toggles.voltage {
            if let Some(voltage) = voltage {
                result.set("voltage", voltage);
            }
        }
        if self.toggles.current {
            if let Some(current) = current {
                result.set("current", current);
            }
        }
        if self.toggles.power {
            if let Some(power) = power {
                result.set("power", power);
            }
        }
        if self.toggles.health {
            if let Ok(health) = read_trimmed(&device.join("health")).await {
                result.set("health", health.to_lowercase());
            }
        }
        if self.toggles.cycles {
            if let Some(cycles) = read_optional_number::<u64>(&device.join("cycle_count")).await {
                result.set("cycles", cycles);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::core::model::{AvailabilityRule, Device, MetricValue, SourceType};

    fn supply(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir(&dir).unwrap();
        for (file, content) in files {
            fs::write(dir.join(file), format!("{content}\n")).unwrap();
        }
    }

    fn fixture() -> TempDir {
        let dir = tempdir().unwrap();
        supply(dir.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(
            dir.path(),
            "BAT0",
            &[
                ("type", "Battery"),
                ("status", "Not charging"),
                ("capacity", "80"),
                ("voltage_now", "12000000"),
                ("current_now", "-1500000"),
                ("health", "Good"),
                ("cycle_count", "42"),
            ],
        );
        dir
    }

    fn collector(root: &Path, battery: Option<&str>) -> BatteryCollector {
        let config = BatterySourceConfig {
            name: "laptop".into(),
            enabled: true,
            battery: battery.map(str::to_string),
            update_interval: None,
            voltage: None,
            current: Some(true),
            power: None,
            health: Some(true),
            cycles: Some(true),
        };
        let host = Device::host("test", "host", "Host");
        let ctx = SourceContext::new("test", SourceType::Battery, "laptop", host);
        BatteryCollector::new(ctx, Schedule::every(Duration::from_secs(30)), &config, &BatteryToggles::default())
            .with_root(root)
    }

    #[tokio::test]
    async fn test_finds_first_battery() {
        let dir = fixture();
        let mut collector = collector(dir.path(), None);
        collector.initialize().await.unwrap();

        let result = collector.collect().await.unwrap();
        assert_eq!(result.state, "not charging");
        assert_eq!(result.get("capacity"), Some(&MetricValue::Int(80)));
        assert_eq!(result.get("voltage"), Some(&MetricValue::Float(12.0)));
        assert_eq!(result.get("current"), Some(&MetricValue::Float(1.5)));
        assert_eq!(result.get("power"), Some(&MetricValue::Float(18.0)));
        assert_eq!(result.get("health"), Some(&MetricValue::Text("good".into())));
        assert_eq!(result.get("cycles"), Some(&MetricValue::Int(42)));

        let rule = AvailabilityRule::for_source(SourceType::Battery);
        assert!(rule.evaluate("online", Some(&result.state)));
    }

    #[tokio::test]
    async fn test_missing_battery() {
        let dir = fixture();
        let mut collector = collector(dir.path(), Some("BAT1"));
        let err = collector.initialize().await.unwrap_err();
        assert_eq!(err.state(), "not_found");
    }

    #[tokio::test]
    async fn test_unplugged_battery_is_not_found() {
        let dir = fixture();
        let mut collector = collector(dir.path(), Some("BAT0"));
        collector.initialize().await.unwrap();
        fs::remove_dir_all(dir.path().join("BAT0")).unwrap();

        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), "not_found");
    }

    #[test]
    fn test_normalize_status() {
        assert_eq!(normalize_status("Discharging\n"), "discharging");
    }
}
