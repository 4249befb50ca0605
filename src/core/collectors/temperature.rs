//! Thermal zones and hwmon-style temperature files.

use std::path::PathBuf;

use tracing::{debug, warn};

use super::{
    error::CollectorError,
    fsutil::{read_number, read_trimmed},
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::TemperatureSourceConfig,
    core::model::{sanitize_id, CollectionResult, Entity, SourceContext},
};

const THERMAL_ROOT: &str = "/sys/class/thermal";

/// Payload key of a single-sensor collector.
pub const TEMPERATURE_KEY: &str = "temperature";

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Zone(String),
    File(PathBuf),
    AllZones,
}

#[derive(Debug, Clone, PartialEq)]
struct Sensor {
    key: String,
    label: String,
    path: PathBuf,
}

pub struct TemperatureCollector {
    ctx: SourceContext,
    schedule: Schedule,
    target: Target,
    thermal_root: PathBuf,
    sensors: Vec<Sensor>,
}

impl TemperatureCollector {
    pub fn from_config(
        ctx: SourceContext,
        schedule: Schedule,
        config: &TemperatureSourceConfig,
    ) -> Self {
        let target = match (&config.zone, &config.path) {
            (Some(zone), _) => Target::Zone(zone.clone()),
            (None, Some(path)) => Target::File(path.clone()),
            (None, None) => Target::AllZones,
        };
        Self::new(ctx, schedule, target)
    }

    /// Every thermal zone of the host, one entity each.
    pub fn all_zones(ctx: SourceContext, schedule: Schedule) -> Self {
        Self::new(ctx, schedule, Target::AllZones)
    }

    fn new(ctx: SourceContext, schedule: Schedule, target: Target) -> Self {
        Self {
            ctx,
            schedule,
            target,
            thermal_root: PathBuf::from(THERMAL_ROOT),
            sensors: Vec::new(),
        }
    }

    pub fn with_thermal_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.thermal_root = root.into();
        self
    }

    async fn discover_zones(&self) -> CollectorResult<Vec<Sensor>> {
        let mut entries = tokio::fs::read_dir(&self.thermal_root)
            .await
            .map_err(|source| CollectorError::from_io(&self.thermal_root, source))?;

        let mut zones = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| CollectorError::from_io(&self.thermal_root, source))?
        {
            let zone = entry.file_name().to_string_lossy().into_owned();
            if zone.starts_with("thermal_zone") {
                zones.push(zone);
            }
        }
        zones.sort_by_key(|zone| zone_index(zone));

        let mut sensors: Vec<Sensor> = Vec::with_capacity(zones.len());
        for zone in zones {
            let dir = self.thermal_root.join(&zone);
            let label = read_trimmed(&dir.join("type"))
                .await
                .unwrap_or_else(|_| zone.clone());
            let mut key = sanitize_id(&label);
            if key.is_empty() || sensors.iter().any(|s| s.key == key) {
                key = sanitize_id(&zone);
            }
            sensors.push(Sensor {
                key,
                label,
                path: dir.join("temp"),
            });
        }
        Ok(sensors)
    }
}

fn zone_index(zone: &str) -> u32 {
    zone.trim_start_matches("thermal_zone")
        .parse()
        .unwrap_or(u32::MAX)
}

/// Millidegrees Celsius as written by the kernel, to degrees.
pub fn millidegrees_to_celsius(raw: i64) -> f64 {
    raw as f64 / 1000.0
}

#[async_trait::async_trait]
impl Collector for TemperatureCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        self.sensors = match &self.target {
            Target::Zone(zone) => vec![Sensor {
                key: TEMPERATURE_KEY.to_string(),
                label: zone.clone(),
                path: self.thermal_root.join(zone).join("temp"),
            }],
            Target::File(path) => vec![Sensor {
                key: TEMPERATURE_KEY.to_string(),
                label: path.display().to_string(),
                path: path.clone(),
            }],
            Target::AllZones => self.discover_zones().await?,
        };

        if self.sensors.is_empty() {
            warn!("Temperature collector {} found no thermal zones", self.id());
        } else {
            debug!(
                "Temperature collector {} reads {} sensor(s)",
                self.id(),
                self.sensors.len()
            );
        }
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        self.sensors
            .iter()
            .map(|sensor| {
                let name = if sensor.key == TEMPERATURE_KEY {
                    "Temperature".to_string()
                } else {
                    format!("Temperature {}", sensor.label)
                };
                self.ctx
                    .sensor(&sensor.key, name)
                    .unit("°C")
                    .device_class("temperature")
                    .measurement()
            })
            .collect()
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        if self.sensors.is_empty() {
            return Err(CollectorError::SourceNotFound(format!(
                "no temperature sensors for {}",
                self.ctx.display_name
            )));
        }

        let mut result = CollectionResult::online();
        let mut first_error = None;
        for sensor in &self.sensors {
            match read_number::<i64>(&sensor.path).await {
                Ok(raw) => result.set(sensor.key.clone(), millidegrees_to_celsius(raw)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if result.data().is_empty() => Err(e),
            _ => Ok(result),
        }
    }
}
