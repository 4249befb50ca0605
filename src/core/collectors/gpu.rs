//! GPUs visible through generic sysfs interfaces.
//!
//! devfreq devices whose name mentions `gpu` or `mali` (ARM SoCs), and DRM
//! cards (`card0`, not connectors like `card0-HDMI-A-1`). Vendor tools are not
//! used, so what each GPU reports depends on its driver.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    error::CollectorError,
    fsutil::{read_optional_number, read_trimmed},
    temperature::millidegrees_to_celsius,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::core::model::{sanitize_id, CollectionResult, Entity, SourceContext};

const DEVFREQ_ROOT: &str = "/sys/class/devfreq";
const DRM_ROOT: &str = "/sys/class/drm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interface {
    Devfreq,
    Drm,
}

#[derive(Debug, Clone, PartialEq)]
struct Gpu {
    /// Payload key prefix.
    id: String,
    name: String,
    path: PathBuf,
    interface: Interface,
}

/// Readings of one GPU; every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuReading {
    pub frequency_mhz: Option<u64>,
    pub temperature: Option<f64>,
    pub utilization: Option<u64>,
}

async fn entry_names(root: &Path) -> Vec<String> {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return Vec::new();
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

/// Current frequency from a devfreq directory (`cur_freq` in Hz) and its `load`.
pub async fn devfreq_reading(dir: &Path) -> GpuReading {
    let frequency_mhz = read_optional_number::<u64>(&dir.join("cur_freq"))
        .await
        .filter(|hz| *hz > 0)
        .map(|hz| hz / 1_000_000);

    // `load` is `busy@freq` on most drivers
    let utilization = read_trimmed(&dir.join("load"))
        .await
        .ok()
        .and_then(|load| load.split('@').next().and_then(|busy| busy.trim().parse().ok()));

    GpuReading {
        frequency_mhz,
        temperature: None,
        utilization,
    }
}

/// Active clock from a DPM table (`1: 1200Mhz *`).
pub fn active_dpm_clock(table: &str) -> Option<u64> {
    table
        .lines()
        .find(|line| line.contains('*'))?
        .split_whitespace()
        .find_map(|part| {
            part.strip_suffix("Mhz")
                .or_else(|| part.strip_suffix("MHz"))
                .and_then(|mhz| mhz.parse().ok())
        })
}

/// Temperature and frequency from `card*/device`.
pub async fn drm_reading(card: &Path) -> GpuReading {
    let device = card.join("device");
    let mut reading = GpuReading::default();

    for hwmon in entry_names(&device.join("hwmon")).await {
        let input = device.join("hwmon").join(hwmon).join("temp1_input");
        if let Some(raw) = read_optional_number::<i64>(&input).await {
            if raw > 0 {
                reading.temperature = Some(millidegrees_to_celsius(raw));
            }
            break;
        }
    }

    if let Some(mhz) = read_optional_number::<u64>(&device.join("gt/gt0/rps_cur_freq_mhz")).await {
        reading.frequency_mhz = Some(mhz).filter(|mhz| *mhz > 0);
    }
    if let Ok(table) = read_trimmed(&device.join("pp_dpm_sclk")).await {
        reading.frequency_mhz = active_dpm_clock(&table).or(reading.frequency_mhz);
    } else if let Some(mhz) = read_optional_number::<u64>(&device.join("gt_cur_freq_mhz")).await {
        reading.frequency_mhz = Some(mhz).filter(|mhz| *mhz > 0).or(reading.frequency_mhz);
    }

    reading
}

pub struct GpuCollector {
    ctx: SourceContext,
    schedule: Schedule,
    devfreq_root: PathBuf,
    drm_root: PathBuf,
    gpus: Vec<Gpu>,
}

impl GpuCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule) -> Self {
        Self {
            ctx,
            schedule,
            devfreq_root: PathBuf::from(DEVFREQ_ROOT),
            drm_root: PathBuf::from(DRM_ROOT),
            gpus: Vec::new(),
        }
    }

    pub fn with_roots(mut self, devfreq: impl Into<PathBuf>, drm: impl Into<PathBuf>) -> Self {
        self.devfreq_root = devfreq.into();
        self.drm_root = drm.into();
        self
    }

    async fn discover(&self) -> Vec<Gpu> {
        let mut gpus = Vec::new();
        for name in entry_names(&self.devfreq_root).await {
            let lower = name.to_lowercase();
            if lower.contains("gpu") || lower.contains("mali") {
                gpus.push(Gpu {
                    id: sanitize_id(&name),
                    path: self.devfreq_root.join(&name),
                    name,
                    interface: Interface::Devfreq,
                });
            }
        }
        for name in entry_names(&self.drm_root).await {
            if name.starts_with("card") && !name.contains('-') {
                gpus.push(Gpu {
                    id: sanitize_id(&name),
                    path: self.drm_root.join(&name),
                    name,
                    interface: Interface::Drm,
                });
            }
        }
        gpus
    }
}

#[async_trait::async_trait]
impl Collector for GpuCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        self.gpus = self.discover().await;
        if self.gpus.is_empty() {
            warn!("GPU collector {} found no GPU devices", self.id());
        } else {
            debug!("GPU collector {} reads {} device(s)", self.id(), self.gpus.len());
        }
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        self.gpus
            .iter()
            .flat_map(|gpu| {
                [
                    ctx.sensor(&format!("{}_frequency", gpu.id), format!("GPU {} Frequency", gpu.name))
                        .unit("MHz")
                        .device_class("frequency")
                        .measurement()
                        .icon("mdi:chip"),
                    ctx.sensor(
                        &format!("{}_temperature", gpu.id),
                        format!("GPU {} Temperature", gpu.name),
                    )
                    .unit("°C")
                    .device_class("temperature")
                    .measurement()
                    .disabled_by_default(),
                    ctx.sensor(
                        &format!("{}_utilization", gpu.id),
                        format!("GPU {} Utilization", gpu.name),
                    )
                    .percent()
                    .icon("mdi:chip")
                    .disabled_by_default(),
                ]
            })
            .collect()
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        if self.gpus.is_empty() {
            return Err(CollectorError::Other("No GPU devices found".into()));
        }

        let mut result = CollectionResult::online();
        for gpu in &self.gpus {
            let reading = match gpu.interface {
                Interface::Devfreq => devfreq_reading(&gpu.path).await,
                Interface::Drm => drm_reading(&gpu.path).await,
            };
            if let Some(mhz) = reading.frequency_mhz {
                result.set(format!("{}_frequency", gpu.id), mhz);
            }
            if let Some(celsius) = reading.temperature {
                result.set(format!("{}_temperature", gpu.id), celsius);
            }
            if let Some(load) = reading.utilization {
                result.set(format!("{}_utilization", gpu.id), load);
            }
        }

        if result.data().is_empty() {
            return Err(CollectorError::Other("No GPU metrics available".into()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::core::model::{Device, MetricValue, SourceType, STATE_ERROR};

    struct Fixture {
        _dir: TempDir,
        devfreq: PathBuf,
        drm: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let devfreq = dir.path().join("devfreq");
        let drm = dir.path().join("drm");

        let mali = devfreq.join("ff9a0000.gpu");
        fs::create_dir_all(&mali).unwrap();
        fs::write(mali.join("cur_freq"), "400000000\n").unwrap();
        fs::write(mali.join("load"), "37@400000000Hz\n").unwrap();
        fs::create_dir_all(devfreq.join("dmc")).unwrap();

        let card = drm.join("card0").join("device");
        fs::create_dir_all(card.join("hwmon/hwmon4")).unwrap();
        fs::write(card.join("hwmon/hwmon4/temp1_input"), "52000\n").unwrap();
        fs::write(card.join("pp_dpm_sclk"), "0: 300Mhz\n1: 1200Mhz *\n").unwrap();
        fs::create_dir_all(drm.join("card0-HDMI-A-1")).unwrap();

        Fixture {
            _dir: dir,
            devfreq,
            drm,
        }
    }

    fn collector(devfreq: &Path, drm: &Path) -> GpuCollector {
        let host = Device::host("test", "host", "Host");
        let ctx = SourceContext::new("test", SourceType::Gpu, "server_gpu", host);
        GpuCollector::new(ctx, Schedule::every(Duration::from_secs(10))).with_roots(devfreq, drm)
    }

    #[tokio::test]
    async fn test_devfreq_and_drm() {
        let f = fixture();
        let mut collector = collector(&f.devfreq, &f.drm);
        collector.initialize().await.unwrap();

        // two GPUs, three entities each; `dmc` and the connector are skipped
        assert_eq!(collector.entities().len(), 6);

        let result = collector.collect().await.unwrap();
        assert_eq!(result.get("ff9a0000_gpu_frequency"), Some(&MetricValue::Int(400)));
        assert_eq!(result.get("ff9a0000_gpu_utilization"), Some(&MetricValue::Int(37)));
        assert_eq!(result.get("card0_frequency"), Some(&MetricValue::Int(1200)));
        assert_eq!(result.get("card0_temperature"), Some(&MetricValue::Float(52.0)));
    }

    #[tokio::test]
    async fn test_no_gpu_is_error() {
        let dir = tempdir().unwrap();
        let mut collector = collector(&dir.path().join("a"), &dir.path().join("b"));
        collector.initialize().await.unwrap();
        assert!(collector.entities().is_empty());

        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), STATE_ERROR);
    }

    #[test]
    fn test_active_dpm_clock() {
        assert_eq!(active_dpm_clock("0: 500Mhz\n1: 800Mhz *\n2: 1000Mhz"), Some(800));
        assert_eq!(active_dpm_clock("0: 500Mhz"), None);
    }
}
