//! Host-wide CPU, memory, swap, load and uptime from procfs.

use std::{collections::HashMap, path::PathBuf};

use tracing::debug;

use super::{
    error::CollectorError,
    fsutil::read_file,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::SystemSourceConfig,
    core::model::{CollectionResult, Entity, SourceContext},
};

/// Jiffies of one `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy share between `self` and a later sample, in percent.
    pub fn percent_until(&self, later: &CpuTimes) -> f64 {
        let total = later.total.saturating_sub(self.total);
        if total == 0 {
            return 0.0;
        }
        let busy = later.busy.saturating_sub(self.busy);
        (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Aggregate line first, then one entry per core in file order.
pub fn parse_cpu_times(stat: &str) -> CollectorResult<Vec<CpuTimes>> {
    let mut times = Vec::new();
    for line in stat.lines().filter(|l| l.starts_with("cpu")) {
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| CollectorError::parse("cpu", "/proc/stat", e.to_string()))?;
        if fields.len() < 4 {
            return Err(CollectorError::InvalidFormat {
                location: "/proc/stat".into(),
                reason: format!("short cpu line: {line}"),
            });
        }
        let total: u64 = fields.iter().sum();
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        times.push(CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        });
    }

    if times.is_empty() {
        return Err(CollectorError::InvalidFormat {
            location: "/proc/stat".into(),
            reason: "no cpu lines".into(),
        });
    }
    Ok(times)
}

/// `/proc/meminfo` values in kB.
pub fn parse_meminfo(meminfo: &str) -> HashMap<String, u64> {
    meminfo
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

pub fn parse_loadavg(loadavg: &str) -> CollectorResult<(f64, f64, f64)> {
    let mut fields = loadavg.split_whitespace().map(|f| f.parse::<f64>());
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(a)), Some(Ok(b)), Some(Ok(c))) => Ok((a, b, c)),
        _ => Err(CollectorError::parse(
            "load",
            "/proc/loadavg",
            format!("unexpected content: {}", loadavg.trim()),
        )),
    }
}

pub fn parse_uptime(uptime: &str) -> CollectorResult<f64> {
    uptime
        .split_whitespace()
        .next()
        .and_then(|f| f.parse::<f64>().ok())
        .ok_or_else(|| CollectorError::parse("uptime", "/proc/uptime", uptime.trim()))
}

fn kib_to_mib(kib: u64) -> f64 {
    kib as f64 / 1024.0
}

pub struct SystemCollector {
    ctx: SourceContext,
    schedule: Schedule,
    config: SystemSourceConfig,
    proc_root: PathBuf,
    previous: Option<Vec<CpuTimes>>,
    cores: usize,
}

impl SystemCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: SystemSourceConfig) -> Self {
        Self {
            ctx,
            schedule,
            config,
            proc_root: PathBuf::from("/proc"),
            previous: None,
            cores: 0,
        }
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.proc_root.join(name)
    }

    async fn sample_cpu(&self) -> CollectorResult<Vec<CpuTimes>> {
        parse_cpu_times(&read_file(&self.path("stat")).await?)
    }

    fn add_cpu(&mut self, result: &mut CollectionResult, now: Vec<CpuTimes>) {
        if let Some(previous) = &self.previous {
            if let (true, Some(before), Some(after)) =
                (self.config.cpu, previous.first(), now.first())
            {
                result.set("cpu_percent", before.percent_until(after));
            }
            if self.config.cpu_per_core {
                for (core, (before, after)) in
                    previous.iter().skip(1).zip(now.iter().skip(1)).enumerate()
                {
                    result.set(format!("cpu{core}_percent"), before.percent_until(after));
                }
            }
        }
        self.previous = Some(now);
    }

    async fn add_memory(&self, result: &mut CollectionResult) -> CollectorResult<()> {
        let meminfo = parse_meminfo(&read_file(&self.path("meminfo")).await?);
        let get = |key: &str| meminfo.get(key).copied().unwrap_or(0);

        if self.config.memory {
            let total = get("MemTotal");
            let available = meminfo
                .get("MemAvailable")
                .copied()
                .unwrap_or_else(|| get("MemFree") + get("Buffers") + get("Cached"));
            let used = total.saturating_sub(available);
            result.set("memory_used_mb", kib_to_mib(used));
            result.set("memory_total_mb", kib_to_mib(total));
            if total > 0 {
                result.set("memory_percent", used as f64 / total as f64 * 100.0);
            }
        }

        if self.config.swap {
            let total = get("SwapTotal");
            let used = total.saturating_sub(get("SwapFree"));
            result.set("swap_used_mb", kib_to_mib(used));
            result.set(
                "swap_percent",
                if total > 0 {
                    used as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Collector for SystemCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        let times = self.sample_cpu().await?;
        self.cores = times.len().saturating_sub(1);
        debug!("System collector {} sees {} cores", self.id(), self.cores);
        self.previous = Some(times);
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let mut entities = Vec::new();

        if self.config.cpu {
            entities.push(ctx.sensor("cpu_percent", "CPU Usage").percent().icon("mdi:cpu-64-bit"));
        }
        if self.config.cpu_per_core {
            for core in 0..self.cores {
                entities.push(
                    ctx.sensor(&format!("cpu{core}_percent"), format!("CPU{core} Usage"))
                        .percent()
                        .icon("mdi:cpu-64-bit")
                        .disabled_by_default(),
                );
            }
        }
        if self.config.memory {
            entities.push(
                ctx.sensor("memory_used_mb", "Memory Used")
                    .unit("MiB")
                    .device_class("data_size")
                    .measurement()
                    .icon("mdi:memory"),
            );
            entities.push(
                ctx.sensor("memory_total_mb", "Memory Total")
                    .unit("MiB")
                    .device_class("data_size")
                    .icon("mdi:memory")
                    .diagnostic(),
            );
            entities.push(ctx.sensor("memory_percent", "Memory Usage").percent().icon("mdi:memory"));
        }
        if self.config.swap {
            entities.push(
                ctx.sensor("swap_used_mb", "Swap Used")
                    .unit("MiB")
                    .device_class("data_size")
                    .measurement(),
            );
            entities.push(ctx.sensor("swap_percent", "Swap Usage").percent());
        }
        if self.config.load {
            for (key, name) in [("load_1", "Load (1m)"), ("load_5", "Load (5m)"), ("load_15", "Load (15m)")] {
                entities.push(ctx.sensor(key, name).measurement().icon("mdi:gauge"));
            }
        }
        if self.config.uptime {
            entities.push(
                ctx.sensor("uptime", "Uptime")
                    .unit("s")
                    .device_class("duration")
                    .total_increasing()
                    .icon("mdi:timer-outline")
                    .diagnostic(),
            );
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let mut result = CollectionResult::online();

        if self.config.cpu || self.config.cpu_per_core {
            let now = self.sample_cpu().await?;
            self.add_cpu(&mut result, now);
        }

        if self.config.memory || self.config.swap {
            self.add_memory(&mut result).await?;
        }

        if self.config.load {
            let (one, five, fifteen) = parse_loadavg(&read_file(&self.path("loadavg")).await?)?;
            result.set("load_1", one);
            result.set("load_5", five);
            result.set("load_15", fifteen);
        }

        if self.config.uptime {
            let uptime = parse_uptime(&read_file(&self.path("uptime")).await?)?;
            result.set("uptime", uptime.floor() as i64);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::core::model::{Device, MetricValue, SourceType};

    const STAT_1: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
cpu0 50 0 50 400 0 0 0 0 0 0\n\
cpu1 50 0 50 400 0 0 0 0 0 0\n\
intr 12345\n";

    const STAT_2: &str = "cpu  200 0 200 1000 0 0 0 0 0 0\n\
cpu0 150 0 50 500 0 0 0 0 0 0\n\
cpu1 50 0 150 500 0 0 0 0 0 0\n";

    const MEMINFO: &str = "MemTotal:        8192000 kB\n\
MemFree:         1000000 kB\n\
MemAvailable:    4096000 kB\n\
SwapTotal:       2048000 kB\n\
SwapFree:        1024000 kB\n";

    fn proc_fixture() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stat"), STAT_1).unwrap();
        fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        fs::write(dir.path().join("loadavg"), "0.50 0.25 0.10 1/123 4567\n").unwrap();
        fs::write(dir.path().join("uptime"), "3600.75 7000.00\n").unwrap();
        dir
    }

    fn config(per_core: bool) -> SystemSourceConfig {
        toml::from_str(&format!("name = \"server\"\ncpu_per_core = {per_core}")).unwrap()
    }

    fn collector(root: &Path, per_core: bool) -> SystemCollector {
        let host = Device::host("test", "server", "server");
        let ctx = SourceContext::new("test", SourceType::System, "server", host);
        SystemCollector::new(ctx, Schedule::every(Duration::from_secs(10)), config(per_core))
            .with_proc_root(root)
    }

    #[test]
    fn test_cpu_percent() {
        let before = parse_cpu_times(STAT_1).unwrap();
        let after = parse_cpu_times(STAT_2).unwrap();
        assert_eq!(before.len(), 3);
        // 200 busy of 400 elapsed
        assert_eq!(before[0].percent_until(&after[0]), 50.0);
        assert_eq!(before[0].percent_until(&before[0]), 0.0);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_meminfo(MEMINFO).get("MemTotal"), Some(&8192000));
        assert_eq!(parse_loadavg("1.5 1.0 0.5 2/3 4").unwrap(), (1.5, 1.0, 0.5));
        assert!(parse_loadavg("garbage").is_err());
        assert_eq!(parse_uptime("12.5 3.0").unwrap(), 12.5);
        assert!(parse_cpu_times("intr 1\n").is_err());
    }

    #[tokio::test]
    async fn test_collect_from_fixture() {
        let dir = proc_fixture();
        let mut collector = collector(dir.path(), true);
        collector.initialize().await.unwrap();
        fs::write(dir.path().join("stat"), STAT_2).unwrap();

        let result = collector.collect().await.unwrap();
        assert_eq!(result.get("cpu_percent"), Some(&MetricValue::Float(50.0)));
        assert_eq!(result.get("cpu0_percent"), Some(&MetricValue::Float(50.0)));
        assert_eq!(result.get("memory_total_mb"), Some(&MetricValue::Float(8000.0)));
        assert_eq!(result.get("memory_percent"), Some(&MetricValue::Float(50.0)));
        assert_eq!(result.get("swap_percent"), Some(&MetricValue::Float(50.0)));
        assert_eq!(result.get("load_15"), Some(&MetricValue::Float(0.1)));
        assert_eq!(result.get("uptime"), Some(&MetricValue::Int(3600)));

        let payload = result.to_payload(collector.context().publishes_state());
        assert!(payload.get("state").is_none());
    }

    #[tokio::test]
    async fn test_entities_follow_toggles() {
        let dir = proc_fixture();
        let mut collector = collector(dir.path(), true);
        collector.initialize().await.unwrap();

        let ids: Vec<String> = collector.entities().into_iter().map(|e| e.value_key).collect();
        assert!(ids.contains(&"cpu1_percent".to_string()));
        assert!(!ids.contains(&"cpu2_percent".to_string()));
        assert!(ids.contains(&"load_5".to_string()));
        assert!(collector.entities().iter().all(|e| e.state_topic == "test/system"));
    }

    #[tokio::test]
    async fn test_missing_procfs_is_not_found() {
        let dir = tempdir().unwrap();
        let mut collector = collector(dir.path(), false);
        let err = collector.initialize().await.unwrap_err();
        assert_eq!(err.state(), "not_found");
    }
}
