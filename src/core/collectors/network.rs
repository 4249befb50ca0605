//! Network interfaces from `/sys/class/net/<iface>`.
//!
//! Counters come from `statistics/*`, link details from `flags`, `speed`,
//! `mtu` and `duplex`. Rates are derived from two consecutive polls, so the
//! first poll publishes none. Wi-Fi signal strength is asked from `iw`, then
//! `iwconfig`.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use regex::Regex;
use tracing::trace;

use super::{
    binary::payload_for,
    command::run,
    error::CollectorError,
    fsutil::{read_number, read_optional_number, read_trimmed},
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{NetworkSourceConfig, NetworkToggles},
    core::model::{CollectionResult, Entity, SourceContext},
};

pub const NET_ROOT: &str = "/sys/class/net";

const IW_SIGNAL: &str = r"signal:\s*(-?\d+)\s*dBm";
const IWCONFIG_SIGNAL: &str = r"Signal\s+level[=:](-?\d+)";
const WIRELESS_TOOL_TIMEOUT: Duration = Duration::from_secs(2);

/// `IFF_UP` in the interface `flags`.
const IFF_UP: u32 = 0x1;

/// Interface counters as exposed under `statistics/`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

impl Counters {
    pub async fn read(iface_dir: &Path) -> CollectorResult<Self> {
        let stats = iface_dir.join("statistics");
        Ok(Self {
            bytes_sent: read_number(&stats.join("tx_bytes")).await?,
            bytes_recv: read_number(&stats.join("rx_bytes")).await?,
            packets_sent: read_number(&stats.join("tx_packets")).await?,
            packets_recv: read_number(&stats.join("rx_packets")).await?,
            errin: read_optional_number(&stats.join("rx_errors")).await.unwrap_or(0),
            errout: read_optional_number(&stats.join("tx_errors")).await.unwrap_or(0),
            dropin: read_optional_number(&stats.join("rx_dropped")).await.unwrap_or(0),
            dropout: read_optional_number(&stats.join("tx_dropped")).await.unwrap_or(0),
        })
    }
}

/// Per-second change between two counter readings. A counter that went
/// backwards (driver reset) yields no rate.
pub fn rate(current: u64, previous: u64, elapsed: Duration) -> Option<f64> {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || current < previous {
        return None;
    }
    Some((current - previous) as f64 / seconds)
}

/// `0x1003` style `flags` file content.
pub fn parse_flags(text: &str) -> Option<u32> {
    u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
}

fn signal(pattern: &str, output: &str) -> Option<i64> {
    Regex::new(pattern)
        .ok()?
        .captures(output)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Signal in dBm from `iw dev <iface> link` output.
pub fn rssi_from_iw(output: &str) -> Option<i64> {
    signal(IW_SIGNAL, output)
}

/// Signal in dBm from `iwconfig <iface>` output.
pub fn rssi_from_iwconfig(output: &str) -> Option<i64> {
    signal(IWCONFIG_SIGNAL, output)
}

async fn wifi_rssi(interface: &str) -> Option<i64> {
    if let Ok(output) = run("iw", &["dev", interface, "link"], WIRELESS_TOOL_TIMEOUT).await {
        if output.status.success() {
            if let Some(rssi) = rssi_from_iw(&String::from_utf8_lossy(&output.stdout)) {
                return Some(rssi);
            }
        }
    }
    let output = run("iwconfig", &[interface], WIRELESS_TOOL_TIMEOUT)
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    rssi_from_iwconfig(&String::from_utf8_lossy(&output.stdout))
}

/// Sorted interface names under `root`, loopback included.
pub async fn interfaces(root: &Path) -> Vec<String> {
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

pub struct NetworkCollector {
    ctx: SourceContext,
    schedule: Schedule,
    interface: String,
    toggles: NetworkToggles,
    root: PathBuf,
    previous: Option<(Counters, Instant)>,
}

impl NetworkCollector {
    pub fn new(
        ctx: SourceContext,
        schedule: Schedule,
        config: &NetworkSourceConfig,
        defaults: &NetworkToggles,
    ) -> Self {
        Self {
            ctx,
            schedule,
            interface: config.interface().to_string(),
            toggles: config.toggles(defaults),
            root: PathBuf::from(NET_ROOT),
            previous: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    fn add_rates(&mut self, result: &mut CollectionResult, counters: Counters) {
        let now = Instant::now();
        let Some((before, at)) = self.previous.replace((counters, now)) else {
            return;
        };
        let elapsed = now.duration_since(at);

        if self.toggles.rate {
            if let Some(r) = rate(counters.bytes_sent, before.bytes_sent, elapsed) {
                result.set("bytes_sent_rate", r / 1024.0);
            }
            if let Some(r) = rate(counters.bytes_recv, before.bytes_recv, elapsed) {
                result.set("bytes_recv_rate", r / 1024.0);
            }
        }
        if self.toggles.packets_rate {
            if let Some(r) = rate(counters.packets_sent, before.packets_sent, elapsed) {
                result.set("packets_sent_rate", r);
            }
            if let Some(r) = rate(counters.packets_recv, before.packets_recv, elapsed) {
                result.set("packets_recv_rate", r);
            }
        }
    }

    async fn add_link(&self, result: &mut CollectionResult, dir: &Path) {
        if self.toggles.isup {
            if let Some(flags) = read_trimmed(&dir.join("flags"))
                .await
                .ok()
                .and_then(|f| parse_flags(&f))
            {
                result.set("isup", payload_for(flags & IFF_UP != 0, false));
            }
        }
        if self.toggles.speed {
            // reading fails with EINVAL while the link is down
            let speed = read_optional_number::<i64>(&dir.join("speed")).await;
            result.set("speed", speed.unwrap_or(0).max(0));
        }
        if self.toggles.mtu {
            if let Some(mtu) = read_optional_number::<u32>(&dir.join("mtu")).await {
                result.set("mtu", mtu);
            }
        }
        if self.toggles.duplex {
            let duplex = read_trimmed(&dir.join("duplex"))
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            result.set("duplex", duplex);
        }
    }
}

#[async_trait::async_trait]
impl Collector for NetworkCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let t = &self.toggles;
        let prefix = format!("Network {}", self.interface);
        let counter = |metric: &str, label: &str| {
            ctx.sensor(metric, format!("{prefix} {label}"))
                .total_increasing()
                .icon("mdi:network")
        };

        let mut entities = Vec::new();
        if t.bytes {
            for (metric, label) in [("bytes_sent", "Bytes Sent"), ("bytes_recv", "Bytes Recv")] {
                entities.push(counter(metric, label).unit("B").device_class("data_size"));
            }
        }
        if t.packets {
            entities.push(counter("packets_sent", "Packets Sent"));
            entities.push(counter("packets_recv", "Packets Recv"));
        }
        if t.errors {
            entities.push(counter("errin", "Errors In"));
            entities.push(counter("errout", "Errors Out"));
        }
        if t.drops {
            entities.push(counter("dropin", "Drops In"));
            entities.push(counter("dropout", "Drops Out"));
        }
        if t.rate {
            for (metric, label) in [("bytes_sent_rate", "Send Rate"), ("bytes_recv_rate", "Recv Rate")] {
                entities.push(
                    ctx.sensor(metric, format!("{prefix} {label}"))
                        .unit("KiB/s")
                        .device_class("data_rate")
                        .measurement()
                        .icon("mdi:network"),
                );
            }
        }
        if t.packets_rate {
            for (metric, label) in [
                ("packets_sent_rate", "Packets Sent Rate"),
                ("packets_recv_rate", "Packets Recv Rate"),
            ] {
                entities.push(
                    ctx.sensor(metric, format!("{prefix} {label}"))
                        .unit("p/s")
                        .measurement()
                        .icon("mdi:network"),
                );
            }
        }
        if t.isup {
            entities.push(
                ctx.binary_sensor("isup", format!("{prefix} Up"))
                    .icon("mdi:ethernet"),
            );
        }
        if t.speed {
            entities.push(
                ctx.sensor("speed", format!("{prefix} Speed"))
                    .unit("Mbps")
                    .icon("mdi:network")
                    .diagnostic(),
            );
        }
        if t.mtu {
            entities.push(ctx.sensor("mtu", format!("{prefix} MTU")).icon("mdi:network").diagnostic());
        }
        if t.duplex {
            entities.push(
                ctx.sensor("duplex", format!("{prefix} Duplex"))
                    .icon("mdi:network")
                    .diagnostic(),
            );
        }
        if t.rssi {
            entities.push(
                ctx.sensor("rssi", format!("{prefix} Signal"))
                    .unit("dBm")
                    .measurement()
                    .icon("mdi:wifi"),
            );
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let dir = self.root.join(&self.interface);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(CollectorError::SourceNotFound(format!(
                "interface {}",
                self.interface
            )));
        }

        let counters = Counters::read(&dir).await?;
        trace!("{} counters: {:?}", self.interface, counters);

        let t = self.toggles;
        let mut result = CollectionResult::online();
        if t.bytes {
            result.set("bytes_sent", counters.bytes_sent);
            result.set("bytes_recv", counters.bytes_recv);
        }
        if t.packets {
            result.set("packets_sent", counters.packets_sent);
            result.set("packets_recv", counters.packets_recv);
        }
        if t.errors {
            result.set("errin", counters.errin);
            result.set("errout", counters.errout);
        }
        if t.drops {
            result.set("dropin", counters.dropin);
            result.set("dropout", counters.dropout);
        }
        self.add_rates(&mut result, counters);
        self.add_link(&mut result, &dir).await;

        if t.rssi {
            if let Some(rssi) = wifi_rssi(&self.interface).await {
                result.set("rssi", rssi);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::core::model::{Device, EntityKind, MetricValue, SourceType, STATE_NOT_FOUND};

    fn write_counters(root: &Path, iface: &str, tx_bytes: u64, rx_bytes: u64) {
        let stats = root.join(iface).join("statistics");
        fs::create_dir_all(&stats).unwrap();
        for (file, value) in [
            ("tx_bytes", tx_bytes),
            ("rx_bytes", rx_bytes),
            ("tx_packets", 10),
            ("rx_packets", 20),
            ("rx_errors", 1),
            ("tx_errors", 0),
            ("rx_dropped", 3),
            ("tx_dropped", 0),
        ] {
            fs::write(stats.join(file), format!("{value}\n")).unwrap();
        }
    }

    fn net_fixture() -> TempDir {
        let dir = tempdir().unwrap();
        write_counters(dir.path(), "eth0", 1000, 5000);
        let eth0 = dir.path().join("eth0");
        fs::write(eth0.join("flags"), "0x1003\n").unwrap();
        fs::write(eth0.join("speed"), "1000\n").unwrap();
        fs::write(eth0.join("mtu"), "1500\n").unwrap();
        fs::write(eth0.join("duplex"), "full\n").unwrap();
        dir
    }

    fn collector(root: &Path, extra: &str) -> NetworkCollector {
        let config: NetworkSourceConfig =
            toml::from_str(&format!("name = \"eth0\"\n{extra}")).unwrap();
        let host = Device::host("test", "host", "Host");
        let ctx = SourceContext::new("test", SourceType::Network, "eth0", host);
        NetworkCollector::new(
            ctx,
            Schedule::every(Duration::from_secs(10)),
            &config,
            &NetworkToggles::default(),
        )
        .with_root(root)
    }

    #[tokio::test]
    async fn test_counters_and_link() {
        let dir = net_fixture();
        let mut collector = collector(dir.path(), "errors = true\nspeed = true\nmtu = true\nduplex = true");

        let result = collector.collect().await.unwrap();
        assert_eq!(result.state, "online");
        assert_eq!(result.get("bytes_sent"), Some(&MetricValue::Int(1000)));
        assert_eq!(result.get("bytes_recv"), Some(&MetricValue::Int(5000)));
        assert_eq!(result.get("errin"), Some(&MetricValue::Int(1)));
        assert_eq!(result.get("isup"), Some(&MetricValue::from("ON")));
        assert_eq!(result.get("speed"), Some(&MetricValue::Int(1000)));
        assert_eq!(result.get("mtu"), Some(&MetricValue::Int(1500)));
        assert_eq!(result.get("duplex"), Some(&MetricValue::from("full")));
        // no rate before a second sample
        assert!(result.get("bytes_sent_rate").is_none());
        assert!(result.get("packets_sent").is_none());
    }

    #[tokio::test]
    async fn test_rates_from_second_sample() {
        let dir = net_fixture();
        let mut collector = collector(dir.path(), "");
        collector.collect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        write_counters(dir.path(), "eth0", 1000 + 10 * 1024, 5000);
        let result = collector.collect().await.unwrap();

        let sent = result.get("bytes_sent_rate").and_then(MetricValue::as_f64).unwrap();
        assert!(sent > 0.0);
        assert_eq!(result.get("bytes_recv_rate"), Some(&MetricValue::Float(0.0)));
    }

    #[tokio::test]
    async fn test_missing_interface_is_not_found() {
        let dir = net_fixture();
        let mut collector = collector(dir.path(), "interface = \"wlan9\"");
        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), STATE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_interfaces_sorted() {
        let dir = net_fixture();
        write_counters(dir.path(), "lo", 0, 0);
        write_counters(dir.path(), "docker0", 0, 0);
        assert_eq!(interfaces(dir.path()).await, vec!["docker0", "eth0", "lo"]);
    }

    #[test]
    fn test_entities_follow_toggles() {
        let dir = tempdir().unwrap();
        let entities = collector(dir.path(), "rate = false\nrssi = true").entities();
        let keys: Vec<&str> = entities.iter().map(|e| e.value_key.as_str()).collect();
        assert_eq!(keys, vec!["bytes_sent", "bytes_recv", "isup", "rssi"]);
        assert_eq!(entities[2].kind, EntityKind::BinarySensor);
        assert_eq!(entities[0].state_class.as_deref(), Some("total_increasing"));
    }

    #[test]
    fn test_rate() {
        assert_eq!(rate(3072, 1024, Duration::from_secs(2)), Some(1024.0));
        assert_eq!(rate(10, 20, Duration::from_secs(1)), None);
        assert_eq!(rate(10, 0, Duration::ZERO), None);
    }

    #[test]
    fn test_flags_and_signal_parsing() {
        assert_eq!(parse_flags("0x1003\n"), Some(0x1003));
        assert_eq!(parse_flags("0x1002").map(|f| f & IFF_UP), Some(0));
        assert_eq!(
            rssi_from_iw("Connected to aa:bb (on wlan0)\n\tsignal: -52 dBm\n"),
            Some(-52)
        );
        assert_eq!(
            rssi_from_iwconfig("Link Quality=58/70  Signal level=-52 dBm"),
            Some(-52)
        );
        assert_eq!(rssi_from_iw("Not connected."), None);
    }
}
