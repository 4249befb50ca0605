//! systemd units through `systemctl show`.

use std::{collections::HashMap, time::Duration, time::Instant};

use regex::Regex;
use tracing::debug;

use super::{
    command::run_checked,
    error::CollectorError,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{ServiceMatch, ServiceSourceConfig, ServiceToggles},
    core::model::{CollectionResult, Entity, SourceContext},
};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(5);

const PROPERTIES: &str = "LoadState,ActiveState,SubState,CPUUsageNSec,MemoryCurrent,NRestarts";

/// `ActiveState` of a healthy unit.
pub const STATE_ACTIVE: &str = "active";

/// `key=value` lines of `systemctl show`.
pub fn parse_properties(output: &str) -> HashMap<&str, &str> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect()
}

/// Numeric property; `[not set]` and the `u64::MAX` sentinel are `None`.
fn numeric(properties: &HashMap<&str, &str>, key: &str) -> Option<u64> {
    properties
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v != u64::MAX)
}

/// Unit name with `.service` appended when no unit suffix is given.
pub fn unit_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

/// First unit of `systemctl list-units --plain --no-legend` output matching `regex`.
pub fn first_matching_unit(listing: &str, regex: &Regex) -> Option<String> {
    listing
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find(|field| *field != "●" && *field != "*")
        })
        .find(|unit| regex.is_match(unit))
        .map(str::to_string)
}

pub struct ServiceCollector {
    ctx: SourceContext,
    schedule: Schedule,
    rule: ServiceMatch,
    toggles: ServiceToggles,
    unit: Option<String>,
    previous_cpu: Option<(u64, Instant)>,
}

impl ServiceCollector {
    pub fn new(
        ctx: SourceContext,
        schedule: Schedule,
        config: &ServiceSourceConfig,
        defaults: &ServiceToggles,
    ) -> Self {
        Self {
            ctx,
            schedule,
            rule: config.match_rule.clone(),
            toggles: config.toggles(defaults),
            unit: None,
            previous_cpu: None,
        }
    }

    async fn resolve_unit(&self) -> CollectorResult<String> {
        match &self.rule {
            ServiceMatch::Unit(name) => Ok(unit_name(name)),
            ServiceMatch::Pattern(pattern) => {
                let regex =
                    Regex::new(pattern).map_err(|e| CollectorError::Other(e.to_string()))?;
                let listing = run_checked(
                    "systemctl",
                    &[
                        "list-units",
                        "--all",
                        "--plain",
                        "--no-legend",
                        "--no-pager",
                        "--type=service",
                    ],
                    SYSTEMCTL_TIMEOUT,
                )
                .await?;
                first_matching_unit(&listing, &regex).ok_or_else(|| {
                    CollectorError::SourceNotFound(format!("no unit matches /{pattern}/"))
                })
            }
        }
    }

    fn cpu_percent(&mut self, usage_ns: u64) -> Option<f64> {
        let now = Instant::now();
        let (before, at) = self.previous_cpu.replace((usage_ns, now))?;
        let elapsed_ns = now.duration_since(at).as_nanos() as f64;
        if elapsed_ns <= 0.0 {
            return None;
        }
        Some(usage_ns.saturating_sub(before) as f64 / elapsed_ns * 100.0)
    }

    /// Builds the result from `systemctl show` output.
    pub fn result_from_properties(&mut self, output: &str) -> CollectorResult<CollectionResult> {
        let properties = parse_properties(output);
        let unit = self.unit.clone().unwrap_or_default();

        if properties.get("LoadState") == Some(&"not-found") {
            return Err(CollectorError::SourceNotFound(unit));
        }
        let active_state = properties.get("ActiveState").copied().ok_or_else(|| {
            CollectorError::InvalidFormat {
                location: format!("systemctl show {unit}"),
                reason: "no ActiveState".into(),
            }
        })?;

        if active_state != STATE_ACTIVE {
            self.previous_cpu = None;
            return Ok(CollectionResult::unavailable(active_state, None));
        }

        let mut result = CollectionResult::available(active_state);
        if let Some(sub_state) = properties.get("SubState") {
            result.set("sub_state", *sub_state);
        }
        if self.toggles.cpu {
            if let Some(percent) = numeric(&properties, "CPUUsageNSec").and_then(|ns| self.cpu_percent(ns)) {
                result.set("cpu_percent", percent);
            }
        }
        if self.toggles.memory {
            if let Some(bytes) = numeric(&properties, "MemoryCurrent") {
                result.set("memory_mb", bytes as f64 / 1024.0 / 1024.0);
            }
        }
        if self.toggles.restart_count {
            if let Some(restarts) = numeric(&properties, "NRestarts") {
                result.set("restart_count", restarts);
            }
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Collector for ServiceCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        let unit = self.resolve_unit().await?;
        debug!("Service collector {} watches {}", self.id(), unit);
        self.unit = Some(unit);
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let mut entities = vec![
            ctx.sensor("state", "State").icon("mdi:list-status"),
            ctx.sensor("sub_state", "Sub State")
                .icon("mdi:list-status")
                .diagnostic(),
        ];
        if self.toggles.cpu {
            entities.push(ctx.sensor("cpu_percent", "CPU Usage").percent().icon("mdi:cpu-64-bit"));
        }
        if self.toggles.memory {
            entities.push(
                ctx.sensor("memory_mb", "Memory")
                    .unit("MiB")
                    .device_class("data_size")
                    .measurement()
                    .icon("mdi:memory"),
            );
        }
        if self.toggles.restart_count {
            entities.push(
                ctx.sensor("restart_count", "Restarts")
                    .total_increasing()
                    .icon("mdi:restart")
                    .diagnostic(),
            );
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let unit = match &self.unit {
            Some(unit) => unit.clone(),
            None => {
                let unit = self.resolve_unit().await?;
                self.unit = Some(unit.clone());
                unit
            }
        };

        let property_arg = format!("--property={PROPERTIES}");
        let output = run_checked(
            "systemctl",
            &["show", unit.as_str(), "--no-pager", property_arg.as_str()],
            SYSTEMCTL_TIMEOUT,
        )
        .await?;
        let result = self.result_from_properties(&output);

        // A pattern may match another unit next time.
        if matches!(self.rule, ServiceMatch::Pattern(_))
            && matches!(&result, Err(CollectorError::SourceNotFound(_)))
        {
            self.unit = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Device, MetricValue, SourceType};

    const ACTIVE: &str = "LoadState=loaded\n\
ActiveState=active\n\
SubState=running\n\
CPUUsageNSec=1000000000\n\
MemoryCurrent=52428800\n\
NRestarts=2\n";

    fn collector(restart_count: bool) -> ServiceCollector {
        let config: ServiceSourceConfig = toml::from_str(&format!(
            "name = \"nginx\"\nmatch = {{ type = \"unit\", value = \"nginx\" }}\nrestart_count = {restart_count}"
        ))
        .unwrap();
        let host = Device::host("test", "host", "Host");
        let device = Device::for_source("test", SourceType::Service, "nginx", "Service: nginx", Some(&host));
        let ctx = SourceContext::new("test", SourceType::Service, "nginx", device);
        let mut collector = ServiceCollector::new(
            ctx,
            Schedule::every(Duration::from_secs(10)),
            &config,
            &ServiceToggles::default(),
        );
        collector.unit = Some("nginx.service".into());
        collector
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name("nginx"), "nginx.service");
        assert_eq!(unit_name("backup.timer"), "backup.timer");
    }

    #[test]
    fn test_first_matching_unit() {
        let listing = "cron.service loaded active running Regular background program\n\
● docker.service loaded failed failed Docker\n\
dockerd-rootless.service loaded inactive dead Rootless\n";
        let regex = Regex::new("^docker").unwrap();
        assert_eq!(
            first_matching_unit(listing, &regex).as_deref(),
            Some("docker.service")
        );
        assert!(first_matching_unit(listing, &Regex::new("^nope").unwrap()).is_none());
    }

    #[test]
    fn test_active_unit() {
        let mut collector = collector(true);
        let result = collector.result_from_properties(ACTIVE).unwrap();
        assert_eq!(result.state, "active");
        assert_eq!(result.get("sub_state"), Some(&MetricValue::Text("running".into())));
        assert_eq!(result.get("memory_mb"), Some(&MetricValue::Float(50.0)));
        assert_eq!(result.get("restart_count"), Some(&MetricValue::Int(2)));
        // first sample has no delta
        assert!(result.get("cpu_percent").is_none());
    }

    #[test]
    fn test_failed_unit_publishes_state_only() {
        let mut collector = collector(false);
        let result = collector
            .result_from_properties("LoadState=loaded\nActiveState=failed\nSubState=failed\nMemoryCurrent=1024\n")
            .unwrap();
        assert!(!result.available);
        assert_eq!(
            result.to_payload(true),
            serde_json::json!({"state": "failed"})
        );
    }

    #[test]
    fn test_missing_unit_is_not_found() {
        let mut collector = collector(false);
        let err = collector
            .result_from_properties("LoadState=not-found\nActiveState=inactive\n")
            .unwrap_err();
        assert_eq!(err.state(), "not_found");
    }

    #[test]
    fn test_memory_not_set() {
        let mut collector = collector(false);
        let result = collector
            .result_from_properties("LoadState=loaded\nActiveState=active\nMemoryCurrent=[not set]\n")
            .unwrap();
        assert!(result.get("memory_mb").is_none());
        assert!(collector.entities().iter().all(|e| e.value_key != "restart_count"));
    }
}
