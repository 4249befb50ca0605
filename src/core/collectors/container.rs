//! Docker containers through the docker CLI.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::trace;

use super::{
    aggregate::{poll_sources, MultiSourceCollector, COUNT_KEY},
    command::run_checked,
    error::CollectorError,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{ContainerMatch, ContainerSourceConfig, ContainerToggles},
    core::model::{CollectionResult, Entity, SourceContext},
};

const DOCKER_TIMEOUT: Duration = Duration::from_secs(10);

pub const STATE_RUNNING: &str = "running";

/// `.State` of `docker inspect`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub health: Option<ContainerHealth>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHealth {
    pub status: String,
}

/// One line of `docker stats --format '{{json .}}'`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "CPUPerc")]
    pub cpu_perc: String,
    #[serde(rename = "MemUsage")]
    pub mem_usage: String,
    #[serde(rename = "MemPerc")]
    pub mem_perc: String,
}

/// `"12.5%"` to `12.5`.
pub fn parse_percent(text: &str) -> Option<f64> {
    text.trim().trim_end_matches('%').parse().ok()
}

/// Docker's human size (`"10.5MiB"`, `"1.2GB"`, `"512kB"`) in MiB.
pub fn parse_size_mib(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let bytes = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1e12,
        "TiB" => 1024.0_f64.powi(4),
        _ => return None,
    };
    Some(value * bytes / (1024.0 * 1024.0))
}

/// Seconds since an RFC 3339 `StartedAt`.
pub fn uptime_seconds(started_at: &str, now: OffsetDateTime) -> Option<i64> {
    let started = OffsetDateTime::parse(started_at, &Rfc3339).ok()?;
    // Docker reports 0001-01-01 for containers that never started.
    if started.year() < 1970 {
        return None;
    }
    Some((now - started).whole_seconds().max(0))
}

pub struct ContainerCollector {
    ctx: SourceContext,
    schedule: Schedule,
    rule: ContainerMatch,
    pattern: Option<Regex>,
    aggregate: bool,
    toggles: ContainerToggles,
}

impl ContainerCollector {
    pub fn new(
        ctx: SourceContext,
        schedule: Schedule,
        config: &ContainerSourceConfig,
        defaults: &ContainerToggles,
    ) -> Self {
        Self {
            ctx,
            schedule,
            rule: config.match_rule.clone(),
            pattern: None,
            aggregate: config.aggregate,
            toggles: config.toggles(defaults),
        }
    }

    fn pattern(&mut self) -> CollectorResult<Option<&Regex>> {
        if let ContainerMatch::Pattern(pattern) = &self.rule {
            if self.pattern.is_none() {
                self.pattern =
                    Some(Regex::new(pattern).map_err(|e| CollectorError::Other(e.to_string()))?);
            }
        }
        Ok(self.pattern.as_ref())
    }

    /// Picks the matching names out of `docker ps` output.
    pub fn select(&mut self, listing: &str) -> CollectorResult<Vec<String>> {
        let rule = self.rule.clone();
        let pattern = self.pattern()?;
        let mut names: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter(|name| match (&rule, pattern) {
                (ContainerMatch::Name(wanted), _) => name == wanted,
                (ContainerMatch::Pattern(_), Some(regex)) => regex.is_match(name),
                // already filtered by docker
                (ContainerMatch::Image(_), _) | (ContainerMatch::Label(_), _) => true,
                (ContainerMatch::Pattern(_), None) => false,
            })
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn result_from(
        &self,
        state: &ContainerState,
        stats: Option<&ContainerStats>,
        now: OffsetDateTime,
    ) -> CollectionResult {
        if state.status != STATE_RUNNING {
            return CollectionResult::unavailable(state.status.clone(), None);
        }

        let mut result = CollectionResult::available(STATE_RUNNING);
        if let Some(stats) = stats {
            if self.toggles.cpu {
                if let Some(cpu) = parse_percent(&stats.cpu_perc) {
                    result.set("cpu_percent", cpu);
                }
            }
            if self.toggles.memory {
                let used = stats
                    .mem_usage
                    .split('/')
                    .next()
                    .and_then(parse_size_mib);
                if let Some(used) = used {
                    result.set("memory_mb", used);
                }
                if let Some(percent) = parse_percent(&stats.mem_perc) {
                    result.set("memory_percent", percent);
                }
            }
        }
        if self.toggles.health {
            let health = state
                .health
                .as_ref()
                .map(|h| h.status.clone())
                .unwrap_or_else(|| "none".to_string());
            result.set("health", health);
        }
        if self.toggles.uptime {
            if let Some(uptime) = state
                .started_at
                .as_deref()
                .and_then(|s| uptime_seconds(s, now))
            {
                result.set("uptime", uptime);
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl MultiSourceCollector for ContainerCollector {
    type Source = String;

    fn describe(&self) -> String {
        match &self.rule {
            ContainerMatch::Name(v) => format!("container '{v}'"),
            ContainerMatch::Pattern(v) => format!("container matching /{v}/"),
            ContainerMatch::Image(v) => format!("container from image '{v}'"),
            ContainerMatch::Label(v) => format!("container labelled '{v}'"),
        }
    }

    async fn discover_sources(&mut self) -> CollectorResult<Vec<String>> {
        let filter = match &self.rule {
            ContainerMatch::Image(image) => Some(format!("ancestor={image}")),
            ContainerMatch::Label(label) => Some(format!("label={label}")),
            _ => None,
        };
        let mut args = vec!["ps", "--all", "--no-trunc", "--format", "{{.Names}}"];
        if let Some(filter) = filter.as_deref() {
            args.extend(["--filter", filter]);
        }

        let listing = run_checked("docker", &args, DOCKER_TIMEOUT).await?;
        let names = self.select(&listing)?;
        trace!("{} matched {:?}", self.describe(), names);
        Ok(names)
    }

    async fn poll_one(&mut self, name: &String) -> CollectorResult<CollectionResult> {
        let inspect = run_checked(
            "docker",
            &["inspect", "--format", "{{json .State}}", name.as_str()],
            DOCKER_TIMEOUT,
        )
        .await
        .map_err(|e| match e {
            // removed between ps and inspect
            CollectorError::CommandFailed { .. } => CollectorError::SourceNotFound(name.clone()),
            other => other,
        })?;
        let state: ContainerState =
            serde_json::from_str(inspect.trim()).map_err(|e| CollectorError::InvalidFormat {
                location: format!("docker inspect {name}"),
                reason: e.to_string(),
            })?;

        let stats = if state.status == STATE_RUNNING && (self.toggles.cpu || self.toggles.memory) {
            let output = run_checked(
                "docker",
                &["stats", "--no-stream", "--no-trunc", "--format", "{{json .}}", name.as_str()],
                DOCKER_TIMEOUT,
            )
            .await?;
            serde_json::from_str::<ContainerStats>(output.trim()).ok()
        } else {
            None
        };

        Ok(self.result_from(&state, stats.as_ref(), OffsetDateTime::now_utc()))
    }
}

#[async_trait::async_trait]
impl Collector for ContainerCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        self.pattern()?;
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let mut entities = vec![ctx.sensor("state", "State").icon("mdi:docker")];
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
            entities.push(ctx.sensor("memory_percent", "Memory Usage").percent().icon("mdi:memory"));
        }
        if self.toggles.health && !self.aggregate {
            entities.push(ctx.sensor("health", "Health").icon("mdi:heart-pulse"));
        }
        if self.toggles.uptime && !self.aggregate {
            entities.push(
                ctx.sensor("uptime", "Uptime")
                    .unit("s")
                    .device_class("duration")
                    .icon("mdi:timer-outline")
                    .diagnostic(),
            );
        }
        if self.aggregate {
            entities.push(ctx.sensor(COUNT_KEY, "Container Count").measurement().icon("mdi:counter"));
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let aggregate = self.aggregate;
        poll_sources(self, aggregate, STATE_RUNNING).await
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::core::model::{Device, MetricValue, SourceType};

    fn collector(source: &str) -> ContainerCollector {
        let config: ContainerSourceConfig = toml::from_str(source).unwrap();
        let host = Device::host("test", "host", "Host");
        let device = Device::for_source("test", SourceType::Container, "c", "Container", Some(&host));
        let ctx = SourceContext::new("test", SourceType::Container, &config.name, device);
        let defaults = ContainerToggles {
            health: true,
            uptime: true,
            ..Default::default()
        };
        ContainerCollector::new(ctx, Schedule::every(Duration::from_secs(10)), &config, &defaults)
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_percent("0.50%"), Some(0.5));
        assert_eq!(parse_size_mib("10MiB"), Some(10.0));
        assert_eq!(parse_size_mib("1GiB "), Some(1024.0));
        assert_eq!(parse_size_mib("512KiB"), Some(0.5));
        assert!(parse_size_mib("12 furlongs").is_none());
    }

    #[test]
    fn test_uptime() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        assert_eq!(
            uptime_seconds("2024-05-01T11:59:00.123456789Z", now),
            Some(59)
        );
        assert_eq!(uptime_seconds("0001-01-01T00:00:00Z", now), None);
    }

    #[test]
    fn test_select_by_name_and_pattern() {
        let listing = "web-1\nweb-2\ndb\n";

        let mut by_name = collector(
            "name = \"db\"\nmatch = { type = \"name\", value = \"db\" }",
        );
        assert_eq!(by_name.select(listing).unwrap(), vec!["db"]);

        let mut by_pattern = collector(
            "name = \"web\"\nmatch = { type = \"pattern\", value = \"^web-\\\\d+$\" }\naggregate = true",
        );
        assert_eq!(by_pattern.select(listing).unwrap(), vec!["web-1", "web-2"]);
        assert!(by_pattern.entities().iter().any(|e| e.value_key == COUNT_KEY));
    }

    #[test]
    fn test_running_container_result() {
        let collector = collector("name = \"db\"\nmatch = { type = \"name\", value = \"db\" }");
        let state: ContainerState = serde_json::from_str(
            r#"{"Status":"running","Running":true,"StartedAt":"2024-05-01T11:00:00Z","Health":{"Status":"healthy"}}"#,
        )
        .unwrap();
        let stats: ContainerStats = serde_json::from_str(
            r#"{"CPUPerc":"3.25%","MemUsage":"64MiB / 2GiB","MemPerc":"3.13%","Name":"db"}"#,
        )
        .unwrap();

        let result = collector.result_from(&state, Some(&stats), datetime!(2024-05-01 12:00:00 UTC));
        assert_eq!(result.state, "running");
        assert_eq!(result.get("cpu_percent"), Some(&MetricValue::Float(3.25)));
        assert_eq!(result.get("memory_mb"), Some(&MetricValue::Float(64.0)));
        assert_eq!(result.get("health"), Some(&MetricValue::Text("healthy".into())));
        assert_eq!(result.get("uptime"), Some(&MetricValue::Int(3600)));
    }

    #[test]
    fn test_exited_container_is_unavailable() {
        let collector = collector("name = \"db\"\nmatch = { type = \"name\", value = \"db\" }");
        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"exited","StartedAt":"2024-05-01T11:00:00Z"}"#).unwrap();

        let result = collector.result_from(&state, None, OffsetDateTime::now_utc());
        assert!(!result.available);
        assert_eq!(result.to_payload(true), serde_json::json!({"state": "exited"}));
    }
}
