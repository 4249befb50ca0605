//! External power supplies: the `online` attribute under `/sys/class/power_supply`.

use std::path::PathBuf;

use super::{
    binary::payload_for,
    fsutil::read_number,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::AcPowerSourceConfig,
    core::model::{CollectionResult, Entity, SourceContext},
};

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

pub const ONLINE_KEY: &str = "online";

pub struct AcPowerCollector {
    ctx: SourceContext,
    schedule: Schedule,
    dir: PathBuf,
}

impl AcPowerCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: &AcPowerSourceConfig) -> Self {
        let dir = config
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(POWER_SUPPLY_ROOT).join(config.supply()));
        Self { ctx, schedule, dir }
    }
}

#[async_trait::async_trait]
impl Collector for AcPowerCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn entities(&self) -> Vec<Entity> {
        vec![self
            .ctx
            .binary_sensor(ONLINE_KEY, self.ctx.display_name.clone())
            .icon("mdi:power-plug")]
    }

    /// A missing `online` file is `not_found`.
    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let online: u8 = read_number(&self.dir.join(ONLINE_KEY)).await?;
        Ok(CollectionResult::online().with(ONLINE_KEY, payload_for(online == 1, false)))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use tempfile::tempdir;

    use super::*;
    use crate::core::model::{Device, EntityKind, MetricValue, SourceType, STATE_NOT_FOUND};

    fn collector(dir: &std::path::Path) -> AcPowerCollector {
        let config: AcPowerSourceConfig = toml::from_str(&format!(
            "name = \"mains\"\npath = \"{}\"",
            dir.display()
        ))
        .unwrap();
        let host = Device::host("test", "host", "Host");
        let ctx = SourceContext::new("test", SourceType::AcPower, "mains", host);
        AcPowerCollector::new(ctx, Schedule::every(Duration::from_secs(10)), &config)
    }

    #[tokio::test]
    async fn test_online_and_offline() {
        let dir = tempdir().unwrap();
        let mut collector = collector(dir.path());

        fs::write(dir.path().join("online"), "1\n").unwrap();
        let result = collector.collect().await.unwrap();
        assert_eq!(result.state, "online");
        assert_eq!(result.get(ONLINE_KEY), Some(&MetricValue::from("ON")));

        fs::write(dir.path().join("online"), "0\n").unwrap();
        let result = collector.collect().await.unwrap();
        assert_eq!(result.get(ONLINE_KEY), Some(&MetricValue::from("OFF")));
    }

    #[tokio::test]
    async fn test_missing_supply_is_not_found() {
        let dir = tempdir().unwrap();
        let mut collector = collector(&dir.path().join("gone"));
        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), STATE_NOT_FOUND);
    }

    #[test]
    fn test_single_binary_entity() {
        let dir = tempdir().unwrap();
        let entities = collector(dir.path()).entities();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind, EntityKind::BinarySensor);
        assert_eq!(entities[0].state_topic, "test/ac_power/mains");
    }
}
