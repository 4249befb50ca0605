//! ON/OFF sensors from a command's exit code.

use std::time::Duration;

use super::{
    command::run_shell,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::BinarySensorSourceConfig,
    core::model::{CollectionResult, Entity, SourceContext},
};

pub const VALUE_KEY: &str = "value";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

/// `ON` for a zero exit code, reversed when `invert` is set.
pub fn payload_for(success: bool, invert: bool) -> &'static str {
    if success != invert {
        PAYLOAD_ON
    } else {
        PAYLOAD_OFF
    }
}

pub struct BinarySensorCollector {
    ctx: SourceContext,
    schedule: Schedule,
    config: BinarySensorSourceConfig,
}

impl BinarySensorCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: BinarySensorSourceConfig) -> Self {
        Self {
            ctx,
            schedule,
            config,
        }
    }
}

#[async_trait::async_trait]
impl Collector for BinarySensorCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn entities(&self) -> Vec<Entity> {
        let mut entity = self
            .ctx
            .binary_sensor(VALUE_KEY, self.ctx.display_name.clone());
        if let Some(class) = &self.config.device_class {
            entity = entity.device_class(class.clone());
        }
        vec![entity]
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let output = run_shell(
            &self.config.command,
            Duration::from_secs_f64(self.config.timeout),
        )
        .await?;
        let payload = payload_for(output.status.success(), self.config.invert);
        Ok(CollectionResult::online().with(VALUE_KEY, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Device, EntityKind, MetricValue, SourceType};

    fn collector(source: &str) -> BinarySensorCollector {
        let config: BinarySensorSourceConfig = toml::from_str(source).unwrap();
        let host = Device::host("test", "host", "Host");
        let device = Device::for_source("test", SourceType::BinarySensor, "b", "Binary", Some(&host));
        let ctx = SourceContext::new("test", SourceType::BinarySensor, &config.name, device);
        BinarySensorCollector::new(ctx, Schedule::every(Duration::from_secs(10)), config)
    }

    #[test]
    fn test_payload_for() {
        assert_eq!(payload_for(true, false), PAYLOAD_ON);
        assert_eq!(payload_for(false, false), PAYLOAD_OFF);
        assert_eq!(payload_for(true, true), PAYLOAD_OFF);
        assert_eq!(payload_for(false, true), PAYLOAD_ON);
    }

    #[tokio::test]
    async fn test_exit_code_drives_state() {
        let mut on = collector("name = \"up\"\ncommand = \"true\"");
        assert_eq!(
            on.collect().await.unwrap().get(VALUE_KEY),
            Some(&MetricValue::Text("ON".into()))
        );

        let mut inverted = collector("name = \"down\"\ncommand = \"false\"\ninvert = true");
        assert_eq!(
            inverted.collect().await.unwrap().get(VALUE_KEY),
            Some(&MetricValue::Text("ON".into()))
        );
    }

    #[test]
    fn test_entity_is_binary_sensor() {
        let collector = collector("name = \"VPN up\"\ncommand = \"true\"\ndevice_class = \"connectivity\"");
        let entities = collector.entities();
        assert_eq!(entities[0].kind, EntityKind::BinarySensor);
        assert_eq!(entities[0].device_class.as_deref(), Some("connectivity"));
        assert_eq!(entities[0].state_topic, "test/binary_sensor/vpn_up");
    }
}
