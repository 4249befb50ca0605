//! User-defined sensors backed by a shell command.

use std::time::Duration;

use super::{
    command::run_shell,
    error::CollectorError,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{CustomSourceConfig, CustomValueType},
    core::model::{CollectionResult, Entity, MetricValue, SourceContext},
};

pub const VALUE_KEY: &str = "value";

/// Turns the first line of the command output into a metric value.
pub fn parse_value(
    stdout: &str,
    value_type: CustomValueType,
    scale: f64,
    command: &str,
) -> CollectorResult<MetricValue> {
    let line = stdout.lines().next().unwrap_or("").trim();
    match value_type {
        CustomValueType::String => Ok(MetricValue::Text(line.to_string())),
        CustomValueType::Number => line
            .parse::<f64>()
            .map(|v| MetricValue::Float(v * scale))
            .map_err(|_| CollectorError::parse(VALUE_KEY, command, format!("not a number: '{line}'"))),
    }
}

pub struct CustomCollector {
    ctx: SourceContext,
    schedule: Schedule,
    config: CustomSourceConfig,
}

impl CustomCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: CustomSourceConfig) -> Self {
        Self {
            ctx,
            schedule,
            config,
        }
    }
}

#[async_trait::async_trait]
impl Collector for CustomCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn entities(&self) -> Vec<Entity> {
        let mut entity = self.ctx.sensor(VALUE_KEY, self.ctx.display_name.clone());
        if let Some(unit) = &self.config.unit {
            entity = entity.unit(unit.clone());
        }
        if let Some(class) = &self.config.device_class {
            entity = entity.device_class(class.clone());
        }
        if self.config.value_type == CustomValueType::Number {
            entity = entity.measurement();
        } else {
            entity = entity.icon("mdi:text-box-outline");
        }
        vec![entity]
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let output = run_shell(
            &self.config.command,
            Duration::from_secs_f64(self.config.timeout),
        )
        .await?;
        if !output.status.success() {
            return Err(CollectorError::CommandFailed {
                command: self.config.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let value = parse_value(
            &String::from_utf8_lossy(&output.stdout),
            self.config.value_type,
            self.config.scale,
            &self.config.command,
        )?;
        Ok(CollectionResult::online().with(VALUE_KEY, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Device, SourceType};

    fn collector(source: &str) -> CustomCollector {
        let config: CustomSourceConfig = toml::from_str(source).unwrap();
        let host = Device::host("test", "host", "Host");
        let device = Device::for_source("test", SourceType::Custom, "c", "Custom", Some(&host));
        let ctx = SourceContext::new("test", SourceType::Custom, &config.name, device);
        CustomCollector::new(ctx, Schedule::every(Duration::from_secs(10)), config)
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(
            parse_value("3\nignored", CustomValueType::Number, 0.5, "cmd").unwrap(),
            MetricValue::Float(1.5)
        );
        assert_eq!(
            parse_value(" ok \n", CustomValueType::String, 1.0, "cmd").unwrap(),
            MetricValue::Text("ok".into())
        );
        assert!(parse_value("n/a", CustomValueType::Number, 1.0, "cmd").is_err());
    }

    #[tokio::test]
    async fn test_numeric_command() {
        let mut collector = collector(
            "name = \"answer\"\ncommand = \"echo 21\"\nscale = 2\nunit = \"items\"",
        );
        let result = collector.collect().await.unwrap();
        assert_eq!(result.get(VALUE_KEY), Some(&MetricValue::Float(42.0)));
        assert_eq!(result.state, "online");

        let entities = collector.entities();
        let entity = &entities[0];
        assert_eq!(entity.unit.as_deref(), Some("items"));
        assert_eq!(entity.state_topic, "test/custom/answer");
    }

    #[tokio::test]
    async fn test_failing_command_is_error() {
        let mut collector = collector("name = \"broken\"\ncommand = \"exit 1\"");
        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), "error");
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        let mut collector = collector("name = \"slow\"\ncommand = \"sleep 5\"\ntimeout = 0.2");
        let err = collector.collect().await.unwrap_err();
        assert!(matches!(err, CollectorError::Timeout { .. }));
    }
}
