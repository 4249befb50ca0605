use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
    device::{DeviceRef, SourceType, APP_ID},
    sanitize::sanitize_id,
};

/// Discovery component an entity is announced as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sensor,
    BinarySensor,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Sensor, EntityKind::BinarySensor];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::BinarySensor => "binary_sensor",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the platform decides whether an entity is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityRule {
    /// Follows `{prefix}/status` only.
    GlobalOnly,
    /// `{prefix}/status` is `online` AND the source's `state` is accepted.
    Dual { accepted_states: Vec<String> },
}

impl AvailabilityRule {
    pub fn for_source(source_type: SourceType) -> Self {
        if source_type.is_host() {
            AvailabilityRule::GlobalOnly
        } else {
            AvailabilityRule::Dual {
                accepted_states: source_type
                    .accepted_states()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }
        }
    }

    /// Evaluates the rule the way the announced availability block does.
    ///
    /// `source_state` is the `state` field of the last source payload, if any.
    pub fn evaluate(&self, global_status: &str, source_state: Option<&str>) -> bool {
        let global_ok = global_status == "online";
        match self {
            AvailabilityRule::GlobalOnly => global_ok,
            AvailabilityRule::Dual { accepted_states } => {
                global_ok
                    && source_state
                        .map(|state| accepted_states.iter().any(|a| a == state))
                        .unwrap_or(false)
            }
        }
    }
}

/// Identity shared by a collector and every entity it produces.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub topic_prefix: String,
    pub source_type: SourceType,
    /// Sanitized configured name.
    pub source_id: String,
    /// Human name as configured.
    pub display_name: String,
    pub device: DeviceRef,
    pub state_topic: String,
}

impl SourceContext {
    pub fn new(
        topic_prefix: &str,
        source_type: SourceType,
        name: &str,
        device: DeviceRef,
    ) -> Self {
        let source_id = sanitize_id(name);
        let state_topic = if source_type.is_host() {
            format!("{topic_prefix}/system")
        } else {
            format!("{topic_prefix}/{}/{source_id}", source_type.as_str())
        };

        Self {
            topic_prefix: topic_prefix.to_string(),
            source_type,
            source_id,
            display_name: name.to_string(),
            device,
            state_topic,
        }
    }

    /// `{app}_{topic_prefix}_{source_type}_{source_name}_{metric}`, sanitized.
    pub fn entity_id(&self, metric: &str) -> String {
        sanitize_id(&format!(
            "{APP_ID}_{}_{}_{}_{metric}",
            self.topic_prefix,
            self.source_type.as_str(),
            self.source_id
        ))
    }

    /// Whether the published payload includes a `state` field.
    pub fn publishes_state(&self) -> bool {
        !self.source_type.is_host()
    }

    /// A sensor entity reading `metric` from this source's payload.
    pub fn sensor(&self, metric: &str, name: impl Into<String>) -> Entity {
        Entity {
            id: self.entity_id(metric),
            name: name.into(),
            kind: EntityKind::Sensor,
            device: self.device.clone(),
            state_topic: self.state_topic.clone(),
            value_key: metric.to_string(),
            unit: None,
            device_class: None,
            state_class: None,
            icon: None,
            entity_category: None,
            enabled_by_default: true,
            availability: AvailabilityRule::for_source(self.source_type),
        }
    }

    /// A binary sensor whose payload value is `ON`/`OFF`.
    pub fn binary_sensor(&self, metric: &str, name: impl Into<String>) -> Entity {
        Entity {
            kind: EntityKind::BinarySensor,
            ..self.sensor(metric, name)
        }
    }
}

/// Immutable descriptor of one published measurement.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub device: DeviceRef,
    pub state_topic: String,
    /// Key of the value inside the source's JSON payload.
    pub value_key: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub icon: Option<String>,
    pub entity_category: Option<String>,
    pub enabled_by_default: bool,
    pub availability: AvailabilityRule,
}

impl Entity {
    pub fn value_template(&self) -> String {
        format!("{{{{ value_json.{} }}}}", self.value_key)
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    /// Sets `state_class: measurement`.
    pub fn measurement(mut self) -> Self {
        self.state_class = Some("measurement".into());
        self
    }

    pub fn total_increasing(mut self) -> Self {
        self.state_class = Some("total_increasing".into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn diagnostic(mut self) -> Self {
        self.entity_category = Some("diagnostic".into());
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    /// Percent gauge, the most common sensor shape.
    pub fn percent(self) -> Self {
        self.unit("%").measurement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::device::Device;

    fn service_context() -> SourceContext {
        let host = Device::host("penguin_metrics", "host", "Host");
        let device = Device::for_source(
            "penguin_metrics",
            SourceType::Service,
            "nginx",
            "Service: nginx",
            Some(&host),
        );
        SourceContext::new("penguin_metrics", SourceType::Service, "Nginx", device)
    }

    #[test]
    fn test_entity_id_layout() {
        let ctx = service_context();
        assert_eq!(
            ctx.entity_id("cpu_percent"),
            "penguin_metrics_penguin_metrics_service_nginx_cpu_percent"
        );
        assert_eq!(ctx.state_topic, "penguin_metrics/service/nginx");
        assert!(ctx.publishes_state());
    }

    #[test]
    fn test_host_topic_has_no_name() {
        let host = Device::host("lab", "server", "Server");
        let ctx = SourceContext::new("lab", SourceType::System, "Server", host);
        assert_eq!(ctx.state_topic, "lab/system");
        assert!(!ctx.publishes_state());
        assert_eq!(
            ctx.sensor("cpu_percent", "CPU Usage").availability,
            AvailabilityRule::GlobalOnly
        );
    }

    #[test]
    fn test_value_template() {
        let entity = service_context().sensor("memory_mb", "Memory").unit("MiB");
        assert_eq!(entity.value_template(), "{{ value_json.memory_mb }}");
        assert_eq!(entity.unit.as_deref(), Some("MiB"));
    }

    #[test]
    fn test_devices_are_shared_not_copied() {
        let ctx = service_context();
        let a = ctx.sensor("a", "A");
        let b = ctx.binary_sensor("b", "B");
        assert!(std::sync::Arc::ptr_eq(&a.device, &b.device));
        assert_eq!(b.kind, EntityKind::BinarySensor);
    }

    #[test]
    fn test_dual_availability_round_trip() {
        let rule = AvailabilityRule::for_source(SourceType::Service);

        assert!(rule.evaluate("online", Some("active")));
        assert!(!rule.evaluate("offline", Some("active")));
        assert!(!rule.evaluate("online", Some("failed")));
        assert!(!rule.evaluate("offline", Some("failed")));
        assert!(rule.evaluate("online", Some("active")));
        assert!(!rule.evaluate("online", None));
    }

    #[test]
    fn test_battery_whitelist() {
        let rule = AvailabilityRule::for_source(SourceType::Battery);
        for state in ["charging", "discharging", "full", "not charging"] {
            assert!(rule.evaluate("online", Some(state)), "{state}");
        }
        assert!(!rule.evaluate("online", Some("unknown")));
    }

    #[test]
    fn test_global_only_ignores_source_state() {
        let rule = AvailabilityRule::GlobalOnly;
        assert!(rule.evaluate("online", None));
        assert!(rule.evaluate("online", Some("not_found")));
        assert!(!rule.evaluate("offline", None));
    }
}
