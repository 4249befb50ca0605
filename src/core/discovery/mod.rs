//! Home Assistant discovery: announcing entities and retracting stale ones.
//!
//! Every entity is announced retained on
//! `{discovery_prefix}/{kind}/{entity_id}/config`. After all collectors have
//! announced, [`DiscoveryEngine::finalize_registration`] compares the ids of
//! this run with the ids persisted by the previous one, publishes an empty
//! retained payload for every id that disappeared and persists the new set.
//! Sources removed while running are retracted through
//! [`DiscoveryEngine::retract_entities`].

pub mod state_file;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use penguin_metrics_mqtt::{MessageClass, OFFLINE_PAYLOAD, ONLINE_PAYLOAD};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use state_file::{RegisteredSensors, StateStore};

use crate::{
    config::homeassistant::HomeAssistantConfig,
    core::{
        collectors::binary::{PAYLOAD_OFF, PAYLOAD_ON},
        model::{AvailabilityRule, Entity, EntityKind},
        publisher::Publisher,
    },
};

const ORIGIN_NAME: &str = "Penguin Metrics";
const SUPPORT_URL: &str = "https://github.com/clusterm/penguin-metrics";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("State file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is not valid: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct DiscoveryEngine {
    publisher: Arc<dyn Publisher>,
    config: HomeAssistantConfig,
    availability_topic: String,
    store: StateStore,
    /// Ids announced in this session.
    current: BTreeMap<String, EntityKind>,
    /// Last set handed to the store, so a second finalize compares against it
    /// even when writing the file failed.
    persisted: Option<BTreeMap<String, EntityKind>>,
}

impl DiscoveryEngine {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        config: HomeAssistantConfig,
        availability_topic: impl Into<String>,
    ) -> Self {
        let store = StateStore::new(config.state_file.clone());
        Self {
            publisher,
            config,
            availability_topic: availability_topic.into(),
            store,
            current: BTreeMap::new(),
            persisted: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    pub fn enabled(&self) -> bool {
        self.config.discovery
    }

    /// Ids recorded in this session.
    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.current.keys().map(String::as_str)
    }

    pub fn discovery_topic(&self, kind: EntityKind, id: &str) -> String {
        format!("{}/{}/{}/config", self.config.discovery_prefix, kind, id)
    }

    /// Announces `entities` and records their ids. Nothing happens when
    /// discovery is disabled.
    pub fn register_sensors(&mut self, entities: &[Entity]) {
        if !self.config.discovery {
            return;
        }

        for entity in entities {
            let topic = self.discovery_topic(entity.kind, &entity.id);
            let payload = self.announce_payload(entity).to_string();
            if !self
                .publisher
                .publish(&topic, payload.into_bytes(), MessageClass::Discovery)
            {
                warn!("Discovery announce for '{}' was dropped", entity.id);
            }
            if let Some(previous) = self.current.insert(entity.id.clone(), entity.kind) {
                if previous != entity.kind {
                    warn!(
                        "Entity '{}' announced as both {} and {}",
                        entity.id, previous, entity.kind
                    );
                }
            }
        }
        debug!("Announced {} entities", entities.len());
    }

    /// Discovery config object for one entity.
    pub fn announce_payload(&self, entity: &Entity) -> Value {
        let mut payload = Map::new();
        payload.insert("unique_id".into(), json!(entity.id));
        payload.insert("object_id".into(), json!(entity.id));
        payload.insert("name".into(), json!(entity.name));
        payload.insert("state_topic".into(), json!(entity.state_topic));
        payload.insert("value_template".into(), json!(entity.value_template()));

        let optional = [
            ("unit_of_measurement", &entity.unit),
            ("device_class", &entity.device_class),
            ("state_class", &entity.state_class),
            ("icon", &entity.icon),
            ("entity_category", &entity.entity_category),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                payload.insert(key.into(), json!(value));
            }
        }

        if !entity.enabled_by_default {
            payload.insert("enabled_by_default".into(), json!(false));
        }
        if entity.kind == EntityKind::BinarySensor {
            payload.insert("payload_on".into(), json!(PAYLOAD_ON));
            payload.insert("payload_off".into(), json!(PAYLOAD_OFF));
        }

        payload.insert(
            "device".into(),
            serde_json::to_value(entity.device.as_ref()).unwrap_or(Value::Null),
        );
        payload.insert(
            "origin".into(),
            json!({
                "name": ORIGIN_NAME,
                "sw_version": env!("CARGO_PKG_VERSION"),
                "support_url": SUPPORT_URL,
            }),
        );

        match &entity.availability {
            AvailabilityRule::GlobalOnly => {
                payload.insert("availability_topic".into(), json!(self.availability_topic));
                payload.insert("payload_available".into(), json!(ONLINE_PAYLOAD));
                payload.insert("payload_not_available".into(), json!(OFFLINE_PAYLOAD));
            }
            AvailabilityRule::Dual { accepted_states } => {
                payload.insert(
                    "availability".into(),
                    json!([
                        {
                            "topic": self.availability_topic,
                            "payload_available": ONLINE_PAYLOAD,
                            "payload_not_available": OFFLINE_PAYLOAD,
                        },
                        {
                            "topic": entity.state_topic,
                            "value_template": state_template(accepted_states),
                        },
                    ]),
                );
                payload.insert("availability_mode".into(), json!("all"));
            }
        }

        Value::Object(payload)
    }

    /// Retracts ids registered by the previous run but not by this one, then
    /// persists this run's ids. Returns the retracted ids.
    ///
    /// Must run once every collector has announced. A second call without
    /// new registrations retracts nothing.
    pub fn finalize_registration(&mut self) -> Vec<String> {
        if !self.config.discovery {
            debug!("Discovery disabled, skipping reconciliation");
            return Vec::new();
        }

        let previous = match self.persisted.take() {
            Some(persisted) => Some(RegisteredSensors::from_map(&persisted)),
            None => match self.store.load() {
                Ok(state) => Some(state.unwrap_or_default()),
                Err(e) => {
                    warn!("Cannot load registered sensors, skipping retraction: {}", e);
                    None
                }
            },
        };

        let mut retracted = Vec::new();
        if let Some(previous) = previous {
            let current: BTreeSet<String> = self.current.keys().cloned().collect();
            for id in previous.sensors.difference(&current) {
                self.retract(id, previous.kind_of(id));
                retracted.push(id.clone());
            }
        }
        if !retracted.is_empty() {
            info!("Retracted {} stale entities", retracted.len());
        }

        self.persist();
        retracted
    }

    /// Retracts `entities` of a source that went away at runtime and forgets
    /// their ids. Returns the retracted ids; call [`persist`](Self::persist)
    /// afterwards.
    pub fn retract_entities(&mut self, entities: &[Entity]) -> Vec<String> {
        if !self.config.discovery {
            return Vec::new();
        }

        let mut retracted = Vec::new();
        for entity in entities {
            if self.current.remove(&entity.id).is_some() {
                self.retract(&entity.id, Some(entity.kind));
                retracted.push(entity.id.clone());
            }
        }
        retracted
    }

    /// Writes the ids of this session to the state file.
    pub fn persist(&mut self) {
        if !self.config.discovery {
            return;
        }
        match self.store.save(&RegisteredSensors::from_map(&self.current)) {
            Ok(path) => debug!(
                "Persisted {} registered sensors to {}",
                self.current.len(),
                path.display()
            ),
            Err(e) => warn!("Cannot persist registered sensors: {}", e),
        }
        self.persisted = Some(self.current.clone());
    }

    /// Empty retained payload on the recorded kind's topic, or on every
    /// kind's topic when the kind is unknown.
    fn retract(&self, id: &str, kind: Option<EntityKind>) {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => EntityKind::ALL.to_vec(),
        };
        for kind in kinds {
            let topic = self.discovery_topic(kind, id);
            debug!("Retracting {}", topic);
            self.publisher
                .publish(&topic, Vec::new(), MessageClass::Discovery);
        }
    }
}

fn state_template(accepted_states: &[String]) -> String {
    let quoted: Vec<String> = accepted_states.iter().map(|s| format!("'{s}'")).collect();
    format!(
        "{{{{ 'online' if value_json.state in [{}] else 'offline' }}}}",
        quoted.join(", ")
    )
}
