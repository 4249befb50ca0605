//! Seam between the runtime and the MQTT transport.
//!
//! Collectors' payloads and discovery messages go through [`Publisher`];
//! the orchestrator additionally drives the connection through [`Transport`]
//! and obtains one from a [`Connector`]. Tests swap in in-memory versions.

use std::{sync::Arc, time::Duration};

use penguin_metrics_mqtt::{MessageClass, MqttInstance, MqttManager, TransferError};

/// Fire-and-forget publishing.
pub trait Publisher: Send + Sync {
    /// Enqueues a message. Returns false if it was dropped.
    fn publish(&self, topic: &str, payload: Vec<u8>, class: MessageClass) -> bool;
}

/// A running broker connection.
#[async_trait::async_trait]
pub trait Transport: Publisher {
    /// True once connected; false after `timeout` or if connecting gave up.
    async fn wait_connected(&self, timeout: Duration) -> bool;

    /// Best-effort clean shutdown. Never fails.
    async fn disconnect(&self);

    /// Why connecting gave up, if it did.
    fn failure(&self) -> Option<String> {
        None
    }

    /// The same transport as a plain [`Publisher`].
    fn publisher(self: Arc<Self>) -> Arc<dyn Publisher>;
}

/// Starts a transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransferError>;
}

impl Publisher for MqttInstance {
    fn publish(&self, topic: &str, payload: Vec<u8>, class: MessageClass) -> bool {
        self.publish_message(topic, payload, class)
    }
}

#[async_trait::async_trait]
impl Transport for MqttInstance {
    async fn wait_connected(&self, timeout: Duration) -> bool {
        MqttInstance::wait_connected(self, timeout).await
    }

    async fn disconnect(&self) {
        MqttInstance::disconnect(self).await
    }

    fn failure(&self) -> Option<String> {
        MqttInstance::failure(self)
    }

    fn publisher(self: Arc<Self>) -> Arc<dyn Publisher> {
        self
    }
}

/// Connects with the `[mqtt]` section of the configuration.
pub struct MqttConnector {
    config: penguin_metrics_mqtt::Config,
}

impl MqttConnector {
    pub fn new(config: penguin_metrics_mqtt::Config) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransferError> {
        let instance = MqttManager::from_config(self.config.clone())?
            .build_and_start()
            .await?;
        Ok(Arc::new(instance))
    }
}
