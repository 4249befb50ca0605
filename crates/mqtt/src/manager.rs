//! Wires the transport together and exposes the handle the agent publishes through.
//!
//! [`MqttManager::build_and_start`] spawns three tasks:
//! - the [`ConnectionKernel`] (event loop, reconnect with backoff),
//! - the [`SendLoop`] (drains the outbound queue while connected),
//! - the [`Supervisor`] (`online` on every connect).
//!
//! and returns an [`MqttInstance`]. Publishing through the instance only
//! enqueues; `wait_connected` and `disconnect` never return errors.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::{
    backoff::Backoff,
    client::{ClientBuilder, OFFLINE_PAYLOAD},
    config::{Config, MessageClass},
    connection::ConnectionKernel,
    error::TransferError,
    queue::{OutboundMessage, OutboundQueue, SendLoop},
    state::ConnectionState,
    supervisor::Supervisor,
};

/// Upper bound for each step of [`MqttInstance::disconnect`].
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MqttManager {
    config: Config,
}

impl MqttManager {
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Builds the client and spawns the transport tasks.
    ///
    /// Returns as soon as the tasks are running; the connection is established
    /// in the background. Use [`MqttInstance::wait_connected`] to wait for it.
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        let config = self.config;
        info!(
            "Connecting to MQTT broker {}:{} with topic prefix '{}'",
            config.host, config.port, config.topic_prefix
        );

        let (client, event_loop) = ClientBuilder::from_config(&config).build()?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let cancel = CancellationToken::new();
        let send_cancel = cancel.child_token();
        let kernel_exited = CancellationToken::new();
        let failure = Arc::new(Mutex::new(None));

        let backoff = Backoff::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.max_reconnect_delay),
            2.0,
        );
        let mut kernel = ConnectionKernel::new(event_loop, backoff, state_tx.clone(), cancel.clone());
        let kernel_handle = tokio::spawn({
            let kernel_exited = kernel_exited.clone();
            let failure = failure.clone();
            async move {
                if let Err(e) = kernel.run().await {
                    error!("MQTT connection kernel exited with error: {}", e);
                    if let Ok(mut slot) = failure.lock() {
                        *slot = Some(e.to_string());
                    }
                }
                kernel_exited.cancel();
            }
        });

        let (queue, rx) = OutboundQueue::new(config.queue_capacity);
        let queue = Arc::new(queue);
        let send_handle = tokio::spawn(
            SendLoop::new(
                client.clone(),
                queue.clone(),
                rx,
                state_tx.clone(),
                send_cancel.clone(),
            )
            .run(),
        );

        let supervisor_handle = tokio::spawn(
            Supervisor::new(
                config.availability_topic(),
                config.retain.retain_status(),
                state_rx.clone(),
                client.clone(),
                cancel.clone(),
            )
            .run(),
        );

        debug!("MQTT transport tasks spawned");

        Ok(MqttInstance {
            client,
            queue,
            state_rx,
            config,
            cancel,
            send_cancel,
            kernel_exited,
            failure,
            kernel: Mutex::new(Some(kernel_handle)),
            send_loop: Mutex::new(Some(send_handle)),
            supervisor: Mutex::new(Some(supervisor_handle)),
        })
    }
}

/// Handle to a running transport.
pub struct MqttInstance {
    client: AsyncClient,
    queue: Arc<OutboundQueue>,
    state_rx: watch::Receiver<ConnectionState>,
    config: Config,
    cancel: CancellationToken,
    send_cancel: CancellationToken,
    kernel_exited: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
    kernel: Mutex<Option<JoinHandle<()>>>,
    send_loop: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MqttInstance {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn availability_topic(&self) -> String {
        self.config.availability_topic()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Enqueues a message. Returns false if it was dropped.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> bool {
        if self.send_cancel.is_cancelled() {
            debug!("Transport stopping, publish ignored");
            return false;
        }
        self.queue
            .push(OutboundMessage::new(topic, payload, qos, retain))
    }

    /// Enqueues with the configured QoS and the retain rule of `class`.
    pub fn publish_message(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        class: MessageClass,
    ) -> bool {
        self.publish(
            topic,
            payload,
            self.config.qos(),
            class.retain(self.config.retain),
        )
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Reason the connection kernel gave up, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|slot| slot.clone())
    }

    /// Waits until connected. Returns false on timeout or if the kernel gave up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                if state_rx.borrow_and_update().is_connected() {
                    return true;
                }
                tokio::select! {
                    _ = self.kernel_exited.cancelled() => return false,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Best-effort clean shutdown: stop sending, publish `offline`, send
    /// DISCONNECT, then stop the remaining tasks. Never fails; safe to call twice.
    pub async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        self.send_cancel.cancel();
        if let Some(handle) = take(&self.send_loop) {
            join_quietly("send loop", handle).await;
        }

        if self.is_connected() {
            let offline = self.client.publish(
                self.availability_topic(),
                QoS::AtLeastOnce,
                self.config.retain.retain_status(),
                OFFLINE_PAYLOAD.as_bytes().to_vec(),
            );
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, offline).await {
                Ok(Ok(())) => debug!("Offline status queued"),
                Ok(Err(e)) => warn!("Failed to publish offline status: {}", e),
                Err(_) => warn!("Timed out publishing offline status"),
            }

            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, self.client.disconnect()).await {
                Ok(Ok(())) => {
                    // The kernel stops by itself once DISCONNECT is written.
                    if tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, self.kernel_exited.cancelled())
                        .await
                        .is_err()
                    {
                        debug!("Connection kernel still running after DISCONNECT");
                    }
                }
                Ok(Err(e)) => warn!("Clean disconnect failed: {}", e),
                Err(_) => warn!("Timed out sending DISCONNECT"),
            }
        }

        self.cancel.cancel();
        for (name, slot) in [("connection kernel", &self.kernel), ("supervisor", &self.supervisor)] {
            if let Some(handle) = take(slot) {
                join_quietly(name, handle).await;
            }
        }

        if !self.queue.is_empty() {
            info!("{} queued messages discarded on shutdown", self.queue.len());
        }
        info!("Disconnected from MQTT broker");
    }
}

fn take(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().ok().and_then(|mut handle| handle.take())
}

async fn join_quietly(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => debug!("{} stopped", name),
        Ok(Err(e)) => warn!("{} ended abnormally: {}", name, e),
        Err(_) => {
            warn!("{} did not stop in time, aborting", name);
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::config::RetainMode;

    fn unreachable_config() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 1,
            reconnect_delay: 1,
            max_reconnect_delay: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            MqttManager::from_config(config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_connected_times_out_without_broker() {
        let instance = MqttManager::from_config(unreachable_config())
            .unwrap()
            .build_and_start()
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(!instance.wait_connected(Duration::from_millis(300)).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(instance.failure().is_none());

        instance.disconnect().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_while_disconnected_is_bounded() {
        let config = Config {
            queue_capacity: 1000,
            ..unreachable_config()
        };
        let instance = MqttManager::from_config(config)
            .unwrap()
            .build_and_start()
            .await
            .unwrap();

        let accepted = (0..1001)
            .filter(|n| {
                instance.publish_message(
                    format!("penguin_metrics/custom/c{n}"),
                    "1",
                    MessageClass::Data,
                )
            })
            .count();

        assert_eq!(accepted, 1000);
        assert_eq!(instance.queued(), 1000);
        assert_eq!(instance.dropped(), 1);
        assert!(logs_contain("Message queue full, dropping message"));

        instance.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_stops_publishing() {
        let config = Config {
            retain: RetainMode::Off,
            ..unreachable_config()
        };
        let instance = MqttManager::from_config(config)
            .unwrap()
            .build_and_start()
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), instance.disconnect())
            .await
            .expect("disconnect must not hang");
        tokio::time::timeout(Duration::from_secs(1), instance.disconnect())
            .await
            .expect("second disconnect returns immediately");

        assert!(!instance.publish_message("penguin_metrics/system", "{}", MessageClass::Data));
    }
}
