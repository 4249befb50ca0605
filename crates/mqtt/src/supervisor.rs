//! Announces availability whenever the connection comes up.
//!
//! The broker holds our last will (`offline`); the supervisor is the other half
//! of the contract and publishes `online` to the availability topic on every
//! transition into [`ConnectionState::Connected`], including reconnects.

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{client::ONLINE_PAYLOAD, error::TransferError, state::ConnectionState};

#[derive(Debug, Clone)]
pub struct Supervisor {
    state_rx: watch::Receiver<ConnectionState>,
    availability_topic: String,
    retain_status: bool,
    client: AsyncClient,
    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        availability_topic: impl Into<String>,
        retain_status: bool,
        state_rx: watch::Receiver<ConnectionState>,
        client: AsyncClient,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            availability_topic: availability_topic.into(),
            retain_status,
            state_rx,
            client,
            cancel_token,
        }
    }

    async fn publish_online_status(&self) -> Result<(), TransferError> {
        self.client
            .publish(
                self.availability_topic.clone(),
                QoS::AtLeastOnce,
                self.retain_status,
                ONLINE_PAYLOAD.as_bytes().to_vec(),
            )
            .await?;
        info!("Published online status to {}", self.availability_topic);
        Ok(())
    }

    async fn on_connect(&self) {
        if let Err(e) = self.publish_online_status().await {
            warn!("Failed to publish online status: {}", e);
        }
    }

    /// Runs until cancelled or until the state channel closes.
    pub async fn run(mut self) {
        debug!("Supervisor monitoring started");

        if self.state_rx.borrow_and_update().is_connected() {
            self.on_connect().await;
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        debug!("State channel closed, supervisor exiting");
                        break;
                    }

                    let state = self.state_rx.borrow_and_update().clone();
                    match state {
                        ConnectionState::Connected => self.on_connect().await,
                        ConnectionState::Disconnected(reason) => {
                            warn!("Disconnected from MQTT broker: {}", reason);
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!("Supervisor monitoring stopped");
    }
}
