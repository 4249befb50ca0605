//! Bounded outbound queue and the send loop that drains it.
//!
//! `publish` never touches the network: it appends to a bounded channel and
//! returns. When the queue is full the new message is dropped with a warning,
//! since the next poll supersedes it anyway. A single [`SendLoop`] owns the
//! receiving end and hands messages to the rumqttc client, but only while the
//! connection is up, so an outage fills the queue instead of losing messages.
//!
//! Handing a message to rumqttc only fails when its request channel is closed;
//! socket errors surface in the event loop, and messages already handed over
//! are resent by rumqttc itself after reconnecting. The re-enqueue-once path
//! below covers the closed-channel case only.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::state::ConnectionState;

/// Upper bound on a single wait of the send loop, so it re-checks cancellation.
pub const DEQUEUE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    retried: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            retried: false,
        }
    }
}

/// Producer side of the outbound queue, shared by every publisher.
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundMessage>,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Enqueues without waiting. Returns false if the message was dropped.
    pub fn push(&self, message: OutboundMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Message queue full, dropping message for {} ({} dropped so far)",
                    message.topic, dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Send loop stopped, dropping message for {}", message.topic);
                false
            }
        }
    }

    /// Messages currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Messages discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains the queue into the live connection.
pub struct SendLoop {
    client: AsyncClient,
    queue: Arc<OutboundQueue>,
    rx: mpsc::Receiver<OutboundMessage>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl SendLoop {
    pub fn new(
        client: AsyncClient,
        queue: Arc<OutboundQueue>,
        rx: mpsc::Receiver<OutboundMessage>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            queue,
            rx,
            state_tx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut state_rx = self.state_tx.subscribe();
        debug!("Send loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let connected = state_rx.borrow_and_update().is_connected();
            if !connected {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(DEQUEUE_WAIT) => {}
                }
                continue;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(DEQUEUE_WAIT, self.rx.recv()) => next,
            };

            match next {
                Ok(Some(message)) => {
                    if !self.send(message).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        debug!("Send loop stopped with {} queued messages", self.queue.len());
    }

    /// Writes one message. Returns false if cancelled mid-write.
    async fn send(&self, mut message: OutboundMessage) -> bool {
        let publish = self.client.publish(
            message.topic.clone(),
            message.qos,
            message.retain,
            message.payload.clone(),
        );

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            result = publish => result,
        };

        match result {
            Ok(()) => {
                trace!("Published {} bytes to {}", message.payload.len(), message.topic);
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", message.topic, e);
                self.state_tx.send_if_modified(|state| {
                    if state.is_connected() {
                        *state = ConnectionState::Disconnected(e.to_string());
                        true
                    } else {
                        false
                    }
                });

                if message.retried {
                    warn!("Dropping message for {} after retry", message.topic);
                } else {
                    message.retried = true;
                    if self.queue.push(message) {
                        info!("Message re-queued for retry after reconnect");
                    }
                }
            }
        }
        true
    }
}
