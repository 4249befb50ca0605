//! Connection kernel: the single task that drives the rumqttc event loop.
//!
//! Polling the event loop is what opens the socket, sends queued requests and
//! reconnects after a failure. The kernel turns poll results into
//! [`ConnectionState`] transitions and sleeps according to [`Backoff`] between
//! failed attempts. It is the only writer of the state channel besides the
//! send loop, which may mark the connection `Disconnected` after a failed write.
//!
//! ```text
//! Connecting --CONNACK--> Connected --error--> Reconnecting(5s) --sleep--> Connecting
//!                                                   ^                          |
//!                                                   +--------error-------------+
//! ```
//!
//! Before the first successful CONNACK, errors that retrying cannot fix (bad
//! credentials, TLS, protocol) end the kernel so that startup fails fast.
//! After the first connection every error is retried.

use std::sync::Arc;

use rumqttc::{ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, error::TransferError, state::ConnectionState};

pub struct ConnectionKernel {
    event_loop: EventLoop,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    ever_connected: bool,
}

impl ConnectionKernel {
    pub fn new(
        event_loop: EventLoop,
        backoff: Backoff,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event_loop,
            backoff,
            cancel,
            state_tx,
            ever_connected: false,
        }
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Runs until cancelled, until a clean DISCONNECT has been written, or until
    /// the first connection fails for a non-retryable reason.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting connection event loop...");
        loop {
            let polled = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.update_state(ConnectionState::Disconnected("Shutdown requested".into()));
                    info!("Connection kernel shutdown completed");
                    return Ok(());
                }

                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if self.handle_event(event) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if !self.ever_connected
                        && classify_connection_error(&e) == Disposition::Fatal
                    {
                        error!(
                            "Broker rejected the connection, not retrying: {}",
                            get_error_message(&e)
                        );
                        self.update_state(ConnectionState::Disconnected(get_error_message(&e)));
                        return Err(TransferError::from(e));
                    }

                    let delay = match self.backoff.next_sleep() {
                        Ok(delay) => delay,
                        Err(backoff_err) => {
                            error!("Maximum retry attempts exceeded: {}", backoff_err);
                            self.update_state(ConnectionState::Disconnected(
                                backoff_err.to_string(),
                            ));
                            return Err(backoff_err.into());
                        }
                    };

                    warn!(
                        "Connection error: {}. Reconnecting in {:.0}s (attempt {})",
                        get_error_message(&e),
                        delay.as_secs_f64(),
                        self.backoff.attempt()
                    );
                    self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.update_state(ConnectionState::Disconnected("Shutdown requested".into()));
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    self.update_state(ConnectionState::Connecting);
                }
            }
        }
    }

    /// Applies one event. Returns true once our own DISCONNECT went out.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully.");
                    self.ever_connected = true;
                    self.backoff.reset();
                    self.update_state(ConnectionState::Connected);
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(packet) => {
                trace!("Incoming packet: {:?}", packet);
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("DISCONNECT written, stopping event loop");
                self.update_state(ConnectionState::Disconnected("Client disconnected".into()));
                return true;
            }
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// Joins the error and its sources into one line.
fn get_error_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
