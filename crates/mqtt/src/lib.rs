//! # penguin-metrics-mqtt
//!
//! Outbound MQTT transport for the penguin-metrics agent, built on `rumqttc`.
//!
//! - **Never-blocking publish**: messages go to a bounded queue (default 1000);
//!   when it is full the newest message is dropped with a warning.
//! - **Single send loop**: drains the queue only while connected; a message
//!   rumqttc refuses (closed request channel) is re-enqueued once. In-flight
//!   messages lost to a socket error are resent by rumqttc on reconnect.
//! - **Reconnect with backoff**: 5s, doubling, capped at 60s, reset on connect.
//! - **Availability contract**: last will `offline` on `{prefix}/status`,
//!   `online` on every connect, `offline` on clean shutdown.
//! - **Retain modes**: `off`, `online` (status only) and `full` (default).
//!
//! ```ignore
//! let instance = MqttManager::from_config(config)?.build_and_start().await?;
//! if !instance.wait_connected(Duration::from_secs(30)).await {
//!     return Err("broker unreachable".into());
//! }
//! instance.publish_message("penguin_metrics/system", r#"{"cpu_percent":3.5}"#, MessageClass::Data);
//! instance.disconnect().await;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod queue;
pub mod state;
pub mod supervisor;

pub use backoff::{Backoff, BackoffError};
pub use client::{ClientBuilder, OFFLINE_PAYLOAD, ONLINE_PAYLOAD};
pub use config::{qos_from_u8, Config, MessageClass, RetainMode, TlsConfig};
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use queue::{OutboundMessage, OutboundQueue};
pub use rumqttc::QoS;
pub use state::ConnectionState;
