//! Broker connection settings.
//!
//! This is the `[mqtt]` table of the agent configuration. Every field has a
//! default, so an empty table connects to `localhost:1883` with topic prefix
//! `penguin_metrics`, QoS 1 and retain mode `full`.
//!
//! ```toml
//! [mqtt]
//! host = "broker.lan"
//! port = 1883
//! username = "agent"
//! password = "secret"
//! topic_prefix = "penguin_metrics"
//! qos = 1
//! retain = "online"
//! keep_alive = 60
//! ```

use std::path::Path;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Which published messages carry the retain flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetainMode {
    /// Nothing is retained.
    #[serde(alias = "none")]
    Off,
    /// Only availability/status messages are retained.
    Online,
    /// Status and data are retained.
    #[default]
    #[serde(alias = "on", alias = "all")]
    Full,
}

impl RetainMode {
    /// Retain flag for per-source data payloads.
    pub fn retain_data(self) -> bool {
        matches!(self, RetainMode::Full)
    }

    /// Retain flag for `online`/`offline` on the availability topic.
    pub fn retain_status(self) -> bool {
        matches!(self, RetainMode::Online | RetainMode::Full)
    }
}

/// Category of an outbound message, deciding its retain flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Per-source telemetry.
    Data,
    /// Availability topic payloads.
    Status,
    /// Discovery announcements and retractions, always retained.
    Discovery,
}

impl MessageClass {
    pub fn retain(self, mode: RetainMode) -> bool {
        match self {
            MessageClass::Data => mode.retain_data(),
            MessageClass::Status => mode.retain_status(),
            MessageClass::Discovery => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Empty means `penguin_metrics_<8 hex digits>` is generated at startup.
    #[validate(length(max = 64, message = "Client ID must not exceed 64 characters"))]
    pub client_id: String,

    /// Root of every state topic; `{topic_prefix}/status` is the availability topic.
    #[validate(custom(function = "validate_topic_prefix"))]
    pub topic_prefix: String,

    #[validate(range(min = 0, max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    pub retain: RetainMode,

    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// How long startup waits for the first CONNACK before giving up.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Capacity of the channel between the send loop and the rumqttc event loop.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Request channel capacity must be between 1 and 1000"
    ))]
    pub request_channel_capacity: usize,

    /// Capacity of the outbound queue; the newest message is dropped when full.
    #[validate(range(
        min = 1,
        max = 100000,
        message = "Queue capacity must be between 1 and 100000"
    ))]
    pub queue_capacity: usize,

    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    #[validate(range(
        min = 1,
        max = 3600,
        message = "Max reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub max_reconnect_delay: u64,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            topic_prefix: "penguin_metrics".to_string(),
            qos: 1,
            retain: RetainMode::default(),
            keep_alive: 60,
            connection_timeout: 30,
            clean_session: true,
            max_inflight: 100,
            request_channel_capacity: 64,
            queue_capacity: 1000,
            reconnect_delay: 5,
            max_reconnect_delay: 60,
            tls: None,
        }
    }
}

impl Config {
    /// Global availability topic carrying `online`/`offline`.
    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    pub fn qos(&self) -> QoS {
        qos_from_u8(self.qos)
    }

    /// Configured client id, or a generated `penguin_metrics_xxxxxxxx`.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            format!("penguin_metrics_{}", &uuid[..8])
        } else {
            self.client_id.clone()
        }
    }
}

/// Maps 0/1/2 to a QoS level; anything else falls back to at-least-once.
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn validate_topic_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.is_empty() || prefix.len() > 255 {
        return Err(ValidationError::new("topic_prefix_length")
            .with_message("Topic prefix must be between 1 and 255 characters".into()));
    }
    if prefix.contains(['#', '+']) {
        return Err(ValidationError::new("topic_prefix_wildcard")
            .with_message("Topic prefix must not contain MQTT wildcards".into()));
    }
    if prefix.starts_with('/') || prefix.ends_with('/') {
        return Err(ValidationError::new("topic_prefix_slash")
            .with_message("Topic prefix must not start or end with '/'".into()));
    }
    Ok(())
}

/// TLS material for `mqtts` brokers. The CA is required; the client pair is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Returns `(ca, Some((cert, key)))` paths after checking the combination is complete.
    pub fn paths(&self) -> Result<(&str, Option<(&str, &str)>), ValidationError> {
        let ca = self.ca_cert_path.as_deref().ok_or_else(|| {
            ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into())
        })?;
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
                Ok((ca, Some((cert, key))))
            }
            (None, None) => Ok((ca, None)),
            _ => Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            )),
        }
    }
}

fn validate_optional_file_exists(path: &str) -> Result<(), ValidationError> {
    validate_file_path(path)
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.availability_topic(), "penguin_metrics/status");
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.retain, RetainMode::Full);
    }

    #[test]
    fn test_retain_mode_rules() {
        assert!(!RetainMode::Off.retain_data());
        assert!(!RetainMode::Off.retain_status());
        assert!(!RetainMode::Online.retain_data());
        assert!(RetainMode::Online.retain_status());
        assert!(RetainMode::Full.retain_data());
        assert!(RetainMode::Full.retain_status());
    }

    #[test]
    fn test_discovery_always_retained() {
        assert!(MessageClass::Discovery.retain(RetainMode::Off));
        assert!(!MessageClass::Data.retain(RetainMode::Online));
        assert!(MessageClass::Status.retain(RetainMode::Online));
    }

    #[test]
    fn test_retain_mode_deserializes_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            retain: RetainMode,
        }
        let parsed: Wrapper = serde_json::from_str(r#"{"retain":"on"}"#).unwrap();
        assert_eq!(parsed.retain, RetainMode::Full);
        let parsed: Wrapper = serde_json::from_str(r#"{"retain":"online"}"#).unwrap();
        assert_eq!(parsed.retain, RetainMode::Online);
        let parsed: Wrapper = serde_json::from_str(r#"{"retain":"off"}"#).unwrap();
        assert_eq!(parsed.retain, RetainMode::Off);
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let config = Config {
            qos: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_prefix_rejected() {
        let config = Config {
            topic_prefix: "metrics/#".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_client_id() {
        let id = Config::default().effective_client_id();
        assert!(id.starts_with("penguin_metrics_"));
        assert_eq!(id.len(), "penguin_metrics_".len() + 8);

        let config = Config {
            client_id: "fixed".into(),
            ..Default::default()
        };
        assert_eq!(config.effective_client_id(), "fixed");
    }

    #[test]
    fn test_tls_paths_require_complete_client_pair() {
        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(b"ca").unwrap();
        let ca_path = ca.path().to_string_lossy().into_owned();

        let tls = TlsConfig::with_ca_only(ca_path.clone());
        let (found, client) = tls.paths().unwrap();
        assert_eq!(found, ca_path);
        assert!(client.is_none());

        let partial = TlsConfig {
            client_cert_path: Some(ca_path.clone()),
            ..TlsConfig::with_ca_only(ca_path)
        };
        assert!(partial.paths().is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
