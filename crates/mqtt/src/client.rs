//! Builds the rumqttc client and event loop from [`Config`].
//!
//! Besides the connection options the builder registers the last will:
//! the broker publishes `offline` to `{topic_prefix}/status` on our behalf if
//! the agent vanishes without a clean DISCONNECT. The will uses the same
//! retain rule as every other status message.

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Payload announced on the availability topic while connected.
pub const ONLINE_PAYLOAD: &str = "online";

/// Payload of the last will and of a clean shutdown.
pub const OFFLINE_PAYLOAD: &str = "offline";

pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            tls_config: None,
        }
    }

    /// Applies every connection option from the configuration, including the last will.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new(
            config.effective_client_id(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive)
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight)
        .last_will(
            &config.availability_topic(),
            config.retain.retain_status(),
        );

        if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
            builder = builder.credentials(username, config.password.clone().unwrap_or_default());
        }

        builder.tls_config = config.tls.clone().filter(TlsConfig::is_enabled);
        builder
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Registers `offline` on `topic` as the last will, QoS 1.
    pub fn last_will(mut self, topic: &str, retain: bool) -> Self {
        let last_will = LastWill::new(
            topic,
            OFFLINE_PAYLOAD.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            retain,
        );
        self.opts.set_last_will(last_will);
        self
    }

    pub fn options(&self) -> &MqttOptions {
        &self.opts
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        let (ca_path, client_paths) = tls_config
            .paths()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca = fs::read(ca_path)?;
        let client_auth = match client_paths {
            Some((cert, key)) => Some((fs::read(cert)?, fs::read(key)?)),
            None => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }

    /// Creates the client handle and its (not yet polled) event loop.
    ///
    /// No network traffic happens until the event loop is polled by the
    /// connection kernel.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls) = self.tls_config.as_ref() {
            opts.set_transport(Self::build_tls_transport(tls)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}
