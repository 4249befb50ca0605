//! Error type for the transport crate.
//!
//! Setup problems (`ClientSetup`, `ConfigError`, `Io`) surface from
//! [`MqttManager::build_and_start`](crate::MqttManager::build_and_start) and are
//! fatal at startup. Connection problems are normally absorbed by the
//! reconnect loop and only escape as `ClientConnection` when the broker
//! refuses the very first connection for a reason retrying cannot fix.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The client could not be constructed (TLS material, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The connection kernel could not be started or stopped unexpectedly.
    #[error("Connection kernel error: {0}")]
    ConnectionKernel(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request channel to the event loop is closed.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Boxed because `ConnectionError` is large.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_client_setup() {
        let err = TransferError::ClientSetup("TLS certificate not found".into());
        assert_eq!(
            err.to_string(),
            "Client setup error: TLS certificate not found"
        );
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "ca.crt missing");
        let transfer_err: TransferError = io_err.into();
        assert!(matches!(transfer_err, TransferError::Io(_)));
        assert!(transfer_err.to_string().contains("ca.crt missing"));
    }

    #[test]
    fn test_transfer_error_from_connection_error() {
        let err: TransferError = rumqttc::ConnectionError::NetworkTimeout.into();
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }

    #[test]
    fn test_transfer_error_from_backoff() {
        let err: TransferError = crate::backoff::BackoffError::MaxAttemptLimitError(3).into();
        assert_eq!(
            err.to_string(),
            "Retry policy error: Maximum number of attempts exceeded: 3"
        );
    }
}
