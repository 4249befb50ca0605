use std::{io, path::Path};

use thiserror::Error;

use crate::core::model::{STATE_ERROR, STATE_NOT_FOUND};

/// Error type for collectors.
///
/// Every variant ends up as the `state` of an unavailable result; see
/// [`CollectorError::state`].
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Failed to read a file from disk.
    #[error("Failed to read file {path}")]
    FileRead {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Encountered a parsing error while extracting a metric.
    #[error("Failed to parse {metric} from {location}: {reason}")]
    ParseError {
        metric: String,
        location: String,
        reason: String,
    },

    /// Data was found but did not conform to the expected format.
    #[error("Invalid format in {location}: {reason}")]
    InvalidFormat { location: String, reason: String },

    /// A low-level system call (e.g. statvfs) failed.
    #[error("System call failed: {syscall} - {reason}")]
    SystemCall { syscall: String, reason: String },

    /// A required file or directory path does not exist.
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// The configured process, unit, container or device is not present.
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// The command could not be spawned.
    #[error("Command '{command}' failed: {source}")]
    CommandExecution {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and exited unsuccessfully.
    #[error("Command '{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: f64 },

    /// The collector panicked while polling.
    #[error("Collector panicked: {0}")]
    Panicked(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl CollectorError {
    /// Maps an I/O error on `path` to `PathNotFound` or `FileRead`.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            CollectorError::PathNotFound {
                path: path.display().to_string(),
            }
        } else {
            CollectorError::FileRead {
                path: path.display().to_string(),
                source,
            }
        }
    }

    pub fn parse(metric: &str, location: impl Into<String>, reason: impl Into<String>) -> Self {
        CollectorError::ParseError {
            metric: metric.to_string(),
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// `not_found` when the source is absent, `error` for everything else.
    pub fn state(&self) -> &'static str {
        match self {
            CollectorError::PathNotFound { .. } | CollectorError::SourceNotFound(_) => {
                STATE_NOT_FOUND
            }
            _ => STATE_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_found() {
        let err = CollectorError::from_io(
            Path::new("/sys/class/power_supply/BAT9/status"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(err.state(), STATE_NOT_FOUND);
        assert!(err.to_string().contains("BAT9"));
    }

    #[test]
    fn test_permission_denied_is_error() {
        let err = CollectorError::from_io(
            Path::new("/proc/1/fd"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.state(), STATE_ERROR);
    }

    #[test]
    fn test_source_not_found_state() {
        assert_eq!(
            CollectorError::SourceNotFound("nginx".into()).state(),
            STATE_NOT_FOUND
        );
        assert_eq!(CollectorError::Panicked("boom".into()).state(), STATE_ERROR);
    }
}
