use std::time::Duration;

use super::{error::CollectorError, traits::Collector};

/// Result type of every collector operation.
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;

/// Owned, type-erased collector as scheduled by the orchestrator.
pub type BoxedCollector = Box<dyn Collector>;

/// Polling interval and enabled flag of one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub enabled: bool,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
