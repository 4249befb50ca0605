//! Value types shared by collectors, discovery and the orchestrator.

pub mod device;
pub mod entity;
pub mod result;
pub mod sanitize;

pub use device::{Device, DeviceRef, SourceType, APP_ID};
pub use entity::{AvailabilityRule, Entity, EntityKind, SourceContext};
pub use result::{CollectionResult, MetricValue, STATE_ERROR, STATE_NOT_FOUND, STATE_ONLINE};
pub use sanitize::sanitize_id;
