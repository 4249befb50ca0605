//! Collectors: one struct per source kind behind the [`Collector`] interface.
//!
//! - **Single-source** collectors read one thing: `system`, `temperature`,
//!   `service`, `battery`, `disk`, `custom`, `binary_sensor`, `network`,
//!   `fan`, `ac_power`, `gpu`.
//! - **Multi-source** collectors (`process`, `container`) implement
//!   [`MultiSourceCollector`] and poll through [`poll_sources`], which picks
//!   the first match or sums over every match.
//!
//! The orchestrator only ever polls through [`guarded_poll`].

pub mod ac_power;
pub mod aggregate;
pub mod battery;
pub mod binary;
pub mod command;
pub mod container;
pub mod custom;
pub mod disk;
pub mod error;
pub mod fan;
pub mod fsutil;
pub mod gpu;
pub mod network;
pub mod process;
pub mod service;
pub mod system;
pub mod temperature;
pub mod traits;
pub mod types;

pub use ac_power::AcPowerCollector;
pub use aggregate::{poll_sources, MultiSourceCollector};
pub use battery::BatteryCollector;
pub use binary::BinarySensorCollector;
pub use container::ContainerCollector;
pub use custom::CustomCollector;
pub use disk::DiskCollector;
pub use error::CollectorError;
pub use fan::FanCollector;
pub use gpu::GpuCollector;
pub use network::NetworkCollector;
pub use process::ProcessCollector;
pub use service::ServiceCollector;
pub use system::SystemCollector;
pub use temperature::TemperatureCollector;
pub use traits::{guarded_poll, Collector};
pub use types::{BoxedCollector, CollectorResult, Schedule};
