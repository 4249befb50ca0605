//! penguin-metrics: Linux host telemetry published over MQTT with
//! Home Assistant discovery.
//!
//! Each configured source (host system, thermal zones, processes, systemd
//! services, Docker containers, batteries, AC power, disks, network
//! interfaces, fans, GPUs, custom commands) becomes a collector polled on its
//! own interval. Sources can also be auto-discovered, and containers,
//! services and processes re-discovered periodically. Every poll publishes
//! one JSON payload on the source's topic; entities are announced when their
//! collector starts and retracted once their source is gone.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `validator` checks and defaults.
//!
//! * `core`: Runtime components:
//!   - Collectors and the guarded poll wrapper
//!   - Auto-discovery of sources from sysfs, procfs, docker and systemd
//!   - Discovery announcements and stale-entity reconciliation
//!   - The orchestrator driving startup, polling and shutdown
//!   - The publisher seam over the MQTT transport
//!
//! * `logger`: `tracing` initialization: console output in compact, pretty
//!   or JSON format and optional systemd journald.
//!
//! The transport itself lives in the `penguin-metrics-mqtt` crate.

pub mod config;
pub mod core;
pub mod logger;
