//! Runtime: collectors, discovery, orchestration and the transport seam.

pub mod autodiscovery;
pub mod collectors;
pub mod discovery;
pub mod factory;
pub mod model;
pub mod orchestrator;
pub mod publisher;

pub use autodiscovery::{AutoKind, DiscoveredSources, Scanner};
pub use factory::{create_collectors, create_discovered_collectors};
pub use orchestrator::{Orchestrator, OrchestratorError};
