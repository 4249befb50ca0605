//! Lifecycle driver: connect, initialize, announce, reconcile, poll, stop.
//!
//! [`Orchestrator::start`] performs every startup step and returns once the
//! polling tasks are running; [`Orchestrator::run`] additionally blocks until
//! a shutdown signal and then calls [`Orchestrator::stop`].
//!
//! Every polling task is tracked by collector id with its own cancellation
//! token. With `[auto] refresh_interval` set, a refresh task re-scans
//! containers, services and processes: new ones are announced and polled,
//! vanished ones are stopped and retracted. Configured sources are never
//! removed.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use penguin_metrics_mqtt::{MessageClass, TransferError};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    autodiscovery::{AutoKind, Scanner},
    collectors::{guarded_poll, BoxedCollector, Collector, CollectorResult, Schedule},
    discovery::{DiscoveryEngine, StateStore},
    factory::{create_collectors, create_discovered_collectors, local_hostname},
    model::{CollectionResult, Entity, SourceContext, SourceType},
    publisher::{Connector, Publisher, Transport},
};
use crate::config::Config;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The broker was not reached within `mqtt.connection_timeout`.
    #[error("Not connected to the broker after {seconds}s: {reason}")]
    ConnectTimeout { seconds: u64, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("Cannot install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Stands in for a collector whose `initialize` failed: keeps its entities
/// and reports the failure on every poll.
struct FailedCollector {
    inner: BoxedCollector,
    state: &'static str,
    reason: String,
}

#[async_trait::async_trait]
impl Collector for FailedCollector {
    fn context(&self) -> &SourceContext {
        self.inner.context()
    }

    fn schedule(&self) -> Schedule {
        self.inner.schedule()
    }

    fn entities(&self) -> Vec<Entity> {
        self.inner.entities()
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        Ok(CollectionResult::unavailable(
            self.state,
            Some(self.reason.clone()),
        ))
    }
}

/// One polling task.
struct Running {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    entities: Vec<Entity>,
    source_type: SourceType,
    discovered: bool,
}

type TaskMap = Arc<Mutex<BTreeMap<String, Running>>>;

/// What the polling and refresh tasks share once started.
#[derive(Clone)]
struct Runtime {
    config: Arc<Config>,
    host_name: String,
    scanner: Scanner,
    publisher: Arc<dyn Publisher>,
    discovery: Arc<Mutex<DiscoveryEngine>>,
    tasks: TaskMap,
    cancel: CancellationToken,
}

impl Runtime {
    async fn spawn(&self, collector: BoxedCollector, discovered: bool) {
        let id = collector.id();
        let cancel = self.cancel.child_token();
        let running = Running {
            entities: collector.entities(),
            source_type: collector.context().source_type,
            discovered,
            cancel: cancel.clone(),
            handle: tokio::spawn(poll_loop(collector, self.publisher.clone(), cancel)),
        };
        if let Some(replaced) = self.tasks.lock().await.insert(id.clone(), running) {
            warn!("Collector {} was already running, replacing it", id);
            replaced.cancel.cancel();
        }
    }

    /// Reconciles running discovered collectors of `source_types` with
    /// `found`. Returns how many were added and removed.
    async fn apply_refresh(
        &self,
        found: Vec<BoxedCollector>,
        source_types: &[SourceType],
    ) -> (usize, usize) {
        let found_ids: HashSet<String> = found.iter().map(|c| c.id()).collect();

        let stale: Vec<(String, Running)> = {
            let mut tasks = self.tasks.lock().await;
            let ids: Vec<String> = tasks
                .iter()
                .filter(|(id, running)| {
                    running.discovered
                        && source_types.contains(&running.source_type)
                        && !found_ids.contains(*id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tasks.remove(&id).map(|running| (id, running)))
                .collect()
        };

        let removed = stale.len();
        for (id, running) in stale {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                if !e.is_cancelled() {
                    error!("Polling task {} ended abnormally: {}", id, e);
                }
            }
            self.discovery.lock().await.retract_entities(&running.entities);
            info!("Source {} is gone, stopped polling", id);
        }

        let mut added = 0;
        for collector in found {
            if !collector.enabled() || self.tasks.lock().await.contains_key(&collector.id()) {
                continue;
            }
            let collector = initialize(collector).await;
            self.discovery
                .lock()
                .await
                .register_sensors(&collector.entities());
            info!("Discovered source {}, started polling", collector.id());
            self.spawn(collector, true).await;
            added += 1;
        }

        if added + removed > 0 {
            self.discovery.lock().await.persist();
        }
        (added, removed)
    }

    /// Re-scans the kinds whose population changes at runtime.
    async fn refresh(&self) {
        let kinds: Vec<AutoKind> = AutoKind::DYNAMIC
            .into_iter()
            .filter(|kind| kind.rule(&self.config.auto).enabled)
            .collect();
        let found = self.scanner.scan(&self.config, &kinds).await;
        let collectors = create_discovered_collectors(&self.config, &self.host_name, &found);
        let source_types: Vec<SourceType> = kinds.iter().map(AutoKind::source_type).collect();

        let (added, removed) = self.apply_refresh(collectors, &source_types).await;
        if added + removed > 0 {
            info!("Refresh added {} and removed {} sources", added, removed);
        } else {
            debug!("Refresh found no changes");
        }
    }
}

async fn refresh_loop(runtime: Runtime, every: Duration) {
    debug!("Refreshing discovered sources every {:?}", every);
    loop {
        tokio::select! {
            _ = runtime.cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        tokio::select! {
            _ = runtime.cancel.cancelled() => break,
            _ = runtime.refresh() => {}
        }
    }
    debug!("Refresh task stopped");
}

pub struct Orchestrator {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    host_name: String,
    scanner: Scanner,
    state_store: Option<StateStore>,
    signal_handlers: bool,
    shutdown: CancellationToken,
    tasks_cancel: CancellationToken,
    transport: Option<Arc<dyn Transport>>,
    tasks: TaskMap,
    refresh_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            host_name: local_hostname(),
            scanner: Scanner::new(),
            state_store: None,
            signal_handlers: true,
            shutdown: CancellationToken::new(),
            tasks_cancel: CancellationToken::new(),
            transport: None,
            tasks: Arc::default(),
            refresh_task: None,
            signal_task: None,
        }
    }

    /// Whether SIGINT/SIGTERM trigger shutdown. On by default.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.signal_handlers = enabled;
        self
    }

    /// Overrides where registered entity ids are persisted.
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Overrides the filesystem roots auto-discovery scans.
    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Cancelling this token makes [`run`](Self::run) stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of running polling tasks.
    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Connects, initializes configured and auto-discovered collectors,
    /// announces and reconciles entities, then spawns one polling task per
    /// enabled collector and the refresh task if configured.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be started, if the broker is not reached
    /// within `mqtt.connection_timeout`, or if signal handlers cannot be
    /// installed. Collector failures never fail startup.
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        let configured = create_collectors(&self.config, &self.host_name);
        let discovered = if self.config.auto.any_enabled() {
            let found = self.scanner.scan(&self.config, &AutoKind::ALL).await;
            create_discovered_collectors(&self.config, &self.host_name, &found)
        } else {
            Vec::new()
        };
        info!(
            "Configured {} collectors, discovered {}",
            configured.len(),
            discovered.len()
        );

        let transport = self.connector.connect().await?;
        let seconds = self.config.mqtt.connection_timeout;
        info!(
            "Waiting up to {}s for broker {}:{}",
            seconds, self.config.mqtt.host, self.config.mqtt.port
        );
        if !transport.wait_connected(Duration::from_secs(seconds)).await {
            let reason = transport
                .failure()
                .unwrap_or_else(|| "timed out".to_string());
            transport.disconnect().await;
            return Err(OrchestratorError::ConnectTimeout { seconds, reason });
        }
        info!("Connected to broker");
        let publisher = transport.clone().publisher();
        self.transport = Some(transport);

        let all = configured
            .into_iter()
            .map(|c| (c, false))
            .chain(discovered.into_iter().map(|c| (c, true)));
        let mut active = Vec::new();
        for (collector, discovered) in all {
            if !collector.enabled() {
                debug!("Collector {} is disabled", collector.id());
                continue;
            }
            active.push((initialize(collector).await, discovered));
        }

        let mut discovery = DiscoveryEngine::new(
            publisher.clone(),
            self.config.homeassistant.clone(),
            self.config.mqtt.availability_topic(),
        );
        if let Some(store) = &self.state_store {
            discovery = discovery.with_store(store.clone());
        }
        for (collector, _) in &active {
            discovery.register_sensors(&collector.entities());
        }
        discovery.finalize_registration();

        if self.signal_handlers {
            self.install_signal_handlers()?;
        }

        let runtime = Runtime {
            config: self.config.clone(),
            host_name: self.host_name.clone(),
            scanner: self.scanner.clone(),
            publisher,
            discovery: Arc::new(Mutex::new(discovery)),
            tasks: self.tasks.clone(),
            cancel: self.tasks_cancel.clone(),
        };
        for (collector, discovered) in active {
            runtime.spawn(collector, discovered).await;
        }
        info!("Started {} polling tasks", self.task_count().await);

        let auto = &self.config.auto;
        let dynamic = AutoKind::DYNAMIC.iter().any(|kind| kind.rule(auto).enabled);
        if auto.refresh_interval > 0.0 && dynamic {
            let every = Duration::from_secs_f64(auto.refresh_interval);
            self.refresh_task = Some(tokio::spawn(refresh_loop(runtime, every)));
        }
        Ok(())
    }

    /// Starts, blocks until shutdown is requested, then stops.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }
        self.shutdown.cancelled().await;
        info!("Shutting down");
        self.stop().await;
        Ok(())
    }

    /// Cancels and awaits the refresh task and every polling task, then
    /// disconnects the transport. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.tasks_cancel.cancel();
        if let Some(refresh) = self.refresh_task.take() {
            if let Err(e) = refresh.await {
                if !e.is_cancelled() {
                    error!("Refresh task ended abnormally: {}", e);
                }
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (id, running) in tasks {
            if let Err(e) = running.handle.await {
                if !e.is_cancelled() {
                    error!("Polling task {} ended abnormally: {}", id, e);
                }
            }
        }

        if let Some(signal_task) = self.signal_task.take() {
            signal_task.abort();
        }

        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
            info!("Transport stopped");
        }
    }

    #[cfg(unix)]
    fn install_signal_handlers(&mut self) -> Result<(), OrchestratorError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).map_err(OrchestratorError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(OrchestratorError::Signal)?;
        let shutdown = self.shutdown.clone();

        self.signal_task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM"),
                _ = interrupt.recv() => info!("Received SIGINT"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        }));
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&mut self) -> Result<(), OrchestratorError> {
        let shutdown = self.shutdown.clone();
        self.signal_task = Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                shutdown.cancel();
            }
        }));
        Ok(())
    }
}

/// Runs `initialize`; on failure the collector is kept, reporting the error.
async fn initialize(mut collector: BoxedCollector) -> BoxedCollector {
    match collector.initialize().await {
        Ok(()) => {
            debug!("Collector {} initialized", collector.id());
            collector
        }
        Err(e) => {
            error!("Collector {} failed to initialize: {}", collector.id(), e);
            Box::new(FailedCollector {
                state: e.state(),
                reason: e.to_string(),
                inner: collector,
            })
        }
    }
}

/// Polls one collector until cancelled, publishing one JSON payload per poll.
async fn poll_loop(
    mut collector: BoxedCollector,
    publisher: Arc<dyn Publisher>,
    cancel: CancellationToken,
) {
    let id = collector.id();
    let topic = collector.state_topic().to_string();
    let include_state = collector.context().publishes_state();
    let interval = collector.interval();
    debug!("Polling {} every {:?}", id, interval);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = guarded_poll(collector.as_mut()) => result,
        };

        if !result.available {
            debug!("Collector {} unavailable: {}", id, result.state);
        }
        let payload = result.to_payload(include_state).to_string();
        if !publisher.publish(&topic, payload.into_bytes(), MessageClass::Data) {
            warn!("Payload of {} was dropped", id);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Polling task {} stopped", id);
}
