//! Configuration to collectors.
//!
//! Pure translation: nothing here touches the system. Devices are built once
//! and shared by reference between every collector that belongs to them.

use std::path::Path;

use tracing::debug;

use super::{
    autodiscovery::DiscoveredSources,
    collectors::{
        AcPowerCollector, BatteryCollector, BinarySensorCollector, BoxedCollector, Collector,
        ContainerCollector, CustomCollector, DiskCollector, FanCollector, GpuCollector,
        NetworkCollector, ProcessCollector, Schedule, ServiceCollector, SystemCollector,
        TemperatureCollector,
    },
    model::{sanitize_id, Device, DeviceRef, SourceContext, SourceType},
};
use crate::config::{
    homeassistant::DeviceGrouping,
    sources::{
        resolve_interval, AcPowerSourceConfig, BatterySourceConfig, BinarySensorSourceConfig,
        ContainerSourceConfig, CustomSourceConfig, DefaultsConfig, DiskSourceConfig,
        FanSourceConfig, NetworkSourceConfig, ProcessSourceConfig, ServiceSourceConfig,
        SystemSourceConfig, TemperatureSourceConfig,
    },
    Config,
};

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// Kernel hostname, `localhost` if unreadable.
pub fn local_hostname() -> String {
    read_hostname(Path::new(HOSTNAME_PATH)).unwrap_or_else(|| "localhost".to_string())
}

fn read_hostname(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Devices of one configuration.
struct Devices<'a> {
    topic_prefix: &'a str,
    grouping: DeviceGrouping,
    host: DeviceRef,
}

impl<'a> Devices<'a> {
    fn new(config: &'a Config, host_name: &str) -> Self {
        let topic_prefix = config.mqtt.topic_prefix.as_str();
        let host_name = config
            .system
            .first()
            .map(|s| s.name.as_str())
            .unwrap_or(host_name);

        Self {
            topic_prefix,
            grouping: config.homeassistant.device_grouping,
            host: Device::host(topic_prefix, &sanitize_id(host_name), host_name),
        }
    }

    /// Hardware readings (temperatures, power, disks, interfaces, fans, GPUs)
    /// describe the host itself.
    fn for_source(&self, source_type: SourceType, name: &str) -> DeviceRef {
        let host_bound = matches!(
            source_type,
            SourceType::System
                | SourceType::Temperature
                | SourceType::Battery
                | SourceType::AcPower
                | SourceType::Disk
                | SourceType::Network
                | SourceType::Fan
                | SourceType::Gpu
        );
        if host_bound || self.grouping == DeviceGrouping::Host {
            return self.host.clone();
        }

        Device::for_source(
            self.topic_prefix,
            source_type,
            &sanitize_id(name),
            &format!("{}: {}", label(source_type), name),
            Some(&self.host),
        )
    }

    fn context(&self, source_type: SourceType, name: &str) -> SourceContext {
        SourceContext::new(
            self.topic_prefix,
            source_type,
            name,
            self.for_source(source_type, name),
        )
    }
}

fn label(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Process => "Process",
        SourceType::Service => "Service",
        SourceType::Container => "Container",
        SourceType::Custom => "Custom",
        SourceType::BinarySensor => "Binary Sensor",
        SourceType::System => "System",
        SourceType::Temperature => "Temperature",
        SourceType::Battery => "Battery",
        SourceType::Disk => "Disk",
        SourceType::Network => "Network",
        SourceType::Fan => "Fan",
        SourceType::AcPower => "AC Power",
        SourceType::Gpu => "GPU",
    }
}

/// Collectors of one source list at a time, sharing devices and defaults.
struct Builder<'a> {
    devices: Devices<'a>,
    defaults: &'a DefaultsConfig,
    collectors: Vec<BoxedCollector>,
}

impl<'a> Builder<'a> {
    fn new(config: &'a Config, host_name: &str) -> Self {
        Self {
            devices: Devices::new(config, host_name),
            defaults: &config.defaults,
            collectors: Vec::new(),
        }
    }

    fn schedule(&self, interval: Option<f64>, enabled: bool) -> Schedule {
        Schedule::every(resolve_interval(interval, self.defaults)).enabled(enabled)
    }

    fn push(&mut self, collector: impl Collector + 'static) {
        self.collectors.push(Box::new(collector));
    }

    fn system(&mut self, sources: &[SystemSourceConfig]) {
        for source in sources {
            let schedule = self.schedule(source.update_interval, source.enabled);
            let ctx = self.devices.context(SourceType::System, &source.name);
            self.push(SystemCollector::new(ctx, schedule, source.clone()));

            if source.temperature {
                let ctx = self.devices.context(SourceType::Temperature, &source.name);
                self.push(TemperatureCollector::all_zones(ctx, schedule));
            }
            if source.gpu {
                let ctx = self
                    .devices
                    .context(SourceType::Gpu, &format!("{}_gpu", source.name));
                self.push(GpuCollector::new(ctx, schedule));
            }
        }
    }

    fn temperature(&mut self, sources: &[TemperatureSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Temperature, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(TemperatureCollector::from_config(ctx, schedule, source));
        }
    }

    fn process(&mut self, sources: &[ProcessSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Process, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            let collector = ProcessCollector::new(ctx, schedule, source, &self.defaults.process);
            self.push(collector);
        }
    }

    fn service(&mut self, sources: &[ServiceSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Service, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            let collector = ServiceCollector::new(ctx, schedule, source, &self.defaults.service);
            self.push(collector);
        }
    }

    fn container(&mut self, sources: &[ContainerSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Container, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            let collector =
                ContainerCollector::new(ctx, schedule, source, &self.defaults.container);
            self.push(collector);
        }
    }

    fn battery(&mut self, sources: &[BatterySourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Battery, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            let collector = BatteryCollector::new(ctx, schedule, source, &self.defaults.battery);
            self.push(collector);
        }
    }

    fn ac_power(&mut self, sources: &[AcPowerSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::AcPower, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(AcPowerCollector::new(ctx, schedule, source));
        }
    }

    fn disk(&mut self, sources: &[DiskSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Disk, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(DiskCollector::new(ctx, schedule, source));
        }
    }

    fn network(&mut self, sources: &[NetworkSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Network, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            let collector = NetworkCollector::new(ctx, schedule, source, &self.defaults.network);
            self.push(collector);
        }
    }

    fn fan(&mut self, sources: &[FanSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Fan, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(FanCollector::new(ctx, schedule, source));
        }
    }

    fn custom(&mut self, sources: &[CustomSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::Custom, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(CustomCollector::new(ctx, schedule, source.clone()));
        }
    }

    fn binary_sensor(&mut self, sources: &[BinarySensorSourceConfig]) {
        for source in sources {
            let ctx = self.devices.context(SourceType::BinarySensor, &source.name);
            let schedule = self.schedule(source.update_interval, source.enabled);
            self.push(BinarySensorCollector::new(ctx, schedule, source.clone()));
        }
    }
}

/// Builds every configured collector, in configuration order.
///
/// A `[[system]]` source with `temperature = true` also yields a
/// temperature collector over every thermal zone on the host device, and
/// one with `gpu = true` a `{name}_gpu` collector.
/// `host_name` names the host device when no system source is configured.
pub fn create_collectors(config: &Config, host_name: &str) -> Vec<BoxedCollector> {
    let mut builder = Builder::new(config, host_name);
    builder.collectors.reserve(config.source_count());

    builder.system(&config.system);
    builder.temperature(&config.temperature);
    builder.process(&config.process);
    builder.service(&config.service);
    builder.container(&config.container);
    builder.battery(&config.battery);
    builder.ac_power(&config.ac_power);
    builder.disk(&config.disk);
    builder.network(&config.network);
    builder.fan(&config.fan);
    builder.custom(&config.custom);
    builder.binary_sensor(&config.binary_sensor);

    debug!("Created {} collectors", builder.collectors.len());
    builder.collectors
}

/// Builds collectors for auto-discovered sources, on the same devices as
/// [`create_collectors`] would use for `config`.
pub fn create_discovered_collectors(
    config: &Config,
    host_name: &str,
    found: &DiscoveredSources,
) -> Vec<BoxedCollector> {
    let mut builder = Builder::new(config, host_name);

    builder.temperature(&found.temperature);
    builder.process(&found.process);
    builder.service(&found.service);
    builder.container(&found.container);
    builder.battery(&found.battery);
    builder.ac_power(&found.ac_power);
    builder.disk(&found.disk);
    builder.network(&found.network);
    builder.fan(&found.fan);

    builder.collectors
}
