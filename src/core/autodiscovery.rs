//! Auto-discovery: turns the `[auto.*]` rules into source configurations by
//! scanning sysfs, procfs, the mount table, `docker` and `systemctl`.
//!
//! Discovered sources are ordinary source configurations, so they are built
//! into collectors by the same factory code as configured ones. A discovered
//! name whose id is already taken by a configured source of the same kind is
//! skipped.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{
    collectors::{
        battery::normalize_status,
        command::run_checked,
        fan::{fan_inputs, hwmon_label},
        fsutil::read_trimmed,
        network::interfaces,
    },
    model::{sanitize_id, SourceType},
};
use crate::config::{
    auto::{AutoConfig, AutoRule, TemperatureFeed},
    sources::{
        AcPowerSourceConfig, BatterySourceConfig, ContainerMatch, ContainerSourceConfig,
        DiskSourceConfig, FanSourceConfig, NetworkSourceConfig, ProcessMatch,
        ProcessSourceConfig, ServiceMatch, ServiceSourceConfig, TemperatureSourceConfig,
    },
    Config,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Filesystems that never hold user data.
const SKIPPED_FSTYPES: [&str; 4] = ["squashfs", "overlay", "tmpfs", "devtmpfs"];

/// Translates a shell glob into an anchored regular expression.
///
/// `*` and `?` match any run and any single character, `[abc]` and `[!abc]`
/// are character classes; everything else is literal. An unterminated `[` is
/// a literal bracket.
pub fn glob_regex(glob: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = glob.chars().collect();
    let mut pattern = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    let (negated, body) = match class.strip_prefix('!') {
                        Some(rest) => (true, rest.to_string()),
                        None => (false, class),
                    };
                    pattern.push('[');
                    if negated {
                        pattern.push('^');
                    }
                    pattern.push_str(&body.replace('\\', "\\\\").replace('[', "\\["));
                    pattern.push(']');
                    i += len + 1;
                }
                _ => pattern.push_str(r"\["),
            },
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    pattern.push('$');
    Regex::new(&pattern)
}

/// `filter`/`exclude` globs of one rule.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    filters: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NameFilter {
    pub fn new(rule: &AutoRule) -> Self {
        let compile = |globs: &[String]| {
            globs
                .iter()
                .filter_map(|glob| match glob_regex(glob) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Ignoring glob '{}': {}", glob, e);
                        None
                    }
                })
                .collect::<Vec<Regex>>()
        };
        Self {
            filters: compile(&rule.filter),
            excludes: compile(&rule.exclude),
        }
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    /// Excludes win; with filters present a name must match one of them.
    pub fn matches(&self, name: &str) -> bool {
        if self.excludes.iter().any(|r| r.is_match(name)) {
            return false;
        }
        self.filters.is_empty() || self.filters.iter().any(|r| r.is_match(name))
    }

    /// Like [`matches`](Self::matches), succeeding if any alias matches and
    /// none is excluded.
    pub fn matches_any(&self, names: &[&str]) -> bool {
        if names
            .iter()
            .any(|name| self.excludes.iter().any(|r| r.is_match(name)))
        {
            return false;
        }
        self.filters.is_empty()
            || names
                .iter()
                .any(|name| self.filters.iter().any(|r| r.is_match(name)))
    }
}

/// Source kinds that can be discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoKind {
    Temperatures,
    Batteries,
    AcPower,
    Disks,
    Networks,
    Fans,
    Containers,
    Services,
    Processes,
}

impl AutoKind {
    pub const ALL: [AutoKind; 9] = [
        AutoKind::Temperatures,
        AutoKind::Batteries,
        AutoKind::AcPower,
        AutoKind::Disks,
        AutoKind::Networks,
        AutoKind::Fans,
        AutoKind::Containers,
        AutoKind::Services,
        AutoKind::Processes,
    ];

    /// Kinds that come and go while the host runs; re-scanned on refresh.
    pub const DYNAMIC: [AutoKind; 3] =
        [AutoKind::Containers, AutoKind::Services, AutoKind::Processes];

    pub fn as_str(&self) -> &'static str {
        match self {
            AutoKind::Temperatures => "temperatures",
            AutoKind::Batteries => "batteries",
            AutoKind::AcPower => "ac_power",
            AutoKind::Disks => "disks",
            AutoKind::Networks => "networks",
            AutoKind::Fans => "fans",
            AutoKind::Containers => "containers",
            AutoKind::Services => "services",
            AutoKind::Processes => "processes",
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            AutoKind::Temperatures => SourceType::Temperature,
            AutoKind::Batteries => SourceType::Battery,
            AutoKind::AcPower => SourceType::AcPower,
            AutoKind::Disks => SourceType::Disk,
            AutoKind::Networks => SourceType::Network,
            AutoKind::Fans => SourceType::Fan,
            AutoKind::Containers => SourceType::Container,
            AutoKind::Services => SourceType::Service,
            AutoKind::Processes => SourceType::Process,
        }
    }

    pub fn rule<'a>(&self, auto: &'a AutoConfig) -> &'a AutoRule {
        match self {
            AutoKind::Temperatures => &auto.temperatures,
            AutoKind::Batteries => &auto.batteries,
            AutoKind::AcPower => &auto.ac_power,
            AutoKind::Disks => &auto.disks,
            AutoKind::Networks => &auto.networks,
            AutoKind::Fans => &auto.fans,
            AutoKind::Containers => &auto.containers,
            AutoKind::Services => &auto.services,
            AutoKind::Processes => &auto.processes,
        }
    }

    /// Services and processes are never taken wholesale.
    fn requires_filter(&self) -> bool {
        matches!(self, AutoKind::Services | AutoKind::Processes)
    }

    /// Ids of configured sources of this kind.
    fn configured_ids(&self, config: &Config) -> HashSet<String> {
        let names: Vec<&str> = match self {
            AutoKind::Temperatures => config
                .temperature
                .iter()
                .map(|s| s.name.as_str())
                .chain(config.system.iter().filter(|s| s.temperature).map(|s| s.name.as_str()))
                .collect(),
            AutoKind::Batteries => config.battery.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::AcPower => config.ac_power.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Disks => config.disk.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Networks => config.network.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Fans => config.fan.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Containers => config.container.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Services => config.service.iter().map(|s| s.name.as_str()).collect(),
            AutoKind::Processes => config.process.iter().map(|s| s.name.as_str()).collect(),
        };
        names.into_iter().map(sanitize_id).collect()
    }
}

impl fmt::Display for AutoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sources found by one scan, shaped like their configured counterparts.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredSources {
    pub temperature: Vec<TemperatureSourceConfig>,
    pub battery: Vec<BatterySourceConfig>,
    pub ac_power: Vec<AcPowerSourceConfig>,
    pub disk: Vec<DiskSourceConfig>,
    pub network: Vec<NetworkSourceConfig>,
    pub fan: Vec<FanSourceConfig>,
    pub container: Vec<ContainerSourceConfig>,
    pub service: Vec<ServiceSourceConfig>,
    pub process: Vec<ProcessSourceConfig>,
}

impl DiscoveredSources {
    pub fn len(&self) -> usize {
        self.temperature.len()
            + self.battery.len()
            + self.ac_power.len()
            + self.disk.len()
            + self.network.len()
            + self.fan.len()
            + self.container.len()
            + self.service.len()
            + self.process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filter plus the ids already in use for one kind.
struct Picker {
    filter: NameFilter,
    taken: HashSet<String>,
}

impl Picker {
    fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(&sanitize_id(name))
    }

    /// Claims `name` if one of `aliases` passes the filter and the id is free.
    fn take(&mut self, name: &str, aliases: &[&str]) -> bool {
        let id = sanitize_id(name);
        if id.is_empty() || self.taken.contains(&id) || !self.filter.matches_any(aliases) {
            return false;
        }
        self.taken.insert(id)
    }
}

/// `systemctl list-units` lines to unit names, status markers skipped.
pub fn parse_unit_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find(|field| !matches!(*field, "●" | "○" | "×" | "*"))
        })
        .filter(|unit| unit.ends_with(".service"))
        .map(str::to_string)
        .collect()
}

/// Octal escapes (`\040`) of `/proc/mounts` fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|digits| {
            digits.iter().all(|d| (b'0'..=b'7').contains(d))
        });
        if let (b'\\', Some(digits)) = (bytes[i], octal) {
            let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(code) = u8::try_from(code) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `(device name, mountpoint)` of block-device mounts, first mount of each
/// device only.
pub fn parse_mounts(mounts: &str) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            if !device.starts_with("/dev/") || SKIPPED_FSTYPES.contains(&fstype) {
                return None;
            }
            let name = device.rsplit('/').next()?.to_string();
            Some((name, unescape_mount_field(mountpoint)))
        })
        .filter(|(name, _)| seen.insert(name.clone()))
        .collect()
}

async fn dir_names(root: &Path) -> Vec<String> {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return Vec::new();
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

fn numeric_suffix(name: &str, prefix: &str) -> u32 {
    name.trim_start_matches(prefix)
        .trim_end_matches("_input")
        .parse()
        .unwrap_or(u32::MAX)
}

/// Scans one host. Roots are overridable for tests.
#[derive(Debug, Clone)]
pub struct Scanner {
    sys_root: PathBuf,
    proc_root: PathBuf,
    mounts: PathBuf,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            mounts: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sys_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_root = root.into();
        self
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn with_mounts(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts = path.into();
        self
    }

    fn class(&self, class: &str) -> PathBuf {
        self.sys_root.join("class").join(class)
    }

    /// Discovers every enabled kind among `kinds`.
    pub async fn scan(&self, config: &Config, kinds: &[AutoKind]) -> DiscoveredSources {
        let mut found = DiscoveredSources::default();

        for kind in kinds {
            let rule = kind.rule(&config.auto);
            if !rule.enabled {
                continue;
            }
            let filter = NameFilter::new(rule);
            if kind.requires_filter() && !filter.has_filters() {
                warn!("Auto-discovery of {} needs at least one filter, skipping", kind);
                continue;
            }
            let mut picker = Picker {
                filter,
                taken: kind.configured_ids(config),
            };

            let before = found.len();
            match kind {
                AutoKind::Temperatures => {
                    found.temperature = self.temperatures(rule, &mut picker).await
                }
                AutoKind::Batteries => found.battery = self.batteries(rule, &mut picker).await,
                AutoKind::AcPower => found.ac_power = self.ac_power(rule, &mut picker).await,
                AutoKind::Disks => found.disk = self.disks(rule, &mut picker).await,
                AutoKind::Networks => found.network = self.networks(rule, &mut picker).await,
                AutoKind::Fans => found.fan = self.fans(rule, &mut picker).await,
                AutoKind::Containers => {
                    found.container = self.containers(rule, &mut picker).await
                }
                AutoKind::Services => found.service = self.services(rule, &mut picker).await,
                AutoKind::Processes => found.process = self.processes(rule, &mut picker).await,
            }
            debug!("Auto-discovered {} {}", found.len() - before, kind);
        }

        if !found.is_empty() {
            info!("Auto-discovered {} sources", found.len());
        }
        found
    }

    async fn temperatures(
        &self,
        rule: &AutoRule,
        picker: &mut Picker,
    ) -> Vec<TemperatureSourceConfig> {
        let source = |name: String, path: PathBuf| TemperatureSourceConfig {
            name,
            enabled: true,
            zone: None,
            path: Some(path),
            update_interval: rule.update_interval,
        };
        let mut sources = Vec::new();

        match rule.source {
            TemperatureFeed::Thermal => {
                let root = self.class("thermal");
                let mut zones: Vec<String> = dir_names(&root)
                    .await
                    .into_iter()
                    .filter(|z| z.starts_with("thermal_zone"))
                    .collect();
                zones.sort_by_key(|z| numeric_suffix(z, "thermal_zone"));

                for zone in zones {
                    let dir = root.join(&zone);
                    let kind = read_trimmed(&dir.join("type")).await.unwrap_or_default();
                    let mut name = if kind.is_empty() { zone.clone() } else { kind.clone() };
                    if picker.is_taken(&name) {
                        name = zone.clone();
                    }
                    if picker.take(&name, &[name.as_str(), kind.as_str()]) {
                        sources.push(source(name, dir.join("temp")));
                    }
                }
            }
            TemperatureFeed::Hwmon => {
                let root = self.class("hwmon");
                for hwmon in dir_names(&root).await {
                    let dir = root.join(&hwmon);
                    let chip = hwmon_label(&dir).await;
                    let mut inputs: Vec<String> = dir_names(&dir)
                        .await
                        .into_iter()
                        .filter(|f| f.starts_with("temp") && f.ends_with("_input"))
                        .collect();
                    inputs.sort_by_key(|f| numeric_suffix(f, "temp"));

                    for input in inputs {
                        let stem = input.trim_end_matches("_input");
                        let label = read_trimmed(&dir.join(format!("{stem}_label")))
                            .await
                            .unwrap_or_else(|_| stem.to_string());
                        let name = format!("{chip}_{label}");
                        if picker.take(&name, &[name.as_str(), chip.as_str()]) {
                            sources.push(source(name, dir.join(&input)));
                        }
                    }
                }
            }
        }
        sources
    }

    /// `(directory name, type)` of every power supply.
    async fn power_supplies(&self) -> Vec<(String, String, PathBuf)> {
        let root = self.class("power_supply");
        let mut supplies = Vec::new();
        for name in dir_names(&root).await {
            let dir = root.join(&name);
            let kind = read_trimmed(&dir.join("type")).await.unwrap_or_default();
            supplies.push((name, kind, dir));
        }
        supplies
    }

    async fn batteries(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<BatterySourceConfig> {
        self.power_supplies()
            .await
            .into_iter()
            .filter(|(_, kind, _)| normalize_status(kind) == "battery")
            .filter(|(name, _, _)| picker.take(name, &[name.as_str()]))
            .map(|(name, _, _)| BatterySourceConfig {
                battery: Some(name.clone()),
                name,
                enabled: true,
                update_interval: rule.update_interval,
                voltage: None,
                current: None,
                power: None,
                health: None,
                cycles: None,
            })
            .collect()
    }

    async fn ac_power(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<AcPowerSourceConfig> {
        self.power_supplies()
            .await
            .into_iter()
            .filter(|(_, kind, _)| normalize_status(kind) != "battery")
            .filter(|(name, kind, _)| picker.take(name, &[name.as_str(), kind.as_str()]))
            .map(|(name, _, dir)| AcPowerSourceConfig {
                name,
                enabled: true,
                supply: None,
                path: Some(dir),
                update_interval: rule.update_interval,
            })
            .collect()
    }

    async fn disks(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<DiskSourceConfig> {
        let mounts = match tokio::fs::read_to_string(&self.mounts).await {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!("Cannot read {}: {}", self.mounts.display(), e);
                return Vec::new();
            }
        };
        parse_mounts(&mounts)
            .into_iter()
            .filter(|(name, _)| picker.take(name, &[name.as_str()]))
            .map(|(name, mountpoint)| DiskSourceConfig {
                name,
                enabled: true,
                mountpoint,
                update_interval: rule.update_interval,
            })
            .collect()
    }

    async fn networks(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<NetworkSourceConfig> {
        interfaces(&self.class("net"))
            .await
            .into_iter()
            .filter(|name| picker.take(name, &[name.as_str()]))
            .map(|name| NetworkSourceConfig {
                interface: Some(name.clone()),
                name,
                enabled: true,
                update_interval: rule.update_interval,
                bytes: None,
                packets: None,
                errors: None,
                drops: None,
                rate: None,
                packets_rate: None,
                isup: None,
                speed: None,
                mtu: None,
                duplex: None,
                rssi: None,
            })
            .collect()
    }

    async fn fans(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<FanSourceConfig> {
        let root = self.class("hwmon");
        let mut sources = Vec::new();
        for hwmon in dir_names(&root).await {
            let dir = root.join(&hwmon);
            if fan_inputs(&dir).await.is_empty() {
                continue;
            }
            let label = hwmon_label(&dir).await;
            let name = if picker.is_taken(&label) { hwmon.clone() } else { label.clone() };
            if picker.take(&name, &[name.as_str(), label.as_str(), hwmon.as_str()]) {
                sources.push(FanSourceConfig {
                    name,
                    enabled: true,
                    hwmon: Some(hwmon),
                    update_interval: rule.update_interval,
                });
            }
        }
        sources
    }

    async fn containers(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<ContainerSourceConfig> {
        let listing = match run_checked(
            "docker",
            &["ps", "--format", "{{.Names}}"],
            COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(listing) => listing,
            Err(e) => {
                debug!("Cannot list containers: {}", e);
                return Vec::new();
            }
        };

        let mut names: Vec<&str> = listing.lines().map(str::trim).filter(|n| !n.is_empty()).collect();
        names.sort_unstable();
        names
            .into_iter()
            .filter(|name| picker.take(name, &[*name]))
            .map(|name| ContainerSourceConfig {
                name: name.to_string(),
                enabled: true,
                match_rule: ContainerMatch::Name(name.to_string()),
                aggregate: false,
                update_interval: rule.update_interval,
                cpu: None,
                memory: None,
                health: None,
                uptime: None,
            })
            .collect()
    }

    async fn services(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<ServiceSourceConfig> {
        let listing = match run_checked(
            "systemctl",
            &[
                "list-units",
                "--type=service",
                "--all",
                "--plain",
                "--no-legend",
                "--no-pager",
            ],
            COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Cannot list systemd units: {}", e);
                return Vec::new();
            }
        };
        self.pick_services(&listing, rule, picker)
    }

    fn pick_services(
        &self,
        listing: &str,
        rule: &AutoRule,
        picker: &mut Picker,
    ) -> Vec<ServiceSourceConfig> {
        parse_unit_listing(listing)
            .into_iter()
            .filter_map(|unit| {
                let name = unit.trim_end_matches(".service").to_string();
                picker.take(&name, &[unit.as_str(), name.as_str()]).then(|| ServiceSourceConfig {
                    name,
                    enabled: true,
                    match_rule: ServiceMatch::Unit(unit),
                    update_interval: rule.update_interval,
                    cpu: None,
                    memory: None,
                    restart_count: None,
                })
            })
            .collect()
    }

    async fn processes(&self, rule: &AutoRule, picker: &mut Picker) -> Vec<ProcessSourceConfig> {
        let mut pids: Vec<u32> = dir_names(&self.proc_root)
            .await
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        pids.sort_unstable();

        let mut sources = Vec::new();
        for pid in pids {
            let Ok(comm) = read_trimmed(&self.proc_root.join(pid.to_string()).join("comm")).await
            else {
                continue;
            };
            let name = format!("{comm}_{pid}");
            if picker.take(&name, &[comm.as_str()]) {
                sources.push(ProcessSourceConfig {
                    name,
                    enabled: true,
                    match_rule: ProcessMatch::Pid(pid),
                    aggregate: false,
                    update_interval: rule.update_interval,
                    cpu: None,
                    memory: None,
                    threads: None,
                    fds: None,
                });
            }
        }
        sources
    }
}
