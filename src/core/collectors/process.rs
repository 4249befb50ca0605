//! Processes matched by name, command line, pid or pidfile.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};

use regex::Regex;
use tracing::trace;

use super::{
    aggregate::{poll_sources, MultiSourceCollector, COUNT_KEY},
    error::CollectorError,
    fsutil::{read_file, read_trimmed},
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::{ProcessMatch, ProcessSourceConfig, ProcessToggles},
    core::model::{CollectionResult, Entity, SourceContext},
};

/// State of a matched process.
pub const STATE_RUNNING: &str = "running";

/// Clock ticks per second for `/proc/<pid>/stat` times.
fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Fields of `/proc/<pid>/stat` the collector uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// utime + stime, in clock ticks.
    pub cpu_ticks: u64,
    pub threads: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_proc_stat(stat: &str) -> CollectorResult<ProcStat> {
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| CollectorError::InvalidFormat {
            location: "/proc/<pid>/stat".into(),
            reason: "missing command name".into(),
        })?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state)
    let field = |n: usize, metric: &str| -> CollectorResult<u64> {
        fields
            .get(n - 3)
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| CollectorError::parse(metric, "/proc/<pid>/stat", format!("field {n}")))
    };

    Ok(ProcStat {
        cpu_ticks: field(14, "utime")? + field(15, "stime")?,
        threads: field(20, "num_threads")?,
    })
}

/// `VmRSS` of `/proc/<pid>/status`, in kB. Kernel threads have none.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

enum Matcher {
    Name(String),
    Pattern(Regex),
    Pid(u32),
    Pidfile(PathBuf),
    Cmdline(String),
}

impl Matcher {
    fn from_rule(rule: &ProcessMatch) -> CollectorResult<Self> {
        Ok(match rule {
            ProcessMatch::Name(name) => Matcher::Name(name.clone()),
            ProcessMatch::Pattern(pattern) => Matcher::Pattern(
                Regex::new(pattern).map_err(|e| CollectorError::Other(e.to_string()))?,
            ),
            ProcessMatch::Pid(pid) => Matcher::Pid(*pid),
            ProcessMatch::Pidfile(path) => Matcher::Pidfile(path.clone()),
            ProcessMatch::Cmdline(text) => Matcher::Cmdline(text.clone()),
        })
    }
}

pub struct ProcessCollector {
    ctx: SourceContext,
    schedule: Schedule,
    rule: ProcessMatch,
    matcher: Option<Matcher>,
    aggregate: bool,
    toggles: ProcessToggles,
    proc_root: PathBuf,
    ticks_per_second: f64,
    previous: HashMap<u32, (u64, Instant)>,
}

impl ProcessCollector {
    pub fn new(
        ctx: SourceContext,
        schedule: Schedule,
        config: &ProcessSourceConfig,
        defaults: &ProcessToggles,
    ) -> Self {
        Self {
            ctx,
            schedule,
            rule: config.match_rule.clone(),
            matcher: None,
            aggregate: config.aggregate,
            toggles: config.toggles(defaults),
            proc_root: PathBuf::from("/proc"),
            ticks_per_second: clock_ticks(),
            previous: HashMap::new(),
        }
    }

    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    async fn all_pids(&self) -> CollectorResult<Vec<u32>> {
        let mut entries = tokio::fs::read_dir(&self.proc_root)
            .await
            .map_err(|source| CollectorError::from_io(&self.proc_root, source))?;
        let mut pids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    async fn cmdline(&self, pid: u32) -> Option<String> {
        let raw = tokio::fs::read(self.pid_dir(pid).join("cmdline")).await.ok()?;
        let text = String::from_utf8_lossy(&raw).replace('\0', " ");
        Some(text.trim().to_string())
    }

    async fn matches(&self, matcher: &Matcher, pid: u32) -> bool {
        match matcher {
            Matcher::Name(name) => read_trimmed(&self.pid_dir(pid).join("comm"))
                .await
                .is_ok_and(|comm| &comm == name),
            Matcher::Pattern(regex) => self
                .cmdline(pid)
                .await
                .is_some_and(|cmdline| !cmdline.is_empty() && regex.is_match(&cmdline)),
            Matcher::Cmdline(text) => self
                .cmdline(pid)
                .await
                .is_some_and(|cmdline| cmdline.contains(text.as_str())),
            Matcher::Pid(_) | Matcher::Pidfile(_) => false,
        }
    }

    async fn pid_from_file(path: &Path) -> CollectorResult<u32> {
        let text = read_trimmed(path).await?;
        text.parse()
            .map_err(|_| CollectorError::parse("pid", path.display().to_string(), text))
    }

    fn cpu_percent(&mut self, pid: u32, ticks: u64) -> Option<f64> {
        let now = Instant::now();
        let previous = self.previous.insert(pid, (ticks, now));
        let (before, at) = previous?;
        let elapsed = now.duration_since(at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let used = ticks.saturating_sub(before) as f64 / self.ticks_per_second;
        Some(used / elapsed * 100.0)
    }
}

#[async_trait::async_trait]
impl MultiSourceCollector for ProcessCollector {
    type Source = u32;

    fn describe(&self) -> String {
        match &self.rule {
            ProcessMatch::Name(v) => format!("process named '{v}'"),
            ProcessMatch::Pattern(v) => format!("process matching /{v}/"),
            ProcessMatch::Pid(v) => format!("pid {v}"),
            ProcessMatch::Pidfile(v) => format!("pid from {}", v.display()),
            ProcessMatch::Cmdline(v) => format!("process with '{v}' in its command line"),
        }
    }

    async fn discover_sources(&mut self) -> CollectorResult<Vec<u32>> {
        let matcher = match self.matcher.take() {
            Some(m) => m,
            None => Matcher::from_rule(&self.rule)?,
        };

        let found = match &matcher {
            Matcher::Pid(pid) => Ok(vec![*pid]),
            Matcher::Pidfile(path) => match Self::pid_from_file(path).await {
                Ok(pid) => Ok(vec![pid]),
                Err(CollectorError::PathNotFound { .. }) => Ok(Vec::new()),
                Err(e) => Err(e),
            },
            _ => match self.all_pids().await {
                Ok(pids) => {
                    let mut found = Vec::new();
                    for pid in pids {
                        if self.matches(&matcher, pid).await {
                            found.push(pid);
                        }
                    }
                    Ok(found)
                }
                Err(e) => Err(e),
            },
        };
        self.matcher = Some(matcher);
        let mut found = found?;

        // A pid that is gone is not a match.
        let mut alive = Vec::with_capacity(found.len());
        for pid in found.drain(..) {
            if tokio::fs::metadata(self.pid_dir(pid)).await.is_ok() {
                alive.push(pid);
            }
        }
        self.previous.retain(|pid, _| alive.contains(pid));
        trace!("{} matched {} process(es)", self.describe(), alive.len());
        Ok(alive)
    }

    async fn poll_one(&mut self, pid: &u32) -> CollectorResult<CollectionResult> {
        let pid = *pid;
        let dir = self.pid_dir(pid);
        let stat = parse_proc_stat(&read_file(&dir.join("stat")).await?)?;

        let mut result = CollectionResult::available(STATE_RUNNING);
        if self.toggles.cpu {
            if let Some(percent) = self.cpu_percent(pid, stat.cpu_ticks) {
                result.set("cpu_percent", percent);
            }
        }
        if self.toggles.memory {
            let status = read_file(&dir.join("status")).await?;
            result.set("memory_mb", parse_vm_rss(&status).unwrap_or(0) as f64 / 1024.0);
        }
        if self.toggles.threads {
            result.set("threads", stat.threads);
        }
        if self.toggles.fds {
            // Needs the same uid or CAP_SYS_PTRACE; skip quietly otherwise.
            if let Ok(mut fds) = tokio::fs::read_dir(dir.join("fd")).await {
                let mut count = 0u64;
                while let Ok(Some(_)) = fds.next_entry().await {
                    count += 1;
                }
                result.set("fds", count);
            }
        }
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Collector for ProcessCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        self.matcher = Some(Matcher::from_rule(&self.rule)?);
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        let mut entities = vec![ctx.sensor("state", "State").icon("mdi:application-cog").diagnostic()];
        if self.toggles.cpu {
            entities.push(ctx.sensor("cpu_percent", "CPU Usage").percent().icon("mdi:cpu-64-bit"));
        }
        if self.toggles.memory {
            entities.push(
                ctx.sensor("memory_mb", "Memory")
                    .unit("MiB")
                    .device_class("data_size")
                    .measurement()
                    .icon("mdi:memory"),
            );
        }
        if self.toggles.threads {
            entities.push(ctx.sensor("threads", "Threads").measurement().icon("mdi:format-list-numbered"));
        }
        if self.toggles.fds {
            entities.push(
                ctx.sensor("fds", "Open Files")
                    .measurement()
                    .icon("mdi:file-multiple")
                    .diagnostic(),
            );
        }
        if self.aggregate {
            entities.push(ctx.sensor(COUNT_KEY, "Process Count").measurement().icon("mdi:counter"));
        }
        entities
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let aggregate = self.aggregate;
        poll_sources(self, aggregate, STATE_RUNNING).await
    }
}
