//! Fan speed (RPM) from hwmon `fan*_input` files.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    error::CollectorError,
    fsutil::{read_number, read_trimmed},
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::FanSourceConfig,
    core::model::{CollectionResult, Entity, SourceContext},
};

pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// State of a hwmon device without fan inputs.
pub const STATE_NO_FAN_INPUTS: &str = "no_fan_inputs";

#[derive(Debug, Clone, PartialEq)]
pub struct FanInput {
    /// `fan{N}_rpm`, or `rpm` when the device has a single fan.
    pub key: String,
    pub path: PathBuf,
}

/// Sorted `fan*_input` files of one hwmon directory.
pub async fn fan_inputs(hwmon_dir: &Path) -> Vec<FanInput> {
    let Ok(mut entries) = tokio::fs::read_dir(hwmon_dir).await else {
        return Vec::new();
    };

    let mut numbers = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file = entry.file_name().to_string_lossy().into_owned();
        if let Some(number) = file
            .strip_prefix("fan")
            .and_then(|rest| rest.strip_suffix("_input"))
        {
            numbers.push((number.parse::<u32>().unwrap_or(u32::MAX), number.to_string()));
        }
    }
    numbers.sort();

    let single = numbers.len() == 1;
    numbers
        .into_iter()
        .map(|(_, number)| FanInput {
            key: if single {
                "rpm".to_string()
            } else {
                format!("fan{number}_rpm")
            },
            path: hwmon_dir.join(format!("fan{number}_input")),
        })
        .collect()
}

/// Driver name of a hwmon directory, its directory name when unnamed.
pub async fn hwmon_label(hwmon_dir: &Path) -> String {
    match read_trimmed(&hwmon_dir.join("name")).await {
        Ok(name) if !name.is_empty() => name,
        _ => hwmon_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

pub struct FanCollector {
    ctx: SourceContext,
    schedule: Schedule,
    dir: PathBuf,
    label: String,
    inputs: Vec<FanInput>,
}

impl FanCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: &FanSourceConfig) -> Self {
        Self {
            ctx,
            schedule,
            dir: PathBuf::from(HWMON_ROOT).join(config.hwmon()),
            label: config.name.clone(),
            inputs: Vec::new(),
        }
    }

    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        if let Some(hwmon) = self.dir.file_name() {
            self.dir = root.as_ref().join(hwmon);
        }
        self
    }
}

#[async_trait::async_trait]
impl Collector for FanCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn initialize(&mut self) -> CollectorResult<()> {
        if tokio::fs::metadata(&self.dir).await.is_err() {
            return Err(CollectorError::SourceNotFound(format!(
                "hwmon device {}",
                self.dir.display()
            )));
        }
        self.label = hwmon_label(&self.dir).await;
        self.inputs = fan_inputs(&self.dir).await;

        if self.inputs.is_empty() {
            warn!("Fan collector {} found no fan inputs", self.id());
        } else {
            debug!("Fan collector {} reads {} input(s)", self.id(), self.inputs.len());
        }
        Ok(())
    }

    fn entities(&self) -> Vec<Entity> {
        self.inputs
            .iter()
            .map(|input| {
                let name = match input.key.strip_suffix("_rpm") {
                    Some(fan) => format!("Fan {} {}", self.label, fan),
                    None => format!("Fan {}", self.label),
                };
                self.ctx
                    .sensor(&input.key, name)
                    .unit("RPM")
                    .measurement()
                    .icon("mdi:fan")
            })
            .collect()
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        if self.inputs.is_empty() {
            return Ok(CollectionResult::unavailable(
                STATE_NO_FAN_INPUTS,
                Some(format!("{} has no fan*_input files", self.dir.display())),
            ));
        }

        let mut result = CollectionResult::online();
        let mut first_error = None;
        for input in &self.inputs {
            match read_number::<u64>(&input.path).await {
                Ok(rpm) => result.set(input.key.clone(), rpm),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if result.data().is_empty() => Err(e),
            _ => Ok(result),
        }
    }
}
