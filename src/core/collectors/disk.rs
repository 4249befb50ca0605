//! Filesystem usage of one mountpoint via `statvfs`.

use std::ffi::CString;

use tracing::trace;

use super::{
    error::CollectorError,
    traits::Collector,
    types::{CollectorResult, Schedule},
};
use crate::{
    config::sources::DiskSourceConfig,
    core::model::{CollectionResult, Entity, SourceContext},
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Byte counts of one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    /// Space available to unprivileged users.
    pub available: u64,
}

impl DiskUsage {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    /// Used share as `df` computes it: used / (used + available).
    pub fn percent(&self) -> f64 {
        let denominator = self.used() + self.available;
        if denominator == 0 {
            return 0.0;
        }
        self.used() as f64 / denominator as f64 * 100.0
    }
}

pub fn statvfs(mountpoint: &str) -> CollectorResult<DiskUsage> {
    let c_path = CString::new(mountpoint.as_bytes()).map_err(|e| CollectorError::InvalidFormat {
        location: mountpoint.to_string(),
        reason: e.to_string(),
    })?;

    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        trace!("statvfs failed for '{}': {}", mountpoint, err);
        if err.kind() == std::io::ErrorKind::NotFound {
            return Err(CollectorError::PathNotFound {
                path: mountpoint.to_string(),
            });
        }
        return Err(CollectorError::SystemCall {
            syscall: "statvfs".into(),
            reason: err.to_string(),
        });
    }

    let block_size = stat.f_frsize as u64;
    Ok(DiskUsage {
        total: (stat.f_blocks as u64).wrapping_mul(block_size),
        free: (stat.f_bfree as u64).wrapping_mul(block_size),
        available: (stat.f_bavail as u64).wrapping_mul(block_size),
    })
}

pub struct DiskCollector {
    ctx: SourceContext,
    schedule: Schedule,
    mountpoint: String,
}

impl DiskCollector {
    pub fn new(ctx: SourceContext, schedule: Schedule, config: &DiskSourceConfig) -> Self {
        Self {
            ctx,
            schedule,
            mountpoint: config.mountpoint.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Collector for DiskCollector {
    fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn entities(&self) -> Vec<Entity> {
        let ctx = &self.ctx;
        vec![
            ctx.sensor("total_gb", "Total")
                .unit("GiB")
                .device_class("data_size")
                .icon("mdi:harddisk")
                .diagnostic(),
            ctx.sensor("used_gb", "Used")
                .unit("GiB")
                .device_class("data_size")
                .measurement()
                .icon("mdi:harddisk"),
            ctx.sensor("free_gb", "Free")
                .unit("GiB")
                .device_class("data_size")
                .measurement()
                .icon("mdi:harddisk"),
            ctx.sensor("percent", "Usage").percent().icon("mdi:harddisk"),
        ]
    }

    async fn collect(&mut self) -> CollectorResult<CollectionResult> {
        let mountpoint = self.mountpoint.clone();
        let usage = tokio::task::spawn_blocking(move || statvfs(&mountpoint))
            .await
            .map_err(|e| CollectorError::Other(format!("statvfs task failed: {e}")))??;

        Ok(CollectionResult::online()
            .with("total_gb", usage.total as f64 / GIB)
            .with("used_gb", usage.used() as f64 / GIB)
            .with("free_gb", usage.available as f64 / GIB)
            .with("percent", usage.percent()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::core::model::{Device, SourceType};

    fn collector(mountpoint: &str) -> DiskCollector {
        let config: DiskSourceConfig =
            toml::from_str(&format!("name = \"data\"\nmountpoint = \"{mountpoint}\"")).unwrap();
        let host = Device::host("test", "host", "Host");
        let ctx = SourceContext::new("test", SourceType::Disk, "data", host);
        DiskCollector::new(ctx, Schedule::every(Duration::from_secs(60)), &config)
    }

    #[test]
    fn test_percent_like_df() {
        let usage = DiskUsage {
            total: 100,
            free: 20,
            available: 10,
        };
        assert_eq!(usage.used(), 80);
        // 80 / (80 + 10)
        assert!((usage.percent() - 88.888).abs() < 0.01);
        assert_eq!(
            DiskUsage {
                total: 0,
                free: 0,
                available: 0
            }
            .percent(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_collect_existing_directory() {
        let dir = tempdir().unwrap();
        let mut collector = collector(dir.path().to_str().unwrap());
        let result = collector.collect().await.unwrap();
        assert!(result.available);
        assert!(result.get("total_gb").is_some());
        assert!(result.get("percent").is_some());
    }

    #[tokio::test]
    async fn test_missing_mountpoint_is_not_found() {
        let mut collector = collector("/definitely/not/mounted");
        let err = collector.collect().await.unwrap_err();
        assert_eq!(err.state(), "not_found");
    }
}
