//! Small readers for procfs/sysfs files.

use std::{path::Path, str::FromStr};

use super::{error::CollectorError, types::CollectorResult};

pub async fn read_file(path: &Path) -> CollectorResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CollectorError::from_io(path, source))
}

/// File content with surrounding whitespace removed.
pub async fn read_trimmed(path: &Path) -> CollectorResult<String> {
    Ok(read_file(path).await?.trim().to_string())
}

/// Parses the whole (trimmed) file as one number.
pub async fn read_number<T: FromStr>(path: &Path) -> CollectorResult<T>
where
    T::Err: std::fmt::Display,
{
    let text = read_trimmed(path).await?;
    text.parse::<T>().map_err(|e| {
        CollectorError::parse(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("value"),
            path.display().to_string(),
            format!("'{text}': {e}"),
        )
    })
}

/// Like [`read_number`], but a missing or unreadable file is `None`.
pub async fn read_optional_number<T: FromStr>(path: &Path) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    read_number(path).await.ok()
}
