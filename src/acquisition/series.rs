//! Series directory discovery under the scanner base directory.
//!
//! The scanner writes each series into its own directory. Before a run the
//! operator either names that directory or lets [`wait_for_series_dir`] pick
//! up the first one touched after the wait began.

use super::StopFlag;
use crate::error::AppResult;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// One series directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesDir {
    /// Full path
    pub path: PathBuf,
    /// Directory name
    pub name: String,
    /// Total size of the files directly inside
    pub size_bytes: u64,
    /// Last modification time of the directory
    pub modified: SystemTime,
}

impl SeriesDir {
    /// One-line summary for a listing.
    pub fn describe(&self, now: SystemTime) -> String {
        let stamp: DateTime<Local> = self.modified.into();
        format!(
            "{:<24} {}  {}  ({})",
            self.name,
            format_size(self.size_bytes),
            format_age(now.duration_since(self.modified).unwrap_or(Duration::ZERO)),
            stamp.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Human-readable size using decimal units.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if bytes < 1_000 {
        format!("{b:5.1} bytes")
    } else if bytes < 1_000_000 {
        format!("{:5.1} kB", b / 1e3)
    } else {
        format!("{:5.1} MB", b / 1e6)
    }
}

/// Elapsed time as `"<m> min, <s> s ago"`.
pub fn format_age(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{} min, {} s ago", secs / 60, secs % 60)
}

/// Lists the subdirectories of `base`, oldest modification first.
pub async fn list_series_dirs(base: &Path) -> AppResult<Vec<SeriesDir>> {
    let mut entries = tokio::fs::read_dir(base).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let path = entry.path();
        dirs.push(SeriesDir {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: dir_size(&path).await?,
            modified: metadata.modified()?,
            path,
        });
    }
    dirs.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(dirs)
}

async fn dir_size(dir: &Path) -> AppResult<u64> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut total = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Waits for a subdirectory of `base` modified after `since`.
///
/// Returns `Ok(None)` if `stop` is raised first.
pub async fn wait_for_series_dir(
    base: &Path,
    since: SystemTime,
    interval: Duration,
    stop: &StopFlag,
) -> AppResult<Option<PathBuf>> {
    info!(base = %base.display(), "waiting for a new series directory");
    loop {
        if stop.is_stopped() {
            return Ok(None);
        }
        let fresh = list_series_dirs(base)
            .await?
            .into_iter()
            .find(|d| d.modified > since);
        if let Some(dir) = fresh {
            info!(series_dir = %dir.path.display(), "found series directory");
            return Ok(Some(dir.path));
        }
        debug!("no new series directory yet");
        tokio::time::sleep(interval).await;
    }
}
