//! Series directory watcher.
//!
//! Polls one directory at a fixed interval and reports every regular file
//! exactly once, in path order within a poll cycle. Missing directories and
//! transient listing errors are tolerated: the cycle is skipped and the next
//! one tries again.

use super::queue::FileQueue;
use super::StopFlag;
use crate::config::ScannerConfig;
use crate::error::AppResult;
use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, info_span, warn, Instrument};

/// Tuning knobs for [`FileWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Delay between directory listings
    pub poll_interval: Duration,
    /// Files younger than this are left for a later cycle
    pub settle_time: Duration,
    /// Only matching file names are reported
    pub file_pattern: Option<Regex>,
    /// Cap on remembered names; only names gone from the listing are evicted
    pub max_tracked: Option<usize>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            settle_time: Duration::ZERO,
            file_pattern: None,
            max_tracked: None,
        }
    }
}

impl WatcherOptions {
    /// Builds options from the scanner section of the configuration.
    pub fn from_config(config: &ScannerConfig) -> AppResult<Self> {
        let file_pattern = config
            .file_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self {
            poll_interval: config.poll_interval,
            settle_time: config.settle_time,
            file_pattern,
            max_tracked: config.max_tracked_files,
        })
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the file name filter.
    pub fn with_file_pattern(mut self, pattern: Regex) -> Self {
        self.file_pattern = Some(pattern);
        self
    }
}

/// A newly observed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileRef {
    /// Full path of the file
    pub path: PathBuf,
    /// Modification time at discovery
    pub modified: SystemTime,
}

/// Names already reported, oldest first.
#[derive(Debug, Default)]
struct SeenFiles {
    names: HashSet<OsString>,
    order: VecDeque<OsString>,
}

impl SeenFiles {
    fn contains(&self, name: &OsString) -> bool {
        self.names.contains(name)
    }

    fn insert(&mut self, name: OsString) {
        if self.names.insert(name.clone()) {
            self.order.push_back(name);
        }
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    /// Drops the oldest names not in `present` until at most `cap` remain.
    /// A name still in the directory is never forgotten, so it cannot be
    /// reported twice.
    fn evict_absent(&mut self, present: &HashSet<OsString>, cap: usize) {
        if self.names.len() <= cap {
            return;
        }
        let mut excess = self.names.len() - cap;
        let mut kept = VecDeque::with_capacity(self.order.len());
        while let Some(name) = self.order.pop_front() {
            if excess > 0 && !present.contains(&name) {
                self.names.remove(&name);
                excess -= 1;
            } else {
                kept.push_back(name);
            }
        }
        self.order = kept;
    }
}

/// Polls a series directory for new files.
#[derive(Debug)]
pub struct FileWatcher {
    dir: PathBuf,
    options: WatcherOptions,
    seen: SeenFiles,
    stop: StopFlag,
}

impl FileWatcher {
    /// Creates a watcher for `dir`. Nothing is read until the first poll.
    pub fn new(dir: PathBuf, options: WatcherOptions, stop: StopFlag) -> Self {
        Self {
            dir,
            options,
            seen: SeenFiles::default(),
            stop,
        }
    }

    /// The flag that ends [`FileWatcher::run`] and the stream.
    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Number of names currently remembered.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    /// Lists the directory once and returns files not reported before,
    /// sorted by path.
    pub async fn poll_once(&mut self) -> Vec<RawFileRef> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "series directory not present yet");
                return Vec::new();
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to list series directory");
                return Vec::new();
            }
        };

        let now = SystemTime::now();
        let mut present = HashSet::new();
        let mut fresh = Vec::new();
        let mut listing_complete = true;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "directory listing interrupted");
                    listing_complete = false;
                    break;
                }
            };
            let name = entry.file_name();
            present.insert(name.clone());
            if self.seen.contains(&name) {
                continue;
            }

            // Entries can vanish between listing and stat; retry next cycle.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            if let Some(pattern) = &self.options.file_pattern {
                let matches = name.to_str().is_some_and(|n| pattern.is_match(n));
                if !matches {
                    debug!(file = ?name, "ignoring file that does not match pattern");
                    self.seen.insert(name);
                    continue;
                }
            }

            let modified = metadata.modified().unwrap_or(now);
            if !self.options.settle_time.is_zero() {
                let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                if age < self.options.settle_time {
                    continue;
                }
            }

            self.seen.insert(name);
            fresh.push(RawFileRef {
                path: entry.path(),
                modified,
            });
        }

        self.end_cycle(&present, listing_complete);

        fresh.sort_by(|a, b| a.path.cmp(&b.path));
        fresh
    }

    /// Applies the tracking cap. A partial listing says nothing about which
    /// files are gone, so eviction waits for a complete one.
    fn end_cycle(&mut self, present: &HashSet<OsString>, listing_complete: bool) {
        if !listing_complete {
            return;
        }
        if let Some(cap) = self.options.max_tracked {
            self.seen.evict_absent(present, cap);
        }
    }

    /// Turns the watcher into a lazy stream of new files.
    ///
    /// The stop flag is checked once per cycle; the stream ends after the
    /// cycle in which it was raised.
    pub fn into_stream(self) -> impl Stream<Item = RawFileRef> + Send {
        stream::unfold((self, true), |(mut watcher, first)| async move {
            if !first {
                tokio::time::sleep(watcher.options.poll_interval).await;
            }
            if watcher.stop.is_stopped() {
                return None;
            }
            let batch = watcher.poll_once().await;
            Some((stream::iter(batch), (watcher, false)))
        })
        .flatten()
    }

    /// Pushes every new file onto `queue` until the stop flag is raised.
    /// Returns the number of files pushed.
    pub async fn run(self, queue: Arc<FileQueue>) -> u64 {
        let span = info_span!("watcher", dir = %self.dir.display());
        async move {
            info!("watching series directory");
            let mut pushed = 0u64;
            let files = self.into_stream();
            futures::pin_mut!(files);
            while let Some(file) = files.next().await {
                debug!(path = %file.path.display(), "new file");
                queue.push(file.path);
                pushed += 1;
            }
            info!(files = pushed, "watcher stopped");
            pushed
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SIEMENS_FILE_PATTERN;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) {
        fs::write(dir.path().join(name), b"x").unwrap();
    }

    fn names(files: &[RawFileRef]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn reports_each_file_once() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "b.dcm");
        touch(&dir, "a.dcm");
        let mut watcher =
            FileWatcher::new(dir.path().to_path_buf(), WatcherOptions::default(), StopFlag::new());

        assert_eq!(names(&watcher.poll_once().await), vec!["a.dcm", "b.dcm"]);
        assert!(watcher.poll_once().await.is_empty());

        touch(&dir, "c.dcm");
        assert_eq!(names(&watcher.poll_once().await), vec!["c.dcm"]);
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let series = dir.path().join("not_yet");
        let mut watcher =
            FileWatcher::new(series.clone(), WatcherOptions::default(), StopFlag::new());

        assert!(watcher.poll_once().await.is_empty());

        fs::create_dir(&series).unwrap();
        fs::write(series.join("001_000001_000001.dcm"), b"x").unwrap();
        assert_eq!(watcher.poll_once().await.len(), 1);
    }

    #[tokio::test]
    async fn skips_subdirectories_and_non_matching_names() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir, "001_000001_000001.dcm");
        touch(&dir, "notes.txt");
        let options =
            WatcherOptions::default().with_file_pattern(Regex::new(SIEMENS_FILE_PATTERN).unwrap());
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), options, StopFlag::new());

        assert_eq!(names(&watcher.poll_once().await), vec!["001_000001_000001.dcm"]);
    }

    #[tokio::test]
    async fn young_files_wait_for_settle_time() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.dcm");
        let options = WatcherOptions {
            settle_time: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), options, StopFlag::new());

        assert!(watcher.poll_once().await.is_empty());
        assert_eq!(watcher.tracked(), 0);
    }

    #[tokio::test]
    async fn eviction_never_forgets_present_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.dcm");
        touch(&dir, "b.dcm");
        let options = WatcherOptions {
            max_tracked: Some(1),
            ..Default::default()
        };
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), options, StopFlag::new());

        assert_eq!(watcher.poll_once().await.len(), 2);
        // Both names are still listed, so both are kept despite the cap.
        assert_eq!(watcher.tracked(), 2);
        assert!(watcher.poll_once().await.is_empty());

        fs::remove_file(dir.path().join("a.dcm")).unwrap();
        assert!(watcher.poll_once().await.is_empty());
        assert_eq!(watcher.tracked(), 1);
    }

    #[tokio::test]
    async fn interrupted_listing_does_not_evict() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.dcm");
        touch(&dir, "b.dcm");
        let options = WatcherOptions {
            max_tracked: Some(1),
            ..Default::default()
        };
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), options, StopFlag::new());
        assert_eq!(watcher.poll_once().await.len(), 2);

        // A listing that broke off early saw neither file.
        watcher.end_cycle(&HashSet::new(), false);
        assert_eq!(watcher.tracked(), 2);
        assert!(watcher.poll_once().await.is_empty());

        watcher.end_cycle(&HashSet::new(), true);
        assert_eq!(watcher.tracked(), 1);
    }

    #[tokio::test]
    async fn modified_file_is_not_reported_again() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.dcm");
        let mut watcher =
            FileWatcher::new(dir.path().to_path_buf(), WatcherOptions::default(), StopFlag::new());
        assert_eq!(names(&watcher.poll_once().await), vec!["a.dcm"]);

        fs::write(dir.path().join("a.dcm"), b"rewritten with more bytes").unwrap();
        let file = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("a.dcm"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        drop(file);

        assert!(watcher.poll_once().await.is_empty());
    }

    #[tokio::test]
    async fn run_pushes_to_queue_until_stopped() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.dcm");
        touch(&dir, "b.dcm");
        let stop = StopFlag::new();
        let options = WatcherOptions::default().with_poll_interval(Duration::from_millis(10));
        let watcher = FileWatcher::new(dir.path().to_path_buf(), options, stop.clone());
        let queue = Arc::new(FileQueue::new());

        let task = tokio::spawn(watcher.run(Arc::clone(&queue)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();

        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(queue.try_pop(), Some(dir.path().join("a.dcm")));
        assert_eq!(queue.try_pop(), Some(dir.path().join("b.dcm")));
    }
}
