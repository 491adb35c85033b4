//! Acquisition side of the pipeline.
//!
//! Runs on the scanner console. Three pieces cooperate through a shared
//! [`FileQueue`] and a shared [`StopFlag`]:
//!
//! ```text
//!  series dir ──poll──▶ FileWatcher ──push──▶ FileQueue ──pop──▶ ConverterWorker
//!                                                                 │ VolumeBuilder
//!                                                                 ▼
//!                                                           VolumeTransport ──▶ analysis
//! ```
//!
//! - [`watcher`]: polls the series directory and emits each new file once.
//! - [`queue`]: FIFO of pending paths with an in-flight set, so an item is only
//!   forgotten after it has been converted and acknowledged.
//! - [`builder`]: the boundary to vendor-specific reconstruction.
//! - [`converter`]: drains the queue and drives the transport.
//! - [`series`]: finds series directories under the scanner base directory.
//!
//! Cancellation is cooperative: every loop checks the [`StopFlag`] once per
//! iteration, so shutdown latency is one poll or queue timeout.

pub mod builder;
pub mod converter;
pub mod queue;
pub mod series;
pub mod watcher;

pub use builder::{IndexPattern, RawVolumeBuilder, VolumeBuilder};
pub use converter::{ConverterWorker, StopReason, WorkerSummary};
pub use queue::FileQueue;
pub use watcher::{FileWatcher, RawFileRef, WatcherOptions};

use crate::error::AppResult;
use crate::network::transport::VolumeTransport;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// A flag that is not yet raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Loops notice it at their next iteration.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one acquisition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionSummary {
    /// Files the watcher handed to the queue
    pub files_enqueued: u64,
    /// What the converter did with them
    pub worker: WorkerSummary,
}

/// Runs watcher and converter for one series until the remote endpoint
/// ends the session, the flag is raised, or the transport fails.
///
/// The transport must already have completed its handshake. The caller owns
/// `queue`: if the transport fails, the path that was being sent is moved
/// back to pending, so [`FileQueue::pending_paths`] lists everything that
/// never reached the remote endpoint.
pub async fn run_acquisition<B, S>(
    series_dir: PathBuf,
    options: WatcherOptions,
    queue_timeout: Duration,
    queue: Arc<FileQueue>,
    builder: Arc<B>,
    transport: VolumeTransport<S>,
    stop: StopFlag,
) -> AppResult<AcquisitionSummary>
where
    B: VolumeBuilder,
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(series_dir = %series_dir.display(), "starting acquisition");

    let watcher = FileWatcher::new(series_dir, options, stop.clone());
    let watcher_task = tokio::spawn(watcher.run(Arc::clone(&queue)));

    let worker = ConverterWorker::new(Arc::clone(&queue), builder, transport, stop.clone())
        .with_queue_timeout(queue_timeout);
    let result = worker.run().await;

    // The worker raises the flag itself on STOP or failure; cover cancellation too.
    stop.stop();
    let files_enqueued = match watcher_task.await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "watcher task ended abnormally");
            queue.total_enqueued()
        }
    };

    let worker = match result {
        Ok(worker) => worker,
        Err(e) => {
            let recovered = queue.recover_in_flight();
            warn!(
                recovered,
                unsent = queue.pending_len(),
                "acquisition ended on transport failure"
            );
            return Err(e);
        }
    };
    info!(
        files_enqueued,
        volumes_sent = worker.sent,
        files_dropped = worker.dropped,
        reason = ?worker.reason,
        "acquisition finished"
    );
    Ok(AcquisitionSummary {
        files_enqueued,
        worker,
    })
}
