//! Queue drain loop: convert each file and push it over the transport.

use super::builder::VolumeBuilder;
use super::queue::FileQueue;
use super::StopFlag;
use crate::error::AppResult;
use crate::network::transport::{SendOutcome, VolumeTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop flag was raised locally
    Cancelled,
    /// The remote endpoint acknowledged the last volume with STOP
    RemoteStop,
}

/// What one worker run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Volumes delivered and acknowledged
    pub sent: u64,
    /// Files dropped because they could not be converted
    pub dropped: u64,
    /// Why the loop ended
    pub reason: StopReason,
}

/// Drains a [`FileQueue`] into a [`VolumeTransport`].
///
/// A path is completed in the queue only after its volume was acknowledged,
/// or after it was dropped as unconvertible. If the transport fails, the
/// path that was being sent stays in flight.
pub struct ConverterWorker<B, S> {
    queue: Arc<FileQueue>,
    builder: Arc<B>,
    transport: VolumeTransport<S>,
    stop: StopFlag,
    queue_timeout: Duration,
    span: Span,
}

impl<B, S> ConverterWorker<B, S>
where
    B: VolumeBuilder,
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// The transport must have completed its handshake.
    pub fn new(
        queue: Arc<FileQueue>,
        builder: Arc<B>,
        transport: VolumeTransport<S>,
        stop: StopFlag,
    ) -> Self {
        Self {
            queue,
            builder,
            transport,
            stop,
            queue_timeout: Duration::from_millis(200),
            span: info_span!("converter"),
        }
    }

    /// How long one pop waits on an empty queue before re-checking the flag.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Span the loop runs in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Runs until the flag is raised, the remote side says STOP, or the
    /// transport fails. A transport failure raises the flag and is returned.
    pub async fn run(self) -> AppResult<WorkerSummary> {
        let span = self.span.clone();
        self.drain().instrument(span).await
    }

    async fn drain(mut self) -> AppResult<WorkerSummary> {
        let mut sent = 0u64;
        let mut dropped = 0u64;
        info!("converter started");

        let reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Cancelled;
            }
            let Some(path) = self.queue.pop_timeout(self.queue_timeout).await else {
                continue;
            };

            let builder = Arc::clone(&self.builder);
            let job_path = path.clone();
            let built = tokio::task::spawn_blocking(move || builder.build(&job_path)).await;
            let record = match built {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "dropping file that failed conversion");
                    self.queue.complete(&path);
                    dropped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping file, builder panicked");
                    self.queue.complete(&path);
                    dropped += 1;
                    continue;
                }
            };

            match self.transport.send_volume(&record).await {
                Ok(outcome) => {
                    self.queue.complete(&path);
                    sent += 1;
                    debug!(vol_idx = record.index(), path = %path.display(), "volume delivered");
                    if outcome == SendOutcome::Stop {
                        self.stop.stop();
                        break StopReason::RemoteStop;
                    }
                }
                Err(e) => {
                    error!(vol_idx = record.index(), error = %e, "transport failed, ending session");
                    self.stop.stop();
                    return Err(e);
                }
            }
        };

        info!(sent, dropped, ?reason, "converter stopped");
        Ok(WorkerSummary {
            sent,
            dropped,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::network::frame::{read_message, read_text, write_text};
    use crate::volume::{Affine, VolumeRecord};
    use ndarray::Array3;
    use std::path::{Path, PathBuf};
    use tokio::io::DuplexStream;
    use tracing_test::traced_test;

    fn build_or_fail(path: &Path) -> AppResult<VolumeRecord> {
        if path.ends_with("bad") {
            return Err(PipelineError::conversion(path, "corrupt"));
        }
        let index = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Ok(VolumeRecord::from_array(
            index,
            &Array3::<u8>::zeros((2, 2, 2)),
            Affine::identity(),
        ))
    }

    /// Echoes the greeting, then acks `stop_after` volumes, the last with STOP.
    fn spawn_remote(
        mut server: DuplexStream,
        stop_after: usize,
    ) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
        tokio::spawn(async move {
            let hello = read_text(&mut server).await.unwrap();
            write_text(&mut server, &hello).await.unwrap();
            let mut headers = Vec::new();
            while let Some(parts) = read_message(&mut server).await.unwrap() {
                headers.push(parts[0].to_vec());
                let last = headers.len() == stop_after;
                let ack = if last { "received STOP" } else { "received" };
                write_text(&mut server, ack).await.unwrap();
                if last {
                    break;
                }
            }
            headers
        })
    }

    async fn ready_transport(client: DuplexStream) -> VolumeTransport<DuplexStream> {
        let mut transport = VolumeTransport::new(client, "test");
        transport.handshake(None).await.unwrap();
        transport
    }

    #[tokio::test]
    #[traced_test]
    async fn conversion_failures_are_logged_and_dropped() {
        let (client, server) = tokio::io::duplex(4096);
        let remote = spawn_remote(server, 1);
        let transport = ready_transport(client).await;

        let queue = Arc::new(FileQueue::new());
        queue.push(PathBuf::from("bad"));
        queue.push(PathBuf::from("7"));

        let worker = ConverterWorker::new(
            Arc::clone(&queue),
            Arc::new(build_or_fail),
            transport,
            StopFlag::new(),
        )
        .with_queue_timeout(Duration::from_millis(10));
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.reason, StopReason::RemoteStop);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(remote.await.unwrap().len(), 1);
        assert!(logs_contain("dropping file that failed conversion"));
    }

    #[tokio::test]
    async fn remote_stop_ends_the_loop_before_the_next_volume() {
        let (client, server) = tokio::io::duplex(4096);
        let remote = spawn_remote(server, 3);
        let transport = ready_transport(client).await;

        let queue = Arc::new(FileQueue::new());
        for name in ["0", "1", "2", "3"] {
            queue.push(PathBuf::from(name));
        }
        let stop = StopFlag::new();
        let worker = ConverterWorker::new(
            Arc::clone(&queue),
            Arc::new(build_or_fail),
            transport,
            stop.clone(),
        )
        .with_queue_timeout(Duration::from_millis(10));
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.reason, StopReason::RemoteStop);
        assert!(stop.is_stopped());
        assert_eq!(remote.await.unwrap().len(), 3);
        assert_eq!(queue.pending_paths(), vec![PathBuf::from("3")]);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_worker_leaves_pending_items() {
        let (client, server) = tokio::io::duplex(4096);
        let _remote = spawn_remote(server, 10);
        let transport = ready_transport(client).await;

        let queue = Arc::new(FileQueue::new());
        let stop = StopFlag::new();
        stop.stop();
        queue.push(PathBuf::from("1"));

        let worker =
            ConverterWorker::new(Arc::clone(&queue), Arc::new(build_or_fail), transport, stop);
        let summary = worker.run().await.unwrap();

        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.sent, 0);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_keeps_item_in_flight() {
        let (client, mut server) = tokio::io::duplex(4096);
        let remote = tokio::spawn(async move {
            let hello = read_text(&mut server).await.unwrap();
            write_text(&mut server, &hello).await.unwrap();
        });
        let transport = ready_transport(client).await;
        remote.await.unwrap();

        let queue = Arc::new(FileQueue::new());
        queue.push(PathBuf::from("3"));
        let stop = StopFlag::new();
        let worker = ConverterWorker::new(
            Arc::clone(&queue),
            Arc::new(build_or_fail),
            transport,
            stop.clone(),
        );

        assert!(worker.run().await.is_err());
        assert!(stop.is_stopped());
        assert_eq!(queue.in_flight_len(), 1);
        assert_eq!(queue.recover_in_flight(), 1);
    }
}
