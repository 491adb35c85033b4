//! Analysis side of the pipeline.
//!
//! An [`AnalysisSession`] pulls volumes off a [`ReceiverSession`], acknowledges
//! each one (telling the sender to stop after the last expected volume), runs
//! the configured [`Analyzer`] plus optional motion estimation, and writes the
//! combined fields into the shared [`ResultsStore`].

pub mod motion;

pub use motion::{
    compute_rms, CentroidRegistration, MotionEstimate, MotionProcessor, Registration,
    RigidTransform, HEAD_RADIUS_MM,
};

use crate::config::AnalysisConfig;
use crate::error::AppResult;
use crate::network::receiver::ReceiverSession;
use crate::results::{ResultEntry, ResultsStore};
use crate::volume::VolumeRecord;
use ndarray::Array3;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, info_span, warn, Instrument};

/// Per-volume analysis producing result fields.
pub trait Analyzer: Send {
    /// Fields for `volume`; `voxels` is the volume decoded to `f64`.
    fn analyze(&mut self, volume: &VolumeRecord, voxels: &Array3<f64>) -> AppResult<ResultEntry>;
}

/// Mean voxel intensity, reported as `meanSignal`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanIntensity;

impl Analyzer for MeanIntensity {
    fn analyze(&mut self, _volume: &VolumeRecord, voxels: &Array3<f64>) -> AppResult<ResultEntry> {
        let mean = voxels.mean().unwrap_or(0.0);
        Ok(ResultEntry::new().with("meanSignal", mean))
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Volumes received and acknowledged
    pub received: u64,
    /// Whether the sender was told to stop (as opposed to hanging up)
    pub stop_sent: bool,
}

/// Drives one sender connection through analysis into the store.
pub struct AnalysisSession<A> {
    store: Arc<ResultsStore>,
    analyzer: A,
    motion: Option<MotionProcessor>,
    expected_volumes: Option<u32>,
}

impl<A: Analyzer> AnalysisSession<A> {
    /// A session writing into `store`.
    pub fn new(store: Arc<ResultsStore>, analyzer: A, config: &AnalysisConfig) -> Self {
        let motion = config
            .estimate_motion
            .then(|| MotionProcessor::new(config.reference_volume));
        Self {
            store,
            analyzer,
            motion,
            expected_volumes: config.expected_volumes,
        }
    }

    /// Processes volumes until the expected count was reached or the sender
    /// closed the connection.
    ///
    /// Each volume is acknowledged before it is analysed, so the sender is
    /// never held up by analysis time.
    pub async fn run<S>(&mut self, receiver: &mut ReceiverSession<S>) -> AppResult<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let span = info_span!("analysis", sender = receiver.sender().unwrap_or("unknown"));
        self.process(receiver).instrument(span).await
    }

    async fn process<S>(&mut self, receiver: &mut ReceiverSession<S>) -> AppResult<SessionSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut received = 0u64;
        let mut stop_sent = false;
        info!(expected = ?self.expected_volumes, "analysis session started");

        while let Some(volume) = receiver.recv_volume().await? {
            received += 1;
            let last = self
                .expected_volumes
                .is_some_and(|n| received >= u64::from(n));
            receiver.acknowledge(volume.index(), last).await?;

            match self.analyze(&volume) {
                Ok(entry) => {
                    debug!(vol_idx = volume.index(), fields = entry.len(), "volume analysed");
                    self.store.put(volume.index(), entry);
                }
                Err(e) => warn!(vol_idx = volume.index(), error = %e, "analysis failed"),
            }

            if last {
                stop_sent = true;
                break;
            }
        }

        info!(received, stop_sent, "analysis session finished");
        Ok(SessionSummary {
            received,
            stop_sent,
        })
    }

    fn analyze(&mut self, volume: &VolumeRecord) -> AppResult<ResultEntry> {
        let voxels = volume.to_f64_array()?;
        let mut entry = self.analyzer.analyze(volume, &voxels)?;
        if let Some(motion) = self.motion.as_mut() {
            if let Some(estimate) = motion.estimate(volume.index(), &voxels, volume.affine())? {
                entry.insert("rms_abs", estimate.rms_abs);
                entry.insert("rms_rel", estimate.rms_rel);
            }
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::frame::{read_text, write_message, write_text};
    use crate::network::protocol::{greeting, VolumeHeader};
    use crate::volume::Affine;
    use serde_json::json;

    async fn send(stream: &mut tokio::io::DuplexStream, record: &VolumeRecord) -> String {
        let header = VolumeHeader::from_record(record).unwrap().to_json().unwrap();
        write_message(stream, &[&header[..], &record.data()[..]])
            .await
            .unwrap();
        read_text(stream).await.unwrap()
    }

    fn filled(index: u32, value: i16) -> VolumeRecord {
        VolumeRecord::from_array(
            index,
            &Array3::<i16>::from_elem((2, 2, 2), value),
            Affine::identity(),
        )
    }

    #[tokio::test]
    async fn stores_results_and_stops_after_expected_count() {
        let (mut sender, receiver_end) = tokio::io::duplex(1 << 16);
        let store = Arc::new(ResultsStore::new());
        let config = AnalysisConfig {
            expected_volumes: Some(2),
            estimate_motion: false,
            reference_volume: 0,
        };

        let session_store = Arc::clone(&store);
        let analysis = tokio::spawn(async move {
            let mut receiver = ReceiverSession::new(receiver_end);
            receiver.handshake().await.unwrap();
            let mut session = AnalysisSession::new(session_store, MeanIntensity, &config);
            session.run(&mut receiver).await.unwrap()
        });

        write_text(&mut sender, &greeting("test")).await.unwrap();
        read_text(&mut sender).await.unwrap();
        assert_eq!(send(&mut sender, &filled(0, 10)).await, "received volIdx 0");
        assert_eq!(send(&mut sender, &filled(1, 20)).await, "received volIdx 1 STOP");

        let summary = analysis.await.unwrap();
        assert_eq!(summary.received, 2);
        assert!(summary.stop_sent);
        assert_eq!(store.lookup(1), json!({"foundResults": true, "meanSignal": 20.0}));
    }

    #[tokio::test]
    async fn motion_fields_appear_after_reference() {
        let (mut sender, receiver_end) = tokio::io::duplex(1 << 16);
        let store = Arc::new(ResultsStore::new());
        let config = AnalysisConfig {
            expected_volumes: None,
            estimate_motion: true,
            reference_volume: 0,
        };

        let session_store = Arc::clone(&store);
        let analysis = tokio::spawn(async move {
            let mut receiver = ReceiverSession::new(receiver_end);
            receiver.handshake().await.unwrap();
            let mut session = AnalysisSession::new(session_store, MeanIntensity, &config);
            session.run(&mut receiver).await.unwrap()
        });

        write_text(&mut sender, &greeting("test")).await.unwrap();
        read_text(&mut sender).await.unwrap();
        send(&mut sender, &filled(0, 5)).await;
        send(&mut sender, &filled(1, 5)).await;
        drop(sender);

        let summary = analysis.await.unwrap();
        assert_eq!(summary.received, 2);
        assert!(!summary.stop_sent);
        assert!(store.get(0).unwrap().get("rms_abs").is_none());
        assert_eq!(store.get(1).unwrap().get("rms_abs"), Some(&json!(0.0)));
    }
}
