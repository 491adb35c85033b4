//! Series directory → watcher → converter → transport → analysis → results.

use rtfmri_stream::acquisition::{
    run_acquisition, FileQueue, IndexPattern, RawVolumeBuilder, StopFlag, StopReason, WatcherOptions,
};
use rtfmri_stream::analysis::{AnalysisSession, MeanIntensity};
use rtfmri_stream::config::{
    AnalysisConfig, TransportConfig, SIEMENS_FILE_PATTERN, SIEMENS_VOLUME_FIELD,
};
use rtfmri_stream::network::{VolumeReceiver, VolumeTransport};
use rtfmri_stream::results::{ResultsClient, ResultsServer, ResultsStore};
use rtfmri_stream::volume::{Affine, Dtype};
use regex::Regex;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SHAPE: [usize; 3] = [4, 4, 2];

/// A Siemens-named raw int16 volume filled with `value`.
fn write_volume(dir: &Path, volume_number: u32, value: i16) {
    let name = format!("001_000001_{volume_number:06}.dcm");
    let count: usize = SHAPE.iter().product();
    let bytes: Vec<u8> = (0..count).flat_map(|_| value.to_le_bytes()).collect();
    std::fs::write(dir.join(name), bytes).unwrap();
}

#[tokio::test]
async fn series_is_streamed_analysed_and_served() {
    let series = TempDir::new().unwrap();
    for (n, value) in [(1, 100), (2, 200), (3, 300)] {
        write_volume(series.path(), n, value);
    }
    // Not a scanner file; must be ignored.
    std::fs::write(series.path().join("notes.txt"), b"ignore me").unwrap();

    // Analysis side.
    let store = Arc::new(ResultsStore::new());
    let server = ResultsServer::bind("127.0.0.1:0", Arc::clone(&store))
        .await
        .unwrap()
        .spawn()
        .unwrap();
    let receiver = VolumeReceiver::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();
    let analysis_store = Arc::clone(&store);
    let analysis = tokio::spawn(async move {
        let mut connection = receiver.accept().await.unwrap();
        let config = AnalysisConfig {
            expected_volumes: Some(3),
            estimate_motion: true,
            reference_volume: 0,
        };
        let mut session = AnalysisSession::new(analysis_store, MeanIntensity, &config);
        session.run(&mut connection).await.unwrap()
    });

    // Scanner side.
    let stop = StopFlag::new();
    let transport_config = TransportConfig {
        port,
        connect_retry: Duration::from_millis(20),
        ..TransportConfig::default()
    };
    let transport = VolumeTransport::connect(&transport_config, &stop)
        .await
        .unwrap();
    let builder = RawVolumeBuilder::new(
        IndexPattern::new(SIEMENS_VOLUME_FIELD, true).unwrap(),
        SHAPE,
        Dtype::Int16,
        Affine::from_voxel_size(3.0, 3.0, 3.0),
    );
    let options = WatcherOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_file_pattern(Regex::new(SIEMENS_FILE_PATTERN).unwrap());

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        run_acquisition(
            series.path().to_path_buf(),
            options,
            Duration::from_millis(20),
            Arc::new(FileQueue::new()),
            Arc::new(builder),
            transport,
            stop.clone(),
        ),
    )
    .await
    .expect("acquisition did not finish")
    .unwrap();

    assert_eq!(summary.worker.sent, 3);
    assert_eq!(summary.worker.dropped, 0);
    assert_eq!(summary.worker.reason, StopReason::RemoteStop);
    assert!(summary.files_enqueued >= 3);
    assert!(stop.is_stopped());

    let session = analysis.await.unwrap();
    assert_eq!(session.received, 3);
    assert!(session.stop_sent);

    let mut client = ResultsClient::connect(server.local_addr()).await.unwrap();
    let first = client.request(0).await.unwrap();
    assert_eq!(first, json!({"foundResults": true, "meanSignal": 100.0}));
    let third = client.request(2).await.unwrap();
    assert_eq!(third["meanSignal"], json!(300.0));
    assert_eq!(third["rms_abs"], json!(0.0));
    assert_eq!(client.request(3).await.unwrap(), json!({"foundResults": false}));

    server.kill().await;
}

#[tokio::test]
async fn unconvertible_files_are_skipped() {
    let series = TempDir::new().unwrap();
    write_volume(series.path(), 1, 7);
    // Right name, wrong size.
    std::fs::write(series.path().join("001_000001_000002.dcm"), [0u8; 3]).unwrap();
    write_volume(series.path(), 3, 9);

    let receiver = VolumeReceiver::bind("127.0.0.1:0").await.unwrap();
    let port = receiver.local_addr().unwrap().port();
    let store = Arc::new(ResultsStore::new());
    let analysis_store = Arc::clone(&store);
    let analysis = tokio::spawn(async move {
        let mut connection = receiver.accept().await.unwrap();
        let config = AnalysisConfig {
            expected_volumes: Some(2),
            estimate_motion: false,
            reference_volume: 0,
        };
        AnalysisSession::new(analysis_store, MeanIntensity, &config)
            .run(&mut connection)
            .await
            .unwrap()
    });

    let stop = StopFlag::new();
    let transport_config = TransportConfig {
        port,
        ..TransportConfig::default()
    };
    let transport = VolumeTransport::connect(&transport_config, &stop)
        .await
        .unwrap();
    let builder = RawVolumeBuilder::new(
        IndexPattern::new(SIEMENS_VOLUME_FIELD, true).unwrap(),
        SHAPE,
        Dtype::Int16,
        Affine::identity(),
    );
    let options = WatcherOptions::default().with_poll_interval(Duration::from_millis(20));

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        run_acquisition(
            series.path().to_path_buf(),
            options,
            Duration::from_millis(20),
            Arc::new(FileQueue::new()),
            Arc::new(builder),
            transport,
            stop,
        ),
    )
    .await
    .expect("acquisition did not finish")
    .unwrap();

    assert_eq!(summary.worker.sent, 2);
    assert_eq!(summary.worker.dropped, 1);
    assert_eq!(analysis.await.unwrap().received, 2);
    assert_eq!(store.indices(), vec![0, 2]);
}
