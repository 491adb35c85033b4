//! CLI entry point for rtfmri-stream
//!
//! # Usage
//!
//! Analysis host, receive volumes and serve results:
//! ```bash
//! rtfmri-stream --config rtfmri.toml analyze --expected-volumes 120
//! ```
//!
//! Scanner console, stream a series as it is written:
//! ```bash
//! rtfmri-stream --config rtfmri.toml scanner --series-dir /data/s012
//! ```
//!
//! Ask for the results of one volume:
//! ```bash
//! rtfmri-stream query 17
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rtfmri_stream::acquisition::{
    run_acquisition, series, FileQueue, RawVolumeBuilder, StopFlag, WatcherOptions,
};
use rtfmri_stream::analysis::{AnalysisSession, MeanIntensity};
use rtfmri_stream::config::Config;
use rtfmri_stream::logging;
use rtfmri_stream::network::{VolumeReceiver, VolumeTransport};
use rtfmri_stream::results::{ResultsClient, ResultsServer, ResultsStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rtfmri-stream")]
#[command(about = "Real-time scanner volume streaming and results serving", long_about = None)]
struct Cli {
    /// Configuration file (TOML); environment variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a series directory and stream its volumes
    Scanner {
        /// Series directory; overrides the configuration
        #[arg(long)]
        series_dir: Option<PathBuf>,
    },

    /// Receive volumes, analyse them and serve results
    Analyze {
        /// Number of volumes in the series; overrides the configuration
        #[arg(long)]
        expected_volumes: Option<u32>,
    },

    /// Query the results server for one volume
    Query {
        /// Zero-based volume index
        index: u32,
    },

    /// Print the effective configuration as TOML
    Config,

    /// List series directories under the scanner base directory
    Series {
        /// Base directory; overrides the configuration
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_env().context("loading configuration from environment")?,
    };
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Scanner { series_dir } => run_scanner(config, series_dir).await,
        Commands::Analyze { expected_volumes } => run_analysis(config, expected_volumes).await,
        Commands::Query { index } => run_query(&config, index).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Series { base_dir } => list_series(&config, base_dir).await,
    }
}

/// Raises `stop` on Ctrl-C.
fn stop_on_ctrl_c(stop: StopFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            stop.stop();
        }
    });
}

async fn run_scanner(config: Config, series_dir: Option<PathBuf>) -> Result<()> {
    let stop = StopFlag::new();
    stop_on_ctrl_c(stop.clone());

    let builder = Arc::new(RawVolumeBuilder::from_config(&config.scanner)?);
    let options = WatcherOptions::from_config(&config.scanner)?;

    // Reach the analysis endpoint before the scan starts writing files.
    let transport = VolumeTransport::connect(&config.transport, &stop)
        .await
        .with_context(|| format!("connecting to {}", config.transport.address()))?;

    let series_dir = match series_dir.or_else(|| config.scanner.series_dir.clone()) {
        Some(dir) => dir,
        None => {
            let Some(base) = config.scanner.base_dir.as_deref() else {
                bail!("set scanner.series_dir or scanner.base_dir, or pass --series-dir");
            };
            match series::wait_for_series_dir(
                base,
                SystemTime::now(),
                config.scanner.poll_interval,
                &stop,
            )
            .await?
            {
                Some(dir) => dir,
                None => return Ok(()),
            }
        }
    };

    let queue = Arc::new(FileQueue::new());
    let result = run_acquisition(
        series_dir,
        options,
        config.scanner.queue_timeout,
        Arc::clone(&queue),
        builder,
        transport,
        stop,
    )
    .await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            for path in queue.pending_paths() {
                warn!(path = %path.display(), "volume not delivered");
            }
            return Err(e.into());
        }
    };
    println!(
        "Sent {} volumes ({} files seen, {} dropped)",
        summary.worker.sent, summary.files_enqueued, summary.worker.dropped
    );
    Ok(())
}

async fn run_analysis(mut config: Config, expected_volumes: Option<u32>) -> Result<()> {
    if expected_volumes.is_some() {
        config.analysis.expected_volumes = expected_volumes;
    }

    let store = Arc::new(ResultsStore::new());
    let server = ResultsServer::bind(config.results.address(), Arc::clone(&store))
        .await
        .with_context(|| format!("binding results server on {}", config.results.address()))?
        .spawn()?;
    info!(addr = %server.local_addr(), "serving results");

    let receiver = VolumeReceiver::bind(config.transport.address())
        .await
        .with_context(|| format!("binding volume receiver on {}", config.transport.address()))?;
    info!(addr = %receiver.local_addr()?, "waiting for scanner connection");

    let outcome = tokio::select! {
        session = async {
            let mut connection = receiver.accept().await?;
            let mut analysis = AnalysisSession::new(Arc::clone(&store), MeanIntensity, &config.analysis);
            analysis.run(&mut connection).await
        } => Some(session),
        _ = tokio::signal::ctrl_c() => None,
    };

    match &outcome {
        Some(Ok(summary)) => println!("Received {} volumes", summary.received),
        Some(Err(e)) => warn!(error = %e, "analysis session ended with an error"),
        None => info!("interrupted before the session finished"),
    }

    store
        .snapshot(&config.results.snapshot_path())
        .context("writing results snapshot")?;
    println!("Results written to {}", config.results.snapshot_path().display());

    if outcome.is_some() {
        println!("Still serving results; press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    }
    server.kill().await;
    Ok(())
}

async fn run_query(config: &Config, index: u32) -> Result<()> {
    let address = config.results.address();
    let mut client = ResultsClient::connect(address.as_str())
        .await
        .with_context(|| format!("connecting to results server at {address}"))?;
    let response = client.request(index).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn list_series(config: &Config, base_dir: Option<PathBuf>) -> Result<()> {
    let Some(base) = base_dir.or_else(|| config.scanner.base_dir.clone()) else {
        bail!("set scanner.base_dir or pass --base-dir");
    };
    let dirs = series::list_series_dirs(&base)
        .await
        .with_context(|| format!("listing {}", base.display()))?;

    println!("Base dir: {}", base.display());
    if dirs.is_empty() {
        println!("No series directories");
        return Ok(());
    }
    let now = SystemTime::now();
    for dir in &dirs {
        println!("  {}", dir.describe(now));
    }
    Ok(())
}
