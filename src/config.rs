//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables prefixed with `RTFMRI_`, using `__` between
//!    nesting levels (e.g. `RTFMRI_TRANSPORT__PORT=6000`)
//!
//! Every field has a default, so an empty file (or no file) yields a usable
//! configuration for a local loopback session.
//!
//! # Example
//! ```no_run
//! use rtfmri_stream::config::Config;
//!
//! let config = Config::load_from("rtfmri.toml")?;
//! config.validate()?;
//! println!("Results served on port {}", config.results.port);
//! # Ok::<(), rtfmri_stream::error::PipelineError>(())
//! ```

use crate::error::{AppResult, PipelineError};
use crate::volume::{Affine, Dtype};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Siemens mosaic file naming: `<session>_<series>_<volume>.dcm`, numbered from 1.
pub const SIEMENS_FILE_PATTERN: &str = r"^\d{3}_\d{6}_\d{6}\.dcm$";

/// Captures the volume number of a Siemens mosaic file name (the last field).
pub const SIEMENS_VOLUME_FIELD: &str = r"^\d{3}_\d{6}_(\d{6})";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition-side directory watching and conversion
    pub scanner: ScannerConfig,
    /// Volume transport endpoint
    pub transport: TransportConfig,
    /// Results store and query server
    pub results: ResultsConfig,
    /// Analysis-side session settings
    pub analysis: AnalysisConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rtfmri-stream".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Acquisition-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Directory under which the scanner creates one directory per series
    pub base_dir: Option<PathBuf>,
    /// Series directory to watch; when unset, wait for a new one in `base_dir`
    pub series_dir: Option<PathBuf>,
    /// Interval between directory listings
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Minimum file age before a file is handed off (0 = immediately)
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Only file names matching this pattern are queued
    pub file_pattern: Option<String>,
    /// Upper bound on remembered file names (unbounded when unset)
    pub max_tracked_files: Option<usize>,
    /// How long the converter blocks on an empty queue
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// How the volume index is read from a file name
    pub index: IndexConfig,
    /// Geometry of raw voxel dumps
    pub raw: RawVolumeConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            series_dir: None,
            poll_interval: Duration::from_millis(500),
            settle_time: Duration::ZERO,
            file_pattern: Some(SIEMENS_FILE_PATTERN.to_string()),
            max_tracked_files: None,
            queue_timeout: Duration::from_millis(200),
            index: IndexConfig::default(),
            raw: RawVolumeConfig::default(),
        }
    }
}

/// Volume index extraction from file names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Regex whose first capture group holds the volume number
    pub pattern: String,
    /// Whether the captured number counts from one
    pub one_based: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            pattern: SIEMENS_VOLUME_FIELD.to_string(),
            one_based: true,
        }
    }
}

/// Raw voxel dump geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawVolumeConfig {
    /// Array shape (x, y, z)
    pub shape: [usize; 3],
    /// Voxel dtype
    pub dtype: Dtype,
    /// Row-major voxel-to-RAS+ affine (16 values, identity when unset)
    pub affine: Option<Vec<f64>>,
    /// Bytes to skip at the start of each file
    pub header_bytes: usize,
}

impl Default for RawVolumeConfig {
    fn default() -> Self {
        Self {
            shape: [64, 64, 18],
            dtype: Dtype::Int16,
            affine: None,
            header_bytes: 0,
        }
    }
}

impl RawVolumeConfig {
    /// Configured affine, identity when unset.
    pub fn affine(&self) -> AppResult<Affine> {
        match &self.affine {
            Some(values) => Affine::from_flat(values),
            None => Ok(Affine::identity()),
        }
    }
}

/// Volume transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Analysis endpoint host
    pub host: String,
    /// Analysis endpoint port
    pub port: u16,
    /// Name used in the handshake greeting
    pub sender_name: String,
    /// Delay between connection attempts while the endpoint is not up
    #[serde(with = "humantime_serde")]
    pub connect_retry: Duration,
    /// Bound on the handshake; unset waits forever
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            sender_name: "rtfmri_scanner".to_string(),
            connect_retry: Duration::from_secs(1),
            handshake_timeout: None,
        }
    }
}

impl TransportConfig {
    /// `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Results serving configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Bind host for the results server
    pub host: String,
    /// Bind port for the results server
    pub port: u16,
    /// Session output directory
    pub output_dir: PathBuf,
    /// Snapshot file name inside `output_dir`
    pub snapshot_name: String,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            output_dir: PathBuf::from("output"),
            snapshot_name: "results.json".to_string(),
        }
    }
}

impl ResultsConfig {
    /// `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full snapshot path.
    pub fn snapshot_path(&self) -> PathBuf {
        self.output_dir.join(&self.snapshot_name)
    }
}

/// Analysis-side session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Number of volumes in the series; the last one is acknowledged with STOP
    pub expected_volumes: Option<u32>,
    /// Whether to estimate head motion for each volume
    pub estimate_motion: bool,
    /// Index of the motion reference volume
    pub reference_volume: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            expected_volumes: None,
            estimate_motion: true,
            reference_volume: 4,
        }
    }
}

impl Config {
    /// Load configuration from a specific file path plus environment
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RTFMRI_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load configuration from defaults plus environment only
    pub fn load_env() -> AppResult<Self> {
        let config = Figment::new()
            .merge(Env::prefixed("RTFMRI_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Renders the configuration as TOML, in the format `load_from` reads.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration(format!("cannot render configuration: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PipelineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.scanner.poll_interval.is_zero() {
            return Err(PipelineError::Configuration(
                "scanner.poll_interval must be greater than zero".to_string(),
            ));
        }

        if let Some(pattern) = &self.scanner.file_pattern {
            Regex::new(pattern)?;
        }

        let index = Regex::new(&self.scanner.index.pattern)?;
        if index.captures_len() < 2 {
            return Err(PipelineError::Configuration(format!(
                "scanner.index.pattern '{}' has no capture group",
                self.scanner.index.pattern
            )));
        }

        if self.scanner.raw.shape.contains(&0) {
            return Err(PipelineError::Configuration(format!(
                "scanner.raw.shape {:?} has an empty axis",
                self.scanner.raw.shape
            )));
        }
        self.scanner
            .raw
            .affine()
            .map_err(|e| PipelineError::Configuration(format!("scanner.raw.affine: {e}")))?;

        let mut ports = HashSet::new();
        for (name, port) in [
            ("transport.port", self.transport.port),
            ("results.port", self.results.port),
        ] {
            if port == 0 {
                return Err(PipelineError::Configuration(format!("{name} must not be 0")));
            }
            ports.insert(port);
        }
        if ports.len() < 2 && self.transport.host == self.results.host {
            return Err(PipelineError::Configuration(format!(
                "transport and results share {}:{}",
                self.results.host, self.results.port
            )));
        }

        if self.results.snapshot_name.is_empty() {
            return Err(PipelineError::Configuration(
                "results.snapshot_name must not be empty".to_string(),
            ));
        }

        if self.analysis.expected_volumes == Some(0) {
            return Err(PipelineError::Configuration(
                "analysis.expected_volumes must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
