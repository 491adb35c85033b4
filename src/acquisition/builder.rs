//! Boundary between raw scanner files and [`VolumeRecord`]s.
//!
//! Reconstruction is vendor specific, so the converter only sees the
//! [`VolumeBuilder`] trait. [`RawVolumeBuilder`] handles the simplest format:
//! a fixed-size header followed by little-endian voxels of a known geometry.

use crate::config::ScannerConfig;
use crate::error::{AppResult, PipelineError};
use crate::volume::{Affine, Dtype, VolumeIndex, VolumeRecord};
use bytes::Bytes;
use regex::Regex;
use std::path::Path;

/// Turns one raw file into a volume.
///
/// Called from a blocking thread; implementations may do synchronous I/O.
/// An error drops the file and the session carries on.
pub trait VolumeBuilder: Send + Sync + 'static {
    /// Builds the volume stored in `path`.
    fn build(&self, path: &Path) -> AppResult<VolumeRecord>;
}

impl<F> VolumeBuilder for F
where
    F: Fn(&Path) -> AppResult<VolumeRecord> + Send + Sync + 'static,
{
    fn build(&self, path: &Path) -> AppResult<VolumeRecord> {
        self(path)
    }
}

/// Extracts the volume index from a file name.
#[derive(Debug, Clone)]
pub struct IndexPattern {
    pattern: Regex,
    one_based: bool,
}

impl IndexPattern {
    /// `pattern` must have a capture group holding the number.
    pub fn new(pattern: &str, one_based: bool) -> AppResult<Self> {
        let pattern = Regex::new(pattern)?;
        if pattern.captures_len() < 2 {
            return Err(PipelineError::Configuration(format!(
                "index pattern '{pattern}' has no capture group"
            )));
        }
        Ok(Self { pattern, one_based })
    }

    /// Zero-based volume index for `path`.
    pub fn index_for(&self, path: &Path) -> AppResult<VolumeIndex> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::conversion(path, "file name is not valid UTF-8"))?;
        let digits = self
            .pattern
            .captures(name)
            .and_then(|c| c.get(1))
            .ok_or_else(|| PipelineError::conversion(path, "no volume number in file name"))?;
        let number: VolumeIndex = digits
            .as_str()
            .parse()
            .map_err(|e| PipelineError::conversion(path, format!("bad volume number: {e}")))?;
        if !self.one_based {
            return Ok(number);
        }
        number
            .checked_sub(1)
            .ok_or_else(|| PipelineError::conversion(path, "volume numbers start at 1"))
    }
}

/// Reads headerless (or fixed-header) voxel dumps of a known geometry.
#[derive(Debug, Clone)]
pub struct RawVolumeBuilder {
    index: IndexPattern,
    shape: [usize; 3],
    dtype: Dtype,
    affine: Affine,
    header_bytes: usize,
}

impl RawVolumeBuilder {
    /// A builder for files holding `shape` voxels of `dtype`.
    pub fn new(index: IndexPattern, shape: [usize; 3], dtype: Dtype, affine: Affine) -> Self {
        Self {
            index,
            shape,
            dtype,
            affine,
            header_bytes: 0,
        }
    }

    /// Skip `n` bytes at the start of every file.
    pub fn with_header_bytes(mut self, n: usize) -> Self {
        self.header_bytes = n;
        self
    }

    /// Builds from the scanner configuration.
    pub fn from_config(config: &ScannerConfig) -> AppResult<Self> {
        let index = IndexPattern::new(&config.index.pattern, config.index.one_based)?;
        Ok(Self::new(index, config.raw.shape, config.raw.dtype, config.raw.affine()?)
            .with_header_bytes(config.raw.header_bytes))
    }

    fn expected_len(&self) -> AppResult<usize> {
        self.dtype.buffer_len(self.shape)
    }
}

impl VolumeBuilder for RawVolumeBuilder {
    fn build(&self, path: &Path) -> AppResult<VolumeRecord> {
        let index = self.index.index_for(path)?;
        let raw = std::fs::read(path)
            .map_err(|e| PipelineError::conversion(path, format!("read failed: {e}")))?;

        let expected = self
            .expected_len()
            .ok()
            .and_then(|len| len.checked_add(self.header_bytes))
            .ok_or_else(|| PipelineError::conversion(path, "configured shape overflows"))?;
        if raw.len() != expected {
            return Err(PipelineError::conversion(
                path,
                format!("file holds {} bytes, expected {expected}", raw.len()),
            ));
        }

        let data = Bytes::from(raw).slice(self.header_bytes..);
        VolumeRecord::from_bytes(index, self.dtype, self.shape, self.affine, data)
    }
}
