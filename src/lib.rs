//! # rtfmri-stream
//!
//! Real-time delivery of scanner volumes to an analysis process, and of
//! per-volume analysis results back to whoever asks for them.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: scanner side. Watches the series directory, queues new
//!   files, converts them into volumes and sends them over the transport.
//! - **`network`**: framing, the volume wire format, the sending transport and
//!   the receiving endpoint.
//! - **`analysis`**: analysis side. Receives volumes, acknowledges them, runs
//!   per-volume analysis and motion estimation.
//! - **`results`**: the concurrent results store, its JSON snapshot, and the
//!   query server/client.
//! - **`volume`**: `VolumeRecord`, dtypes and the voxel-to-world affine.
//! - **`config`**: figment-based configuration (TOML + `RTFMRI_` environment).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the crate-wide `PipelineError`.

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod results;
pub mod volume;

pub use error::{AppResult, PipelineError};
