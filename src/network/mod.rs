//! Network layer.
//!
//! - [`frame`]: length-prefixed multi-part framing shared by both ends.
//! - [`protocol`]: volume header, greeting and acknowledgement formats.
//! - [`transport`]: acquisition-side session that sends volumes.
//! - [`receiver`]: analysis-side endpoint that accepts them.
//!
//! The results query protocol lives in [`crate::results`].

pub mod frame;
pub mod protocol;
pub mod receiver;
pub mod transport;

pub use protocol::{VolumeHeader, STOP_MARKER};
pub use receiver::{ReceiverSession, VolumeReceiver};
pub use transport::{SendOutcome, TransportState, VolumeTransport};
