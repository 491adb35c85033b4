//! Volume transport messages.
//!
//! One volume travels as a two-part message: a JSON [`VolumeHeader`] and the
//! raw voxel bytes. Every volume is answered with a text acknowledgement; an
//! acknowledgement containing [`STOP_MARKER`] ends the session.

use crate::error::{AppResult, PipelineError};
use crate::volume::{Affine, Dtype, VolumeIndex, VolumeRecord};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Substring of an acknowledgement that ends the session.
pub const STOP_MARKER: &str = "STOP";

/// Prefix of every handshake greeting.
pub const GREETING_PREFIX: &str = "hello from ";

/// Handshake greeting for `sender`.
pub fn greeting(sender: &str) -> String {
    format!("{GREETING_PREFIX}{sender} ")
}

/// Whether an acknowledgement asks the sender to stop.
pub fn is_stop(ack: &str) -> bool {
    ack.contains(STOP_MARKER)
}

/// Acknowledgement text for volume `index`; `last` appends the stop marker.
pub fn acknowledgement(index: VolumeIndex, last: bool) -> String {
    if last {
        format!("received volIdx {index} {STOP_MARKER}")
    } else {
        format!("received volIdx {index}")
    }
}

/// Header part of a volume message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeHeader {
    /// Volume index
    #[serde(rename = "volIdx")]
    pub vol_idx: VolumeIndex,
    /// Numpy dtype name
    pub dtype: String,
    /// Array shape
    pub shape: [usize; 3],
    /// Affine; see [`AffineRepr`]
    pub affine: AffineRepr,
}

/// Ways an affine may appear in a header.
///
/// Senders write [`AffineRepr::Encoded`]: a JSON string holding the 16
/// row-major values. Receivers also accept a plain array, flat or nested 4x4,
/// inside or outside the string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AffineRepr {
    /// JSON text of a flat or nested matrix
    Encoded(String),
    /// Flat or nested matrix
    Values(AffineValues),
}

/// An affine as a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AffineValues {
    /// 16 row-major values
    Flat(Vec<f64>),
    /// 4 rows of 4 values
    Nested(Vec<Vec<f64>>),
}

impl AffineValues {
    fn to_affine(&self) -> AppResult<Affine> {
        match self {
            AffineValues::Flat(values) => Affine::from_flat(values),
            AffineValues::Nested(rows) => {
                if rows.len() != 4 || rows.iter().any(|r| r.len() != 4) {
                    return Err(PipelineError::Protocol(
                        "nested affine must be 4 rows of 4 values".to_string(),
                    ));
                }
                let flat: Vec<f64> = rows.iter().flatten().copied().collect();
                Affine::from_flat(&flat)
            }
        }
    }
}

impl AffineRepr {
    /// Encoded form of `affine`.
    pub fn encode(affine: &Affine) -> AppResult<Self> {
        Ok(AffineRepr::Encoded(serde_json::to_string(&affine.flatten())?))
    }

    /// Decodes any accepted form.
    pub fn to_affine(&self) -> AppResult<Affine> {
        match self {
            AffineRepr::Encoded(text) => {
                let values: AffineValues = serde_json::from_str(text)?;
                values.to_affine()
            }
            AffineRepr::Values(values) => values.to_affine(),
        }
    }
}

impl VolumeHeader {
    /// Header describing `record`.
    pub fn from_record(record: &VolumeRecord) -> AppResult<Self> {
        Ok(Self {
            vol_idx: record.index(),
            dtype: record.dtype().as_str().to_string(),
            shape: record.shape(),
            affine: AffineRepr::encode(record.affine())?,
        })
    }

    /// Parses the header part.
    pub fn from_json(bytes: &[u8]) -> AppResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the header part.
    pub fn to_json(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Combines the header with the body part into a record.
    pub fn into_record(self, body: Bytes) -> AppResult<VolumeRecord> {
        let dtype: Dtype = self.dtype.parse()?;
        let affine = self.affine.to_affine()?;
        VolumeRecord::from_bytes(self.vol_idx, dtype, self.shape, affine, body)
    }
}
