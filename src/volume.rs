//! Volume records and their voxel encoding.
//!
//! A [`VolumeRecord`] is one timepoint of a scan: a 3D voxel array of a fixed
//! dtype plus the affine that maps voxel coordinates to RAS+ millimetres.
//! Voxels are held as little-endian bytes in C (row-major) order over
//! `shape`, which is exactly what travels as the body part of a volume
//! message. Typed access goes through [`ndarray::Array3`].

use crate::error::{AppResult, PipelineError};
use bytes::Bytes;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Zero-based position of a volume within one scanning session.
pub type VolumeIndex = u32;

/// Voxel element type. Wire names follow numpy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// `uint8`
    Uint8,
    /// `int16`
    Int16,
    /// `uint16`
    Uint16,
    /// `int32`
    Int32,
    /// `float32`
    Float32,
    /// `float64`
    Float64,
}

impl Dtype {
    /// Size of one voxel in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::Uint8 => 1,
            Dtype::Int16 | Dtype::Uint16 => 2,
            Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    /// Bytes needed for a volume of `shape`, or a protocol error when the
    /// shape does not fit in memory.
    pub fn buffer_len(self, shape: [usize; 3]) -> AppResult<usize> {
        shape
            .iter()
            .try_fold(self.size(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                PipelineError::Protocol(format!("shape {shape:?} of {self} overflows"))
            })
    }

    /// Tag used in the volume header.
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::Uint8 => "uint8",
            Dtype::Int16 => "int16",
            Dtype::Uint16 => "uint16",
            Dtype::Int32 => "int32",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }

    fn read_f64(self, chunk: &[u8]) -> f64 {
        match self {
            Dtype::Uint8 => f64::from(chunk[0]),
            Dtype::Int16 => f64::from(i16::from_le_bytes([chunk[0], chunk[1]])),
            Dtype::Uint16 => f64::from(u16::from_le_bytes([chunk[0], chunk[1]])),
            Dtype::Int32 => {
                f64::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            }
            Dtype::Float32 => {
                f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            }
            Dtype::Float64 => f64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(Dtype::Uint8),
            "int16" => Ok(Dtype::Int16),
            "uint16" => Ok(Dtype::Uint16),
            "int32" => Ok(Dtype::Int32),
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            other => Err(PipelineError::UnsupportedDtype(other.to_string())),
        }
    }
}

/// Element types that can live in a voxel buffer.
pub trait Voxel: Copy + Default {
    /// Dtype tag for this element type.
    const DTYPE: Dtype;

    /// Appends the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `DTYPE.size()` bytes.
    fn read_le(chunk: &[u8]) -> Self;
}

macro_rules! impl_voxel {
    ($ty:ty, $dtype:expr, $n:literal) => {
        impl Voxel for $ty {
            const DTYPE: Dtype = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(chunk: &[u8]) -> Self {
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&chunk[..$n]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_voxel!(u8, Dtype::Uint8, 1);
impl_voxel!(i16, Dtype::Int16, 2);
impl_voxel!(u16, Dtype::Uint16, 2);
impl_voxel!(i32, Dtype::Int32, 4);
impl_voxel!(f32, Dtype::Float32, 4);
impl_voxel!(f64, Dtype::Float64, 8);

/// 4x4 voxel-to-RAS+ transform, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// The identity transform.
    pub fn identity() -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Affine(m)
    }

    /// Scaling transform with the given voxel sizes in millimetres.
    pub fn from_voxel_size(x: f64, y: f64, z: f64) -> Self {
        let mut a = Self::identity();
        a.0[0][0] = x;
        a.0[1][1] = y;
        a.0[2][2] = z;
        a
    }

    /// Builds an affine from 16 row-major values.
    pub fn from_flat(values: &[f64]) -> AppResult<Self> {
        if values.len() != 16 {
            return Err(PipelineError::Protocol(format!(
                "affine needs 16 values, got {}",
                values.len()
            )));
        }
        let mut m = [[0.0; 4]; 4];
        for (i, v) in values.iter().enumerate() {
            m[i / 4][i % 4] = *v;
        }
        Ok(Affine(m))
    }

    /// Row-major flattening.
    pub fn flatten(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.0[i / 4][i % 4];
        }
        out
    }

    /// Maps a voxel coordinate to RAS+ millimetres.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        let mut out = [0.0; 3];
        for (r, slot) in out.iter_mut().enumerate() {
            *slot = m[r][0] * p[0] + m[r][1] * p[1] + m[r][2] * p[2] + m[r][3];
        }
        out
    }
}

/// One reconstructed volume, immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    index: VolumeIndex,
    dtype: Dtype,
    shape: [usize; 3],
    affine: Affine,
    data: Bytes,
}

impl VolumeRecord {
    /// Wraps an already-encoded voxel buffer, checking its length.
    pub fn from_bytes(
        index: VolumeIndex,
        dtype: Dtype,
        shape: [usize; 3],
        affine: Affine,
        data: Bytes,
    ) -> AppResult<Self> {
        let expected = dtype.buffer_len(shape)?;
        if data.len() != expected {
            return Err(PipelineError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            index,
            dtype,
            shape,
            affine,
            data,
        })
    }

    /// Encodes a typed array. Iteration is in logical (row-major) order, so
    /// non-contiguous views are laid out the same way as contiguous ones.
    pub fn from_array<T: Voxel>(index: VolumeIndex, voxels: &Array3<T>, affine: Affine) -> Self {
        let (x, y, z) = voxels.dim();
        let mut buf = Vec::with_capacity(voxels.len() * T::DTYPE.size());
        for v in voxels.iter() {
            v.write_le(&mut buf);
        }
        Self {
            index,
            dtype: T::DTYPE,
            shape: [x, y, z],
            affine,
            data: Bytes::from(buf),
        }
    }

    /// Volume index within the session.
    pub fn index(&self) -> VolumeIndex {
        self.index
    }

    /// Voxel dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Array shape.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Voxel-to-RAS+ transform.
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// Raw voxel bytes, cheap to clone.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decodes the buffer as `T`. Fails if `T` does not match the dtype.
    pub fn to_array<T: Voxel>(&self) -> AppResult<Array3<T>> {
        if T::DTYPE != self.dtype {
            return Err(PipelineError::UnsupportedDtype(format!(
                "requested {} from a {} volume",
                T::DTYPE,
                self.dtype
            )));
        }
        let values: Vec<T> = self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_le)
            .collect();
        self.shape_vec(values)
    }

    /// Decodes the buffer into `f64` regardless of dtype.
    pub fn to_f64_array(&self) -> AppResult<Array3<f64>> {
        let dtype = self.dtype;
        let values: Vec<f64> = self
            .data
            .chunks_exact(dtype.size())
            .map(|c| dtype.read_f64(c))
            .collect();
        self.shape_vec(values)
    }

    fn shape_vec<T>(&self, values: Vec<T>) -> AppResult<Array3<T>> {
        let [x, y, z] = self.shape;
        Array3::from_shape_vec((x, y, z), values)
            .map_err(|e| PipelineError::Protocol(format!("voxel shape mismatch: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [
            Dtype::Uint8,
            Dtype::Int16,
            Dtype::Uint16,
            Dtype::Int32,
            Dtype::Float32,
            Dtype::Float64,
        ] {
            assert_eq!(dtype.as_str().parse::<Dtype>().unwrap(), dtype);
        }
        assert!("complex64".parse::<Dtype>().is_err());
    }

    #[test]
    fn from_array_keeps_row_major_order() {
        let arr = Array3::from_shape_fn((2, 3, 4), |(x, y, z)| (x * 100 + y * 10 + z) as i16);
        let vol = VolumeRecord::from_array(7, &arr, Affine::identity());

        assert_eq!(vol.shape(), [2, 3, 4]);
        assert_eq!(vol.data().len(), 2 * 3 * 4 * 2);
        // Second voxel in memory is [0, 0, 1].
        assert_eq!(i16::from_le_bytes([vol.data()[2], vol.data()[3]]), 1);
        assert_eq!(vol.to_array::<i16>().unwrap(), arr);
    }

    #[test]
    fn wrong_buffer_length_is_rejected() {
        let err = VolumeRecord::from_bytes(
            0,
            Dtype::Uint16,
            [2, 2, 2],
            Affine::identity(),
            Bytes::from_static(&[0u8; 15]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BufferSize {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn buffer_len_rejects_overflowing_shapes() {
        assert_eq!(Dtype::Int16.buffer_len([2, 3, 4]).unwrap(), 48);
        assert!(matches!(
            Dtype::Uint8.buffer_len([1 << 32, 1 << 32, 1]),
            Err(PipelineError::Protocol(_))
        ));
        assert!(Dtype::Float64.buffer_len([usize::MAX / 4, 1, 1]).is_err());
    }

    #[test]
    fn typed_access_checks_dtype() {
        let arr = Array3::<f32>::zeros((2, 2, 2));
        let vol = VolumeRecord::from_array(0, &arr, Affine::identity());
        assert!(vol.to_array::<i16>().is_err());
        assert_eq!(vol.to_f64_array().unwrap().sum(), 0.0);
    }

    #[test]
    fn affine_flatten_is_row_major() {
        let mut a = Affine::from_voxel_size(2.0, 2.0, 3.0);
        a.0[0][3] = -90.0;
        let flat = a.flatten();
        assert_eq!(flat[0], 2.0);
        assert_eq!(flat[3], -90.0);
        assert_eq!(Affine::from_flat(&flat).unwrap(), a);
        assert!(Affine::from_flat(&flat[..12]).is_err());
        assert_eq!(a.apply([1.0, 0.0, 0.0]), [-88.0, 0.0, 0.0]);
    }
}
