//! Head motion estimates.
//!
//! Each volume after the reference is registered to the reference volume.
//! Two RMS displacements are reported, both in millimetres over a sphere of
//! radius [`HEAD_RADIUS_MM`]:
//!
//! - `rms_abs`: current transform against the reference (identity)
//! - `rms_rel`: current transform against the previous volume's transform
//!
//! The RMS between rigid transforms `T1` and `T2` follows Jenkinson (1999):
//! with `M = T1 · T2⁻¹ - I`, `A` its upper-left 3x3 block and `t` its
//! translation column,
//!
//! ```text
//! rms = sqrt(R² / 5 · trace(Aᵀ A) + tᵀ t)
//! ```
//!
//! The registration algorithm is pluggable through [`Registration`].

use crate::error::AppResult;
use crate::volume::{Affine, VolumeIndex};
use ndarray::Array3;
use tracing::debug;

/// Approximate distance from the centre of the head to the cortex, in mm.
pub const HEAD_RADIUS_MM: f64 = 50.0;

/// 4x4 rigid-body transform in world (RAS+ mm) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform(pub [[f64; 4]; 4]);

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// No motion.
    pub fn identity() -> Self {
        Self(Affine::identity().0)
    }

    /// Pure translation.
    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        let mut m = Self::identity().0;
        m[0][3] = x;
        m[1][3] = y;
        m[2][3] = z;
        Self(m)
    }

    /// Rotation about the z axis by `radians`.
    pub fn rotation_z(radians: f64) -> Self {
        let (s, c) = radians.sin_cos();
        let mut m = Self::identity().0;
        m[0][0] = c;
        m[0][1] = -s;
        m[1][0] = s;
        m[1][1] = c;
        Self(m)
    }

    /// `self · other`.
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        let (a, b) = (&self.0, &other.0);
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| a[i][k] * b[k][j]).sum();
            }
        }
        RigidTransform(m)
    }

    /// Inverse, using `Rᵀ` and `-Rᵀ t`. Only valid for rigid transforms.
    pub fn inverse(&self) -> RigidTransform {
        let m = &self.0;
        let mut inv = Self::identity().0;
        for i in 0..3 {
            for j in 0..3 {
                inv[i][j] = m[j][i];
            }
        }
        for i in 0..3 {
            inv[i][3] = -(0..3).map(|k| m[k][i] * m[k][3]).sum::<f64>();
        }
        RigidTransform(inv)
    }
}

/// RMS displacement between two transforms over a sphere of `radius` mm.
pub fn compute_rms(t1: &RigidTransform, t2: &RigidTransform, radius: f64) -> f64 {
    let mut diff = t1.compose(&t2.inverse()).0;
    for (i, row) in diff.iter_mut().enumerate() {
        row[i] -= 1.0;
    }

    // trace(AᵀA) is the sum of squares of A.
    let trace: f64 = diff[..3].iter().flat_map(|row| &row[..3]).map(|v| v * v).sum();
    let t2_norm: f64 = diff[..3].iter().map(|row| row[3] * row[3]).sum();
    (radius * radius / 5.0 * trace + t2_norm).sqrt()
}

/// Estimates the transform that maps `moving` onto `reference`.
pub trait Registration: Send {
    /// `initial` is the previous volume's estimate.
    fn register(
        &self,
        moving: &Array3<f64>,
        reference: &Array3<f64>,
        affine: &Affine,
        initial: &RigidTransform,
    ) -> AppResult<RigidTransform>;
}

/// Translation-only registration by intensity-weighted centre of mass.
///
/// Cheap and robust enough for real-time monitoring of gross head motion;
/// rotations are not estimated.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidRegistration;

impl CentroidRegistration {
    fn centroid(volume: &Array3<f64>, affine: &Affine) -> Option<[f64; 3]> {
        let mut sum = [0.0; 3];
        let mut weight = 0.0;
        for ((x, y, z), &v) in volume.indexed_iter() {
            if v <= 0.0 || !v.is_finite() {
                continue;
            }
            sum[0] += v * x as f64;
            sum[1] += v * y as f64;
            sum[2] += v * z as f64;
            weight += v;
        }
        if weight == 0.0 {
            return None;
        }
        Some(affine.apply([sum[0] / weight, sum[1] / weight, sum[2] / weight]))
    }
}

impl Registration for CentroidRegistration {
    fn register(
        &self,
        moving: &Array3<f64>,
        reference: &Array3<f64>,
        affine: &Affine,
        initial: &RigidTransform,
    ) -> AppResult<RigidTransform> {
        match (
            Self::centroid(moving, affine),
            Self::centroid(reference, affine),
        ) {
            (Some(m), Some(r)) => Ok(RigidTransform::translation(
                m[0] - r[0],
                m[1] - r[1],
                m[2] - r[2],
            )),
            // Blank volume: keep the last estimate.
            _ => Ok(*initial),
        }
    }
}

/// Motion parameters of one volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEstimate {
    /// Displacement against the reference volume, mm
    pub rms_abs: f64,
    /// Displacement against the previous volume, mm
    pub rms_rel: f64,
}

/// Tracks the reference volume and the previous transform across a series.
pub struct MotionProcessor<R = CentroidRegistration> {
    registration: R,
    reference_index: VolumeIndex,
    reference: Option<Array3<f64>>,
    previous: RigidTransform,
    radius: f64,
}

impl MotionProcessor<CentroidRegistration> {
    /// Centroid registration against volume `reference_index`.
    pub fn new(reference_index: VolumeIndex) -> Self {
        Self::with_registration(reference_index, CentroidRegistration)
    }
}

impl<R: Registration> MotionProcessor<R> {
    /// Custom registration against volume `reference_index`.
    pub fn with_registration(reference_index: VolumeIndex, registration: R) -> Self {
        Self {
            registration,
            reference_index,
            reference: None,
            previous: RigidTransform::identity(),
            radius: HEAD_RADIUS_MM,
        }
    }

    /// Index of the reference volume.
    pub fn reference_index(&self) -> VolumeIndex {
        self.reference_index
    }

    /// Motion of volume `index`.
    ///
    /// Volumes up to and including the reference yield `None`; the reference
    /// itself is remembered. Later volumes before a reference was seen also
    /// yield `None`.
    pub fn estimate(
        &mut self,
        index: VolumeIndex,
        volume: &Array3<f64>,
        affine: &Affine,
    ) -> AppResult<Option<MotionEstimate>> {
        if index < self.reference_index {
            return Ok(None);
        }
        if index == self.reference_index {
            self.reference = Some(volume.clone());
            self.previous = RigidTransform::identity();
            debug!(vol_idx = index, "motion reference volume set");
            return Ok(None);
        }
        let Some(reference) = &self.reference else {
            return Ok(None);
        };

        let transform = self
            .registration
            .register(volume, reference, affine, &self.previous)?;
        let estimate = MotionEstimate {
            rms_abs: compute_rms(&RigidTransform::identity(), &transform, self.radius),
            rms_rel: compute_rms(&self.previous, &transform, self.radius),
        };
        self.previous = transform;
        Ok(Some(estimate))
    }
}
