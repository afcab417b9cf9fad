//! Quaternion log-map / exp-map primitives.
//!
//! The whole-body solver parameterizes joint rotations as 3-vector
//! rotation vectors (axis scaled by angle) so they can live in a flat
//! optimization vector; goal consolidation averages rotations in the same
//! space; the base-pose regularizer measures geodesic distance through it.
//!
//! These run inside the per-frame solve loop where there is no recovery
//! path, so degenerate inputs map to the identity / zero vector instead of
//! propagating NaN.

use nalgebra::{UnitQuaternion, Vector3};

/// Squared norm below which a rotation vector is treated as zero.
const MIN_SQ_ANGLE: f32 = 1e-12;

/// Quaternion log-map: unit quaternion to rotation vector (axis * angle).
///
/// Near-identity rotations, where the axis is undefined, map to the zero
/// vector.
pub fn log(q: &UnitQuaternion<f32>) -> Vector3<f32> {
    match q.axis() {
        Some(axis) => axis.into_inner() * q.angle(),
        None => Vector3::zeros(),
    }
}

/// Quaternion exp-map: rotation vector to unit quaternion.
///
/// The zero vector maps to the identity rotation.
pub fn exp(v: &Vector3<f32>) -> UnitQuaternion<f32> {
    if v.norm_squared() < MIN_SQ_ANGLE {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_scaled_axis(*v)
    }
}

/// Rotation vector describing the rotation from `q1` to `q2`.
pub fn disp(q1: &UnitQuaternion<f32>, q2: &UnitQuaternion<f32>) -> Vector3<f32> {
    log(&(q1.inverse() * q2))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
