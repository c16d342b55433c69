//! SO(3) helpers used by the control law.
//!
//! Quaternions cross the crate boundary in `[x, y, z, w]` order, which is also
//! nalgebra's storage order for `Quaternion::coords`.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Skew-symmetric matrix from vector (hat operator)
///
/// For v = [x, y, z]^T:
/// ```text
/// [v]x = [ 0  -z   y]
///        [ z   0  -x]
///        [-y   x   0]
/// ```
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Vector corresponding to a skew-symmetric matrix (vee operator)
///
/// Inverse of [`skew`]. Only the upper triangle is read, so a matrix that is
/// not exactly skew-symmetric is projected onto `[-S12, S02, -S01]`.
pub fn vee(s: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(-s[(1, 2)], s[(0, 2)], -s[(0, 1)])
}

/// Normalize `v`, or `None` when its norm is at or below `min_norm`.
pub fn try_normalize(v: &Vector3<f64>, min_norm: f64) -> Option<Vector3<f64>> {
    let norm = v.norm();
    if norm > min_norm && norm.is_finite() {
        Some(v / norm)
    } else {
        None
    }
}

/// Sign-preserving square root: `sign(x) * sqrt(|x|)`.
///
/// Used to turn `force / k_eta` into a rotor speed without taking the root of
/// a negative number. A negative result marks an infeasible (reverse thrust)
/// command, not a real spin direction.
pub fn signed_sqrt(x: f64) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    x.signum() * x.abs().sqrt()
}

/// Unit quaternion from `[x, y, z, w]` components.
///
/// The input is normalized; callers are expected to pass a unit quaternion.
pub fn quat_from_xyzw(q: [f64; 4]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]))
}

/// `[x, y, z, w]` components of a unit quaternion.
pub fn quat_to_xyzw(q: &UnitQuaternion<f64>) -> [f64; 4] {
    [q.i, q.j, q.k, q.w]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_skew_is_antisymmetric() {
        let v = Vector3::new(1.0, -2.0, 3.5);
        let s = skew(&v);

        assert_relative_eq!(s.transpose(), -s);
    }

    #[test]
    fn test_skew_matches_cross_product() {
        let a = Vector3::new(0.3, -1.2, 2.0);
        let b = Vector3::new(-4.0, 0.5, 1.0);

        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_vee_inverts_skew() {
        let v = Vector3::new(0.1, 2.0, -7.25);
        assert_eq!(vee(&skew(&v)), v);
    }

    #[test]
    fn test_try_normalize() {
        let v = Vector3::new(3.0, 0.0, 4.0);
        let n = try_normalize(&v, 1e-9).unwrap();
        assert_relative_eq!(n, Vector3::new(0.6, 0.0, 0.8));

        assert!(try_normalize(&Vector3::zeros(), 1e-9).is_none());
        assert!(try_normalize(&Vector3::new(1e-12, 0.0, 0.0), 1e-9).is_none());
        assert!(try_normalize(&Vector3::new(f64::NAN, 0.0, 0.0), 1e-9).is_none());
    }

    #[test]
    fn test_signed_sqrt() {
        assert_eq!(signed_sqrt(4.0), 2.0);
        assert_eq!(signed_sqrt(-9.0), -3.0);
        assert_eq!(signed_sqrt(0.0), 0.0);
        assert_eq!(signed_sqrt(-0.0), 0.0);
    }

    #[test]
    fn test_quaternion_boundary_order() {
        // 90 degrees about z: [0, 0, sin(pi/4), cos(pi/4)]
        let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), PI / 2.0);
        let xyzw = quat_to_xyzw(&q);

        assert_relative_eq!(xyzw[0], 0.0);
        assert_relative_eq!(xyzw[1], 0.0);
        assert_relative_eq!(xyzw[2], (PI / 4.0).sin(), epsilon = 1e-12);
        assert_relative_eq!(xyzw[3], (PI / 4.0).cos(), epsilon = 1e-12);

        let back = quat_from_xyzw(xyzw);
        assert_relative_eq!(back.angle_to(&q), 0.0, epsilon = 1e-12);
    }
}
