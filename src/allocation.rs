//! Rotor force allocation.
//!
//! The allocation matrix maps per-rotor thrust forces `[f_1 .. f_N]` (all along
//! body +z) to the body wrench `[T, M_x, M_y, M_z]`:
//!
//! ```text
//! row 0:  1                    (thrust sum)
//! row 1:  (p_i x z)_x  =  p_i.y (roll arm)
//! row 2:  (p_i x z)_y  = -p_i.x (pitch arm)
//! row 3:  s_i * k_m / k_eta    (yaw reaction, s_i = +1 for Cw, -1 for Ccw)
//! ```
//!
//! The yaw signs come from the vehicle's spin-direction map. Without one the
//! layout alternates starting with `Cw` at rotor 1; that is a numbering
//! convention, not something derivable from rotor positions.

use nalgebra::{DMatrix, DVector, Vector3, Vector4};
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::params::{SpinDirection, VehicleParameters};

/// Singular values below this fraction of the largest count as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Relative tolerance when comparing an allocator against a vehicle.
const MATCH_TOLERANCE: f64 = 1e-12;

/// Iteration cap for the rank decomposition.
const SVD_MAX_ITERATIONS: usize = 1000;

/// Forward allocation matrix and its (pseudo-)inverse.
///
/// Immutable once built; share it between controllers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Allocator {
    /// 4 x N, rotor forces to wrench
    f_to_tm: DMatrix<f64>,
    /// N x 4, wrench to rotor forces
    tm_to_f: DMatrix<f64>,
}

impl Allocator {
    /// Build the allocator for a vehicle.
    pub fn new(params: &VehicleParameters) -> Result<Self> {
        params.validate()?;
        Self::from_geometry(
            &params.rotor_pos,
            &params.spin_directions(),
            params.k_eta,
            params.k_m,
        )
    }

    /// Build the allocator from raw rotor geometry.
    ///
    /// Fails with [`ControlError::SingularAllocator`] when the forward matrix
    /// does not have rank 4, which includes every layout with fewer than four
    /// rotors. Four rotors use the exact inverse; more use the minimum-norm
    /// right pseudo-inverse `A^T (A A^T)^-1`.
    pub fn from_geometry(
        positions: &[Vector3<f64>],
        directions: &[SpinDirection],
        k_eta: f64,
        k_m: f64,
    ) -> Result<Self> {
        let f_to_tm = forward_from_geometry(positions, directions, k_eta, k_m)?;
        let num_rotors = f_to_tm.ncols();

        let rank = numerical_rank(&f_to_tm)
            .ok_or(ControlError::SingularAllocator { num_rotors, rank: 0 })?;
        if rank < 4 {
            return Err(ControlError::SingularAllocator { num_rotors, rank });
        }

        let tm_to_f = if num_rotors == 4 {
            f_to_tm.clone().try_inverse()
        } else {
            let at = f_to_tm.transpose();
            (&f_to_tm * &at).try_inverse().map(|inv| at * inv)
        }
        .ok_or(ControlError::SingularAllocator { num_rotors, rank })?;

        debug!(num_rotors, yaw_ratio = k_m / k_eta, "built rotor allocator");

        Ok(Self { f_to_tm, tm_to_f })
    }

    /// Whether this allocator was built from the given vehicle's geometry,
    /// spin map and yaw moment ratio.
    pub fn matches(&self, params: &VehicleParameters) -> bool {
        let expected = match forward_from_geometry(
            &params.rotor_pos,
            &params.spin_directions(),
            params.k_eta,
            params.k_m,
        ) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if expected.shape() != self.f_to_tm.shape() {
            return false;
        }
        let scale = expected.amax().max(1.0);
        (&expected - &self.f_to_tm).amax() <= MATCH_TOLERANCE * scale
    }

    /// Number of rotors the allocator was built for.
    pub fn num_rotors(&self) -> usize {
        self.f_to_tm.ncols()
    }

    /// 4 x N matrix from rotor forces to `[T, M_x, M_y, M_z]`.
    pub fn forward_matrix(&self) -> &DMatrix<f64> {
        &self.f_to_tm
    }

    /// N x 4 matrix from `[T, M_x, M_y, M_z]` to rotor forces.
    pub fn inverse_matrix(&self) -> &DMatrix<f64> {
        &self.tm_to_f
    }

    /// Net thrust and body moment produced by the given rotor forces.
    pub fn forward(&self, forces: &DVector<f64>) -> Result<Vector4<f64>> {
        if forces.len() != self.num_rotors() {
            return Err(ControlError::RotorCountMismatch {
                expected: self.num_rotors(),
                actual: forces.len(),
            });
        }
        let tm = &self.f_to_tm * forces;
        Ok(Vector4::new(tm[0], tm[1], tm[2], tm[3]))
    }

    /// Rotor forces realizing `[T, M_x, M_y, M_z]`.
    ///
    /// For over-actuated layouts this is the least-norm solution.
    pub fn inverse(&self, wrench: &Vector4<f64>) -> DVector<f64> {
        &self.tm_to_f * DVector::from_column_slice(wrench.as_slice())
    }
}

/// Assemble the 4 x N forward matrix, rejecting non-finite geometry.
fn forward_from_geometry(
    positions: &[Vector3<f64>],
    directions: &[SpinDirection],
    k_eta: f64,
    k_m: f64,
) -> Result<DMatrix<f64>> {
    if positions.len() != directions.len() {
        return Err(ControlError::RotorCountMismatch {
            expected: positions.len(),
            actual: directions.len(),
        });
    }
    if !(k_eta.is_finite() && k_eta > 0.0) {
        return Err(ControlError::configuration("k_eta must be positive"));
    }

    let k = k_m / k_eta;
    if !k.is_finite() {
        return Err(ControlError::configuration(format!(
            "yaw moment ratio k_m / k_eta = {k} is not finite"
        )));
    }
    if let Some(i) = positions.iter().position(|p| !p.iter().all(|c| c.is_finite())) {
        return Err(ControlError::configuration(format!(
            "rotor {} position is not finite",
            i + 1
        )));
    }
    let z = Vector3::z();

    let mut f_to_tm = DMatrix::zeros(4, positions.len());
    for (i, (p, dir)) in positions.iter().zip(directions).enumerate() {
        let arm = p.cross(&z);
        f_to_tm[(0, i)] = 1.0;
        f_to_tm[(1, i)] = arm.x;
        f_to_tm[(2, i)] = arm.y;
        f_to_tm[(3, i)] = k * dir.yaw_sign();
    }

    Ok(f_to_tm)
}

/// `None` when the decomposition does not converge.
fn numerical_rank(m: &DMatrix<f64>) -> Option<usize> {
    let singular_values = m
        .clone()
        .try_svd(false, false, f64::EPSILON, SVD_MAX_ITERATIONS)?
        .singular_values;
    let largest = singular_values.max();
    if largest <= 0.0 {
        return Some(0);
    }
    Some(
        singular_values
            .iter()
            .filter(|&&s| s > RANK_TOLERANCE * largest)
            .count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_quad() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.1, 0.1, 0.0),
            Vector3::new(-0.1, 0.1, 0.0),
            Vector3::new(-0.1, -0.1, 0.0),
            Vector3::new(0.1, -0.1, 0.0),
        ]
    }

    fn quad_allocator() -> Allocator {
        let dirs = SpinDirection::alternating(4);
        Allocator::from_geometry(&square_quad(), &dirs, 1e-6, 1e-7).unwrap()
    }

    fn hexarotor(arm: f64) -> Vec<Vector3<f64>> {
        (0..6)
            .map(|i| {
                let a = f64::from(i) * std::f64::consts::FRAC_PI_3;
                Vector3::new(arm * a.cos(), arm * a.sin(), 0.0)
            })
            .collect()
    }

    #[test]
    fn test_matrix_layout() {
        let alloc = quad_allocator();
        let a = alloc.forward_matrix();

        assert_eq!(a.nrows(), 4);
        assert_eq!(a.ncols(), 4);
        for i in 0..4 {
            assert_eq!(a[(0, i)], 1.0);
        }
        // p x z = (p.y, -p.x, 0)
        assert_relative_eq!(a[(1, 1)], 0.1);
        assert_relative_eq!(a[(2, 1)], 0.1);
        assert_relative_eq!(a[(1, 2)], -0.1);
        assert_relative_eq!(a[(2, 0)], -0.1);
        // alternating yaw row, positive for rotor 1
        assert_relative_eq!(a[(3, 0)], 0.1, epsilon = 1e-12);
        assert_relative_eq!(a[(3, 1)], -0.1, epsilon = 1e-12);
        assert_relative_eq!(a[(3, 2)], 0.1, epsilon = 1e-12);
        assert_relative_eq!(a[(3, 3)], -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_forward_times_inverse_is_identity() {
        let alloc = quad_allocator();
        let product = alloc.forward_matrix() * alloc.inverse_matrix();

        assert_relative_eq!(product, DMatrix::identity(4, 4), epsilon = 1e-10);
    }

    #[test]
    fn test_hover_forces_equal_and_positive() {
        let alloc = quad_allocator();
        let weight = 0.5 * 9.81;
        let forces = alloc.inverse(&Vector4::new(weight, 0.0, 0.0, 0.0));

        for f in forces.iter() {
            assert!(*f > 0.0);
            assert_relative_eq!(*f, weight / 4.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_forward_recovers_wrench() {
        let alloc = quad_allocator();
        let wrench = Vector4::new(3.0, 0.02, -0.01, 0.005);
        let forces = alloc.inverse(&wrench);

        assert_relative_eq!(alloc.forward(&forces).unwrap(), wrench, epsilon = 1e-12);
    }

    #[test]
    fn test_hexarotor_pseudo_inverse() {
        let dirs = SpinDirection::alternating(6);
        let alloc = Allocator::from_geometry(&hexarotor(0.25), &dirs, 1e-6, 2e-8).unwrap();
        assert_eq!(alloc.num_rotors(), 6);
        assert_eq!(alloc.inverse_matrix().shape(), (6, 4));

        let product = alloc.forward_matrix() * alloc.inverse_matrix();
        assert_relative_eq!(product, DMatrix::identity(4, 4), epsilon = 1e-9);

        // Minimum-norm hover splits thrust evenly.
        let forces = alloc.inverse(&Vector4::new(12.0, 0.0, 0.0, 0.0));
        for f in forces.iter() {
            assert_relative_eq!(*f, 2.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_too_few_rotors_is_singular() {
        let positions = vec![Vector3::new(0.1, 0.0, 0.0), Vector3::new(-0.1, 0.0, 0.0)];
        let dirs = SpinDirection::alternating(2);
        let result = Allocator::from_geometry(&positions, &dirs, 1e-6, 1e-7);

        assert!(matches!(
            result,
            Err(ControlError::SingularAllocator { num_rotors: 2, .. })
        ));
    }

    #[test]
    fn test_collinear_rotors_are_singular() {
        // All rotors on the x axis: no roll authority.
        let positions: Vec<_> = [-0.3, -0.1, 0.1, 0.3]
            .iter()
            .map(|&x| Vector3::new(x, 0.0, 0.0))
            .collect();
        let dirs = SpinDirection::alternating(4);
        let result = Allocator::from_geometry(&positions, &dirs, 1e-6, 1e-7);

        assert!(matches!(
            result,
            Err(ControlError::SingularAllocator { rank: 3, .. })
        ));
    }

    #[test]
    fn test_same_spin_everywhere_is_singular() {
        let result =
            Allocator::from_geometry(&square_quad(), &[SpinDirection::Cw; 4], 1e-6, 1e-7);
        assert!(matches!(result, Err(ControlError::SingularAllocator { .. })));
    }

    #[test]
    fn test_non_finite_position_is_rejected() {
        let mut positions = square_quad();
        positions[1].x = f64::NAN;
        let dirs = SpinDirection::alternating(4);

        let result = Allocator::from_geometry(&positions, &dirs, 1e-6, 1e-7);

        assert!(matches!(result, Err(ControlError::Configuration(_))));
    }

    #[test]
    fn test_non_finite_yaw_ratio_is_rejected() {
        let dirs = SpinDirection::alternating(4);

        let infinite_km = Allocator::from_geometry(&square_quad(), &dirs, 1e-6, f64::INFINITY);
        assert!(matches!(infinite_km, Err(ControlError::Configuration(_))));

        // Both finite, but the ratio overflows.
        let overflow = Allocator::from_geometry(&square_quad(), &dirs, 1e-10, 1e300);
        assert!(matches!(overflow, Err(ControlError::Configuration(_))));
    }

    #[test]
    fn test_numerical_rank_of_non_finite_matrix_terminates() {
        let mut m = DMatrix::<f64>::identity(4, 4);
        m[(2, 1)] = f64::NAN;

        // Either no convergence or some rank; the call must return.
        let _ = numerical_rank(&m);
    }

    #[test]
    fn test_matches_only_its_own_vehicle() {
        let params = VehicleParameters::crazyflie();
        let alloc = Allocator::new(&params).unwrap();
        assert!(alloc.matches(&params));

        let mut flipped = params.clone();
        flipped.rotor_directions = Some(vec![
            SpinDirection::Ccw,
            SpinDirection::Cw,
            SpinDirection::Ccw,
            SpinDirection::Cw,
        ]);
        assert!(!alloc.matches(&flipped));

        let mut wider = params.clone();
        wider.rotor_pos[0].x *= 2.0;
        assert!(!alloc.matches(&wider));

        let mut other_rotor = params;
        other_rotor.k_m *= 3.0;
        assert!(!alloc.matches(&other_rotor));
    }

    #[test]
    fn test_explicit_directions_flip_yaw_row() {
        let dirs = [
            SpinDirection::Ccw,
            SpinDirection::Cw,
            SpinDirection::Ccw,
            SpinDirection::Cw,
        ];
        let alloc = Allocator::from_geometry(&square_quad(), &dirs, 1e-6, 1e-7).unwrap();

        assert!(alloc.forward_matrix()[(3, 0)] < 0.0);
        assert!(alloc.forward_matrix()[(3, 1)] > 0.0);
    }

    #[test]
    fn test_forward_rejects_wrong_length() {
        let alloc = Allocator::new(&VehicleParameters::crazyflie()).unwrap();
        let result = alloc.forward(&DVector::from_element(6, 1.0));

        assert!(matches!(
            result,
            Err(ControlError::RotorCountMismatch {
                expected: 4,
                actual: 6
            })
        ));
    }
}
