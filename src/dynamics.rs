//! Rigid-body multirotor model used to close the loop around the controller.
//!
//! This is the actuator boundary: commanded speeds are clipped to the rotor
//! bounds here, never inside the control law.

use nalgebra::{DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};

use crate::allocation::Allocator;
use crate::control::VehicleState;
use crate::error::{ControlError, Result};
use crate::params::VehicleParameters;

/// Ordinary Differential Equation (ODE) system for multirotor dynamics.
///
/// State layout (13 values):
/// `[x, y, z, vx, vy, vz, qx, qy, qz, qw, wx, wy, wz]`
///
/// Rotor speeds are held constant over one integration interval (zero-order
/// hold), so thrust and body moment are precomputed.
pub struct MultirotorOde {
    mass: f64,
    g: f64,
    inertia: Matrix3<f64>,
    inertia_inv: Matrix3<f64>,
    drag: Vector3<f64>,
    /// Collective thrust along body z (N)
    thrust: f64,
    /// Body moment (N⋅m)
    moment: Vector3<f64>,
}

impl MultirotorOde {
    /// Builds the model for one interval of constant rotor speeds.
    pub fn new(
        params: &VehicleParameters,
        allocator: &Allocator,
        rotor_speeds: &DVector<f64>,
        g: f64,
    ) -> Result<Self> {
        let inertia = params.inertia();
        let inertia_inv = inertia
            .try_inverse()
            .ok_or_else(|| ControlError::configuration("inertia tensor is singular"))?;

        let forces = rotor_forces(params, rotor_speeds);
        let wrench = allocator.forward(&forces)?;

        Ok(Self {
            mass: params.mass,
            g,
            inertia,
            inertia_inv,
            drag: params.drag_coefficients(),
            thrust: wrench[0],
            moment: Vector3::new(wrench[1], wrench[2], wrench[3]),
        })
    }
}

/// Per-rotor thrust `k_eta * ω²` after clipping speeds to the rotor bounds.
pub fn rotor_forces(params: &VehicleParameters, rotor_speeds: &DVector<f64>) -> DVector<f64> {
    rotor_speeds.map(|w| {
        let w = w.clamp(params.rotor_speed_min, params.rotor_speed_max);
        params.k_eta * w * w
    })
}

impl fast_ode::DifferentialEquation<13> for MultirotorOde {
    /// Newton-Euler equations with quaternion attitude kinematics.
    ///
    /// - ẋ = v
    /// - v̇ = (R [0, 0, T] + R D_b) / m - g z, with D_b = -|v_b| diag(c_D) v_b
    /// - q̇ = ½ q ⊗ [ω, 0]
    /// - ω̇ = I⁻¹ (M - ω × I ω)
    fn ode_dot_y(&self, _t: f64, y: &fast_ode::Coord<13>) -> (fast_ode::Coord<13>, bool) {
        let s = y.0;

        let v = Vector3::new(s[3], s[4], s[5]);
        let quat = Quaternion::new(s[9], s[6], s[7], s[8]);
        let omega = Vector3::new(s[10], s[11], s[12]);

        let attitude = UnitQuaternion::from_quaternion(quat);

        // Parasitic drag acts on the body-frame airspeed.
        let v_body = attitude.inverse_transform_vector(&v);
        let drag_body = -v_body.norm() * self.drag.component_mul(&v_body);
        let force_body = Vector3::new(0.0, 0.0, self.thrust) + drag_body;

        let accel = attitude.transform_vector(&force_body) / self.mass
            - Vector3::new(0.0, 0.0, self.g);

        let q_dot = quat * Quaternion::from_imag(omega) * 0.5;

        let omega_dot =
            self.inertia_inv * (self.moment - omega.cross(&(self.inertia * omega)));

        let mut dot_y = [0.0; 13];

        // Position derivatives (velocities)
        dot_y[0] = s[3];
        dot_y[1] = s[4];
        dot_y[2] = s[5];

        dot_y[3] = accel.x;
        dot_y[4] = accel.y;
        dot_y[5] = accel.z;

        // Quaternion derivative, [x, y, z, w] order
        dot_y[6] = q_dot.i;
        dot_y[7] = q_dot.j;
        dot_y[8] = q_dot.k;
        dot_y[9] = q_dot.w;

        dot_y[10] = omega_dot.x;
        dot_y[11] = omega_dot.y;
        dot_y[12] = omega_dot.z;

        let finite = dot_y.iter().all(|v| v.is_finite());
        (fast_ode::Coord(dot_y), finite)
    }
}

#[rustfmt::skip]
fn to_array(state: &VehicleState) -> [f64; 13] {
    let q = state.q.coords;
    [
        state.x.x, state.x.y, state.x.z,
        state.v.x, state.v.y, state.v.z,
        q[0], q[1], q[2], q[3],
        state.w.x, state.w.y, state.w.z,
    ]
}

fn from_array(arr: &[f64; 13]) -> VehicleState {
    VehicleState {
        x: Vector3::new(arr[0], arr[1], arr[2]),
        v: Vector3::new(arr[3], arr[4], arr[5]),
        // Renormalize to remove integration drift.
        q: UnitQuaternion::from_quaternion(Quaternion::new(arr[9], arr[6], arr[7], arr[8])),
        w: Vector3::new(arr[10], arr[11], arr[12]),
    }
}

/// Simulates the vehicle under constant rotor speeds over `time_span`.
///
/// Speeds outside `[rotor_speed_min, rotor_speed_max]`, including the negative
/// speeds the controller uses to flag reverse thrust, are clipped first.
///
/// # Arguments
///
/// * `initial_state` - State at the start of the interval
/// * `params` - Vehicle the model describes
/// * `allocator` - Allocator built for `params`, used as the forward wrench map
/// * `rotor_speeds` - Commanded rotor speeds (rad/s)
/// * `g` - Gravitational acceleration (m/s²)
/// * `time_span` - Tuple (t_start, t_end) defining integration interval (seconds)
/// * `tolerance` - Absolute tolerance for the numerical integrator
///
/// # Example
///
/// let params = VehicleParameters::crazyflie();
/// let allocator = Allocator::new(&params)?;
/// let hover = (params.mass * 9.81 / 4.0 / params.k_eta).sqrt();
/// let speeds = DVector::from_element(4, hover);
/// let next = simulate_multirotor(&state, &params, &allocator, &speeds, 9.81, (0.0, 0.01), 1e-8)?;
pub fn simulate_multirotor(
    initial_state: &VehicleState,
    params: &VehicleParameters,
    allocator: &Allocator,
    rotor_speeds: &DVector<f64>,
    g: f64,
    time_span: (f64, f64),
    tolerance: f64,
) -> Result<VehicleState> {
    if rotor_speeds.len() != params.num_rotors {
        return Err(ControlError::RotorCountMismatch {
            expected: params.num_rotors,
            actual: rotor_speeds.len(),
        });
    }

    let ode = MultirotorOde::new(params, allocator, rotor_speeds, g)?;

    let initial_coord = fast_ode::Coord(to_array(initial_state));

    let result = fast_ode::solve_ivp(
        &ode,
        time_span,
        initial_coord,
        |_, _| true,
        tolerance,
        tolerance * 10.0,
    );

    match result {
        fast_ode::IvpResult::FinalTimeReached(final_coord) => Ok(from_array(&final_coord.0)),
        _ => Err(ControlError::integration(format!(
            "integration over [{}, {}] did not reach the final time",
            time_span.0, time_span.1
        ))),
    }
}
