use std::sync::Arc;

use nalgebra::{DVector, Matrix3, Rotation3, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use tracing::{debug, warn};

use crate::allocation::Allocator;
use crate::error::{ControlError, Result};
use crate::math::{quat_from_xyzw, quat_to_xyzw, signed_sqrt, try_normalize, vee};
use crate::params::{ControlGains, VehicleParameters};

/// Desired forces below this norm (N) leave the thrust direction undefined.
pub const MIN_FORCE_NORM: f64 = 1e-9;

/// `|b3_des x c1_des|` below this leaves the desired body y axis undefined.
pub const MIN_ALIGNMENT_NORM: f64 = 1e-9;

/// Measured vehicle state, supplied by a simulator or estimator each step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// Position in the world frame (m), z up
    pub x: Vector3<f64>,
    /// Velocity in the world frame (m/s)
    pub v: Vector3<f64>,
    /// Orientation, body to world. Serialized as `[x, y, z, w]`.
    pub q: UnitQuaternion<f64>,
    /// Angular velocity in the body frame (rad/s)
    pub w: Vector3<f64>,
}

impl VehicleState {
    /// State with the orientation given as `[x, y, z, w]`.
    pub fn from_xyzw(x: Vector3<f64>, v: Vector3<f64>, q: [f64; 4], w: Vector3<f64>) -> Self {
        Self {
            x,
            v,
            q: quat_from_xyzw(q),
            w,
        }
    }

    /// Level and at rest at `position`.
    pub fn hover_at(position: Vector3<f64>) -> Self {
        Self {
            x: position,
            v: Vector3::zeros(),
            q: UnitQuaternion::identity(),
            w: Vector3::zeros(),
        }
    }
}

/// Desired trajectory sample: position and its derivatives, plus yaw.
///
/// Jerk and snap are accepted for interface completeness; this control law does
/// not use them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatOutput {
    /// Position (m)
    pub x: Vector3<f64>,
    /// Velocity (m/s)
    pub x_dot: Vector3<f64>,
    /// Acceleration (m/s²)
    pub x_ddot: Vector3<f64>,
    /// Jerk (m/s³)
    pub x_dddot: Vector3<f64>,
    /// Snap (m/s⁴)
    pub x_ddddot: Vector3<f64>,
    /// Yaw (rad)
    pub yaw: f64,
    /// Yaw rate (rad/s)
    pub yaw_dot: f64,
}

impl FlatOutput {
    /// Stationary setpoint at `position` with heading `yaw`.
    pub fn hold(position: Vector3<f64>, yaw: f64) -> Self {
        Self {
            x: position,
            yaw,
            ..Self::default()
        }
    }
}

/// Condition reported for a single control step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandWarning {
    /// Desired force is near zero, so the thrust direction is undefined.
    /// The current body z axis was held.
    DegenerateThrustDirection { force_norm: f64 },
    /// Desired thrust direction is parallel to the yaw reference, so the
    /// desired body y axis is undefined. Heading was built from the
    /// perpendicular yaw reference instead.
    DegenerateYawAlignment,
    /// Allocation asks a rotor for negative thrust.
    InfeasibleThrust { rotor: usize, force: f64 },
    /// Signed rotor speed lies outside the vehicle's speed bounds.
    RotorSpeedOutOfBounds { rotor: usize, speed: f64 },
}

/// Output of one control step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// Signed rotor speeds (rad/s). Negative entries mark infeasible reverse
    /// thrust; clipping is left to the actuator boundary.
    pub cmd_motor_speeds: DVector<f64>,
    /// Collective thrust along the current body z axis (N)
    pub cmd_thrust: f64,
    /// Body moment (N⋅m)
    pub cmd_moment: Vector3<f64>,
    /// Desired orientation, body to world
    pub cmd_q: UnitQuaternion<f64>,
    /// Fallbacks taken and feasibility violations found during the step
    pub warnings: Vec<CommandWarning>,
}

impl ControlCommand {
    /// Desired orientation as `[x, y, z, w]`.
    pub fn cmd_q_xyzw(&self) -> [f64; 4] {
        quat_to_xyzw(&self.cmd_q)
    }

    /// Whether a fallback replaced an undefined desired attitude.
    pub fn is_degenerate(&self) -> bool {
        self.warnings.iter().any(|w| {
            matches!(
                w,
                CommandWarning::DegenerateThrustDirection { .. }
                    | CommandWarning::DegenerateYawAlignment
            )
        })
    }

    /// Whether every rotor command is physically achievable.
    pub fn is_feasible(&self) -> bool {
        !self.warnings.iter().any(|w| {
            matches!(
                w,
                CommandWarning::InfeasibleThrust { .. }
                    | CommandWarning::RotorSpeedOutOfBounds { .. }
            )
        })
    }
}

/// Reference angular velocity fed to the attitude damping term.
pub trait AngularRateReference: Send + Sync {
    /// Desired body angular velocity (rad/s) for this trajectory sample.
    fn angular_velocity(&self, flat_output: &FlatOutput) -> Vector3<f64>;
}

/// `[0, 0, yaw_dot]`.
///
/// Ignores the roll and pitch rates implied by the trajectory's jerk, so the
/// damping term fights aggressive attitude changes. Known inaccuracy of the
/// default law; swap in a full reference with
/// [`Se3Controller::with_rate_reference`].
#[derive(Debug, Clone, Copy, Default)]
pub struct YawRateOnly;

impl AngularRateReference for YawRateOnly {
    fn angular_velocity(&self, flat_output: &FlatOutput) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, flat_output.yaw_dot)
    }
}

/// Geometric tracking controller on SE(3) for a multirotor.
///
/// Maps the current state and a flat-output sample to collective thrust, body
/// moment, desired attitude and rotor speeds. Holds no per-step state: each
/// [`update`](Self::update) is a pure function of its arguments and the fixed
/// parameters, so one instance can be driven from several threads at once.
///
/// # Control Law
///
/// ```text
/// F_des = m (-Kp ⊙ e_x - Kd ⊙ e_v + x_ddot_des + g z)
/// u1    = F_des · R z
/// b3_des = F_des / |F_des|,  b2_des = normalize(b3_des x c1_des)
/// R_des = [b2_des x b3_des | b2_des | b3_des]
/// e_R   = vee(½ (R_desᵀ R - Rᵀ R_des))
/// u2    = I (-kp_att e_R - kd_att (ω - ω_ref))
/// f     = A⁻¹ [u1, u2]
/// ω_i   = sign(f_i) sqrt(|f_i| / k_eta)
/// ```
pub struct Se3Controller {
    params: VehicleParameters,
    gains: ControlGains,
    inertia: Matrix3<f64>,
    allocator: Arc<Allocator>,
    rate_reference: Box<dyn AngularRateReference>,
}

assert_impl_all!(Se3Controller: Send, Sync);
assert_impl_all!(Allocator: Send, Sync);

impl Se3Controller {
    /// Validates the parameters and builds a dedicated allocator.
    ///
    /// # Errors
    ///
    /// [`ControlError::Configuration`] for inconsistent parameters and
    /// [`ControlError::SingularAllocator`] for rotor geometry that cannot
    /// produce an arbitrary thrust and moment.
    pub fn new(params: VehicleParameters, gains: ControlGains) -> Result<Self> {
        let allocator = Arc::new(Allocator::new(&params)?);
        Self::assemble(params, gains, allocator)
    }

    /// Reuses an allocator shared with other controllers.
    ///
    /// # Errors
    ///
    /// Besides parameter validation, fails with
    /// [`ControlError::RotorCountMismatch`] or [`ControlError::Configuration`]
    /// when the allocator was built for a different rotor count, geometry,
    /// spin map or yaw moment ratio.
    pub fn with_allocator(
        params: VehicleParameters,
        gains: ControlGains,
        allocator: Arc<Allocator>,
    ) -> Result<Self> {
        params.validate()?;
        if allocator.num_rotors() != params.num_rotors {
            return Err(ControlError::RotorCountMismatch {
                expected: params.num_rotors,
                actual: allocator.num_rotors(),
            });
        }
        if !allocator.matches(&params) {
            return Err(ControlError::configuration(
                "allocator was built for a different rotor layout",
            ));
        }
        Self::assemble(params, gains, allocator)
    }

    /// Final construction step; `params` and `allocator` are already checked.
    fn assemble(
        params: VehicleParameters,
        gains: ControlGains,
        allocator: Arc<Allocator>,
    ) -> Result<Self> {
        if !gains.g.is_finite() || gains.g < 0.0 {
            return Err(ControlError::configuration(format!(
                "gravity must be non-negative, got {}",
                gains.g
            )));
        }

        debug!(
            num_rotors = params.num_rotors,
            mass = params.mass,
            "constructed SE(3) controller"
        );

        Ok(Self {
            inertia: params.inertia(),
            params,
            gains,
            allocator,
            rate_reference: Box::new(YawRateOnly),
        })
    }

    /// Replaces the angular-velocity reference used in the damping term.
    pub fn with_rate_reference(
        mut self,
        reference: impl AngularRateReference + 'static,
    ) -> Self {
        self.rate_reference = Box::new(reference);
        self
    }

    /// Vehicle parameters the controller was built with.
    pub fn params(&self) -> &VehicleParameters {
        &self.params
    }

    /// Tracking gains and gravity.
    pub fn gains(&self) -> &ControlGains {
        &self.gains
    }

    /// Shared rotor allocator.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Desired force in the world frame (N), including weight compensation.
    ///
    /// Gains act as restoring forces, so errors are `state - desired`.
    pub fn desired_force(&self, state: &VehicleState, flat_output: &FlatOutput) -> Vector3<f64> {
        let pos_err = state.x - flat_output.x;
        let vel_err = state.v - flat_output.x_dot;
        let restoring = -self.gains.kp_pos.component_mul(&pos_err)
            - self.gains.kd_pos.component_mul(&vel_err);
        self.params.mass * (restoring + flat_output.x_ddot + Vector3::new(0.0, 0.0, self.gains.g))
    }

    /// Runs one control step.
    ///
    /// `_t` is accepted for symmetry with time-varying controllers. Degenerate
    /// attitude targets and infeasible rotor commands never fail the step;
    /// they are listed in [`ControlCommand::warnings`] alongside finite
    /// fallback values.
    pub fn update(
        &self,
        _t: f64,
        state: &VehicleState,
        flat_output: &FlatOutput,
    ) -> ControlCommand {
        let mut warnings = Vec::new();

        let f_des = self.desired_force(state, flat_output);

        // Thrust is projected on the current body z axis, not the desired one.
        let r = *state.q.to_rotation_matrix().matrix();
        let b3 = r * Vector3::z();
        let u1 = f_des.dot(&b3);

        let r_des = desired_attitude(&f_des, flat_output.yaw, &b3, &mut warnings);

        let s_err = 0.5 * (r_des.transpose() * r - r.transpose() * r_des);
        let att_err = vee(&s_err);

        let w_err = state.w - self.rate_reference.angular_velocity(flat_output);

        let u2 = self.inertia * (-self.gains.kp_att * att_err - self.gains.kd_att * w_err);

        let forces = self
            .allocator
            .inverse(&Vector4::new(u1, u2.x, u2.y, u2.z));
        let speeds = forces.map(|f| signed_sqrt(f / self.params.k_eta));
        self.check_feasibility(&forces, &speeds, &mut warnings);

        ControlCommand {
            cmd_motor_speeds: speeds,
            cmd_thrust: u1,
            cmd_moment: u2,
            cmd_q: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_des)),
            warnings,
        }
    }

    fn check_feasibility(
        &self,
        forces: &DVector<f64>,
        speeds: &DVector<f64>,
        warnings: &mut Vec<CommandWarning>,
    ) {
        for (rotor, (&force, &speed)) in forces.iter().zip(speeds.iter()).enumerate() {
            if force < 0.0 {
                debug!(rotor, force, "allocation requests reverse thrust");
                warnings.push(CommandWarning::InfeasibleThrust { rotor, force });
            }
            if speed < self.params.rotor_speed_min || speed > self.params.rotor_speed_max {
                debug!(rotor, speed, "rotor speed outside bounds");
                warnings.push(CommandWarning::RotorSpeedOutOfBounds { rotor, speed });
            }
        }
    }
}

/// Desired rotation `[b1_des | b2_des | b3_des]` for a desired force and yaw.
///
/// Falls back to the current body z axis `b3` when the force vanishes, and to
/// the perpendicular heading `c2 = [-sin ψ, cos ψ, 0]` when the thrust
/// direction lines up with `c1 = [cos ψ, sin ψ, 0]`. The two constructions agree
/// whenever both are defined.
fn desired_attitude(
    f_des: &Vector3<f64>,
    yaw: f64,
    b3: &Vector3<f64>,
    warnings: &mut Vec<CommandWarning>,
) -> Matrix3<f64> {
    let b3_des = match try_normalize(f_des, MIN_FORCE_NORM) {
        Some(dir) => dir,
        None => {
            let force_norm = f_des.norm();
            warn!(force_norm, "desired force vanishes, holding current thrust axis");
            warnings.push(CommandWarning::DegenerateThrustDirection { force_norm });
            *b3
        }
    };

    let (sin_yaw, cos_yaw) = yaw.sin_cos();
    let c1_des = Vector3::new(cos_yaw, sin_yaw, 0.0);

    let (b1_des, b2_des) = match try_normalize(&b3_des.cross(&c1_des), MIN_ALIGNMENT_NORM) {
        Some(b2_des) => (b2_des.cross(&b3_des), b2_des),
        None => {
            warn!(yaw, "desired thrust parallel to yaw reference, using perpendicular heading");
            warnings.push(CommandWarning::DegenerateYawAlignment);
            let c2_des = Vector3::new(-sin_yaw, cos_yaw, 0.0);
            // c2 is orthogonal to c1, hence to b3_des here, so this is unit length.
            let b1_des = c2_des.cross(&b3_des).normalize();
            (b1_des, b3_des.cross(&b1_des))
        }
    };

    Matrix3::from_columns(&[b1_des, b2_des, b3_des])
}
