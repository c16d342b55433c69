//! Vehicle parameters and control gains.
//!
//! Both records load from TOML. The vehicle keys (`Ixx`, `c_Dx`, `rotor_pos`,
//! ...) are shared with trajectory and simulator tooling and must not be
//! renamed.

use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Spin direction of a rotor, named by the sign of its yaw reaction moment.
///
/// `Cw` rotors push the body about +z (positive entry in the yaw row of the
/// allocation matrix), `Ccw` rotors about -z. Which physical direction that is
/// depends on the vehicle's propeller handedness; the name is a convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpinDirection {
    Cw,
    Ccw,
}

impl SpinDirection {
    /// Sign of the yaw reaction moment produced by positive thrust.
    pub fn yaw_sign(self) -> f64 {
        match self {
            SpinDirection::Cw => 1.0,
            SpinDirection::Ccw => -1.0,
        }
    }

    /// Alternating layout `Cw, Ccw, Cw, ...` starting at rotor 1.
    pub fn alternating(num_rotors: usize) -> Vec<SpinDirection> {
        (0..num_rotors)
            .map(|i| {
                if i % 2 == 0 {
                    SpinDirection::Cw
                } else {
                    SpinDirection::Ccw
                }
            })
            .collect()
    }
}

/// Physical description of a multirotor.
///
/// Drag, rotor drag, inflow, flapping and motor time constant are carried for
/// collaborators (the simulator uses the drag terms); the control law reads
/// only mass, inertia, rotor geometry and the thrust/yaw coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleParameters {
    /// Total mass (kg)
    pub mass: f64,
    /// Moments and products of inertia (kg⋅m²)
    #[serde(rename = "Ixx")]
    pub ixx: f64,
    #[serde(rename = "Iyy")]
    pub iyy: f64,
    #[serde(rename = "Izz")]
    pub izz: f64,
    #[serde(rename = "Ixy", default)]
    pub ixy: f64,
    #[serde(rename = "Ixz", default)]
    pub ixz: f64,
    #[serde(rename = "Iyz", default)]
    pub iyz: f64,
    /// Parasitic drag coefficients, N/(m/s)²
    #[serde(rename = "c_Dx", default)]
    pub c_dx: f64,
    #[serde(rename = "c_Dy", default)]
    pub c_dy: f64,
    #[serde(rename = "c_Dz", default)]
    pub c_dz: f64,
    pub num_rotors: usize,
    /// Explicit spin directions; alternating from rotor 1 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotor_directions: Option<Vec<SpinDirection>>,
    /// Rotor speed bounds (rad/s)
    pub rotor_speed_min: f64,
    pub rotor_speed_max: f64,
    /// Thrust coefficient, N/(rad/s)²
    pub k_eta: f64,
    /// Yaw moment coefficient, N⋅m/(rad/s)²
    pub k_m: f64,
    /// Rotor drag coefficient, N/(m/s)
    #[serde(default)]
    pub k_d: f64,
    /// Induced inflow coefficient, N/(m/s)
    #[serde(default)]
    pub k_z: f64,
    /// Flapping moment coefficient, N⋅m/(m/s)
    #[serde(default)]
    pub k_flap: f64,
    /// Motor response time constant (s)
    #[serde(default)]
    pub tau_m: f64,
    /// Rotor positions relative to the center of mass (m), rotor 1 first.
    /// Kept last so it serializes as the trailing `[rotor_pos]` table.
    #[serde(with = "rotor_map")]
    pub rotor_pos: Vec<Vector3<f64>>,
}

impl VehicleParameters {
    /// Parameters of a Crazyflie-class 4-rotor micro quadrotor in an X layout.
    pub fn crazyflie() -> Self {
        let d = 0.043 * std::f64::consts::FRAC_1_SQRT_2;
        Self {
            mass: 0.03,
            ixx: 1.43e-5,
            iyy: 1.43e-5,
            izz: 2.89e-5,
            ixy: 0.0,
            ixz: 0.0,
            iyz: 0.0,
            c_dx: 0.5e-2,
            c_dy: 0.5e-2,
            c_dz: 1e-2,
            num_rotors: 4,
            rotor_pos: vec![
                Vector3::new(d, d, 0.0),
                Vector3::new(d, -d, 0.0),
                Vector3::new(-d, -d, 0.0),
                Vector3::new(-d, d, 0.0),
            ],
            rotor_directions: None,
            rotor_speed_min: 0.0,
            rotor_speed_max: 2500.0,
            k_eta: 2.3e-8,
            k_m: 7.8e-11,
            k_d: 10.2506e-7,
            k_z: 7.553e-7,
            k_flap: 0.0,
            tau_m: 0.005,
        }
    }

    /// Parse and validate parameters from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let params: Self = toml::from_str(s)?;
        params.validate()?;
        Ok(params)
    }

    /// Read, parse and validate parameters from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Symmetric inertia tensor assembled from the six independent components.
    #[rustfmt::skip]
    pub fn inertia(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.ixx, self.ixy, self.ixz,
            self.ixy, self.iyy, self.iyz,
            self.ixz, self.iyz, self.izz,
        )
    }

    /// Parasitic drag coefficients as a vector.
    pub fn drag_coefficients(&self) -> Vector3<f64> {
        Vector3::new(self.c_dx, self.c_dy, self.c_dz)
    }

    /// Spin directions in rotor order, defaulting to the alternating layout.
    pub fn spin_directions(&self) -> Vec<SpinDirection> {
        self.rotor_directions
            .clone()
            .unwrap_or_else(|| SpinDirection::alternating(self.num_rotors))
    }

    /// Check physical consistency.
    ///
    /// Rank of the rotor geometry is not checked here; that is the allocator's
    /// job at construction.
    pub fn validate(&self) -> Result<()> {
        if !(self.mass.is_finite() && self.mass > 0.0) {
            return Err(ControlError::configuration(format!(
                "mass must be positive, got {}",
                self.mass
            )));
        }

        let inertia = self.inertia();
        if inertia.iter().any(|v| !v.is_finite()) || inertia.cholesky().is_none() {
            return Err(ControlError::configuration(
                "inertia tensor must be positive definite",
            ));
        }

        if self.num_rotors < 2 {
            return Err(ControlError::configuration(format!(
                "at least 2 rotors required, got {}",
                self.num_rotors
            )));
        }
        if self.rotor_pos.len() != self.num_rotors {
            return Err(ControlError::configuration(format!(
                "num_rotors is {} but {} rotor positions given",
                self.num_rotors,
                self.rotor_pos.len()
            )));
        }
        if self.rotor_pos.iter().any(|p| p.iter().any(|v| !v.is_finite())) {
            return Err(ControlError::configuration("rotor positions must be finite"));
        }
        if let Some(directions) = &self.rotor_directions {
            if directions.len() != self.num_rotors {
                return Err(ControlError::configuration(format!(
                    "num_rotors is {} but {} rotor directions given",
                    self.num_rotors,
                    directions.len()
                )));
            }
        }

        if !(self.rotor_speed_min >= 0.0 && self.rotor_speed_min < self.rotor_speed_max) {
            return Err(ControlError::configuration(format!(
                "rotor speed bounds [{}, {}] are invalid",
                self.rotor_speed_min, self.rotor_speed_max
            )));
        }
        if !(self.k_eta.is_finite() && self.k_eta > 0.0) {
            return Err(ControlError::configuration("k_eta must be positive"));
        }
        if !(self.k_m.is_finite() && self.k_m >= 0.0) {
            return Err(ControlError::configuration("k_m must be non-negative"));
        }
        if !(self.k_m / self.k_eta).is_finite() {
            return Err(ControlError::configuration("k_m / k_eta must be finite"));
        }
        if self.tau_m < 0.0 {
            return Err(ControlError::configuration("tau_m must be non-negative"));
        }

        Ok(())
    }
}

/// Fixed gains of the geometric tracking law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlGains {
    /// Position proportional gains per axis (1/s²)
    pub kp_pos: Vector3<f64>,
    /// Position derivative gains per axis (1/s)
    pub kd_pos: Vector3<f64>,
    /// Attitude proportional gain, applied to all axes
    pub kp_att: f64,
    /// Attitude derivative gain, applied to all axes
    pub kd_att: f64,
    /// Gravitational acceleration (m/s²)
    pub g: f64,
}

impl Default for ControlGains {
    fn default() -> Self {
        Self {
            kp_pos: Vector3::new(6.5, 6.5, 15.0),
            kd_pos: Vector3::new(4.0, 4.0, 9.0),
            kp_att: 544.0,
            kd_att: 46.64,
            g: 9.81,
        }
    }
}

impl ControlGains {
    /// Parse gains from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse gains from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

/// Serde adapter for `rotor_pos`: a table `r1 ... rN` of `[x, y, z]`.
///
/// Keys are ordered by their numeric suffix, so `r10` follows `r9`.
mod rotor_map {
    use std::collections::BTreeMap;

    use nalgebra::Vector3;
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(rotors: &[Vector3<f64>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(rotors.len()))?;
        for (i, p) in rotors.iter().enumerate() {
            map.serialize_entry(&format!("r{}", i + 1), &[p.x, p.y, p.z])?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vector3<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, [f64; 3]>::deserialize(deserializer)?;

        let mut indexed = BTreeMap::new();
        for (key, p) in raw {
            let index = key
                .strip_prefix('r')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| n >= 1)
                .ok_or_else(|| D::Error::custom(format!("invalid rotor key `{key}`")))?;
            if indexed.insert(index, Vector3::new(p[0], p[1], p[2])).is_some() {
                return Err(D::Error::custom(format!("duplicate rotor index {index}")));
            }
        }

        for (expected, &index) in (1..).zip(indexed.keys()) {
            if index != expected {
                return Err(D::Error::custom(format!("rotor r{expected} is missing")));
            }
        }

        Ok(indexed.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const QUAD_TOML: &str = r#"
        mass = 0.5
        Ixx = 3.65e-3
        Iyy = 3.68e-3
        Izz = 7.03e-3
        Ixy = 0.0
        Ixz = 0.0
        Iyz = 0.0
        c_Dx = 0.0
        c_Dy = 0.0
        c_Dz = 0.0
        num_rotors = 4
        rotor_speed_min = 0.0
        rotor_speed_max = 1500.0
        k_eta = 5.57e-6
        k_m = 1.36e-7
        k_d = 0.0
        k_z = 0.0
        k_flap = 0.0
        tau_m = 0.005

        [rotor_pos]
        r1 = [0.1, 0.1, 0.0]
        r2 = [-0.1, 0.1, 0.0]
        r3 = [-0.1, -0.1, 0.0]
        r4 = [0.1, -0.1, 0.0]
    "#;

    #[test]
    fn test_parse_toml() {
        let params = VehicleParameters::from_toml_str(QUAD_TOML).unwrap();

        assert_eq!(params.num_rotors, 4);
        assert_eq!(params.rotor_pos[1], Vector3::new(-0.1, 0.1, 0.0));
        assert_relative_eq!(params.iyy, 3.68e-3);
        assert!(params.rotor_directions.is_none());
        assert_eq!(
            params.spin_directions(),
            vec![
                SpinDirection::Cw,
                SpinDirection::Ccw,
                SpinDirection::Cw,
                SpinDirection::Ccw
            ]
        );
    }

    #[test]
    fn test_rotor_keys_sort_numerically() {
        let mut rotors = String::from("[rotor_pos]\n");
        for i in (1..=10).rev() {
            rotors.push_str(&format!("r{i} = [{i}.0, 0.0, 0.0]\n"));
        }
        let doc = QUAD_TOML
            .split("[rotor_pos]")
            .next()
            .unwrap()
            .replace("num_rotors = 4", "num_rotors = 10")
            + &rotors;

        let params = VehicleParameters::from_toml_str(&doc).unwrap();
        let xs: Vec<f64> = params.rotor_pos.iter().map(|p| p.x).collect();
        assert_eq!(xs, (1..=10).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_rotor_key_rejected() {
        let doc = QUAD_TOML.replace("r3 = [-0.1, -0.1, 0.0]", "r5 = [-0.1, -0.1, 0.0]");
        assert!(matches!(
            VehicleParameters::from_toml_str(&doc),
            Err(ControlError::Parse(_))
        ));
    }

    #[test]
    fn test_explicit_directions() {
        let doc = QUAD_TOML.replace(
            "tau_m = 0.005",
            "tau_m = 0.005\nrotor_directions = [\"ccw\", \"ccw\", \"cw\", \"cw\"]",
        );
        let params = VehicleParameters::from_toml_str(&doc).unwrap();
        assert_eq!(
            params.spin_directions(),
            vec![
                SpinDirection::Ccw,
                SpinDirection::Ccw,
                SpinDirection::Cw,
                SpinDirection::Cw
            ]
        );
    }

    #[test]
    fn test_toml_round_trip_keeps_external_keys() {
        let params = VehicleParameters::crazyflie();
        let doc = toml::to_string(&params).unwrap();

        assert!(doc.contains("Ixx"));
        assert!(doc.contains("c_Dz"));
        assert!(doc.contains("r4"));

        let back = VehicleParameters::from_toml_str(&doc).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_validate_rejects_bad_mass() {
        let mut params = VehicleParameters::crazyflie();
        params.mass = 0.0;
        assert!(matches!(
            params.validate(),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_indefinite_inertia() {
        let mut params = VehicleParameters::crazyflie();
        params.ixy = 1.0;
        assert!(matches!(
            params.validate(),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_rotor_count() {
        let mut params = VehicleParameters::crazyflie();
        params.num_rotors = 1;
        params.rotor_pos.truncate(1);
        assert!(params.validate().is_err());

        let mut params = VehicleParameters::crazyflie();
        params.num_rotors = 6;
        assert!(params.validate().is_err());

        let mut params = VehicleParameters::crazyflie();
        params.rotor_directions = Some(vec![SpinDirection::Cw; 3]);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_yaw_ratio() {
        let mut params = VehicleParameters::crazyflie();
        params.k_eta = 1e-10;
        params.k_m = 1e300;
        assert!(matches!(
            params.validate(),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_gains() {
        let gains = ControlGains::default();
        assert_eq!(gains.kp_pos, Vector3::new(6.5, 6.5, 15.0));
        assert_relative_eq!(gains.kd_att, 46.64);

        let doc = r#"
            kp_pos = [1.0, 2.0, 3.0]
            kd_pos = [0.5, 0.5, 1.0]
            kp_att = 100.0
            kd_att = 20.0
            g = 9.80665
        "#;
        let parsed = ControlGains::from_toml_str(doc).unwrap();
        assert_eq!(parsed.kp_pos, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(parsed.g, 9.80665);
    }
}
