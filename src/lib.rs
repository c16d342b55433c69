//! # se3-control
//!
//! Geometric tracking control for multirotors with an arbitrary number of
//! rotors in a planar layout.
//!
//! - [`allocation`]: rotor force to thrust/moment map and its inverse
//! - [`control`]: the per-step SE(3) control law
//! - [`params`]: vehicle parameters and gains, loadable from TOML
//! - [`math`]: skew/vee and quaternion boundary helpers
//! - [`dynamics`]: rigid-body model for closing the loop in tests and demos
//!
//! Quaternions are exchanged in `[x, y, z, w]` order.

pub mod allocation;
pub mod control;
pub mod dynamics;
pub mod error;
pub mod math;
pub mod params;

pub use allocation::Allocator;
pub use control::{
    AngularRateReference, CommandWarning, ControlCommand, FlatOutput, Se3Controller,
    VehicleState, YawRateOnly,
};
pub use error::{ControlError, Result};
pub use params::{ControlGains, SpinDirection, VehicleParameters};
