//! Error types for controller construction and the simulation harness.

use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur while building or driving a controller.
///
/// Per-step conditions such as a degenerate thrust direction are not errors;
/// they are reported through [`crate::control::CommandWarning`].
#[derive(Debug, Error)]
pub enum ControlError {
    /// Vehicle parameters are malformed or physically inconsistent.
    #[error("invalid vehicle configuration: {0}")]
    Configuration(String),

    /// Rotor geometry yields an allocation matrix without full row rank.
    #[error("allocation matrix for {num_rotors} rotors is singular (rank {rank} < 4)")]
    SingularAllocator { num_rotors: usize, rank: usize },

    /// A per-rotor vector does not match the vehicle's rotor count.
    #[error("expected {expected} rotor values, got {actual}")]
    RotorCountMismatch { expected: usize, actual: usize },

    /// TOML parameter file could not be parsed.
    #[error("failed to parse parameters: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parameter file could not be read.
    #[error("failed to read parameters: {0}")]
    Io(#[from] std::io::Error),

    /// Numerical integration of the vehicle model failed.
    #[error("integration failed: {0}")]
    Integration(String),
}

impl ControlError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration(details.into())
    }

    /// Create an integration error.
    #[must_use]
    pub fn integration(details: impl Into<String>) -> Self {
        Self::Integration(details.into())
    }
}
