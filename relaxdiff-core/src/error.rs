use thiserror::Error;

/// Errors surfaced by the diffusion stepper and the Bloch–McConnell integrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Input array has the wrong rank or trailing dimension.
    #[error("shape error: {0}")]
    Shape(String),

    /// A supplied or derived numeric parameter is outside its valid domain.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The adaptive ODE solver gave up on one voxel.
    #[error("integration failed for voxel {voxel}: {message}")]
    Integration { voxel: usize, message: String },
}

impl SimError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SimError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
