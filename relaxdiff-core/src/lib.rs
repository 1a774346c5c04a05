//! Numerical core: explicit 2D diffusion and two-pool Bloch–McConnell dynamics.
//!
//! Both solvers are stateless functions; every call owns its buffers and
//! returns owned results.

pub mod bloch_mcconnell;
pub mod diffusion;
pub mod error;
pub mod ode;

pub use bloch_mcconnell::{
    BlochMcConnellParams, BlochMcConnellResult, MagnetizationState, STATE_LEN, integrate,
    integrate_batch, integrate_voxel,
};
pub use diffusion::{DiffusionConfig, DiffusionResult, diffuse, diffuse_field, laplacian};
pub use error::{Result, SimError};
pub use ode::{Dopri5, OdeError, OdeSystem, SolveStats, SolverOptions, Trajectory};
