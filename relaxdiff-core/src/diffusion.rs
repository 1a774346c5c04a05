//! Explicit finite-difference diffusion on a 2D scalar field.
//!
//! Each step applies the 5-point Laplacian under zero-flux (Neumann) boundaries
//! and advances the field with forward Euler:
//!
//! ```text
//! u' = u + D * dt / dx² * (up + down + left + right - 4u)
//! ```
//!
//! Edge cells see themselves as their missing neighbour, so no mass leaves the grid.

use std::collections::HashSet;

use ndarray::{Array2, ArrayView2, ArrayViewD, Ix2};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Result, SimError};

/// Fraction of the stability bound `dx² / (4D)` used when `dt` is derived.
pub const STABILITY_SAFETY: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiffusionConfig {
    /// Diffusion coefficient `D`.
    pub coefficient: f64,
    /// Spatial step.
    pub dx: f64,
    /// Time step. Derived from the stability bound when `None`.
    pub dt: Option<f64>,
    pub total_time: f64,
    /// Times to record, matched to the nearest step. `None` (or empty) records every step.
    pub snapshot_times: Option<Vec<f64>>,
    /// Keep a copy of the field at every recorded time.
    pub keep_frames: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        DiffusionConfig {
            coefficient: 0.1,
            dx: 1.0,
            dt: None,
            total_time: 1.0,
            snapshot_times: None,
            keep_frames: false,
        }
    }
}

impl DiffusionConfig {
    pub fn new(coefficient: f64, dx: f64, total_time: f64) -> Self {
        DiffusionConfig {
            coefficient,
            dx,
            total_time,
            ..Default::default()
        }
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = Some(dt);
        self
    }

    pub fn with_snapshots<I: IntoIterator<Item = f64>>(mut self, times: I) -> Self {
        self.snapshot_times = Some(times.into_iter().collect());
        self
    }

    pub fn with_frames(mut self, keep: bool) -> Self {
        self.keep_frames = keep;
        self
    }

    /// Largest step for which the explicit update stays bounded.
    pub fn stability_limit(&self) -> f64 {
        self.dx * self.dx / (4.0 * self.coefficient)
    }

    /// Step used when the caller leaves `dt` unset.
    pub fn stable_dt(&self) -> f64 {
        STABILITY_SAFETY * self.dx * self.dx / (4.0 * self.coefficient)
    }

    /// The step that a run with this config will use.
    pub fn resolve_dt(&self) -> Result<f64> {
        let dt = self.dt.unwrap_or_else(|| self.stable_dt());
        if dt <= 0.0 {
            return Err(SimError::invalid(
                "dt",
                format!("time step must be positive, got {dt}"),
            ));
        }
        if !dt.is_finite() {
            return Err(SimError::invalid(
                "dt",
                format!("time step must be finite, got {dt}"),
            ));
        }
        Ok(dt)
    }

    /// Number of steps needed to cover `total_time`.
    pub fn step_count(&self, dt: f64) -> Result<usize> {
        if !self.total_time.is_finite() {
            return Err(SimError::invalid(
                "total_time",
                format!("must be finite, got {}", self.total_time),
            ));
        }
        let steps = (self.total_time / dt).ceil();
        Ok(if steps > 0.0 { steps as usize } else { 0 })
    }

    // Step indices to record, or `None` for every step.
    fn recorded_steps(&self, dt: f64) -> Result<Option<HashSet<i64>>> {
        let times = match self.snapshot_times.as_deref() {
            None | Some([]) => return Ok(None),
            Some(times) => times,
        };
        let mut steps = HashSet::with_capacity(times.len());
        for &t in times {
            if !t.is_finite() {
                return Err(SimError::invalid(
                    "snapshot_times",
                    format!("snapshot time must be finite, got {t}"),
                ));
            }
            // Ties go to the even step.
            steps.insert((t / dt).round_ties_even() as i64);
        }
        Ok(Some(steps))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionResult {
    /// Field after the last step.
    pub field: Array2<f64>,
    /// Ascending simulation times that were recorded.
    pub time_points: Vec<f64>,
    /// Step size actually used.
    pub dt: f64,
    pub steps: usize,
    /// Field copies matching `time_points`, filled only when `keep_frames` is set.
    pub frames: Vec<Array2<f64>>,
}

/// Run the stepper on an array of any rank; anything but a 2D grid is a shape error.
pub fn diffuse(initial: ArrayViewD<'_, f64>, cfg: &DiffusionConfig) -> Result<DiffusionResult> {
    let ndim = initial.ndim();
    let field = initial.into_dimensionality::<Ix2>().map_err(|_| {
        SimError::Shape(format!(
            "initial field must be 2-dimensional, got {ndim} dimensions"
        ))
    })?;
    diffuse_field(field, cfg)
}

pub fn diffuse_field(
    initial: ArrayView2<'_, f64>,
    cfg: &DiffusionConfig,
) -> Result<DiffusionResult> {
    let dt = cfg.resolve_dt()?;
    let steps = cfg.step_count(dt)?;
    let record = cfg.recorded_steps(dt)?;

    if cfg.dt.is_some() && dt > cfg.stability_limit() {
        warn!(
            dt,
            limit = cfg.stability_limit(),
            "time step exceeds the explicit stability bound"
        );
    }

    let (rows, cols) = initial.dim();
    debug!(rows, cols, dt, steps, "diffusion run");

    let mut grid = Grid::new(rows, cols, initial.iter().copied().collect());
    let c = cfg.coefficient * dt / (cfg.dx * cfg.dx);

    let mut time_points = Vec::new();
    let mut frames = Vec::new();
    for step in 1..=steps {
        grid.explicit_step(c);

        let recorded = record
            .as_ref()
            .is_none_or(|wanted| wanted.contains(&(step as i64)));
        if recorded {
            time_points.push(step as f64 * dt);
            if cfg.keep_frames {
                frames.push(grid.to_array()?);
            }
        }
    }

    Ok(DiffusionResult {
        field: grid.into_array()?,
        time_points,
        dt,
        steps,
        frames,
    })
}

/// Discrete 5-point Laplacian with zero-flux boundaries.
pub fn laplacian(field: ArrayView2<'_, f64>) -> Array2<f64> {
    let (rows, cols) = field.dim();
    let src: Vec<f64> = field.iter().copied().collect();
    Array2::from_shape_fn((rows, cols), |(y, x)| laplacian_at(&src, rows, cols, y, x))
}

#[inline]
fn laplacian_at(src: &[f64], rows: usize, cols: usize, y: usize, x: usize) -> f64 {
    let i = y * cols + x;
    let u = src[i];
    let up = if y > 0 { src[i - cols] } else { u };
    let down = if y + 1 < rows { src[i + cols] } else { u };
    let left = if x > 0 { src[i - 1] } else { u };
    let right = if x + 1 < cols { src[i + 1] } else { u };
    (up + down + left + right) - 4.0 * u
}

fn update_row(src: &[f64], rows: usize, cols: usize, y: usize, c: f64, out: &mut [f64]) {
    let row = y * cols;
    for (x, v) in out.iter_mut().enumerate() {
        *v = src[row + x] + c * laplacian_at(src, rows, cols, y, x);
    }
}

// Row-major working buffers; `next` is only ever read after a full step.
struct Grid {
    rows: usize,
    cols: usize,
    field: Vec<f64>,
    next: Vec<f64>,
}

impl Grid {
    fn new(rows: usize, cols: usize, field: Vec<f64>) -> Self {
        let next = vec![0.0; field.len()];
        Grid {
            rows,
            cols,
            field,
            next,
        }
    }

    fn explicit_step(&mut self, c: f64) {
        if self.field.is_empty() {
            return;
        }
        let (rows, cols) = (self.rows, self.cols);
        let src = &self.field;

        #[cfg(feature = "parallel")]
        self.next
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(y, out)| update_row(src, rows, cols, y, c, out));

        #[cfg(not(feature = "parallel"))]
        for (y, out) in self.next.chunks_mut(cols).enumerate() {
            update_row(src, rows, cols, y, c, out);
        }

        self.swap_buffers();
    }

    fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.field, &mut self.next);
    }

    fn to_array(&self) -> Result<Array2<f64>> {
        Array2::from_shape_vec((self.rows, self.cols), self.field.clone())
            .map_err(|e| SimError::Shape(e.to_string()))
    }

    fn into_array(self) -> Result<Array2<f64>> {
        Array2::from_shape_vec((self.rows, self.cols), self.field)
            .map_err(|e| SimError::Shape(e.to_string()))
    }
}
