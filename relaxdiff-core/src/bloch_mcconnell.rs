//! Two-pool Bloch–McConnell exchange dynamics.
//!
//! Each voxel carries `(Mx_a, My_a, Mz_a, Mx_b, My_b, Mz_b)`. Pools relax toward
//! their own equilibrium, precess at their own offset, share the RF field and
//! exchange longitudinal magnetization at rates `kab` (A→B) and `kba` (B→A).
//! Voxels never interact, so a batch is a set of independent solves.

use std::array;

use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView2, ArrayViewD, Axis, Ix1, Ix2};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, SimError};
use crate::ode::{
    Dopri5, OdeError, OdeSystem, SolveStats, SolverOptions, Trajectory, integration_direction,
};

/// Components per voxel.
pub const STATE_LEN: usize = 6;

/// Relaxation, exchange and off-resonance coefficients. Rates are in 1/s,
/// frequencies in rad/s.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BlochMcConnellParams {
    pub r1a: f64,
    pub r2a: f64,
    pub r1b: f64,
    pub r2b: f64,
    pub kab: f64,
    pub kba: f64,
    pub delta_a: f64,
    pub delta_b: f64,
    pub omega1: f64,
    pub m0a: f64,
    pub m0b: f64,
}

impl Default for BlochMcConnellParams {
    fn default() -> Self {
        BlochMcConnellParams {
            r1a: 0.0,
            r2a: 0.0,
            r1b: 0.0,
            r2b: 0.0,
            kab: 0.0,
            kba: 0.0,
            delta_a: 0.0,
            delta_b: 0.0,
            omega1: 0.0,
            m0a: 1.0,
            m0b: 1.0,
        }
    }
}

impl BlochMcConnellParams {
    /// Both pools share relaxation rates and offset; unit equilibrium magnetization.
    pub fn symmetric(r1: f64, r2: f64, kab: f64, kba: f64, delta: f64, omega1: f64) -> Self {
        BlochMcConnellParams {
            r1a: r1,
            r2a: r2,
            r1b: r1,
            r2b: r2,
            kab,
            kba,
            delta_a: delta,
            delta_b: delta,
            omega1,
            ..Default::default()
        }
    }
}

impl OdeSystem<STATE_LEN> for BlochMcConnellParams {
    fn rhs(&self, _t: f64, m: &[f64; STATE_LEN]) -> [f64; STATE_LEN] {
        let [mx_a, my_a, mz_a, mx_b, my_b, mz_b] = *m;
        let p = self;
        [
            -p.r2a * mx_a + p.delta_a * my_a,
            -p.delta_a * mx_a - p.r2a * my_a + p.omega1 * mz_a,
            -p.omega1 * my_a - p.r1a * (mz_a - p.m0a) - p.kab * mz_a + p.kba * mz_b,
            -p.r2b * mx_b + p.delta_b * my_b,
            -p.delta_b * mx_b - p.r2b * my_b + p.omega1 * mz_b,
            -p.omega1 * my_b - p.r1b * (mz_b - p.m0b) + p.kab * mz_a - p.kba * mz_b,
        ]
    }
}

/// Magnetization of both pools at one voxel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MagnetizationState(pub [f64; STATE_LEN]);

impl MagnetizationState {
    /// Purely longitudinal state, no transverse component.
    pub fn longitudinal(mz_a: f64, mz_b: f64) -> Self {
        MagnetizationState([0.0, 0.0, mz_a, 0.0, 0.0, mz_b])
    }

    pub fn mx_a(&self) -> f64 {
        self.0[0]
    }
    pub fn my_a(&self) -> f64 {
        self.0[1]
    }
    pub fn mz_a(&self) -> f64 {
        self.0[2]
    }
    pub fn mx_b(&self) -> f64 {
        self.0[3]
    }
    pub fn my_b(&self) -> f64 {
        self.0[4]
    }
    pub fn mz_b(&self) -> f64 {
        self.0[5]
    }
}

impl From<[f64; STATE_LEN]> for MagnetizationState {
    fn from(v: [f64; STATE_LEN]) -> Self {
        MagnetizationState(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlochMcConnellResult {
    /// The requested time grid, unchanged.
    pub time: Array1<f64>,
    /// `(time, 6)` for a single state, `(voxel, time, 6)` for a batch.
    pub magnetization: ArrayD<f64>,
    /// Solver work per voxel.
    pub stats: Vec<SolveStats>,
}

impl BlochMcConnellResult {
    pub fn is_batch(&self) -> bool {
        self.magnetization.ndim() == 3
    }

    pub fn voxel_count(&self) -> usize {
        if self.is_batch() {
            self.magnetization.len_of(Axis(0))
        } else {
            1
        }
    }

    /// `(time, 6)` view of one voxel's trajectory.
    pub fn trajectory(&self, voxel: usize) -> Option<ArrayView2<'_, f64>> {
        if self.is_batch() {
            if voxel >= self.voxel_count() {
                return None;
            }
            self.magnetization
                .index_axis(Axis(0), voxel)
                .into_dimensionality::<Ix2>()
                .ok()
        } else if voxel == 0 {
            self.magnetization.view().into_dimensionality::<Ix2>().ok()
        } else {
            None
        }
    }

    /// State of one voxel at time index `k`.
    pub fn state(&self, voxel: usize, k: usize) -> Option<MagnetizationState> {
        let traj = self.trajectory(voxel)?;
        if k >= traj.nrows() {
            return None;
        }
        let row = traj.row(k);
        Some(MagnetizationState(array::from_fn(|i| row[i])))
    }
}

/// Integrates a single state `(6,)` or a batch `(n, 6)` over `times`.
///
/// A batch fails as a whole; the error names the lowest failing voxel.
pub fn integrate(
    states: ArrayViewD<'_, f64>,
    times: ArrayViewD<'_, f64>,
    params: &BlochMcConnellParams,
    opts: &SolverOptions,
) -> Result<BlochMcConnellResult> {
    let times_ndim = times.ndim();
    let times = times.into_dimensionality::<Ix1>().map_err(|_| {
        SimError::Shape(format!(
            "times must be a 1D sequence, got {times_ndim} dimensions"
        ))
    })?;
    let times: Vec<f64> = times.iter().copied().collect();

    let (voxels, batched) = match states.ndim() {
        1 => (vec![state_row(states.iter().copied())?], false),
        2 => {
            let rows = states
                .into_dimensionality::<Ix2>()
                .map_err(|e| SimError::Shape(e.to_string()))?;
            let voxels = rows
                .rows()
                .into_iter()
                .map(|row| state_row(row.iter().copied()))
                .collect::<Result<Vec<_>>>()?;
            (voxels, true)
        }
        n => {
            return Err(SimError::Shape(format!(
                "initial magnetization must have shape (6,) or (n, 6), got {n} dimensions"
            )));
        }
    };
    if voxels.is_empty() {
        return Err(SimError::Shape(
            "initial magnetization batch must contain at least one voxel".into(),
        ));
    }

    let trajectories = integrate_batch(&voxels, &times, params, opts)?;
    let stats = trajectories.iter().map(|t| t.stats).collect();

    let m = times.len();
    let flat: Vec<f64> = trajectories
        .iter()
        .flat_map(|t| t.states.iter().flatten().copied())
        .collect();
    let magnetization = if batched {
        Array3::from_shape_vec((voxels.len(), m, STATE_LEN), flat).map(|a| a.into_dyn())
    } else {
        Array2::from_shape_vec((m, STATE_LEN), flat).map(|a| a.into_dyn())
    }
    .map_err(|e| SimError::Shape(e.to_string()))?;

    Ok(BlochMcConnellResult {
        time: Array1::from(times),
        magnetization,
        stats,
    })
}

/// Integrates one voxel. The first state of the trajectory is `state` itself.
pub fn integrate_voxel(
    state: [f64; STATE_LEN],
    times: &[f64],
    params: &BlochMcConnellParams,
    opts: &SolverOptions,
) -> Result<Trajectory<STATE_LEN>> {
    let mut out = integrate_batch(&[state], times, params, opts)?;
    out.pop()
        .ok_or_else(|| SimError::Shape("empty batch".into()))
}

/// Integrates independent voxels, in parallel when the `parallel` feature is on.
///
/// Output position `i` always belongs to input voxel `i`.
pub fn integrate_batch(
    states: &[[f64; STATE_LEN]],
    times: &[f64],
    params: &BlochMcConnellParams,
    opts: &SolverOptions,
) -> Result<Vec<Trajectory<STATE_LEN>>> {
    check_times(times)?;
    let solver = Dopri5::new(*opts).map_err(|e| SimError::invalid("tolerance", e.to_string()))?;
    debug!(
        voxels = states.len(),
        samples = times.len(),
        rtol = solver.options().rtol,
        atol = solver.options().atol,
        "bloch-mcconnell batch"
    );

    #[cfg(feature = "parallel")]
    let outcomes: Vec<std::result::Result<Trajectory<STATE_LEN>, OdeError>> = states
        .par_iter()
        .map(|&y0| solver.solve(params, y0, times))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let outcomes: Vec<std::result::Result<Trajectory<STATE_LEN>, OdeError>> = states
        .iter()
        .map(|&y0| solver.solve(params, y0, times))
        .collect();

    outcomes
        .into_iter()
        .enumerate()
        .map(|(voxel, outcome)| {
            outcome.map_err(|e| SimError::Integration {
                voxel,
                message: e.to_string(),
            })
        })
        .collect()
}

fn check_times(times: &[f64]) -> Result<()> {
    if times.is_empty() {
        return Err(SimError::invalid("times", "at least one time point is required"));
    }
    integration_direction(times)
        .map(|_| ())
        .map_err(|e| SimError::invalid("times", e.to_string()))
}

fn state_row<I: ExactSizeIterator<Item = f64>>(values: I) -> Result<[f64; STATE_LEN]> {
    let len = values.len();
    let values: Vec<f64> = values.collect();
    <[f64; STATE_LEN]>::try_from(values).map_err(|_| {
        SimError::Shape(format!(
            "initial magnetization must have {STATE_LEN} components per voxel, got {len}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn, array};

    #[test]
    fn equilibrium_is_a_fixed_point_without_exchange() {
        let params = BlochMcConnellParams::symmetric(1.0, 5.0, 0.0, 0.0, 3.0, 0.0);
        let d = params.rhs(0.0, &MagnetizationState::longitudinal(1.0, 1.0).0);
        assert!(d.iter().all(|v| v.abs() < 1e-15));
    }

    #[test]
    fn rhs_matches_hand_computed_derivative() {
        let params = BlochMcConnellParams {
            r1a: 1.0,
            r2a: 2.0,
            r1b: 3.0,
            r2b: 4.0,
            kab: 0.5,
            kba: 0.25,
            delta_a: 10.0,
            delta_b: -10.0,
            omega1: 2.0,
            m0a: 1.0,
            m0b: 0.5,
        };
        let d = params.rhs(0.0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_abs_diff_eq!(d[0], -2.0 + 20.0);
        assert_abs_diff_eq!(d[1], -10.0 - 4.0 + 6.0);
        assert_abs_diff_eq!(d[2], -4.0 - 2.0 - 1.5 + 1.5);
        assert_abs_diff_eq!(d[3], -16.0 - 50.0);
        assert_abs_diff_eq!(d[4], 40.0 - 20.0 + 12.0);
        assert_abs_diff_eq!(d[5], -10.0 - 16.5 + 1.5 - 1.5);
    }

    #[test]
    fn single_state_gives_rank_two_result() {
        let params = BlochMcConnellParams::symmetric(1.0, 5.0, 1.0, 1.0, 0.0, 0.0);
        let state = array![0.0, 0.0, 0.5, 0.0, 0.0, 0.5].into_dyn();
        let times = array![0.0, 0.5, 1.0].into_dyn();
        let opts = SolverOptions::default();
        let out = integrate(state.view(), times.view(), &params, &opts).unwrap();

        assert_eq!(out.magnetization.shape(), &[3, 6]);
        assert!(!out.is_batch());
        assert_eq!(out.voxel_count(), 1);
        assert_eq!(out.time.to_vec(), vec![0.0, 0.5, 1.0]);
        assert_eq!(out.state(0, 0), Some(MagnetizationState::longitudinal(0.5, 0.5)));
        assert!(out.trajectory(1).is_none());
    }

    #[test]
    fn explicit_single_voxel_batch_keeps_batch_axis() {
        let params = BlochMcConnellParams::default();
        let states = Array2::<f64>::zeros((1, 6)).into_dyn();
        let times = array![0.0, 1.0].into_dyn();
        let opts = SolverOptions::default();
        let out = integrate(states.view(), times.view(), &params, &opts).unwrap();
        assert_eq!(out.magnetization.shape(), &[1, 2, 6]);
        assert!(out.is_batch());
    }

    #[test]
    fn single_time_point_returns_initial_state() {
        let state = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let traj = integrate_voxel(
            state,
            &[4.0],
            &BlochMcConnellParams::symmetric(1.0, 1.0, 1.0, 1.0, 1.0, 1.0),
            &SolverOptions::default(),
        )
        .unwrap();
        assert_eq!(traj.states, vec![state]);
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let params = BlochMcConnellParams::default();
        let opts = SolverOptions::default();
        let good_state = array![0.0, 0.0, 1.0, 0.0, 0.0, 1.0].into_dyn();
        let good_times = array![0.0, 1.0].into_dyn();

        let times_2d = Array2::<f64>::zeros((2, 2)).into_dyn();
        let err = integrate(good_state.view(), times_2d.view(), &params, &opts).unwrap_err();
        assert!(matches!(err, SimError::Shape(_)));

        let five = array![[0.0, 0.0, 1.0, 0.0, 0.0]].into_dyn();
        let err = integrate(five.view(), good_times.view(), &params, &opts).unwrap_err();
        assert!(matches!(err, SimError::Shape(_)));

        let cube = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 6]));
        assert!(matches!(
            integrate(cube.view(), good_times.view(), &params, &opts),
            Err(SimError::Shape(_))
        ));

        let empty = Array2::<f64>::zeros((0, 6)).into_dyn();
        assert!(matches!(
            integrate(empty.view(), good_times.view(), &params, &opts),
            Err(SimError::Shape(_))
        ));
    }

    #[test]
    fn bad_time_grids_and_tolerances_are_invalid_parameters() {
        let params = BlochMcConnellParams::default();
        let state = [0.0; 6];
        let opts = SolverOptions::default();

        assert!(matches!(
            integrate_voxel(state, &[], &params, &opts),
            Err(SimError::InvalidParameter { name: "times", .. })
        ));
        assert!(matches!(
            integrate_voxel(state, &[0.0, 1.0, 0.5], &params, &opts),
            Err(SimError::InvalidParameter { name: "times", .. })
        ));
        let negative_rtol = SolverOptions::with_tolerances(-1.0, 1e-9);
        assert!(matches!(
            integrate_voxel(state, &[0.0, 1.0], &params, &negative_rtol),
            Err(SimError::InvalidParameter { name: "tolerance", .. })
        ));
    }

    #[test]
    fn batch_failure_names_lowest_failing_voxel() {
        let params = BlochMcConnellParams::symmetric(1.0, 1.0, 0.5, 0.5, 0.0, 0.0);
        let states = [
            [0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, f64::NAN, 0.0, 0.0, 1.0],
            [f64::INFINITY, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let err = integrate_batch(&states, &[0.0, 1.0], &params, &SolverOptions::default())
            .unwrap_err();
        match err {
            SimError::Integration { voxel, message } => {
                assert_eq!(voxel, 1);
                assert!(message.contains("non-finite"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exhausted_step_budget_is_an_integration_error() {
        let params = BlochMcConnellParams::symmetric(1.0, 5.0, 1.0, 1.0, 50.0, 20.0);
        let opts = SolverOptions {
            max_steps: 2,
            ..Default::default()
        };
        let err = integrate_voxel([0.0, 0.0, 1.0, 0.0, 0.0, 1.0], &[0.0, 10.0], &params, &opts)
            .unwrap_err();
        assert!(matches!(err, SimError::Integration { voxel: 0, .. }));
    }
}
