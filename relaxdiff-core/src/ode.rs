//! Adaptive Dormand–Prince 5(4) integrator for small fixed-size systems.
//!
//! The fifth-order solution is propagated; the embedded fourth-order solution
//! only feeds the local error estimate. The last stage is evaluated at the new
//! point, so it doubles as the first stage of the next step (FSAL).
//!
//! Output times are hit exactly by shortening the step that would cross them.

use std::array;

use thiserror::Error;
use tracing::trace;

// Nodes.
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

// Runge–Kutta matrix.
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// Fifth-order weights (b2 = b7 = 0).
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// Difference between the fifth- and fourth-order weights.
const E1: f64 = -71.0 / 57600.0;
const E3: f64 = 71.0 / 16695.0;
const E4: f64 = -71.0 / 1920.0;
const E5: f64 = 17253.0 / 339200.0;
const E6: f64 = -22.0 / 525.0;
const E7: f64 = 1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
// 1 / (order of the error estimator + 1)
const ERROR_EXPONENT: f64 = -1.0 / 5.0;

/// Right-hand side `dy/dt = f(t, y)` of an `N`-dimensional system.
pub trait OdeSystem<const N: usize> {
    fn rhs(&self, t: f64, y: &[f64; N]) -> [f64; N];
}

impl<F, const N: usize> OdeSystem<N> for F
where
    F: Fn(f64, &[f64; N]) -> [f64; N],
{
    fn rhs(&self, t: f64, y: &[f64; N]) -> [f64; N] {
        self(t, y)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OdeError {
    #[error("invalid tolerance: {0}")]
    InvalidTolerance(String),

    #[error("time points must be strictly monotonic (violated at index {index})")]
    NonMonotonicTimes { index: usize },

    #[error("maximum number of steps ({max_steps}) exceeded at t = {t}")]
    StepBudgetExhausted { max_steps: usize, t: f64 },

    #[error("required step size {h:e} is less than spacing between numbers at t = {t}")]
    StepSizeUnderflow { t: f64, h: f64 },

    #[error("non-finite state or derivative at t = {t}")]
    NonFinite { t: f64 },
}

/// Step controller settings.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Budget of step attempts (accepted and rejected) for one solve.
    pub max_steps: usize,
    /// Upper bound on the step size. Unbounded by default; an unbounded value is
    /// left out when serialized.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "is_unbounded"))]
    pub max_step: f64,
    /// Initial step size. Chosen automatically when `None`.
    pub first_step: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            rtol: 1e-6,
            atol: 1e-9,
            max_steps: 500_000,
            max_step: f64::INFINITY,
            first_step: None,
        }
    }
}

impl SolverOptions {
    pub fn with_tolerances(rtol: f64, atol: f64) -> Self {
        SolverOptions {
            rtol,
            atol,
            ..Default::default()
        }
    }

    fn validated(mut self) -> Result<Self, OdeError> {
        if !self.atol.is_finite() || self.atol < 0.0 {
            return Err(OdeError::InvalidTolerance(format!(
                "atol must be finite and non-negative, got {}",
                self.atol
            )));
        }
        if !self.rtol.is_finite() || self.rtol < 0.0 {
            return Err(OdeError::InvalidTolerance(format!(
                "rtol must be finite and non-negative, got {}",
                self.rtol
            )));
        }
        let rtol_floor = 100.0 * f64::EPSILON;
        if self.rtol < rtol_floor {
            tracing::warn!(rtol = self.rtol, floor = rtol_floor, "rtol too small, clamping");
            self.rtol = rtol_floor;
        }
        if !(self.max_step > 0.0) {
            return Err(OdeError::InvalidTolerance(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        if let Some(h) = self.first_step {
            if !(h > 0.0 && h.is_finite()) {
                return Err(OdeError::InvalidTolerance(format!(
                    "first_step must be positive and finite, got {h}"
                )));
            }
        }
        Ok(self)
    }
}

#[cfg(feature = "serde")]
fn is_unbounded(step: &f64) -> bool {
    !step.is_finite()
}

/// Work counters for one solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolveStats {
    /// Right-hand-side evaluations.
    pub nfev: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// States at each requested time, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory<const N: usize> {
    pub states: Vec<[f64; N]>,
    pub stats: SolveStats,
}

/// Checks that `times` is strictly monotonic and returns the integration direction.
pub fn integration_direction(times: &[f64]) -> Result<f64, OdeError> {
    let direction = match times {
        [first, second, ..] if second < first => -1.0,
        _ => 1.0,
    };
    for (index, pair) in times.windows(2).enumerate() {
        let delta = direction * (pair[1] - pair[0]);
        if !(delta > 0.0) {
            return Err(OdeError::NonMonotonicTimes { index: index + 1 });
        }
    }
    Ok(direction)
}

#[derive(Debug, Clone)]
pub struct Dopri5 {
    opts: SolverOptions,
}

impl Dopri5 {
    pub fn new(opts: SolverOptions) -> Result<Self, OdeError> {
        Ok(Dopri5 {
            opts: opts.validated()?,
        })
    }

    pub fn options(&self) -> &SolverOptions {
        &self.opts
    }

    /// Integrates from `times[0]` through every later entry of `times`.
    ///
    /// The first state of the trajectory is `y0` itself.
    pub fn solve<S, const N: usize>(
        &self,
        sys: &S,
        y0: [f64; N],
        times: &[f64],
    ) -> Result<Trajectory<N>, OdeError>
    where
        S: OdeSystem<N> + ?Sized,
    {
        let mut states = Vec::with_capacity(times.len());
        let Some((&t0, rest)) = times.split_first() else {
            return Ok(Trajectory {
                states,
                stats: SolveStats::default(),
            });
        };
        states.push(y0);
        let Some(&t_end) = rest.last() else {
            return Ok(Trajectory {
                states,
                stats: SolveStats::default(),
            });
        };

        let direction = integration_direction(times)?;
        let interval = (t_end - t0).abs();
        let mut stepper = Stepper::start(sys, &self.opts, t0, y0, direction, interval)?;

        for &target in rest {
            while !stepper.step_toward(target)? {}
            states.push(stepper.y);
        }

        trace!(
            nfev = stepper.stats.nfev,
            accepted = stepper.stats.accepted,
            rejected = stepper.stats.rejected,
            "dopri5 solve finished"
        );
        Ok(Trajectory {
            states,
            stats: stepper.stats,
        })
    }
}

struct Stepper<'a, S: ?Sized, const N: usize> {
    sys: &'a S,
    opts: &'a SolverOptions,
    direction: f64,
    t: f64,
    y: [f64; N],
    f: [f64; N],
    h_abs: f64,
    attempts: usize,
    stats: SolveStats,
}

impl<'a, S, const N: usize> Stepper<'a, S, N>
where
    S: OdeSystem<N> + ?Sized,
{
    fn start(
        sys: &'a S,
        opts: &'a SolverOptions,
        t0: f64,
        y0: [f64; N],
        direction: f64,
        interval: f64,
    ) -> Result<Self, OdeError> {
        let f0 = sys.rhs(t0, &y0);
        if !all_finite(&y0) || !all_finite(&f0) {
            return Err(OdeError::NonFinite { t: t0 });
        }
        let mut stepper = Stepper {
            sys,
            opts,
            direction,
            t: t0,
            y: y0,
            f: f0,
            h_abs: 0.0,
            attempts: 0,
            stats: SolveStats {
                nfev: 1,
                ..Default::default()
            },
        };
        stepper.h_abs = match opts.first_step {
            Some(h) => h.min(interval),
            None => stepper.initial_step(interval),
        };
        Ok(stepper)
    }

    // Hairer, Nørsett & Wanner, "Solving ODEs I", section II.4.
    fn initial_step(&mut self, interval: f64) -> f64 {
        let (rtol, atol) = (self.opts.rtol, self.opts.atol);
        let scale: [f64; N] = array::from_fn(|i| atol + self.y[i].abs() * rtol);

        let d0 = rms_norm(&array::from_fn::<f64, N, _>(|i| self.y[i] / scale[i]));
        let d1 = rms_norm(&array::from_fn::<f64, N, _>(|i| self.f[i] / scale[i]));
        let h0 = (if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        })
        .min(interval);

        let y1: [f64; N] = array::from_fn(|i| self.y[i] + h0 * self.direction * self.f[i]);
        let f1 = self.sys.rhs(self.t + h0 * self.direction, &y1);
        self.stats.nfev += 1;

        let d2 = rms_norm(&array::from_fn::<f64, N, _>(|i| (f1[i] - self.f[i]) / scale[i])) / h0;
        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(-ERROR_EXPONENT)
        };

        (100.0 * h0).min(h1).min(interval)
    }

    // Takes one accepted step toward `target`; returns whether it landed on it.
    fn step_toward(&mut self, target: f64) -> Result<bool, OdeError> {
        let min_step = 10.0 * spacing(self.t);
        self.h_abs = self.h_abs.min(self.opts.max_step).max(min_step);
        let mut rejected = false;
        loop {
            if self.attempts >= self.opts.max_steps {
                return Err(OdeError::StepBudgetExhausted {
                    max_steps: self.opts.max_steps,
                    t: self.t,
                });
            }
            // Only a rejection can shrink the step below the floor.
            if self.h_abs < min_step {
                return Err(OdeError::StepSizeUnderflow {
                    t: self.t,
                    h: self.h_abs,
                });
            }

            let remaining = (target - self.t).abs();
            let lands = self.h_abs >= remaining;
            let h = (if lands { remaining } else { self.h_abs }) * self.direction;
            let t_new = if lands { target } else { self.t + h };

            let (y_new, f_new, err) = self.dopri_step(h);
            self.attempts += 1;
            self.stats.nfev += 6;

            let err_norm = self.error_norm(&err, &y_new);
            if !err_norm.is_finite() || !all_finite(&y_new) {
                return Err(OdeError::NonFinite { t: self.t });
            }

            if err_norm < 1.0 {
                let mut factor = if err_norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err_norm.powf(ERROR_EXPONENT)).min(MAX_FACTOR)
                };
                if rejected {
                    factor = factor.min(1.0);
                }
                let grown = h.abs() * factor;
                // A step cut short to land on an output time says nothing
                // against the step the controller had proposed.
                self.h_abs = if lands { grown.max(self.h_abs) } else { grown };

                self.t = t_new;
                self.y = y_new;
                self.f = f_new;
                self.stats.accepted += 1;
                return Ok(lands);
            }

            self.h_abs = h.abs() * (SAFETY * err_norm.powf(ERROR_EXPONENT)).max(MIN_FACTOR);
            self.stats.rejected += 1;
            rejected = true;
        }
    }

    fn dopri_step(&self, h: f64) -> ([f64; N], [f64; N], [f64; N]) {
        let (t, y, k1) = (self.t, &self.y, &self.f);
        let sys = self.sys;

        let k2 = sys.rhs(t + C2 * h, &combine(y, h, &[(A21, k1)]));
        let k3 = sys.rhs(t + C3 * h, &combine(y, h, &[(A31, k1), (A32, &k2)]));
        let k4 = sys.rhs(
            t + C4 * h,
            &combine(y, h, &[(A41, k1), (A42, &k2), (A43, &k3)]),
        );
        let k5 = sys.rhs(
            t + C5 * h,
            &combine(y, h, &[(A51, k1), (A52, &k2), (A53, &k3), (A54, &k4)]),
        );
        let k6 = sys.rhs(
            t + h,
            &combine(
                y,
                h,
                &[(A61, k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)],
            ),
        );

        let y_new = combine(y, h, &[(B1, k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)]);
        let k7 = sys.rhs(t + h, &y_new);

        let err = combine(
            &[0.0; N],
            h,
            &[(E1, k1), (E3, &k3), (E4, &k4), (E5, &k5), (E6, &k6), (E7, &k7)],
        );
        (y_new, k7, err)
    }

    fn error_norm(&self, err: &[f64; N], y_new: &[f64; N]) -> f64 {
        let (rtol, atol) = (self.opts.rtol, self.opts.atol);
        let scaled: [f64; N] =
            array::from_fn(|i| err[i] / (atol + rtol * self.y[i].abs().max(y_new[i].abs())));
        rms_norm(&scaled)
    }
}

// y + h * Σ a·k
fn combine<const N: usize>(y: &[f64; N], h: f64, terms: &[(f64, &[f64; N])]) -> [f64; N] {
    array::from_fn(|i| y[i] + h * terms.iter().map(|(a, k)| a * k[i]).sum::<f64>())
}

fn rms_norm<const N: usize>(v: &[f64; N]) -> f64 {
    if N == 0 {
        return 0.0;
    }
    (v.iter().map(|x| x * x).sum::<f64>() / N as f64).sqrt()
}

fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn spacing(t: f64) -> f64 {
    (t.abs() * f64::EPSILON).max(f64::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn decay(_t: f64, y: &[f64; 1]) -> [f64; 1] {
        [-y[0]]
    }

    fn oscillator(_t: f64, y: &[f64; 2]) -> [f64; 2] {
        [y[1], -y[0]]
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        let solver = Dopri5::new(SolverOptions::with_tolerances(1e-8, 1e-12)).unwrap();
        let times = [0.0, 0.5, 1.0, 2.0, 5.0];
        let traj = solver.solve(&decay, [1.0], &times).unwrap();

        assert_eq!(traj.states.len(), times.len());
        for (state, t) in traj.states.iter().zip(times) {
            assert_abs_diff_eq!(state[0], (-t).exp(), epsilon = 1e-7);
        }
        assert!(traj.stats.accepted > 0);
        assert!(traj.stats.nfev >= 6 * traj.stats.accepted);
    }

    #[test]
    fn oscillator_stays_on_circle_with_uneven_outputs() {
        let solver = Dopri5::new(SolverOptions::with_tolerances(1e-9, 1e-12)).unwrap();
        let times = [0.0, 0.01, 0.3, 2.0, 2.05, 6.0];
        let traj = solver.solve(&oscillator, [1.0, 0.0], &times).unwrap();
        for (state, t) in traj.states.iter().zip(times) {
            assert_abs_diff_eq!(state[0], t.cos(), epsilon = 1e-6);
            assert_abs_diff_eq!(state[1], -t.sin(), epsilon = 1e-6);
        }
    }

    #[test]
    fn integrates_backward_in_time() {
        let solver = Dopri5::new(SolverOptions::default()).unwrap();
        let times = [1.0, 0.5, 0.0];
        let traj = solver.solve(&decay, [(-1.0f64).exp()], &times).unwrap();
        assert_abs_diff_eq!(traj.states[2][0], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn tighter_tolerance_costs_more_evaluations() {
        let times = [0.0, 10.0];
        let loose = Dopri5::new(SolverOptions::with_tolerances(1e-3, 1e-6)).unwrap();
        let tight = Dopri5::new(SolverOptions::with_tolerances(1e-10, 1e-12)).unwrap();
        let a = loose.solve(&oscillator, [1.0, 0.0], &times).unwrap();
        let b = tight.solve(&oscillator, [1.0, 0.0], &times).unwrap();
        assert!(b.stats.nfev > a.stats.nfev);
    }

    #[test]
    fn single_and_empty_time_grids() {
        let solver = Dopri5::new(SolverOptions::default()).unwrap();
        let one = solver.solve(&decay, [3.0], &[2.0]).unwrap();
        assert_eq!(one.states, vec![[3.0]]);
        assert_eq!(one.stats.nfev, 0);

        let none = solver.solve(&decay, [3.0], &[]).unwrap();
        assert!(none.states.is_empty());
    }

    #[test]
    fn span_below_float_spacing_still_lands() {
        let solver = Dopri5::new(SolverOptions::default()).unwrap();
        let times = [1.0e6, 1.0e6 + 1.0e-9];
        let traj = solver.solve(&decay, [1.0], &times).unwrap();
        assert_eq!(traj.states.len(), 2);
        assert_abs_diff_eq!(traj.states[1][0], 1.0, epsilon = 1e-8);
        assert_eq!(traj.stats.accepted, 1);
    }

    #[test]
    fn step_budget_is_enforced() {
        let opts = SolverOptions {
            max_steps: 3,
            max_step: 0.01,
            ..Default::default()
        };
        let solver = Dopri5::new(opts).unwrap();
        let err = solver.solve(&decay, [1.0], &[0.0, 1.0]).unwrap_err();
        assert!(matches!(err, OdeError::StepBudgetExhausted { max_steps: 3, .. }));
    }

    #[test]
    fn blow_up_is_reported_as_non_finite() {
        let nan = |_t: f64, _y: &[f64; 1]| [f64::NAN];
        let solver = Dopri5::new(SolverOptions::default()).unwrap();
        let err = solver.solve(&nan, [1.0], &[0.0, 1.0]).unwrap_err();
        assert!(matches!(err, OdeError::NonFinite { .. }));
    }

    #[test]
    fn rejects_bad_time_grids_and_tolerances() {
        assert_eq!(
            integration_direction(&[0.0, 1.0, 1.0]),
            Err(OdeError::NonMonotonicTimes { index: 2 })
        );
        assert_eq!(
            integration_direction(&[0.0, 1.0, 0.5]),
            Err(OdeError::NonMonotonicTimes { index: 2 })
        );
        assert_eq!(integration_direction(&[2.0, 1.0]), Ok(-1.0));
        assert!(integration_direction(&[0.0, f64::NAN]).is_err());

        assert!(Dopri5::new(SolverOptions::with_tolerances(1e-6, -1.0)).is_err());
        assert!(Dopri5::new(SolverOptions::with_tolerances(f64::NAN, 1e-9)).is_err());
        let clamped = Dopri5::new(SolverOptions::with_tolerances(0.0, 1e-9)).unwrap();
        assert!(clamped.options().rtol > 0.0);
    }
}
