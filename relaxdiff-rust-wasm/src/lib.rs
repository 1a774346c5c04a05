use ndarray::Array2;
use relaxdiff_core::{
    BlochMcConnellParams, DiffusionConfig, MagnetizationState, SimError, SolverOptions,
    diffuse_field, integrate_voxel,
};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct Simulator {
    field: Array2<f64>,
    diffusion: f64,
    dx: f64,
    params: BlochMcConnellParams,
    solver: SolverOptions,
}

#[wasm_bindgen]
impl Simulator {
    #[wasm_bindgen(constructor)]
    pub fn new(rows: usize, cols: usize) -> Result<Simulator, JsValue> {
        if rows == 0 || cols == 0 {
            return Err(JsValue::from_str("rows and cols must be >= 1"));
        }
        Ok(Simulator {
            field: Array2::zeros((rows, cols)),
            diffusion: 0.1,
            dx: 1.0,
            params: BlochMcConnellParams::symmetric(1.0, 5.0, 1.0, 1.0, 0.0, 0.0),
            solver: SolverOptions::default(),
        })
    }

    // Parameters
    pub fn set_diffusion(&mut self, d: f64) { self.diffusion = d; }
    pub fn set_dx(&mut self, dx: f64) { self.dx = dx; }
    pub fn set_exchange(&mut self, kab: f64, kba: f64) {
        self.params.kab = kab;
        self.params.kba = kba;
    }
    pub fn set_relaxation(&mut self, r1: f64, r2: f64) {
        self.params.r1a = r1;
        self.params.r1b = r1;
        self.params.r2a = r2;
        self.params.r2b = r2;
    }
    pub fn set_rf(&mut self, omega1: f64, delta: f64) {
        self.params.omega1 = omega1;
        self.params.delta_a = delta;
        self.params.delta_b = delta;
    }
    pub fn set_tolerances(&mut self, rtol: f64, atol: f64) {
        self.solver.rtol = rtol;
        self.solver.atol = atol;
    }

    pub fn rows(&self) -> usize { self.field.nrows() }
    pub fn cols(&self) -> usize { self.field.ncols() }

    /// Row-major intensities, expected already normalized; clamped into [0, 1].
    pub fn set_field(&mut self, values: Vec<f32>) -> Result<(), JsValue> {
        self.load_field(&values).map_err(|e| JsValue::from_str(&e))
    }

    // Copy-based JS access (reliable)
    pub fn get_field(&self) -> Vec<f32> {
        self.field.iter().map(|&v| v as f32).collect()
    }

    /// Diffuse the current field for `total_time` (timed, WASM-only).
    pub fn diffuse(&mut self, total_time: f64) -> Result<StepInfo, JsValue> {
        let t0 = now_ms();
        let (steps, dt) = self.run_diffusion(total_time).map_err(to_js)?;
        let t1 = now_ms();
        Ok(StepInfo { steps: steps as u32, dt, compute_ms: t1 - t0 })
    }

    /// Center-voxel trajectory, flattened `samples x 6`.
    pub fn relax_center(&self, total_time: f64, samples: usize) -> Result<Vec<f64>, JsValue> {
        self.center_trajectory(total_time, samples).map_err(to_js)
    }
}

impl Simulator {
    fn load_field(&mut self, values: &[f32]) -> Result<(), String> {
        if values.len() != self.field.len() {
            return Err(format!(
                "expected {} values, got {}",
                self.field.len(),
                values.len()
            ));
        }
        for (dst, &v) in self.field.iter_mut().zip(values) {
            *dst = (v as f64).clamp(0.0, 1.0);
        }
        Ok(())
    }

    fn run_diffusion(&mut self, total_time: f64) -> Result<(usize, f64), SimError> {
        let cfg = DiffusionConfig::new(self.diffusion, self.dx, total_time);
        let out = diffuse_field(self.field.view(), &cfg)?;
        self.field = out.field;
        Ok((out.steps, out.dt))
    }

    fn center_trajectory(&self, total_time: f64, samples: usize) -> Result<Vec<f64>, SimError> {
        let (rows, cols) = self.field.dim();
        let mz_a0 = self.field[[rows / 2, cols / 2]];
        let initial = MagnetizationState::longitudinal(mz_a0, (1.0 - mz_a0).max(1e-3));

        let times: Vec<f64> = match samples {
            0 | 1 => vec![0.0],
            n => (0..n).map(|i| total_time * i as f64 / (n - 1) as f64).collect(),
        };
        let traj = integrate_voxel(initial.0, &times, &self.params, &self.solver)?;
        Ok(traj.states.iter().flatten().copied().collect())
    }
}

#[wasm_bindgen]
pub struct StepInfo {
    steps: u32,
    dt: f64,
    compute_ms: f64,
}

#[wasm_bindgen]
impl StepInfo {
    pub fn steps(&self) -> u32 { self.steps }
    pub fn dt(&self) -> f64 { self.dt }
    pub fn compute_ms(&self) -> f64 { self.compute_ms }
}

fn to_js(e: SimError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn now_ms() -> f64 {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now())
        .unwrap_or(0.0)
}
