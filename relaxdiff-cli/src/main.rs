mod image;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use image::{SampleFormat, load_dicom, normalize, read_raw, write_f32_field};
use ndarray::Array2;
use relaxdiff_core::{
    BlochMcConnellParams, DiffusionConfig, MagnetizationState, SolveStats, SolverOptions,
    diffuse_field, integrate_batch, integrate_voxel,
};
use serde::Serialize;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Diffusion and Bloch-McConnell simulation on a DICOM image"
)]
struct Args {
    /// Path to the DICOM file (or a raw sample file with --rows/--cols)
    input: PathBuf,

    /// Read the input as a headerless raw image with this many rows
    #[arg(long, requires = "cols")]
    rows: Option<usize>,

    /// Columns of a raw input
    #[arg(long, requires = "rows")]
    cols: Option<usize>,

    /// Sample format of a raw input (little-endian, row-major)
    #[arg(long, value_enum, default_value_t = SampleFormat::U16)]
    dtype: SampleFormat,

    /// Total simulated time (arbitrary units)
    #[arg(long, default_value_t = 1.0)]
    time: f64,

    /// Diffusion coefficient
    #[arg(long, default_value_t = 0.1)]
    diffusion: f64,

    /// Spatial step size for diffusion
    #[arg(long, default_value_t = 1.0)]
    dx: f64,

    /// Exchange rate from pool A to B
    #[arg(long, default_value_t = 1.0)]
    kab: f64,

    /// Exchange rate from pool B to A
    #[arg(long, default_value_t = 1.0)]
    kba: f64,

    /// Longitudinal relaxation rate for both pools
    #[arg(long, default_value_t = 1.0)]
    r1: f64,

    /// Transverse relaxation rate for both pools
    #[arg(long, default_value_t = 5.0)]
    r2: f64,

    /// B1 amplitude (rad/s)
    #[arg(long, default_value_t = 0.0)]
    omega1: f64,

    /// Off-resonance frequency (rad/s) for both pools
    #[arg(long, default_value_t = 0.0)]
    delta: f64,

    /// JSON file with all eleven Bloch-McConnell coefficients; replaces the flags above
    #[arg(long)]
    params: Option<PathBuf>,

    /// Number of evenly spaced Bloch-McConnell time samples
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
    samples: u32,

    /// Relative tolerance of the ODE solver
    #[arg(long, default_value_t = 1e-6)]
    rtol: f64,

    /// Absolute tolerance of the ODE solver
    #[arg(long, default_value_t = 1e-9)]
    atol: f64,

    /// Also integrate every voxel of the diffused field as one batch
    #[arg(long)]
    batch: bool,

    /// Output directory for field.bin, trajectory.jsonl and summary.json
    #[arg(long)]
    out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct TrajectoryRow {
    sample_idx: usize,
    t: f64,
    mx_a: f64,
    my_a: f64,
    mz_a: f64,
    mx_b: f64,
    my_b: f64,
    mz_b: f64,
}

#[derive(Serialize)]
struct Summary<'a> {
    source: String,
    rows: usize,
    cols: usize,
    diffusion: &'a DiffusionConfig,
    dt: f64,
    steps: usize,
    center_intensity: f64,
    params: &'a BlochMcConnellParams,
    solver: &'a SolverOptions,
    center_stats: SolveStats,
    batch_mean_final: Option<(f64, f64)>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (pixels, source) = load_pixels(&args)?;
    let normalized = normalize(&pixels);
    let (rows, cols) = normalized.dim();
    if rows == 0 || cols == 0 {
        bail!("image is empty");
    }
    info!(rows, cols, %source, "image loaded");

    let diffusion = DiffusionConfig::new(args.diffusion, args.dx, args.time);
    let diffused = diffuse_field(normalized.view(), &diffusion)?;
    debug!(dt = diffused.dt, steps = diffused.steps, "diffusion finished");

    let mz_a0 = diffused.field[[rows / 2, cols / 2]];
    let mz_b0 = (1.0 - mz_a0).max(1e-3);
    let initial = MagnetizationState::longitudinal(mz_a0, mz_b0);

    let params: BlochMcConnellParams = match &args.params {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?
        }
        None => BlochMcConnellParams::symmetric(
            args.r1,
            args.r2,
            args.kab,
            args.kba,
            args.delta,
            args.omega1,
        ),
    };
    let solver = SolverOptions::with_tolerances(args.rtol, args.atol);

    let times = linspace(0.0, args.time, args.samples as usize);
    let center = integrate_voxel(initial.0, &times, &params, &solver)?;

    println!("Diffusion complete.");
    println!("Final diffusion pixel (center) intensity: {mz_a0:.4}");
    println!("Bloch-McConnell simulation (center voxel):");
    for (t, m) in times.iter().zip(&center.states) {
        let m = MagnetizationState(*m);
        println!("t={t:6.3}  Mz_a={:7.4}  Mz_b={:7.4}", m.mz_a(), m.mz_b());
    }

    let batch_mean = if args.batch {
        let mean = batch_mean_final(&diffused.field, &times, &params, &solver)?;
        println!(
            "Batch ({} voxels) mean final Mz_a={:7.4}  Mz_b={:7.4}",
            rows * cols,
            mean.0,
            mean.1
        );
        Some(mean)
    } else {
        None
    };

    if let Some(out) = &args.out {
        fs::create_dir_all(out)?;

        let mut field_writer = BufWriter::new(File::create(out.join("field.bin"))?);
        write_f32_field(&mut field_writer, &diffused.field)?;
        field_writer.flush()?;

        let mut traj_writer = BufWriter::new(File::create(out.join("trajectory.jsonl"))?);
        for (sample_idx, (&t, m)) in times.iter().zip(&center.states).enumerate() {
            let [mx_a, my_a, mz_a, mx_b, my_b, mz_b] = *m;
            let row = TrajectoryRow {
                sample_idx,
                t,
                mx_a,
                my_a,
                mz_a,
                mx_b,
                my_b,
                mz_b,
            };
            serde_json::to_writer(&mut traj_writer, &row)?;
            traj_writer.write_all(b"\n")?;
        }
        traj_writer.flush()?;

        let summary = Summary {
            source,
            rows,
            cols,
            diffusion: &diffusion,
            dt: diffused.dt,
            steps: diffused.steps,
            center_intensity: mz_a0,
            params: &params,
            solver: &solver,
            center_stats: center.stats,
            batch_mean_final: batch_mean,
        };
        let summary_file = File::create(out.join("summary.json"))?;
        serde_json::to_writer_pretty(summary_file, &summary)?;

        info!(dir = %out.display(), "wrote outputs");
    }

    Ok(())
}

fn load_pixels(args: &Args) -> anyhow::Result<(Array2<f64>, String)> {
    let source = args.input.display().to_string();
    let pixels = match (args.rows, args.cols) {
        (Some(rows), Some(cols)) => read_raw(&args.input, rows, cols, args.dtype)?,
        (None, None) => load_dicom(&args.input)?,
        _ => bail!("raw input needs both --rows and --cols"),
    };
    Ok((pixels, source))
}

// Every voxel seeds its own state the same way the center voxel does.
fn batch_mean_final(
    field: &Array2<f64>,
    times: &[f64],
    params: &BlochMcConnellParams,
    solver: &SolverOptions,
) -> anyhow::Result<(f64, f64)> {
    let voxels: Vec<[f64; 6]> = field
        .iter()
        .map(|&v| MagnetizationState::longitudinal(v, (1.0 - v).max(1e-3)).0)
        .collect();
    let trajectories = integrate_batch(&voxels, times, params, solver)?;

    let n = trajectories.len().max(1) as f64;
    let (sum_a, sum_b) = trajectories
        .iter()
        .filter_map(|t| t.states.last())
        .fold((0.0, 0.0), |(a, b), m| (a + m[2], b + m[5]));
    Ok((sum_a / n, sum_b / n))
}

/// `n` evenly spaced points from `start` to `stop` inclusive.
fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut out: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            out[n - 1] = stop;
            out
        }
    }
}
