//! Physical invariants of the explicit diffusion stepper.

use approx::assert_abs_diff_eq;
use ndarray::{Array2, ArrayD, IxDyn};
use proptest::prelude::*;
use relaxdiff_core::{DiffusionConfig, SimError, diffuse, diffuse_field};

fn field_strategy() -> impl Strategy<Value = Array2<f64>> {
    (1usize..10, 1usize..10).prop_flat_map(|(rows, cols)| {
        prop::collection::vec(0.0f64..1.0, rows * cols)
            .prop_map(move |v| Array2::from_shape_vec((rows, cols), v).unwrap())
    })
}

proptest! {
    #[test]
    fn zero_flux_boundaries_conserve_total(
        field in field_strategy(),
        coefficient in 0.01f64..1.0,
        dx in 0.5f64..2.0,
        total_time in 0.0f64..5.0,
    ) {
        let before = field.sum();
        let cfg = DiffusionConfig::new(coefficient, dx, total_time);
        let out = diffuse_field(field.view(), &cfg).unwrap();
        prop_assert!((out.field.sum() - before).abs() < 1e-9 * field.len().max(1) as f64);
    }

    #[test]
    fn stable_step_respects_maximum_principle(
        field in field_strategy(),
        coefficient in 0.01f64..1.0,
        total_time in 0.0f64..3.0,
    ) {
        let lo = field.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = field.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let cfg = DiffusionConfig::new(coefficient, 1.0, total_time);
        let out = diffuse_field(field.view(), &cfg).unwrap();
        for &v in out.field.iter() {
            prop_assert!(v >= lo - 1e-12 && v <= hi + 1e-12);
        }
    }

    #[test]
    fn recorded_times_are_ascending_step_multiples(
        snapshots in prop::collection::vec(0.0f64..2.0, 1..6),
    ) {
        let cfg = DiffusionConfig::new(1.0, 1.0, 1.5).with_dt(0.1).with_snapshots(snapshots);
        let out = diffuse_field(Array2::<f64>::zeros((2, 2)).view(), &cfg).unwrap();
        for pair in out.time_points.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        for t in &out.time_points {
            let k = (t / out.dt).round();
            prop_assert!((t - k * out.dt).abs() < 1e-12);
            prop_assert!(k >= 1.0 && k as usize <= out.steps);
        }
    }
}

#[test]
fn long_run_relaxes_to_the_mean() {
    let mut field = Array2::<f64>::zeros((5, 5));
    field[[2, 2]] = 1.0;
    let out = diffuse_field(field.view(), &DiffusionConfig::new(1.0, 1.0, 200.0)).unwrap();
    for &v in out.field.iter() {
        assert_abs_diff_eq!(v, 1.0 / 25.0, epsilon = 1e-6);
    }
}

#[test]
fn step_count_is_ceiling_of_duration_over_dt() {
    let cfg = DiffusionConfig::new(0.1, 1.0, 1.0);
    let out = diffuse_field(Array2::<f64>::zeros((3, 3)).view(), &cfg).unwrap();
    // dt = 0.9 / 0.4 = 2.25, one step covers the whole run
    assert_abs_diff_eq!(out.dt, 2.25, epsilon = 1e-12);
    assert_eq!(out.steps, 1);
    assert_eq!(out.time_points, vec![out.dt]);
}

#[test]
fn rank_checks_on_dynamic_input() {
    let flat = ArrayD::<f64>::zeros(IxDyn(&[9]));
    assert!(matches!(
        diffuse(flat.view(), &DiffusionConfig::default()),
        Err(SimError::Shape(_))
    ));
    let volume = ArrayD::<f64>::zeros(IxDyn(&[3, 3, 3]));
    assert!(matches!(
        diffuse(volume.view(), &DiffusionConfig::default()),
        Err(SimError::Shape(_))
    ));
}
