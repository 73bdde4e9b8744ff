//! `spec.md` §8 scenario 5: RMSNorm correctness. Normalizing 256 rows of
//! 1024 normally-distributed values with a unit weight should bring each
//! row's RMS to within 5e-2 of 1.0.

use exsa_core::compute::cpu_ref::rmsnorm;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

#[test]
fn normal_input_rows_normalize_to_unit_rms() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let cols = 1024;
    let weight = vec![1.0f32; cols];
    let eps = 1e-5;

    let mut max_deviation = 0f32;
    for _ in 0..256 {
        let row: Vec<f32> = (0..cols).map(|_| StandardNormal.sample(&mut rng)).collect();
        let normalized = rmsnorm(&row, &weight, eps);
        let rms = (normalized.iter().map(|v| v * v).sum::<f32>() / cols as f32).sqrt();
        max_deviation = max_deviation.max((rms - 1.0).abs());
    }

    assert!(max_deviation <= 5e-2, "max row-RMS deviation={max_deviation}");
}
