//! Shared utilities for benchmarks.

#![allow(dead_code)]

use ndarray::Array2;
use rand::prelude::*;

use joinsketch::sketch::{n_pairs, Sketch};

// =============================================================================
// Data Generation
// =============================================================================

/// Random normalized seller sketch: counts of 1, values in [-5, 5].
pub fn random_seller(domain_size: usize, n_features: usize, seed: u64) -> Sketch {
    let mut rng = StdRng::seed_from_u64(seed);
    let sum_x = Array2::from_shape_fn((domain_size, n_features), |_| rng.r#gen::<f64>() * 10.0 - 5.0);
    let sum_xx = sum_x.mapv(|v| v * v);
    Sketch::new(Array2::ones((domain_size, n_features)), sum_x, sum_xx, None)
}

/// Random normalized buyer sketch with cross terms for `n_columns` columns.
pub fn random_buyer(domain_size: usize, n_columns: usize, seed: u64) -> Sketch {
    let mut rng = StdRng::seed_from_u64(seed);
    let sum_x = Array2::from_shape_fn((domain_size, n_columns), |_| rng.r#gen::<f64>() * 2.0 - 1.0);
    let sum_xx = sum_x.mapv(|v| v * v);
    let mut sum_xy = Array2::zeros((domain_size, n_pairs(n_columns)));
    let mut pair = 0;
    for i in 0..n_columns {
        for j in (i + 1)..n_columns {
            let product = &sum_x.column(i) * &sum_x.column(j);
            sum_xy.column_mut(pair).assign(&product);
            pair += 1;
        }
    }
    Sketch::new(Array2::ones((domain_size, n_columns)), sum_x, sum_xx, Some(sum_xy))
}
