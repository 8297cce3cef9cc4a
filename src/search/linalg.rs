//! Small dense solvers for normal-equations systems.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Relative pivot tolerance below which a matrix is treated as singular.
pub const SINGULAR_TOLERANCE: f64 = 1e-12;

/// Relative pivot tolerance used to drop dependent columns in
/// [`solve_psd_dropping`].
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Invert a square matrix by Gauss-Jordan elimination with partial pivoting.
///
/// Returns `None` when some pivot magnitude is at or below
/// [`SINGULAR_TOLERANCE`] times the largest absolute entry, or when the matrix
/// contains non-finite values.
pub fn invert(a: ArrayView2<'_, f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "matrix must be square");

    if a.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if n == 0 {
        return Some(Array2::zeros((0, 0)));
    }
    let tol = SINGULAR_TOLERANCE * scale;

    let mut m = a.to_owned();
    let mut inv = Array2::<f64>::eye(n);

    for k in 0..n {
        let pivot_row = (k..n)
            .max_by(|&i, &j| m[[i, k]].abs().total_cmp(&m[[j, k]].abs()))
            .unwrap_or(k);
        let pivot = m[[pivot_row, k]];
        if pivot.abs() <= tol {
            return None;
        }
        if pivot_row != k {
            swap_rows(&mut m, k, pivot_row);
            swap_rows(&mut inv, k, pivot_row);
        }

        let inv_pivot = 1.0 / pivot;
        m.row_mut(k).mapv_inplace(|v| v * inv_pivot);
        inv.row_mut(k).mapv_inplace(|v| v * inv_pivot);

        for i in 0..n {
            if i == k {
                continue;
            }
            let factor = m[[i, k]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                m[[i, j]] -= factor * m[[k, j]];
                inv[[i, j]] -= factor * inv[[k, j]];
            }
        }
    }

    Some(inv)
}

fn swap_rows(m: &mut Array2<f64>, a: usize, b: usize) {
    for j in 0..m.ncols() {
        m.swap([a, j], [b, j]);
    }
}

/// Solve `a·x = b` for a symmetric positive semi-definite `a`, dropping
/// columns that are linearly dependent on earlier ones.
///
/// Dropped columns get a zero coefficient and their indices are returned in
/// increasing order.
pub fn solve_psd_dropping(a: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> (Array1<f64>, Vec<usize>) {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    debug_assert_eq!(n, b.len());

    let scale = a
        .diag()
        .iter()
        .fold(0.0f64, |m, v| m.max(v.abs()))
        .max(f64::MIN_POSITIVE);
    let tol = RANK_TOLERANCE * scale;

    let mut m = a.to_owned();
    let mut rhs = b.to_owned();
    let mut active = vec![true; n];

    for k in 0..n {
        let pivot = m[[k, k]];
        if pivot.abs() <= tol {
            active[k] = false;
            continue;
        }
        for i in (k + 1)..n {
            let factor = m[[i, k]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in k..n {
                m[[i, j]] -= factor * m[[k, j]];
            }
            rhs[i] -= factor * rhs[k];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for k in (0..n).rev() {
        if !active[k] {
            continue;
        }
        let tail: f64 = ((k + 1)..n)
            .filter(|&j| active[j])
            .map(|j| m[[k, j]] * x[j])
            .sum();
        x[k] = (rhs[k] - tail) / m[[k, k]];
    }

    let dropped = active
        .iter()
        .enumerate()
        .filter_map(|(i, &keep)| (!keep).then_some(i))
        .collect();
    (x, dropped)
}

/// Quadratic form `xᵀ·a·x`.
pub fn quadratic_form(a: ArrayView2<'_, f64>, x: ArrayView1<'_, f64>) -> f64 {
    a.dot(&x).dot(&x)
}
