//! Batched closed-form regression scoring.
//!
//! Every candidate seller column of a batch is scored against the buyer
//! target at once. The buyer and seller sketches share their domain rows, so
//! each sufficient statistic of the implicit join is a column sum of an
//! element-wise product, computed for all candidates as one matrix product.
//!
//! # Direct mode
//!
//! For `m` buyer columns (the target at `target`), each candidate gets an
//! `(m+1)×(m+1)` normal-equations system. Index 0 is the intercept, index 1
//! the candidate, and buyer column `k != target` sits at `k+2` if it comes
//! before the target and `k+1` otherwise. Buyer cross terms involving the
//! target fill the right-hand side; the others fill the matrix.
//!
//! # Residual mode
//!
//! The buyer holds a single residual column and the score is the R² of a
//! simple linear regression, from `S_xx`, `S_xy` and the sums.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

use super::linalg::{invert, quadratic_form, SINGULAR_TOLERANCE};
use crate::sketch::{n_pairs, pair_index, Sketch};
use crate::utils::Parallelism;

/// How the buyer target is modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// Regress the target on the candidate and every other buyer column.
    #[default]
    Direct,
    /// Regress the buyer's residual column on the candidate alone.
    Residual,
}

/// Errors from [`BatchRegressionEvaluator::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluateError {
    #[error("buyer sketch has {buyer} domain rows, seller batch has {seller}")]
    DomainMismatch { buyer: usize, seller: usize },

    #[error("target column {target} out of range for {columns} buyer columns")]
    TargetOutOfRange { target: usize, columns: usize },

    #[error("buyer sketch with {0} columns has no cross terms")]
    MissingCrossTerms(usize),
}

/// Scores of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchScores {
    /// R² per batch column. Unusable candidates score `-inf`.
    pub r_squared: Array1<f64>,
    /// Batch columns whose system was singular.
    pub singular: Vec<usize>,
}

impl BatchScores {
    /// Index and score of the best column, ignoring `masked` ones.
    ///
    /// Ties go to the lowest index. Returns `None` for an empty batch.
    pub fn best_excluding<I>(&self, masked: I) -> Option<(usize, f64)>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut scores = self.r_squared.clone();
        for index in masked {
            if let Some(score) = scores.get_mut(index) {
                *score = f64::NEG_INFINITY;
            }
        }
        scores
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            })
    }
}

/// Map NaN and R² ≥ 1 to `-inf`.
#[inline]
fn sanitize(r_squared: f64) -> f64 {
    if r_squared.is_nan() || r_squared >= 1.0 {
        f64::NEG_INFINITY
    } else {
        r_squared
    }
}

#[inline]
fn nonzero_or_one(v: f64) -> f64 {
    if v == 0.0 {
        1.0
    } else {
        v
    }
}

/// Scores seller batches against a buyer sketch.
#[derive(Debug, Clone, Copy)]
pub struct BatchRegressionEvaluator {
    mode: FitMode,
    parallelism: Parallelism,
}

impl BatchRegressionEvaluator {
    pub fn new(mode: FitMode, parallelism: Parallelism) -> Self {
        Self { mode, parallelism }
    }

    pub fn mode(&self) -> FitMode {
        self.mode
    }

    /// Score every column of `seller` for predicting buyer column `target`.
    ///
    /// Singular candidates never fail the batch: they score `-inf` and are
    /// listed in [`BatchScores::singular`].
    pub fn evaluate(
        &self,
        seller: &Sketch,
        buyer: &Sketch,
        target: usize,
    ) -> Result<BatchScores, EvaluateError> {
        if seller.domain_size() != buyer.domain_size() {
            return Err(EvaluateError::DomainMismatch {
                buyer: buyer.domain_size(),
                seller: seller.domain_size(),
            });
        }
        let columns = buyer.n_features();
        if target >= columns {
            return Err(EvaluateError::TargetOutOfRange { target, columns });
        }

        let results = match self.mode {
            FitMode::Direct => self.direct(seller, buyer, target)?,
            FitMode::Residual => self.residual(seller, buyer, target),
        };

        let mut singular = Vec::new();
        let r_squared = results
            .into_iter()
            .enumerate()
            .map(|(i, (score, is_singular))| {
                if is_singular {
                    singular.push(i);
                    f64::NEG_INFINITY
                } else {
                    sanitize(score)
                }
            })
            .collect();
        Ok(BatchScores {
            r_squared,
            singular,
        })
    }

    fn direct(
        &self,
        seller: &Sketch,
        buyer: &Sketch,
        target: usize,
    ) -> Result<Vec<(f64, bool)>, EvaluateError> {
        let m = buyer.n_features();
        let n_cross = n_pairs(m);
        let bxy = match buyer.sum_xy() {
            Some(xy) if xy.ncols() == n_cross => Some(xy),
            _ if n_cross == 0 => None,
            _ => return Err(EvaluateError::MissingCrossTerms(m)),
        };

        let s1 = seller.ones();
        let sx = seller.sum_x();
        let sxx = seller.sum_xx();
        let b1 = buyer.ones();
        let b1 = b1.column(0);
        let by = buyer.sum_x();
        let byy = buyer.sum_xx();

        let c = s1.t().dot(&b1);
        let x = sx.t().dot(&b1);
        let xx = sxx.t().dot(&b1).mapv(nonzero_or_one);

        // [buyer column, candidate]
        let cur_y = by.t().dot(&s1);
        let cur_xy = by.t().dot(&sx);
        let cur_yy = byy.t().dot(&s1).mapv(nonzero_or_one);
        // [pair, candidate]
        let cross: Array2<f64> = match bxy {
            Some(bxy) => bxy.t().dot(&s1),
            None => Array2::zeros((0, seller.n_features())),
        };

        let y = cur_y.row(target);
        let yy = byy.column(target).dot(&s1);
        let tss = &yy - &(&y * &y / &c);

        let stats = DirectStats {
            m,
            target,
            c: c.view(),
            x: x.view(),
            xx: xx.view(),
            cur_y: cur_y.view(),
            cur_xy: cur_xy.view(),
            cur_yy: cur_yy.view(),
            cross: cross.view(),
        };

        let results = self.parallelism.maybe_par_map(0..seller.n_features(), |f| {
            let (xtx, xty) = stats.system(f);
            match invert(xtx.view()) {
                Some(inv) => {
                    let beta = inv.dot(&xty);
                    let rss = yy[f] + quadratic_form(xtx.view(), beta.view()) - 2.0 * beta.dot(&xty);
                    (1.0 - rss / tss[f], false)
                }
                None => (f64::NEG_INFINITY, true),
            }
        });
        Ok(results)
    }

    fn residual(&self, seller: &Sketch, buyer: &Sketch, target: usize) -> Vec<(f64, bool)> {
        let s1 = seller.ones();
        let sx = seller.sum_x();
        let sxx = seller.sum_xx();
        let b1 = buyer.ones();
        let b1 = b1.column(0);
        let by = buyer.sum_x();
        let by = by.column(target);
        let byy = buyer.sum_xx();
        let byy = byy.column(target);

        let c = s1.t().dot(&b1);
        let x = sx.t().dot(&b1);
        let xx = sxx.t().dot(&b1);
        let y = s1.t().dot(&by);
        let yy = s1.t().dot(&byy);
        let xy = sx.t().dot(&by);

        self.parallelism.maybe_par_map(0..seller.n_features(), |f| {
            simple_regression_r2(c[f], x[f], xx[f], y[f], yy[f], xy[f])
        })
    }
}

/// R² of `y ~ 1 + x` from sums, and whether `S_xx` vanished.
///
/// `S_xx` is a difference of two nearly equal sums for a constant column, so
/// it is compared against the magnitude of those sums.
fn simple_regression_r2(c: f64, x: f64, xx: f64, y: f64, yy: f64, xy: f64) -> (f64, bool) {
    let x_mean = x / c;
    let y_mean = y / c;
    let s_xx = xx - 2.0 * x_mean * x + c * x_mean * x_mean;
    let s_xy = xy - x_mean * y - x * y_mean + c * x_mean * y_mean;
    let scale = xx.abs().max(x * x_mean).max(f64::MIN_POSITIVE);
    if !s_xx.is_finite() || s_xx <= SINGULAR_TOLERANCE * scale {
        return (f64::NEG_INFINITY, true);
    }

    let slope = s_xy / s_xx;
    let intercept = y_mean - slope * x_mean;
    let tss = yy - 2.0 * y_mean * y + c * y_mean * y_mean;
    let rss = yy + c * intercept * intercept + slope * slope * xx
        - 2.0 * (slope * xy + intercept * y - slope * intercept * x);
    (1.0 - rss / tss, false)
}

/// Per-candidate sums feeding the direct-mode systems.
struct DirectStats<'a> {
    m: usize,
    target: usize,
    c: ArrayView1<'a, f64>,
    x: ArrayView1<'a, f64>,
    xx: ArrayView1<'a, f64>,
    cur_y: ArrayView2<'a, f64>,
    cur_xy: ArrayView2<'a, f64>,
    cur_yy: ArrayView2<'a, f64>,
    cross: ArrayView2<'a, f64>,
}

impl DirectStats<'_> {
    /// Position of buyer column `k` (not the target) in the system.
    #[inline]
    fn pos(&self, k: usize) -> usize {
        if k < self.target {
            k + 2
        } else {
            k + 1
        }
    }

    /// Normal equations `(XᵀX, Xᵀy)` of candidate `f`.
    fn system(&self, f: usize) -> (Array2<f64>, Array1<f64>) {
        let size = self.m + 1;
        let mut xtx = Array2::<f64>::zeros((size, size));
        let mut xty = Array1::<f64>::zeros(size);

        xtx[[0, 0]] = self.c[f];
        xtx[[0, 1]] = self.x[f];
        xtx[[1, 0]] = self.x[f];
        xtx[[1, 1]] = self.xx[f];

        for i in 0..self.m {
            let cur_y = self.cur_y[[i, f]];
            let cur_xy = self.cur_xy[[i, f]];
            if i == self.target {
                xty[0] = cur_y;
                xty[1] = cur_xy;
            } else {
                let p = self.pos(i);
                xtx[[p, p]] = self.cur_yy[[i, f]];
                xtx[[1, p]] = cur_xy;
                xtx[[p, 1]] = cur_xy;
                xtx[[0, p]] = cur_y;
                xtx[[p, 0]] = cur_y;
            }

            for j in (i + 1)..self.m {
                let v = self.cross[[pair_index(i, j, self.m), f]];
                if i == self.target {
                    xty[self.pos(j)] = v;
                } else if j == self.target {
                    xty[self.pos(i)] = v;
                } else {
                    let (pi, pj) = (self.pos(i), self.pos(j));
                    xtx[[pi, pj]] = v;
                    xtx[[pj, pi]] = v;
                }
            }
        }

        (xtx, xty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rstest::rstest;

    /// Buyer with one row per domain value (counts of 1).
    fn buyer(columns: &[Vec<f64>]) -> Sketch {
        let d = columns[0].len();
        let m = columns.len();
        let sx = Array2::from_shape_fn((d, m), |(r, k)| columns[k][r]);
        let sxx = sx.mapv(|v| v * v);
        let xy = Array2::from_shape_fn((d, n_pairs(m)), |(r, p)| {
            let mut idx = 0;
            for i in 0..m {
                for j in (i + 1)..m {
                    if idx == p {
                        return columns[i][r] * columns[j][r];
                    }
                    idx += 1;
                }
            }
            unreachable!()
        });
        Sketch::new(Array2::ones((d, m)), sx, sxx, Some(xy))
    }

    fn seller(columns: &[Vec<f64>]) -> Sketch {
        let d = columns[0].len();
        let f = columns.len();
        let sx = Array2::from_shape_fn((d, f), |(r, k)| columns[k][r]);
        Sketch::new(Array2::ones((d, f)), sx.clone(), sx.mapv(|v| v * v), None)
    }

    fn evaluator(mode: FitMode) -> BatchRegressionEvaluator {
        BatchRegressionEvaluator::new(mode, Parallelism::Sequential)
    }

    #[test]
    fn better_predictor_wins() {
        let b = buyer(&[vec![1.0, 2.0, 3.0, 4.0, 5.0]]);
        let s = seller(&[
            vec![3.0, 1.0, 4.0, 1.0, 5.0],
            vec![1.0, 2.5, 2.5, 4.5, 5.0],
        ]);
        let scores = evaluator(FitMode::Direct).evaluate(&s, &b, 0).unwrap();

        assert!(scores.singular.is_empty());
        assert!(scores.r_squared[1] > scores.r_squared[0]);
        assert_eq!(scores.best_excluding([]), Some((1, scores.r_squared[1])));
        assert_eq!(scores.best_excluding([1]).unwrap().0, 0);
    }

    #[test]
    fn sanitize_rejects_nan_and_perfect_fits() {
        assert_eq!(sanitize(f64::NAN), f64::NEG_INFINITY);
        assert_eq!(sanitize(1.0), f64::NEG_INFINITY);
        assert_eq!(sanitize(1.5), f64::NEG_INFINITY);
        assert_eq!(sanitize(0.25), 0.25);
        assert_eq!(sanitize(-3.0), -3.0);
    }

    #[test]
    fn direct_and_residual_agree_for_single_column() {
        let b = buyer(&[vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.0]]);
        let s = seller(&[vec![0.5, 1.0, 1.5, 1.0, 3.0, 2.5], vec![6.0, 1.0, 5.0, 2.0, 4.0, 3.0]]);
        let direct = evaluator(FitMode::Direct).evaluate(&s, &b, 0).unwrap();
        let residual = evaluator(FitMode::Residual).evaluate(&s, &b, 0).unwrap();
        for f in 0..2 {
            assert_relative_eq!(direct.r_squared[f], residual.r_squared[f], epsilon = 1e-9);
        }
    }

    #[test]
    fn constant_candidate_is_singular() {
        let b = buyer(&[vec![1.0, 3.0, 2.0, 5.0]]);
        let s = seller(&[vec![5.0; 4], vec![1.0, 2.0, 3.0, 5.0]]);

        let direct = evaluator(FitMode::Direct).evaluate(&s, &b, 0).unwrap();
        assert_eq!(direct.singular, vec![0]);
        assert_eq!(direct.r_squared[0], f64::NEG_INFINITY);
        assert!(direct.r_squared[1].is_finite());

        let residual = evaluator(FitMode::Residual).evaluate(&s, &b, 0).unwrap();
        assert_eq!(residual.singular, vec![0]);
    }

    #[rstest]
    #[case::tenth(0.1)]
    #[case::third(1.0 / 3.0)]
    #[case::large_offset(1.0e6 + 0.1)]
    fn inexact_constant_is_singular_in_both_modes(#[case] value: f64) {
        let b = buyer(&[vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.5]]);
        let s = seller(&[vec![value; 6], vec![1.1, 2.9, 2.2, 4.8, 4.1, 6.0]]);
        for mode in [FitMode::Direct, FitMode::Residual] {
            let scores = evaluator(mode).evaluate(&s, &b, 0).unwrap();
            assert_eq!(scores.singular, vec![0], "{mode:?} with constant {value}");
            assert_eq!(scores.r_squared[0], f64::NEG_INFINITY);
            assert!(scores.r_squared[1] > 0.9);
        }
    }

    #[test]
    fn multi_column_target_position_matches_ols() {
        // Buyer columns [a, y, b]; the target sits in the middle so both
        // placement branches are exercised.
        let a = vec![1.0, 0.0, 2.0, 1.0, 3.0, 0.5, 2.5];
        let bcol = vec![0.0, 1.0, 1.0, 3.0, 0.0, 2.0, 1.5];
        let cand = vec![2.0, 1.0, 0.0, 1.0, 2.0, 3.0, 0.5];
        let y: Vec<f64> = (0..7)
            .map(|r| 1.0 + 0.5 * a[r] - 2.0 * bcol[r] + 0.25 * cand[r] + [0.1, -0.2, 0.05, 0.0, 0.3, -0.1, 0.2][r])
            .collect();
        let b = buyer(&[a.clone(), y.clone(), bcol.clone()]);
        let s = seller(&[cand.clone()]);

        let scores = evaluator(FitMode::Direct).evaluate(&s, &b, 1).unwrap();
        let expected = ols_r2(&[&cand, &a, &bcol], &y);
        assert_relative_eq!(scores.r_squared[0], expected, epsilon = 1e-9);

        // Same data with the target last.
        let b_last = buyer(&[a.clone(), bcol.clone(), y.clone()]);
        let last = evaluator(FitMode::Direct).evaluate(&s, &b_last, 2).unwrap();
        assert_relative_eq!(last.r_squared[0], expected, epsilon = 1e-9);
    }

    /// Reference R² by solving the normal equations of the explicit design.
    fn ols_r2(xs: &[&Vec<f64>], y: &[f64]) -> f64 {
        let n = y.len();
        let design = Array2::from_shape_fn((n, xs.len() + 1), |(r, c)| {
            if c == 0 {
                1.0
            } else {
                xs[c - 1][r]
            }
        });
        let y = Array1::from(y.to_vec());
        let beta = invert(design.t().dot(&design).view())
            .unwrap()
            .dot(&design.t().dot(&y));
        let resid = &y - &design.dot(&beta);
        let mean = y.sum() / n as f64;
        let tss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
        1.0 - resid.dot(&resid) / tss
    }

    #[test]
    fn errors() {
        let b = buyer(&[vec![1.0, 2.0], vec![2.0, 1.0]]);
        let s = seller(&[vec![1.0, 2.0, 3.0]]);
        assert!(matches!(
            evaluator(FitMode::Direct).evaluate(&s, &b, 0),
            Err(EvaluateError::DomainMismatch { .. })
        ));

        let s = seller(&[vec![1.0, 2.0]]);
        assert_eq!(
            evaluator(FitMode::Direct).evaluate(&s, &b, 2),
            Err(EvaluateError::TargetOutOfRange {
                target: 2,
                columns: 2
            })
        );

        let no_cross = Sketch::new(
            array![[1.0, 1.0], [1.0, 1.0]],
            array![[1.0, 2.0], [2.0, 1.0]],
            array![[1.0, 4.0], [4.0, 1.0]],
            None,
        );
        assert_eq!(
            evaluator(FitMode::Direct).evaluate(&s, &no_cross, 0),
            Err(EvaluateError::MissingCrossTerms(2))
        );
    }

    #[test]
    fn parallel_matches_sequential() {
        let b = buyer(&[vec![1.0, 3.0, 2.0, 5.0, 4.0]]);
        let s = seller(&[
            vec![1.0, 2.0, 2.0, 4.0, 3.0],
            vec![5.0, 5.0, 5.0, 5.0, 5.0],
            vec![0.0, 1.0, 0.0, 1.0, 0.0],
        ]);
        let seq = evaluator(FitMode::Direct).evaluate(&s, &b, 0).unwrap();
        let par = BatchRegressionEvaluator::new(FitMode::Direct, Parallelism::Parallel)
            .evaluate(&s, &b, 0)
            .unwrap();
        assert_eq!(seq, par);
    }
}
