//! One-shot ordinary least squares on an unsketched table.
//!
//! Used to seed the search: the buyer's baseline R² and, in residual mode,
//! the residual column that replaces the target in the buyer sketch.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::data::{SchemaError, Table};
use crate::search::linalg::solve_psd_dropping;

/// Errors raised by [`LinearFit::fit`].
#[derive(Debug, Error)]
pub enum RegressionError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A regressor or the target holds `NaN` or infinite values.
    #[error("column `{0}` contains missing or non-finite values")]
    NonFinite(String),

    #[error("cannot fit a regression on an empty table")]
    Empty,
}

/// An OLS fit of one target on a set of numeric columns, with intercept.
#[derive(Debug, Clone)]
pub struct LinearFit {
    /// Regressor names, in the order given to [`LinearFit::fit`].
    pub features: Vec<String>,
    /// Coefficient per regressor. Dropped regressors have a zero coefficient.
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    /// Regressors dropped because they were linearly dependent on earlier ones.
    pub dropped: Vec<String>,
    /// `y - ŷ` per table row.
    pub residuals: Array1<f64>,
    /// Coefficient of determination (adjusted if requested). `NaN` when the
    /// target is constant.
    pub r_squared: f64,
}

impl LinearFit {
    /// Fit `y ~ 1 + x` on `table`.
    ///
    /// Rank-deficient designs do not fail: dependent regressors are dropped
    /// and reported in [`LinearFit::dropped`]. With `adjusted`, R² is replaced
    /// by `1 - (1 - R²)(n - 1)/(n - p - 1)` where `p = x.len()`.
    pub fn fit<S: AsRef<str>>(
        table: &Table,
        x: &[S],
        y: &str,
        adjusted: bool,
    ) -> Result<Self, RegressionError> {
        let n = table.n_rows();
        if n == 0 {
            return Err(RegressionError::Empty);
        }

        let target = table.numeric(y)?;
        if target.iter().any(|v| !v.is_finite()) {
            return Err(RegressionError::NonFinite(y.to_owned()));
        }

        let p = x.len();
        let mut design = Array2::<f64>::ones((n, p + 1));
        for (j, name) in x.iter().enumerate() {
            let column = table.numeric(name.as_ref())?;
            if column.iter().any(|v| !v.is_finite()) {
                return Err(RegressionError::NonFinite(name.as_ref().to_owned()));
            }
            design.column_mut(j + 1).assign(&column);
        }

        let xtx = design.t().dot(&design);
        let xty = design.t().dot(&target);
        let (beta, dropped_idx) = solve_psd_dropping(xtx.view(), xty.view());

        let predictions = design.dot(&beta);
        let residuals = &target - &predictions;

        let mean = target.sum() / n as f64;
        let ss_res = residuals.dot(&residuals);
        let ss_tot = target.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        let mut r_squared = if ss_tot == 0.0 {
            f64::NAN
        } else {
            1.0 - ss_res / ss_tot
        };
        if adjusted {
            r_squared = 1.0 - (1.0 - r_squared) * (n as f64 - 1.0) / (n as f64 - p as f64 - 1.0);
        }

        let features: Vec<String> = x.iter().map(|s| s.as_ref().to_owned()).collect();
        let dropped: Vec<String> = dropped_idx
            .iter()
            .filter(|&&i| i > 0)
            .map(|&i| features[i - 1].clone())
            .collect();
        if !dropped.is_empty() {
            tracing::debug!(?dropped, "dropped linearly dependent regressors");
        }

        Ok(Self {
            features,
            coefficients: beta.slice(ndarray::s![1..]).to_owned(),
            intercept: beta[0],
            dropped,
            residuals,
            r_squared,
        })
    }
}
