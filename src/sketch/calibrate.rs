//! Calibration: raw table to domain-aligned sufficient statistics.
//!
//! Rows are grouped by their join-key tuple; each group contributes its count,
//! per-feature sums and sums of squares and, for buyers, the sums of every
//! pairwise feature product. Results are laid out on the cartesian domain of
//! the join keys so that sketches on the same keys line up row by row.

use ndarray::{Array2, ArrayView1};

use super::matrices::{n_pairs, pair_index, Sketch};
use crate::data::{JoinKeyDomain, KeyValue, SchemaError, Table};

/// Options controlling calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOptions {
    /// Divide sums by the group count and report a count of 1.
    pub normalized: bool,
    /// Compute pairwise cross-product sums among the features.
    pub cross_terms: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            normalized: true,
            cross_terms: false,
        }
    }
}

/// Output of [`Calibrator::calibrate`].
#[derive(Debug, Clone)]
pub struct CalibratedTable {
    /// Feature names, in column order of the sketch.
    pub feature_names: Vec<String>,
    /// The domain-aligned matrices.
    pub sketch: Sketch,
    /// Rows dropped because their key tuple lies outside the domain.
    pub dropped_rows: usize,
}

impl CalibratedTable {
    /// Number of feature columns.
    #[inline]
    pub fn width(&self) -> usize {
        self.feature_names.len()
    }
}

/// Turns tables into sketches over a join-key domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Calibrator {
    options: CalibrationOptions,
}

impl Calibrator {
    pub fn new(options: CalibrationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> CalibrationOptions {
        self.options
    }

    /// Calibrate `features` of `table` on the cartesian domain of `join_keys`.
    ///
    /// Domain rows with no matching table rows get zero sums and a count of 1
    /// when normalized, 0 otherwise. `NaN` values are left out of the sums but
    /// still count towards the group size.
    ///
    /// # Errors
    ///
    /// [`SchemaError`] if `join_keys` is empty, a key is not a join-key column
    /// of the table or has no domain, or a feature is not a numeric column.
    pub fn calibrate<K, F>(
        &self,
        table: &Table,
        join_keys: &[K],
        features: &[F],
        domain: &JoinKeyDomain,
    ) -> Result<CalibratedTable, SchemaError>
    where
        K: AsRef<str>,
        F: AsRef<str>,
    {
        if join_keys.is_empty() {
            return Err(SchemaError::NoJoinKeys);
        }

        let key_columns = join_keys
            .iter()
            .map(|key| {
                domain.values(key.as_ref())?;
                table.keys(key.as_ref())
            })
            .collect::<Result<Vec<&[KeyValue]>, _>>()?;
        let feature_columns = features
            .iter()
            .map(|name| table.numeric(name.as_ref()))
            .collect::<Result<Vec<ArrayView1<'_, f64>>, _>>()?;
        let feature_names: Vec<String> =
            features.iter().map(|f| f.as_ref().to_owned()).collect();

        let n_domain = domain.size(join_keys)?;
        let n_features = feature_columns.len();
        let n_cross = if self.options.cross_terms {
            n_pairs(n_features)
        } else {
            0
        };

        let mut counts = vec![0.0f64; n_domain];
        let mut sum_x = Array2::<f64>::zeros((n_domain, n_features));
        let mut sum_xx = Array2::<f64>::zeros((n_domain, n_features));
        let mut sum_xy = Array2::<f64>::zeros((n_domain, n_cross));

        let mut tuple: Vec<KeyValue> = Vec::with_capacity(join_keys.len());
        let mut values = vec![0.0f64; n_features];
        let mut dropped_rows = 0usize;

        for row in 0..table.n_rows() {
            tuple.clear();
            tuple.extend(key_columns.iter().map(|col| col[row].clone()));
            let Some(d) = domain.row_index(join_keys, &tuple)? else {
                dropped_rows += 1;
                continue;
            };

            counts[d] += 1.0;
            for (f, column) in feature_columns.iter().enumerate() {
                let v = column[row];
                values[f] = v;
                if !v.is_nan() {
                    sum_x[[d, f]] += v;
                    sum_xx[[d, f]] += v * v;
                }
            }

            if n_cross > 0 {
                for i in 0..n_features {
                    if values[i].is_nan() {
                        continue;
                    }
                    for j in (i + 1)..n_features {
                        if !values[j].is_nan() {
                            sum_xy[[d, pair_index(i, j, n_features)]] += values[i] * values[j];
                        }
                    }
                }
            }
        }

        if self.options.normalized {
            for (d, count) in counts.iter_mut().enumerate() {
                if *count > 0.0 {
                    let inv = 1.0 / *count;
                    sum_x.row_mut(d).mapv_inplace(|v| v * inv);
                    sum_xx.row_mut(d).mapv_inplace(|v| v * inv);
                    sum_xy.row_mut(d).mapv_inplace(|v| v * inv);
                }
                *count = 1.0;
            }
        }

        if dropped_rows > 0 {
            tracing::debug!(
                dropped_rows,
                n_rows = table.n_rows(),
                "rows outside the join-key domain were dropped"
            );
        }

        let ones = Array2::from_shape_fn((n_domain, n_features), |(d, _)| counts[d]);
        let sum_xy = self.options.cross_terms.then_some(sum_xy);

        Ok(CalibratedTable {
            feature_names,
            sketch: Sketch::new(ones, sum_x, sum_xx, sum_xy),
            dropped_rows,
        })
    }
}
