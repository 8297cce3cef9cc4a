//! Greedy single-feature augmentation search.
//!
//! Each iteration scores every batch of every join key's seller store
//! against the buyer sketch, picks the best surviving candidate, records it
//! in the plan and folds it into the buyer table. The buyer is then
//! re-registered, which rebuilds its sketches and refits its baseline.

use std::collections::HashMap;

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

use super::evaluator::{BatchRegressionEvaluator, EvaluateError};
use super::plan::{AugmentationPlan, PlanEntry, SelectedSet, UnusableSet};
use crate::config::SearchConfig;
use crate::data::{KeyValue, SchemaError, Table};
use crate::market::{DataMarket, MarketError, SellerId};
use crate::sketch::{BatchId, StoreError};
use crate::utils::{nan_mean, run_with_threads, Parallelism};

/// Errors that abort a search run.
///
/// Per-feature numerical failures never show up here; they only exclude the
/// feature.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no buyer registered")]
    NoBuyer,

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Evaluate(#[from] EvaluateError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("column {index} of batch {batch_id} under `{join_key}` does not resolve to a feature")]
    UnresolvedFeature {
        join_key: String,
        batch_id: BatchId,
        index: usize,
    },
}

/// Why a search run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every configured iteration selected a feature.
    BudgetExhausted,
    /// No candidate survived masking and thresholds.
    NoFeatureFound,
}

/// Result of [`SearchEngine::run`].
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub plan: AugmentationPlan,
    /// Baseline R² followed by the refit R² after each selection.
    pub r_squared_history: Vec<f64>,
    /// Buyer table with every selected feature joined in.
    pub buyer_table: Table,
    pub termination: Termination,
}

/// Best candidate of one iteration.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    join_key: String,
    batch_id: BatchId,
    index: usize,
    r_squared: f64,
}

/// Drives the greedy search over a [`DataMarket`].
///
/// The engine holds the market mutably for its whole lifetime: every
/// selection rewrites the buyer.
#[derive(Debug)]
pub struct SearchEngine<'m> {
    market: &'m mut DataMarket,
    config: SearchConfig,
    plan: AugmentationPlan,
    unusable: UnusableSet,
    selected: SelectedSet,
}

impl<'m> SearchEngine<'m> {
    pub fn new(market: &'m mut DataMarket, config: SearchConfig) -> Self {
        Self {
            market,
            config,
            plan: AugmentationPlan::new(),
            unusable: UnusableSet::new(),
            selected: SelectedSet::new(),
        }
    }

    /// Plan accumulated so far, also after a failed [`run`](Self::run).
    pub fn plan(&self) -> &AugmentationPlan {
        &self.plan
    }

    /// Features permanently excluded because their system was singular.
    pub fn unusable(&self) -> &UnusableSet {
        &self.unusable
    }

    /// Features already added to the plan, masked in later iterations.
    pub fn selected(&self) -> &SelectedSet {
        &self.selected
    }

    pub fn market(&self) -> &DataMarket {
        self.market
    }

    /// Run up to `n_iterations` greedy iterations.
    pub fn run(&mut self) -> Result<SearchOutcome, SearchError> {
        let n_threads = self.config.n_threads;
        run_with_threads(n_threads, |parallelism| self.run_inner(parallelism))
    }

    fn run_inner(&mut self, parallelism: Parallelism) -> Result<SearchOutcome, SearchError> {
        let mode = self.market.buyer().ok_or(SearchError::NoBuyer)?.mode;
        let evaluator = BatchRegressionEvaluator::new(mode, parallelism);

        let mut termination = Termination::BudgetExhausted;
        for iteration in 0..self.config.n_iterations {
            let Some(best) = self.search_iteration(&evaluator)? else {
                tracing::info!(iteration = iteration + 1, "no feature found, stopping");
                termination = Termination::NoFeatureFound;
                break;
            };
            let entry = self.select(&best, iteration + 1)?;
            tracing::info!(
                iteration = entry.iteration,
                feature = %entry.feature_name,
                seller = %entry.seller_name,
                join_key = %best.join_key,
                r_squared = best.r_squared,
                "selected feature"
            );
        }

        let buyer_table = self
            .market
            .buyer_table()
            .cloned()
            .ok_or(SearchError::NoBuyer)?;
        Ok(SearchOutcome {
            plan: self.plan.clone(),
            r_squared_history: self.market.r_squared_history().to_vec(),
            buyer_table,
            termination,
        })
    }

    /// Score every batch and return the best selectable candidate.
    fn search_iteration(
        &mut self,
        evaluator: &BatchRegressionEvaluator,
    ) -> Result<Option<Candidate>, SearchError> {
        let target = self.market.buyer().ok_or(SearchError::NoBuyer)?.target_index;
        let mut best: Option<Candidate> = None;

        for (join_key, store) in self.market.seller_stores() {
            let Some(buyer_store) = self.market.buyer_store(join_key) else {
                tracing::debug!(join_key, "buyer not keyed on seller join key, skipping");
                continue;
            };
            let buyer = buyer_store.sketch(0)?;

            for batch in store.batches() {
                let batch_id = batch.id();
                let sketch = store.sketch(batch_id)?;
                let scores = evaluator.evaluate(&sketch, &buyer, target)?;

                for &index in &scores.singular {
                    if self.unusable.insert(join_key, batch_id, index) {
                        let feature = store.feature_name(batch_id, index).map(|(_, name)| name);
                        tracing::warn!(
                            join_key,
                            batch_id,
                            index,
                            feature,
                            "singular normal equations, feature excluded"
                        );
                    }
                }

                let masked = self
                    .unusable
                    .get(join_key, batch_id)
                    .into_iter()
                    .chain(self.selected.get(join_key, batch_id))
                    .flatten()
                    .copied();
                let Some((index, r_squared)) = scores.best_excluding(masked) else {
                    continue;
                };
                if r_squared < self.config.exhaustion_floor {
                    tracing::debug!(join_key, batch_id, r_squared, "batch exhausted");
                    continue;
                }
                if r_squared > self.config.min_r_squared
                    && best.as_ref().map_or(true, |b| r_squared > b.r_squared)
                {
                    best = Some(Candidate {
                        join_key: join_key.to_owned(),
                        batch_id,
                        index,
                        r_squared,
                    });
                }
            }
        }

        Ok(best)
    }

    /// Record `best` in the plan and fold it into the buyer.
    fn select(&mut self, best: &Candidate, iteration: usize) -> Result<PlanEntry, SearchError> {
        let unresolved = || SearchError::UnresolvedFeature {
            join_key: best.join_key.clone(),
            batch_id: best.batch_id,
            index: best.index,
        };
        let store = self
            .market
            .seller_store(&best.join_key)
            .ok_or_else(unresolved)?;
        let (seller_id, feature_name) = store
            .feature_name(best.batch_id, best.index)
            .ok_or_else(unresolved)?;
        let feature_name = feature_name.to_owned();
        let seller_name = self
            .market
            .seller_name(seller_id)
            .ok_or(MarketError::UnknownSeller(seller_id))?
            .to_owned();

        let entry = PlanEntry {
            seller_id,
            iteration,
            seller_name,
            feature_name,
        };
        self.plan.push(entry.clone());
        self.selected
            .insert(&best.join_key, best.batch_id, best.index);

        let folded = self.fold(&best.join_key, seller_id, &entry.feature_name)?;
        self.market.update_buyer(folded)?;
        Ok(entry)
    }

    /// Left-join one seller feature onto the buyer table.
    ///
    /// The seller column is averaged per join-key value. Buyer rows without a
    /// match take the mean of the matched rows, or the mean over all seller
    /// key values when nothing matched. A buyer column of the same name is
    /// kept as is.
    fn fold(
        &self,
        join_key: &str,
        seller_id: SellerId,
        feature_name: &str,
    ) -> Result<Table, SearchError> {
        let buyer = self.market.buyer_table().ok_or(SearchError::NoBuyer)?;
        if buyer.schema().contains(feature_name) {
            return Ok(buyer.clone());
        }
        let seller = self
            .market
            .seller(seller_id)
            .ok_or(MarketError::UnknownSeller(seller_id))?;
        let column = seller
            .column_of(join_key, feature_name)
            .ok_or_else(|| SchemaError::MissingColumn(feature_name.to_owned()))?;

        let means = group_means(seller.table.keys(join_key)?, seller.table.numeric(column)?);
        let joined: Array1<f64> = buyer
            .keys(join_key)?
            .iter()
            .map(|key| means.get(key).copied().unwrap_or(f64::NAN))
            .collect();

        let mut fill = nan_mean(joined.view());
        if fill.is_nan() {
            let aggregated: Array1<f64> = means.values().copied().collect();
            fill = nan_mean(aggregated.view());
        }
        let matched = joined.iter().filter(|v| !v.is_nan()).count();
        tracing::debug!(
            join_key,
            feature = feature_name,
            matched,
            rows = joined.len(),
            fill,
            "folded feature into buyer"
        );
        let values = joined.mapv(|v| if v.is_nan() { fill } else { v });

        Ok(buyer.clone().with_numeric_column(feature_name, values)?)
    }
}

/// Mean of the non-NaN values per key. Keys with only NaN values are absent.
fn group_means<'a>(keys: &'a [KeyValue], values: ArrayView1<'_, f64>) -> HashMap<&'a KeyValue, f64> {
    let mut sums: HashMap<&KeyValue, (f64, usize)> = HashMap::new();
    for (key, &value) in keys.iter().zip(values.iter()) {
        if value.is_nan() {
            continue;
        }
        let slot = sums.entry(key).or_insert((0.0, 0));
        slot.0 += value;
        slot.1 += 1;
    }
    sums.into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_means_skip_nan() {
        let keys = vec![
            KeyValue::Int(1),
            KeyValue::Int(1),
            KeyValue::Int(2),
            KeyValue::Int(3),
        ];
        let values = [2.0, 4.0, f64::NAN, 5.0];
        let means = group_means(&keys, ndarray::aview1(&values));
        assert_eq!(means.get(&KeyValue::Int(1)), Some(&3.0));
        assert_eq!(means.get(&KeyValue::Int(2)), None);
        assert_eq!(means.get(&KeyValue::Int(3)), Some(&5.0));
    }
}
