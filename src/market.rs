//! The data market: sellers, the buyer, and their sketch stores.
//!
//! [`DataMarket`] owns every piece of state shared between registration and
//! search: one seller [`SketchStore`] per join key, one buyer store per join
//! key, the raw seller tables (needed to fold a selected feature into the
//! buyer) and the buyer's R² history.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::MarketConfig;
use crate::data::{JoinKeyDomain, SchemaError, Table};
use crate::io::SpillDir;
use crate::regression::{LinearFit, RegressionError};
use crate::search::FitMode;
use crate::sketch::{
    BatchCapacity, CalibratedTable, CalibrationOptions, Calibrator, Checkpoint, MemoryProbe,
    SketchStore, StoreError, StoreRole, SystemMemoryProbe, TableId,
};

/// Identifier of a registered seller. Doubles as its store table id.
pub type SellerId = TableId;

/// Identifier of a registered buyer.
pub type BuyerId = usize;

/// Name of the buyer column holding one-shot regression residuals.
pub const RESIDUALS_COLUMN: &str = "residuals";

/// Errors raised by [`DataMarket`].
#[derive(Debug, Error)]
pub enum MarketError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Regression(#[from] RegressionError),

    #[error("no buyer registered")]
    NoBuyer,

    #[error("unknown seller {0}")]
    UnknownSeller(SellerId),
}

/// A registered seller table.
#[derive(Debug, Clone)]
pub struct SellerRecord {
    pub name: String,
    pub join_keys: Vec<String>,
    /// The table as registered, with its original column names.
    pub table: Table,
}

impl SellerRecord {
    /// Store-level feature name of `column` under `join_key`.
    pub fn feature_name(&self, join_key: &str, column: &str) -> String {
        format!("{join_key}_{}_{column}", self.name)
    }

    /// Inverse of [`feature_name`](Self::feature_name).
    pub fn column_of<'a>(&self, join_key: &str, feature_name: &'a str) -> Option<&'a str> {
        feature_name
            .strip_prefix(join_key)?
            .strip_prefix('_')?
            .strip_prefix(self.name.as_str())?
            .strip_prefix('_')
    }
}

/// The registered buyer.
#[derive(Debug, Clone)]
pub struct BuyerState {
    pub id: BuyerId,
    pub join_keys: Vec<String>,
    pub domain: JoinKeyDomain,
    pub target: String,
    pub mode: FitMode,
    /// Full buyer table, target and every augmentation included.
    pub table: Table,
    /// Column names of the buyer sketch, in sketch order.
    pub sketched: Vec<String>,
    /// Position of the predicted column among `sketched`.
    pub target_index: usize,
    /// One-shot fit of the target on every other numeric column.
    pub fit: LinearFit,
}

/// Registration context for sellers and the buyer.
///
/// # Example
///
/// ```
/// use joinsketch::data::{JoinKeyDomain, Table};
/// use joinsketch::{DataMarket, FitMode, MarketConfig};
///
/// let domain = JoinKeyDomain::new().with_key("zip", [1, 2, 3, 4]);
/// let mut market = DataMarket::new(MarketConfig::default());
///
/// let seller = Table::builder()
///     .key_column("zip", vec![1, 2, 3, 4])
///     .numeric_column("income", vec![3.0, 1.0, 4.0, 1.5])
///     .build()
///     .unwrap();
/// let id = market.register_seller(seller, "census", &["zip"], &domain).unwrap();
/// assert_eq!(id, 0);
///
/// let buyer = Table::builder()
///     .key_column("zip", vec![1, 2, 3, 4])
///     .numeric_column("price", vec![10.0, 4.0, 13.0, 6.0])
///     .build()
///     .unwrap();
/// market
///     .register_buyer(buyer, &["zip"], &domain, "price", FitMode::Direct)
///     .unwrap();
/// assert_eq!(market.r_squared_history().len(), 1);
/// ```
#[derive(Debug)]
pub struct DataMarket {
    config: MarketConfig,
    probe: Arc<dyn MemoryProbe>,
    seller_stores: BTreeMap<String, SketchStore>,
    buyer_stores: BTreeMap<String, SketchStore>,
    sellers: Vec<SellerRecord>,
    buyer: Option<BuyerState>,
    n_buyers: usize,
    r_squared_history: Vec<f64>,
}

impl DataMarket {
    /// Create a market budgeted from the memory currently free on this host.
    pub fn new(config: MarketConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemMemoryProbe))
    }

    /// Create a market with an explicit memory probe.
    pub fn with_probe(config: MarketConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            seller_stores: BTreeMap::new(),
            buyer_stores: BTreeMap::new(),
            sellers: Vec::new(),
            buyer: None,
            n_buyers: 0,
            r_squared_history: Vec::new(),
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    // =========================================================================
    // Sellers
    // =========================================================================

    /// Register a seller table under each of its join keys.
    ///
    /// Every numeric column becomes one candidate feature per join key, named
    /// `{join_key}_{name}_{column}`. A table wider than the store's maximum
    /// table width is registered in chunks of one less than that width.
    ///
    /// All calibration happens before any store is touched, so schema and
    /// capacity errors leave the market unchanged. A failed spill rolls back
    /// every store the call touched.
    pub fn register_seller<S: AsRef<str>>(
        &mut self,
        table: Table,
        name: impl Into<String>,
        join_keys: &[S],
        domain: &JoinKeyDomain,
    ) -> Result<SellerId, MarketError> {
        if join_keys.is_empty() {
            return Err(SchemaError::NoJoinKeys.into());
        }
        let seller_id = self.sellers.len();
        let record = SellerRecord {
            name: name.into(),
            join_keys: join_keys.iter().map(|k| k.as_ref().to_owned()).collect(),
            table,
        };
        let columns = record.table.numeric_names_except(&[]);
        let calibrator = Calibrator::new(CalibrationOptions {
            normalized: self.config.normalized,
            cross_terms: false,
        });

        let mut pending = Vec::with_capacity(record.join_keys.len());
        for join_key in &record.join_keys {
            let max_width = match self.seller_stores.get(join_key) {
                Some(store) => store.capacity(),
                None => self.capacity_for(join_key, domain)?,
            }
            .max_table_width();
            let chunk = if columns.len() > max_width {
                max_width.saturating_sub(1).max(1)
            } else {
                columns.len().max(1)
            };
            if chunk > max_width && !columns.is_empty() {
                return Err(StoreError::Capacity {
                    table_id: seller_id,
                    width: columns.len(),
                    capacity: max_width,
                }
                .into());
            }

            let renamed = record
                .table
                .clone()
                .rename_numeric(|column| record.feature_name(join_key, column))?;
            let parts = columns
                .chunks(chunk)
                .map(|names| {
                    let features: Vec<String> = names
                        .iter()
                        .map(|column| record.feature_name(join_key, column))
                        .collect();
                    calibrator.calibrate(&renamed, &[join_key], &features, domain)
                })
                .collect::<Result<Vec<_>, _>>()?;
            pending.push((join_key, parts));
        }

        self.commit_seller(seller_id, &pending, domain)?;
        self.sellers.push(record);
        Ok(seller_id)
    }

    /// Register calibrated chunks into their seller stores, all or nothing.
    fn commit_seller(
        &mut self,
        seller_id: SellerId,
        pending: &[(&String, Vec<CalibratedTable>)],
        domain: &JoinKeyDomain,
    ) -> Result<(), MarketError> {
        let mut touched = Vec::with_capacity(pending.len());
        for (join_key, parts) in pending {
            if let Err(err) = self.register_parts(seller_id, join_key, parts, domain, &mut touched) {
                for (join_key, checkpoint) in touched.iter().rev() {
                    match checkpoint {
                        Some(checkpoint) => {
                            if let Some(store) = self.seller_stores.get_mut(join_key) {
                                store.rollback(checkpoint);
                            }
                        }
                        None => {
                            self.seller_stores.remove(join_key);
                        }
                    }
                }
                tracing::warn!(seller_id, error = %err, "seller registration rolled back");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Register one join key's chunks, recording how to undo it in `touched`.
    fn register_parts(
        &mut self,
        seller_id: SellerId,
        join_key: &str,
        parts: &[CalibratedTable],
        domain: &JoinKeyDomain,
        touched: &mut Vec<(String, Option<Checkpoint>)>,
    ) -> Result<(), MarketError> {
        let checkpoint = match self.seller_stores.get(join_key) {
            Some(store) => Some(store.checkpoint(seller_id)),
            None => {
                let store = self.new_store(StoreRole::Seller, join_key, domain)?;
                self.seller_stores.insert(join_key.to_owned(), store);
                None
            }
        };
        touched.push((join_key.to_owned(), checkpoint));

        let Some(store) = self.seller_stores.get_mut(join_key) else {
            return Ok(());
        };
        for part in parts {
            store.register(seller_id, part)?;
        }
        tracing::debug!(
            seller_id,
            join_key,
            chunks = parts.len(),
            batches = store.n_batches(),
            "registered seller"
        );
        Ok(())
    }

    pub fn n_sellers(&self) -> usize {
        self.sellers.len()
    }

    pub fn seller(&self, seller_id: SellerId) -> Option<&SellerRecord> {
        self.sellers.get(seller_id)
    }

    pub fn seller_name(&self, seller_id: SellerId) -> Option<&str> {
        self.seller(seller_id).map(|s| s.name.as_str())
    }

    /// Seller store of one join key.
    pub fn seller_store(&self, join_key: &str) -> Option<&SketchStore> {
        self.seller_stores.get(join_key)
    }

    /// Seller stores in join-key order.
    pub fn seller_stores(&self) -> impl Iterator<Item = (&str, &SketchStore)> {
        self.seller_stores.iter().map(|(k, s)| (k.as_str(), s))
    }

    // =========================================================================
    // Buyer
    // =========================================================================

    /// Register the buyer, replacing any previous one.
    ///
    /// The target is first regressed on every other numeric column; that R²
    /// starts a new history. In [`FitMode::Residual`] only the residuals are
    /// sketched, in [`FitMode::Direct`] every numeric column is, cross terms
    /// included.
    pub fn register_buyer<S: AsRef<str>>(
        &mut self,
        table: Table,
        join_keys: &[S],
        domain: &JoinKeyDomain,
        target: &str,
        mode: FitMode,
    ) -> Result<BuyerId, MarketError> {
        let id = self.n_buyers;
        let join_keys: Vec<String> = join_keys.iter().map(|k| k.as_ref().to_owned()).collect();
        let state = self.build_buyer(id, table, join_keys, domain.clone(), target, mode)?;

        self.r_squared_history.clear();
        self.r_squared_history.push(state.fit.r_squared);
        tracing::info!(
            buyer_id = id,
            target,
            ?mode,
            r_squared = state.fit.r_squared,
            "registered buyer"
        );
        self.buyer = Some(state);
        self.n_buyers += 1;
        Ok(id)
    }

    /// Replace the buyer table, keeping its keys, target and mode.
    ///
    /// Every buyer store is rebuilt from scratch and the refit R² is appended
    /// to the history.
    pub fn update_buyer(&mut self, table: Table) -> Result<f64, MarketError> {
        let current = self.buyer.as_ref().ok_or(MarketError::NoBuyer)?;
        let (id, join_keys, domain, target, mode) = (
            current.id,
            current.join_keys.clone(),
            current.domain.clone(),
            current.target.clone(),
            current.mode,
        );
        let state = self.build_buyer(id, table, join_keys, domain, &target, mode)?;
        let r_squared = state.fit.r_squared;
        self.r_squared_history.push(r_squared);
        tracing::debug!(buyer_id = id, r_squared, "refit buyer");
        self.buyer = Some(state);
        Ok(r_squared)
    }

    fn build_buyer(
        &mut self,
        id: BuyerId,
        table: Table,
        join_keys: Vec<String>,
        domain: JoinKeyDomain,
        target: &str,
        mode: FitMode,
    ) -> Result<BuyerState, MarketError> {
        if join_keys.is_empty() {
            return Err(SchemaError::NoJoinKeys.into());
        }
        for key in &join_keys {
            table.keys(key)?;
        }
        table.numeric(target)?;

        let regressors = table.numeric_names_except(&[target]);
        let fit = LinearFit::fit(&table, &regressors, target, false)?;

        let (sketch_table, sketched, target_index, cross_terms) = match mode {
            FitMode::Residual => {
                let residual_table = table
                    .select(&join_keys)?
                    .with_numeric_column(RESIDUALS_COLUMN, fit.residuals.clone())?;
                (residual_table, vec![RESIDUALS_COLUMN.to_owned()], 0, false)
            }
            FitMode::Direct => {
                let sketched = table.numeric_names_except(&[]);
                let target_index = sketched
                    .iter()
                    .position(|name| name == target)
                    .ok_or_else(|| SchemaError::MissingColumn(target.to_owned()))?;
                (table.clone(), sketched, target_index, true)
            }
        };

        let calibrator = Calibrator::new(CalibrationOptions {
            normalized: self.config.normalized,
            cross_terms,
        });
        let mut stores = BTreeMap::new();
        for join_key in &join_keys {
            let calibrated = calibrator.calibrate(&sketch_table, &[join_key], &sketched, &domain)?;
            let mut store = self.new_store(StoreRole::Buyer, join_key, &domain)?;
            store.register(id, &calibrated)?;
            stores.insert(join_key.clone(), store);
        }
        self.buyer_stores = stores;

        Ok(BuyerState {
            id,
            join_keys,
            domain,
            target: target.to_owned(),
            mode,
            table,
            sketched,
            target_index,
            fit,
        })
    }

    pub fn buyer(&self) -> Option<&BuyerState> {
        self.buyer.as_ref()
    }

    pub fn buyer_table(&self) -> Option<&Table> {
        self.buyer.as_ref().map(|b| &b.table)
    }

    /// Buyer store of one join key.
    pub fn buyer_store(&self, join_key: &str) -> Option<&SketchStore> {
        self.buyer_stores.get(join_key)
    }

    /// R² of the one-shot buyer regression, one entry per (re)registration.
    pub fn r_squared_history(&self) -> &[f64] {
        &self.r_squared_history
    }

    // =========================================================================
    // Stores
    // =========================================================================

    fn capacity_for(
        &self,
        join_key: &str,
        domain: &JoinKeyDomain,
    ) -> Result<BatchCapacity, MarketError> {
        let domain_size = domain.size(&[join_key])?;
        Ok(BatchCapacity::estimate(
            self.probe.as_ref(),
            domain_size,
            self.config.host_memory_fraction,
        ))
    }

    fn new_store(
        &self,
        role: StoreRole,
        join_key: &str,
        domain: &JoinKeyDomain,
    ) -> Result<SketchStore, MarketError> {
        let domain_size = domain.size(&[join_key])?;
        let capacity = self.capacity_for(join_key, domain)?;
        let spill_dir = self.config.spill_dir.as_ref().map(|root| {
            let sub = match role {
                StoreRole::Seller => root.join(join_key),
                StoreRole::Buyer => root.join("buyer").join(join_key),
            };
            SpillDir::new(sub)
        });
        tracing::debug!(
            join_key,
            ?role,
            domain_size,
            device_columns = capacity.device_columns,
            host_columns = capacity.host_columns,
            "created sketch store"
        );
        Ok(SketchStore::new(
            role,
            domain_size,
            capacity,
            self.config.spill_policy,
            spill_dir,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::{FixedMemoryProbe, SpillPolicy};

    fn domain() -> JoinKeyDomain {
        JoinKeyDomain::new()
            .with_key("k", [1, 2, 3, 4])
            .with_key("g", ["a", "b"])
    }

    fn market(device_columns: usize, host_columns: usize) -> DataMarket {
        let probe = FixedMemoryProbe::for_columns(4, device_columns, host_columns);
        DataMarket::with_probe(
            MarketConfig::builder().host_memory_fraction(1.0).build().unwrap(),
            Arc::new(probe),
        )
    }

    fn seller_table(width: usize) -> Table {
        let mut builder = Table::builder()
            .key_column("k", vec![1, 2, 3, 4])
            .key_column("g", vec!["a", "a", "b", "b"]);
        for c in 0..width {
            builder = builder.numeric_column(
                format!("c{c}"),
                (0..4).map(|r| (r * 10 + c) as f64).collect(),
            );
        }
        builder.build().unwrap()
    }

    fn buyer_table() -> Table {
        Table::builder()
            .key_column("k", vec![1, 2, 3, 4])
            .key_column("g", vec!["a", "a", "b", "b"])
            .numeric_column("x", vec![1.0, 2.0, 0.0, 3.0])
            .numeric_column("y", vec![2.0, 5.0, 1.0, 6.5])
            .build()
            .unwrap()
    }

    #[test]
    fn seller_features_are_renamed_per_join_key() {
        let mut market = market(8, 8);
        let id = market
            .register_seller(seller_table(2), "s", &["k", "g"], &domain())
            .unwrap();

        let k_store = market.seller_store("k").unwrap();
        let g_store = market.seller_store("g").unwrap();
        assert_eq!(k_store.domain_size(), 4);
        assert_eq!(g_store.domain_size(), 2);
        assert_eq!(k_store.feature_name(0, 1), Some((id, "k_s_c1")));
        assert_eq!(g_store.feature_name(0, 0), Some((id, "g_s_c0")));

        let record = market.seller(id).unwrap();
        assert_eq!(record.column_of("k", "k_s_c1"), Some("c1"));
        assert_eq!(record.column_of("g", "k_s_c1"), None);
    }

    #[test]
    fn wide_seller_is_chunked() {
        let mut market = market(4, 4);
        market
            .register_seller(seller_table(10), "wide", &["k"], &domain())
            .unwrap();
        let store = market.seller_store("k").unwrap();
        assert_eq!(store.total_width(0), 10);
        assert_eq!(store.directory().width(0), 10);
    }

    #[test]
    fn failed_seller_registration_leaves_market_unchanged() {
        let mut market = market(8, 8);
        market
            .register_seller(seller_table(1), "ok", &["k"], &domain())
            .unwrap();
        let err = market
            .register_seller(seller_table(1), "bad", &["k", "missing"], &domain())
            .unwrap_err();
        assert!(matches!(err, MarketError::Schema(_)));
        assert_eq!(market.n_sellers(), 1);
        assert_eq!(market.seller_store("k").unwrap().total_width(0), 1);
        assert!(market.seller_store("missing").is_none());
    }

    #[test]
    fn failed_spill_rolls_back_every_join_key() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"file").unwrap();
        let config = MarketConfig::builder()
            .host_memory_fraction(1.0)
            .spill_policy(SpillPolicy::Always)
            .spill_dir(blocker)
            .build()
            .unwrap();
        let probe = FixedMemoryProbe::for_columns(4, 2, 8);
        let mut market = DataMarket::with_probe(config, Arc::new(probe));

        market
            .register_seller(seller_table(1), "ok", &["k"], &domain())
            .unwrap();
        // "g" registers without sealing; "k" fills its batch and cannot spill.
        let err = market
            .register_seller(seller_table(1), "bad", &["g", "k"], &domain())
            .unwrap_err();
        assert!(matches!(err, MarketError::Store(StoreError::Spill(_))));

        assert_eq!(market.n_sellers(), 1);
        assert!(market.seller_store("g").is_none());
        let k_store = market.seller_store("k").unwrap();
        assert_eq!(k_store.total_width(0), 1);
        assert_eq!(k_store.total_width(1), 0);
        assert!(!k_store.batch(0).unwrap().is_sealed());

        let id = market
            .register_seller(seller_table(1), "next", &["g"], &domain())
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            market.seller_store("g").unwrap().feature_name(0, 0),
            Some((1, "g_next_c0"))
        );
    }

    #[test]
    fn direct_buyer_sketches_every_column() {
        let mut market = market(8, 8);
        market
            .register_buyer(buyer_table(), &["k"], &domain(), "y", FitMode::Direct)
            .unwrap();
        let buyer = market.buyer().unwrap();
        assert_eq!(buyer.sketched, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(buyer.target_index, 1);

        let sketch = market.buyer_store("k").unwrap().sketch(0).unwrap();
        assert_eq!(sketch.n_features(), 2);
        assert!(sketch.sum_xy().is_some());
        assert_eq!(market.r_squared_history().len(), 1);
    }

    #[test]
    fn residual_buyer_sketches_residuals() {
        let mut market = market(8, 8);
        market
            .register_buyer(buyer_table(), &["k", "g"], &domain(), "y", FitMode::Residual)
            .unwrap();
        let buyer = market.buyer().unwrap();
        assert_eq!(buyer.sketched, vec![RESIDUALS_COLUMN.to_string()]);
        assert!(buyer.table.schema().contains("x"));

        let sketch = market.buyer_store("g").unwrap().sketch(0).unwrap();
        assert_eq!(sketch.n_features(), 1);
        assert!(sketch.sum_xy().is_none());
    }

    #[test]
    fn update_buyer_extends_history() {
        let mut market = market(8, 8);
        assert!(matches!(
            market.update_buyer(buyer_table()),
            Err(MarketError::NoBuyer)
        ));
        market
            .register_buyer(buyer_table(), &["k"], &domain(), "y", FitMode::Direct)
            .unwrap();
        let extended = buyer_table()
            .with_numeric_column("z", ndarray::array![0.5, 0.0, 1.0, 0.25])
            .unwrap();
        market.update_buyer(extended).unwrap();
        assert_eq!(market.r_squared_history().len(), 2);
        assert_eq!(market.buyer().unwrap().sketched.len(), 3);
    }

    #[test]
    fn buyer_target_must_exist() {
        let mut market = market(8, 8);
        let err = market
            .register_buyer(buyer_table(), &["k"], &domain(), "nope", FitMode::Direct)
            .unwrap_err();
        assert!(matches!(
            err,
            MarketError::Schema(SchemaError::MissingColumn(_))
        ));
        assert!(market.buyer().is_none());
    }
}
