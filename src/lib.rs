//! joinsketch: join-free feature augmentation search.
//!
//! Finds the seller features that best improve a linear model of a buyer's
//! target column without materializing any buyer/seller join. Every table is
//! replaced by per-join-key-value sufficient statistics (counts, sums, sums of
//! squares and cross products), from which the R² of each candidate
//! regression follows in closed form.
//!
//! # Key Types
//!
//! - [`DataMarket`] - Registers sellers and the buyer, owns the sketch stores
//! - [`SearchEngine`] - Greedy search producing an [`AugmentationPlan`]
//! - [`MarketConfig`] / [`SearchConfig`] - Configuration builders
//! - [`data::Table`] / [`data::JoinKeyDomain`] - Input tables and key domains
//! - [`sketch::Calibrator`] / [`sketch::SketchStore`] - Sketch building and
//!   tiered storage
//!
//! # Example
//!
//! ```
//! use joinsketch::data::{JoinKeyDomain, Table};
//! use joinsketch::{DataMarket, FitMode, MarketConfig, SearchConfig, SearchEngine};
//!
//! let domain = JoinKeyDomain::new().with_key("zip", [1, 2, 3, 4, 5]);
//! let mut market = DataMarket::new(MarketConfig::default());
//!
//! let seller = Table::builder()
//!     .key_column("zip", vec![1, 2, 3, 4, 5])
//!     .numeric_column("income", vec![1.0, 2.0, 3.5, 3.0, 5.0])
//!     .build()
//!     .unwrap();
//! market.register_seller(seller, "census", &["zip"], &domain).unwrap();
//!
//! let buyer = Table::builder()
//!     .key_column("zip", vec![1, 2, 3, 4, 5])
//!     .numeric_column("price", vec![2.1, 3.9, 7.2, 5.8, 10.1])
//!     .build()
//!     .unwrap();
//! market
//!     .register_buyer(buyer, &["zip"], &domain, "price", FitMode::Residual)
//!     .unwrap();
//!
//! let config = SearchConfig::builder().n_iterations(1).build().unwrap();
//! let outcome = SearchEngine::new(&mut market, config).run().unwrap();
//! assert_eq!(outcome.plan.feature_names(), vec!["zip_census_income"]);
//! ```

pub mod config;
pub mod data;
pub mod io;
pub mod market;
pub mod regression;
pub mod search;
pub mod sketch;
pub mod utils;

// =============================================================================
// Convenience Re-exports
// =============================================================================

// Configuration
pub use config::{ConfigError, MarketConfig, SearchConfig};
pub use sketch::SpillPolicy;

// Registration
pub use market::{BuyerId, DataMarket, MarketError, SellerId};

// Search
pub use search::{
    AugmentationPlan, FitMode, PlanEntry, SearchEngine, SearchError, SearchOutcome, Termination,
};

// One-shot regression
pub use regression::{LinearFit, RegressionError};

// Shared utilities
pub use utils::{run_with_threads, Parallelism};
