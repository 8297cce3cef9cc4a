//! Batched regression scoring and the greedy augmentation search.
//!
//! - [`BatchRegressionEvaluator`] scores every feature of a seller batch
//!   against the buyer sketch in closed form.
//! - [`SearchEngine`] runs the greedy loop over a
//!   [`DataMarket`](crate::DataMarket) and produces an [`AugmentationPlan`].

mod engine;
mod evaluator;
pub mod linalg;
mod plan;

pub use engine::{SearchEngine, SearchError, SearchOutcome, Termination};
pub use evaluator::{BatchRegressionEvaluator, BatchScores, EvaluateError, FitMode};
pub use plan::{AugmentationPlan, FeatureSet, PlanEntry, SelectedSet, UnusableSet};
