//! Market and search configuration with builder pattern.
//!
//! Both configurations use the `bon` crate for builder generation and are
//! validated when built.
//!
//! # Example
//!
//! ```
//! use joinsketch::{MarketConfig, SearchConfig, SpillPolicy};
//!
//! // All defaults
//! let market = MarketConfig::builder().build().unwrap();
//! assert!(market.normalized);
//!
//! let search = SearchConfig::builder()
//!     .n_iterations(5)
//!     .min_r_squared(0.1)
//!     .build()
//!     .unwrap();
//! assert_eq!(search.exhaustion_floor, -1.0);
//!
//! // Always spilling needs somewhere to spill to.
//! let err = MarketConfig::builder()
//!     .spill_policy(SpillPolicy::Always)
//!     .build();
//! assert!(err.is_err());
//! ```

use std::path::PathBuf;

use bon::Builder;

use crate::sketch::SpillPolicy;

// =============================================================================
// ConfigError
// =============================================================================

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Host memory fraction must be in (0, 1].
    InvalidMemoryFraction(f64),
    /// `SpillPolicy::Always` was requested without a spill directory.
    SpillDirRequired,
    /// Number of iterations must be at least 1.
    InvalidIterations,
    /// A threshold is NaN.
    InvalidThreshold { field: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMemoryFraction(v) => {
                write!(f, "host_memory_fraction must be in (0, 1], got {}", v)
            }
            Self::SpillDirRequired => write!(f, "spill_policy Always requires a spill_dir"),
            Self::InvalidIterations => write!(f, "n_iterations must be at least 1"),
            Self::InvalidThreshold { field } => write!(f, "{} must not be NaN", field),
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// MarketConfig
// =============================================================================

/// Configuration of a [`DataMarket`](crate::DataMarket).
#[derive(Debug, Clone, Builder)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct MarketConfig {
    /// Normalize sketches by group count. Default: `true`.
    #[builder(default = true)]
    pub normalized: bool,

    /// Share of available host memory budgeted for sketches. Default: 0.5.
    #[builder(default = 0.5)]
    pub host_memory_fraction: f64,

    /// When sealed batches go to disk. Default: [`SpillPolicy::WhenFull`].
    #[builder(default)]
    pub spill_policy: SpillPolicy,

    /// Directory for spilled batches. Without one nothing is spilled.
    ///
    /// Each join key gets its own subdirectory.
    #[builder(into)]
    pub spill_dir: Option<PathBuf>,
}

/// Custom finishing function that validates the config.
impl<S: market_config_builder::IsComplete> MarketConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `host_memory_fraction` is outside (0, 1] or
    /// `SpillPolicy::Always` is set without a `spill_dir`.
    pub fn build(self) -> Result<MarketConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl MarketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.host_memory_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidMemoryFraction(fraction));
        }
        if self.spill_policy == SpillPolicy::Always && self.spill_dir.is_none() {
            return Err(ConfigError::SpillDirRequired);
        }
        Ok(())
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

// =============================================================================
// SearchConfig
// =============================================================================

/// Configuration of a [`SearchEngine`](crate::SearchEngine) run.
#[derive(Debug, Clone, Builder)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct SearchConfig {
    /// Maximum number of features to select. Default: 2.
    #[builder(default = 2)]
    pub n_iterations: usize,

    /// A batch whose best score is below this value is skipped as exhausted.
    /// Default: -1.0.
    #[builder(default = -1.0)]
    pub exhaustion_floor: f64,

    /// Scores must exceed this value to be selected. Default: -inf.
    #[builder(default = f64::NEG_INFINITY)]
    pub min_r_squared: f64,

    /// Number of threads for batch evaluation. 0 = auto, 1 = sequential.
    #[builder(default)]
    pub n_threads: usize,
}

/// Custom finishing function that validates the config.
impl<S: search_config_builder::IsComplete> SearchConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `n_iterations == 0` or a threshold is NaN.
    pub fn build(self) -> Result<SearchConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl SearchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.n_iterations == 0 {
            return Err(ConfigError::InvalidIterations);
        }
        if self.exhaustion_floor.is_nan() {
            return Err(ConfigError::InvalidThreshold {
                field: "exhaustion_floor",
            });
        }
        if self.min_r_squared.is_nan() {
            return Err(ConfigError::InvalidThreshold {
                field: "min_r_squared",
            });
        }
        Ok(())
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self::builder().build().expect("default config is valid")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_market_config_is_valid() {
        let config = MarketConfig::default();
        assert!(config.normalized);
        assert_eq!(config.host_memory_fraction, 0.5);
        assert_eq!(config.spill_policy, SpillPolicy::WhenFull);
        assert!(config.spill_dir.is_none());
    }

    #[test]
    fn test_invalid_memory_fraction() {
        for fraction in [0.0, -0.5, 1.5, f64::NAN] {
            let result = MarketConfig::builder()
                .host_memory_fraction(fraction)
                .build();
            assert!(matches!(result, Err(ConfigError::InvalidMemoryFraction(_))));
        }
        assert!(MarketConfig::builder()
            .host_memory_fraction(1.0)
            .build()
            .is_ok());
    }

    #[test]
    fn test_always_spill_needs_dir() {
        let result = MarketConfig::builder()
            .spill_policy(SpillPolicy::Always)
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::SpillDirRequired);

        let config = MarketConfig::builder()
            .spill_policy(SpillPolicy::Always)
            .spill_dir("/tmp/sketches")
            .build()
            .unwrap();
        assert_eq!(config.spill_dir, Some(PathBuf::from("/tmp/sketches")));
    }

    #[test]
    fn test_default_search_config() {
        let config = SearchConfig::default();
        assert_eq!(config.n_iterations, 2);
        assert_eq!(config.exhaustion_floor, -1.0);
        assert_eq!(config.min_r_squared, f64::NEG_INFINITY);
        assert_eq!(config.n_threads, 0);
    }

    #[test]
    fn test_invalid_search_config() {
        assert!(matches!(
            SearchConfig::builder().n_iterations(0).build(),
            Err(ConfigError::InvalidIterations)
        ));
        assert!(matches!(
            SearchConfig::builder().exhaustion_floor(f64::NAN).build(),
            Err(ConfigError::InvalidThreshold {
                field: "exhaustion_floor"
            })
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConfigError::InvalidIterations.to_string(),
            "n_iterations must be at least 1"
        );
    }
}
