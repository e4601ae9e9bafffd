//! Predictor configuration with builder pattern.
//!
//! [`PredictorConfig`] uses the `bon` crate for builder generation and
//! validates its fields when built.
//!
//! # Example
//!
//! ```
//! use forest_infer::PredictorConfig;
//!
//! // All defaults: 64-row blocks, unroll depth 8, current rayon pool
//! let config = PredictorConfig::builder().build().unwrap();
//! assert_eq!(config.block_size, 64);
//!
//! let config = PredictorConfig::builder()
//!     .block_size(128)
//!     .n_threads(std::num::NonZeroUsize::new(4).unwrap())
//!     .build()
//!     .unwrap();
//! ```

use std::num::NonZeroUsize;

use bon::Builder;

use crate::error::ConfigError;
use crate::explain::{Condition, FeatureGroupMap};
use crate::utils::Parallelism;

/// Default number of rows per block.
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Default number of in-flight converted rows per worker for adapter input.
pub const DEFAULT_UNROLL_DEPTH: usize = 8;

/// Configuration for [`CpuPredictor`](crate::predict::CpuPredictor).
#[derive(Debug, Clone, Builder)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct PredictorConfig {
    /// Rows per block. Default: 64.
    ///
    /// A block is the unit of work handed to a worker; all trees in the
    /// requested range are evaluated over the block before moving on.
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    /// Converted rows that may be alive per worker in the adapter path. Default: 8.
    #[builder(default = DEFAULT_UNROLL_DEPTH)]
    pub unroll_depth: usize,

    /// Number of threads. `None` uses the current rayon pool.
    pub n_threads: Option<NonZeroUsize>,
}

/// Custom finishing function that validates the config.
impl<S: predictor_config_builder::IsComplete> PredictorConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `block_size` or `unroll_depth` is zero.
    pub fn build(self) -> Result<PredictorConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl PredictorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.unroll_depth == 0 {
            return Err(ConfigError::InvalidUnrollDepth);
        }
        Ok(())
    }

    /// Raw thread count (`0` = auto) for [`run_with_threads`](crate::run_with_threads).
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.n_threads.map_or(0, NonZeroUsize::get)
    }

    /// Parallelism implied by the thread count.
    #[inline]
    pub fn parallelism(&self) -> Parallelism {
        Parallelism::from_threads(self.thread_count())
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            unroll_depth: DEFAULT_UNROLL_DEPTH,
            n_threads: None,
        }
    }
}

/// Options for contribution and interaction prediction.
///
/// ```
/// use forest_infer::ContributionOptions;
///
/// let weights = [1.0, 0.5];
/// let options = ContributionOptions::builder()
///     .tree_weights(&weights)
///     .approximate(true)
///     .build();
/// assert_eq!(options.tree_limit, 0);
/// ```
#[derive(Debug, Clone, Default, Builder)]
pub struct ContributionOptions<'a> {
    /// Number of leading trees to use. `0` or a value past the end means all.
    #[builder(default)]
    pub tree_limit: usize,

    /// One weight per tree of the model, scaling each tree's attribution.
    pub tree_weights: Option<&'a [f32]>,

    /// Use path attribution instead of exact Shapley values.
    #[builder(default)]
    pub approximate: bool,

    /// Merge features into attribution columns.
    pub feature_groups: Option<&'a FeatureGroupMap>,

    /// Conditioning for a single contribution pass. Ignored by interaction
    /// prediction, which runs its own conditioned passes.
    #[builder(default)]
    pub condition: Condition,

    /// Column the condition applies to.
    #[builder(default)]
    pub condition_column: u32,
}
