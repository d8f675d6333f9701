//! Delayed Rejection Adaptive Metropolis sampling for calibrating one
//! parametric model against several datasets at once.
//!
//! [`ChainSampler`] generates the chain of parameter vectors and residual
//! covariances. [`estimate_densities`] and [`propagate_intervals`] turn a
//! finished chain into marginal posterior densities and credible and
//! prediction bands.

pub(crate) mod adapt;
pub(crate) mod chain;
pub(crate) mod checkpoint;
pub(crate) mod csv_storage;
pub(crate) mod delayed_rejection;
pub(crate) mod density;
pub(crate) mod distributions;
pub(crate) mod error;
pub(crate) mod intervals;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod residual;
pub(crate) mod residual_cov;
pub(crate) mod sampler;
pub(crate) mod spd_matrix;

pub use adapt::CovarianceTracker;
pub use chain::{ChainState, RunStart};
pub use checkpoint::{CheckpointStore, CsvCheckpoint, MemoryCheckpoint, NoCheckpoint};
pub use delayed_rejection::{
    delayed_rejection_step, evaluate_candidate, Candidate, CurrentState, ProposalSteps,
    RejectReason, StepOutcome, StepReport,
};
pub use density::{bandwidth, estimate_densities, estimate_densities_of, kernel_density, PosteriorDensities, GRID_POINTS};
pub use distributions::{sample_multivariate_normal, InverseWishart};
pub use error::{DramError, Result};
pub use intervals::{propagate_intervals, sample_indices, IntervalBands, QUANTILES};
pub use model::{Calibration, Dataset, ModelError, ModelFunc, ModelSpec, Parameters};
pub use residual::{evaluate_residuals, sum_of_squares, ResidualOutcome};
pub use residual_cov::{PriorHyperparams, ResidualCovariance};
pub use sampler::{Acceptance, ChainSampler, DramSettings, Progress, SampleOutput, SampleStats};
pub use spd_matrix::SpdMatrix;
