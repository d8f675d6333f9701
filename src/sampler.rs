use faer::Mat;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    adapt::CovarianceTracker,
    chain::{ChainState, RunStart},
    checkpoint::CheckpointStore,
    delayed_rejection::{delayed_rejection_step, CurrentState, ProposalSteps, RejectReason, StepOutcome},
    error::{validation, DramError, Result},
    model::{Calibration, ModelFunc, Parameters},
    residual::{evaluate_residuals, ResidualOutcome},
    residual_cov::{PriorHyperparams, ResidualCovariance},
    spd_matrix::SpdMatrix,
};

/// Settings for the DRAM sampler
#[derive(Debug, Clone, Copy)]
pub struct DramSettings {
    /// Total chain length, including rows of a resumed chain.
    pub num_iterations: usize,
    /// Rows between proposal covariance updates. No adaptation happens
    /// before the first interval is complete.
    pub adapt_interval: usize,
    /// The second stage step is the first stage step divided by this.
    pub second_stage_shrink: f64,
    /// Save a snapshot every this many iterations. The final state is always
    /// saved.
    pub checkpoint_every: Option<usize>,
    /// Log the current parameters every this many iterations.
    pub display_every: Option<usize>,
    pub seed: u64,
}

impl Default for DramSettings {
    fn default() -> Self {
        Self {
            num_iterations: 5000,
            adapt_interval: 100,
            second_stage_shrink: 5.,
            checkpoint_every: Some(1000),
            display_every: Some(200),
            seed: 0,
        }
    }
}

impl DramSettings {
    fn validate(&self) -> Result<()> {
        if self.adapt_interval < 2 {
            return Err(validation("adapt_interval must be at least 2"));
        }
        if !(self.second_stage_shrink.is_finite() && self.second_stage_shrink > 0.) {
            return Err(validation("second_stage_shrink must be positive"));
        }
        if self.checkpoint_every == Some(0) || self.display_every == Some(0) {
            return Err(validation("checkpoint and display intervals must be positive"));
        }
        Ok(())
    }

    /// `2.38 / √p`
    pub fn adaptive_scale(num_parameters: usize) -> f64 {
        2.38 / (num_parameters as f64).sqrt()
    }
}

/// Which proposal, if any, was accepted in an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    FirstStage,
    SecondStage,
    Rejected,
}

/// Counts over the iterations of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub iterations: usize,
    pub first_stage_accepted: usize,
    pub second_stage_accepted: usize,
    pub rejected: usize,
    /// Candidates of either stage outside the parameter bounds.
    pub out_of_bounds: usize,
    /// Candidates of either stage with non-finite residuals.
    pub non_finite: usize,
    /// Candidates of either stage for which a model failed recoverably.
    pub model_errors: usize,
    /// Number of proposal covariance updates.
    pub adaptations: usize,
}

impl SampleStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.iterations == 0 {
            return 0.;
        }
        (self.first_stage_accepted + self.second_stage_accepted) as f64 / self.iterations as f64
    }

    fn record_invalid(&mut self, reason: Option<RejectReason>) {
        match reason {
            Some(RejectReason::OutOfBounds) => self.out_of_bounds += 1,
            Some(RejectReason::NonFinite) => self.non_finite += 1,
            Some(RejectReason::RecoverableModelError) => self.model_errors += 1,
            None => {}
        }
    }
}

/// Reported after every iteration.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub iteration: usize,
    pub num_iterations: usize,
    pub acceptance: Acceptance,
    /// The proposal covariance and step matrices were replaced after this
    /// iteration.
    pub proposal_updated: bool,
    pub stats: SampleStats,
}

#[derive(Debug, Clone)]
pub struct SampleOutput {
    pub chain: ChainState,
    pub stats: SampleStats,
}

/// Generates a DRAM chain for a calibration problem.
#[derive(Debug)]
pub struct ChainSampler<F: ModelFunc> {
    calibration: Calibration<F>,
    parameters: Parameters,
    settings: DramSettings,
}

/// Mutable state of a run between iterations.
struct RunState {
    prior: PriorHyperparams,
    chain_q: Mat<f64>,
    chain_cov_err: Vec<Mat<f64>>,
    last_cov_q: Mat<f64>,
    q: Vec<f64>,
    residual: Mat<f64>,
    cov_q: SpdMatrix,
    cov_err: ResidualCovariance,
    steps: ProposalSteps,
    tracker: CovarianceTracker,
    start: usize,
}

impl RunState {
    fn snapshot(&self, rows: usize) -> ChainState {
        ChainState {
            prior: self.prior.clone(),
            chain_q: self.chain_q.as_ref().subrows(0, rows).to_owned(),
            last_cov_q: self.last_cov_q.clone(),
            chain_cov_err: self.chain_cov_err[..rows].to_vec(),
        }
    }

    fn into_chain(self) -> ChainState {
        ChainState {
            prior: self.prior,
            chain_q: self.chain_q,
            last_cov_q: self.last_cov_q,
            chain_cov_err: self.chain_cov_err,
        }
    }
}

impl<F: ModelFunc> ChainSampler<F> {
    pub fn new(calibration: Calibration<F>, parameters: Parameters, settings: DramSettings) -> Result<Self> {
        parameters.validate()?;
        settings.validate()?;
        Ok(Self {
            calibration,
            parameters,
            settings,
        })
    }

    pub fn calibration(&self) -> &Calibration<F> {
        &self.calibration
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn settings(&self) -> &DramSettings {
        &self.settings
    }

    /// Run with a `ChaCha8Rng` seeded from the settings.
    pub fn sample_seeded<S: CheckpointStore + ?Sized>(
        &self,
        start: RunStart,
        store: &mut S,
    ) -> Result<SampleOutput> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        self.sample(start, &mut rng, store)
    }

    pub fn sample<R: Rng + ?Sized, S: CheckpointStore + ?Sized>(
        &self,
        start: RunStart,
        rng: &mut R,
        store: &mut S,
    ) -> Result<SampleOutput> {
        self.sample_with_progress(start, rng, store, |_| {})
    }

    /// Generate the chain up to `num_iterations` rows, calling `callback`
    /// after every iteration.
    pub fn sample_with_progress<R, S, C>(
        &self,
        start: RunStart,
        rng: &mut R,
        store: &mut S,
        mut callback: C,
    ) -> Result<SampleOutput>
    where
        R: Rng + ?Sized,
        S: CheckpointStore + ?Sized,
        C: FnMut(&Progress),
    {
        let mut state = self.init(start)?;
        let total = self.settings.num_iterations;
        let scale = DramSettings::adaptive_scale(self.parameters.dim());
        let shrink = self.settings.second_stage_shrink;
        let mut stats = SampleStats::default();

        info!(
            "Sampling {} parameters against {} datasets, iterations {}..{}",
            self.parameters.dim(),
            self.calibration.num_datasets(),
            state.start,
            total
        );

        for k in state.start..total {
            if self.settings.display_every.is_some_and(|every| k % every == 0) {
                info!("iteration {}: {:?}", k, state.q);
            }
            if self.settings.checkpoint_every.is_some_and(|every| k % every == 0) {
                store
                    .save(Some(k), &state.snapshot(k))
                    .map_err(DramError::checkpoint)?;
                debug!("Saved checkpoint with {} rows", k);
            }

            let report = delayed_rejection_step(
                rng,
                &self.calibration,
                &self.parameters,
                &state.steps,
                CurrentState {
                    q: &state.q,
                    residual: &state.residual,
                },
                state.cov_err.inverse(),
                state.cov_q.inverse(),
            )?;
            report
                .invalid
                .iter()
                .for_each(|reason| stats.record_invalid(*reason));
            let acceptance = match report.outcome {
                StepOutcome::FirstStage { q, residual } => {
                    state.q = q;
                    state.residual = residual;
                    stats.first_stage_accepted += 1;
                    Acceptance::FirstStage
                }
                StepOutcome::SecondStage { q, residual } => {
                    state.q = q;
                    state.residual = residual;
                    stats.second_stage_accepted += 1;
                    Acceptance::SecondStage
                }
                StepOutcome::Rejected => {
                    stats.rejected += 1;
                    Acceptance::Rejected
                }
            };
            stats.iterations += 1;

            state
                .q
                .iter()
                .enumerate()
                .for_each(|(j, &v)| state.chain_q[(k, j)] = v);
            state.last_cov_q = state.cov_q.matrix().clone();
            state.chain_cov_err.push(state.cov_err.current().matrix().clone());

            state.cov_err.redraw(rng, &state.prior, &state.residual)?;

            let proposal_updated = match state.tracker.observe(k, &state.chain_q) {
                Some(cov) => {
                    state.cov_q = SpdMatrix::new(cov, "proposal covariance")?;
                    state.steps = ProposalSteps::new(&state.cov_q, scale, shrink);
                    stats.adaptations += 1;
                    debug!("Updated proposal covariance at iteration {}", k);
                    true
                }
                None => false,
            };

            callback(&Progress {
                iteration: k,
                num_iterations: total,
                acceptance,
                proposal_updated,
                stats,
            });
        }

        let chain = state.into_chain();
        store.save(None, &chain).map_err(DramError::checkpoint)?;

        let rate = stats.acceptance_rate();
        info!(
            "Finished {} iterations: {} first stage and {} second stage acceptances, {} out of bounds, {} non-finite",
            stats.iterations,
            stats.first_stage_accepted,
            stats.second_stage_accepted,
            stats.out_of_bounds,
            stats.non_finite
        );
        if stats.iterations > 0 && rate < 0.01 {
            warn!("Acceptance rate is only {:.4}", rate);
        }
        Ok(SampleOutput { chain, stats })
    }

    fn init(&self, start: RunStart) -> Result<RunState> {
        let p = self.parameters.dim();
        let num_sets = self.calibration.num_datasets();
        let total = self.settings.num_iterations;
        let shrink = self.settings.second_stage_shrink;
        let interval = self.settings.adapt_interval;

        match start {
            RunStart::Fresh { prior } => {
                let prior = prior.unwrap_or_else(|| PriorHyperparams::uninformative(num_sets));
                prior.validate(num_sets)?;
                if total <= 1 {
                    return Err(validation(format!(
                        "num_iterations must exceed the initial row, got {}",
                        total
                    )));
                }
                let q = self.parameters.values.clone();
                let residual = self.initial_residual(&q)?;
                let cov_q = SpdMatrix::diagonal_heuristic(&q)?;
                let cov_err = ResidualCovariance::from_residual(&residual)?;

                let mut chain_q = Mat::zeros(total, p);
                q.iter().enumerate().for_each(|(j, &v)| chain_q[(0, j)] = v);
                let mut chain_cov_err = Vec::with_capacity(total);
                chain_cov_err.push(cov_err.current().matrix().clone());

                Ok(RunState {
                    prior,
                    chain_q,
                    chain_cov_err,
                    last_cov_q: cov_q.matrix().clone(),
                    steps: ProposalSteps::new(&cov_q, 1., shrink),
                    tracker: CovarianceTracker::new(interval, 1, q.clone(), cov_q.matrix().clone()),
                    q,
                    residual,
                    cov_q,
                    cov_err,
                    start: 1,
                })
            }
            RunStart::Resume(previous) => {
                previous.validate()?;
                previous.prior.validate(num_sets)?;
                if previous.num_parameters() != p {
                    return Err(validation(format!(
                        "previous chain has {} parameters, expected {}",
                        previous.num_parameters(),
                        p
                    )));
                }
                let done = previous.len();
                if total <= done {
                    return Err(validation(format!(
                        "num_iterations ({}) must exceed the {} iterations already done",
                        total, done
                    )));
                }
                let q = previous.row(done - 1);
                let residual = self.initial_residual(&q)?;
                let cov_q = SpdMatrix::new(previous.last_cov_q.clone(), "proposal covariance")?;
                let cov_err = ResidualCovariance::new(previous.chain_cov_err[done - 1].clone())?;

                let chain_q = Mat::from_fn(total, p, |i, j| {
                    if i < done {
                        previous.chain_q[(i, j)]
                    } else {
                        0.
                    }
                });
                let mut chain_cov_err = Vec::with_capacity(total);
                chain_cov_err.extend_from_slice(&previous.chain_cov_err);

                Ok(RunState {
                    steps: ProposalSteps::new(&cov_q, 1., shrink),
                    tracker: CovarianceTracker::resumed(interval, &previous.chain_q, &previous.last_cov_q),
                    prior: previous.prior,
                    chain_q,
                    chain_cov_err,
                    last_cov_q: previous.last_cov_q,
                    q,
                    residual,
                    cov_q,
                    cov_err,
                    start: done,
                })
            }
        }
    }

    /// Residuals at the starting point. Every failure here is fatal.
    fn initial_residual(&self, q: &[f64]) -> Result<Mat<f64>> {
        match evaluate_residuals(&self.calibration, q)? {
            ResidualOutcome::Finite(residual) => Ok(residual),
            ResidualOutcome::NonFinite => Err(validation(
                "model residuals at the starting point are not finite",
            )),
            ResidualOutcome::Recoverable => Err(validation(
                "model failed at the starting point",
            )),
        }
    }
}
