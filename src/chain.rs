use faer::Mat;

use crate::{
    error::{validation, Result},
    residual_cov::PriorHyperparams,
};

/// Everything needed to continue a run: the prior, every recorded row and
/// the last proposal covariance.
///
/// This is also the checkpoint record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub prior: PriorHyperparams,
    /// `M×p`, one accepted parameter vector per row.
    pub chain_q: Mat<f64>,
    /// `p×p` proposal covariance in force during the last recorded iteration.
    pub last_cov_q: Mat<f64>,
    /// `M` residual covariances of size `N×N`, in force during each row.
    pub chain_cov_err: Vec<Mat<f64>>,
}

/// How a run begins.
#[derive(Debug, Clone)]
pub enum RunStart {
    /// Start at the initial parameter values. Without a prior the
    /// uninformative one is used.
    Fresh { prior: Option<PriorHyperparams> },
    /// Continue after the last row of a previous run.
    Resume(ChainState),
}

impl Default for RunStart {
    fn default() -> Self {
        RunStart::Fresh { prior: None }
    }
}

impl ChainState {
    pub fn len(&self) -> usize {
        self.chain_q.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_parameters(&self) -> usize {
        self.chain_q.ncols()
    }

    pub fn num_datasets(&self) -> usize {
        self.prior.dim()
    }

    pub fn row(&self, index: usize) -> Vec<f64> {
        (0..self.num_parameters())
            .map(|j| self.chain_q[(index, j)])
            .collect()
    }

    pub fn last_row(&self) -> Option<Vec<f64>> {
        self.len().checked_sub(1).map(|last| self.row(last))
    }

    /// Values of one parameter across all rows.
    pub fn column(&self, param: usize) -> Vec<f64> {
        (0..self.len()).map(|i| self.chain_q[(i, param)]).collect()
    }

    /// Rows `from..`, e.g. to drop a burn-in phase before post-processing.
    pub fn burn_in(&self, from: usize) -> Result<ChainState> {
        if from >= self.len() {
            return Err(validation(format!(
                "cannot discard {from} of {} rows",
                self.len()
            )));
        }
        Ok(self.rows(from, self.len()))
    }

    /// Copy of rows `start..end`.
    pub(crate) fn rows(&self, start: usize, end: usize) -> ChainState {
        ChainState {
            prior: self.prior.clone(),
            chain_q: self.chain_q.as_ref().subrows(start, end - start).to_owned(),
            last_cov_q: self.last_cov_q.clone(),
            chain_cov_err: self.chain_cov_err[start..end].to_vec(),
        }
    }

    /// Posterior mean of every parameter.
    pub fn parameter_mean(&self) -> Vec<f64> {
        let rows = self.len() as f64;
        (0..self.num_parameters())
            .map(|j| (0..self.len()).map(|i| self.chain_q[(i, j)]).sum::<f64>() / rows)
            .collect()
    }

    /// Check that all parts agree on `M`, `p` and `N`.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(validation("chain has no rows"));
        }
        let p = self.num_parameters();
        let n = self.num_datasets();
        if self.prior.psi_s.ncols() != n {
            return Err(validation("prior scale is not square"));
        }
        if self.last_cov_q.nrows() != p || self.last_cov_q.ncols() != p {
            return Err(validation(format!(
                "last proposal covariance must be {p}x{p}, got {}x{}",
                self.last_cov_q.nrows(),
                self.last_cov_q.ncols()
            )));
        }
        if self.chain_cov_err.len() != self.len() {
            return Err(validation(format!(
                "{} residual covariances for {} chain rows",
                self.chain_cov_err.len(),
                self.len()
            )));
        }
        if let Some(bad) = self
            .chain_cov_err
            .iter()
            .position(|c| c.nrows() != n || c.ncols() != n)
        {
            return Err(validation(format!(
                "residual covariance {bad} is not {n}x{n}"
            )));
        }
        Ok(())
    }
}
