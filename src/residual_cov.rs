//! Conjugate inverse-Wishart update of the residual covariance.

use faer::Mat;
use rand::Rng;

use crate::{
    distributions::InverseWishart,
    error::{validation, Result},
    spd_matrix::{gram, SpdMatrix},
};

/// Scale `psi_s` and degrees of freedom `nu_s` of the inverse-Wishart prior
/// on the `N×N` residual covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorHyperparams {
    pub psi_s: Mat<f64>,
    pub nu_s: f64,
}

impl PriorHyperparams {
    /// Zero scale and zero degrees of freedom, so the posterior is
    /// determined by the residuals alone.
    pub fn uninformative(num_datasets: usize) -> Self {
        Self {
            psi_s: Mat::zeros(num_datasets, num_datasets),
            nu_s: 0.,
        }
    }

    /// A caller supplied scale. Degrees of freedom default to one.
    pub fn new(psi_s: Mat<f64>, nu_s: Option<f64>) -> Self {
        Self {
            psi_s,
            nu_s: nu_s.unwrap_or(1.),
        }
    }

    pub fn dim(&self) -> usize {
        self.psi_s.nrows()
    }

    pub(crate) fn validate(&self, num_datasets: usize) -> Result<()> {
        if self.psi_s.nrows() != num_datasets || self.psi_s.ncols() != num_datasets {
            return Err(validation(format!(
                "prior scale must be {num_datasets}x{num_datasets}, got {}x{}",
                self.psi_s.nrows(),
                self.psi_s.ncols()
            )));
        }
        if !self.nu_s.is_finite() || self.nu_s < 0. {
            return Err(validation(format!(
                "prior degrees of freedom must be finite and non-negative, got {}",
                self.nu_s
            )));
        }
        Ok(())
    }
}

/// The residual covariance in force for the current iteration.
#[derive(Debug, Clone)]
pub struct ResidualCovariance {
    current: SpdMatrix,
}

impl ResidualCovariance {
    pub fn new(cov_err: Mat<f64>) -> Result<Self> {
        Ok(Self {
            current: SpdMatrix::new(cov_err, "residual covariance")?,
        })
    }

    /// `errᵀ err` of the initial residual.
    pub fn from_residual(residual: &Mat<f64>) -> Result<Self> {
        Self::new(gram(residual))
    }

    pub fn current(&self) -> &SpdMatrix {
        &self.current
    }

    pub fn inverse(&self) -> &Mat<f64> {
        self.current.inverse()
    }

    /// Replace the covariance with a draw from
    /// `IW(nu_s + n, psi_s + errᵀ err)` for the accepted residual `err`.
    pub fn redraw<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        prior: &PriorHyperparams,
        residual: &Mat<f64>,
    ) -> Result<()> {
        let num_points = residual.nrows();
        let scale = gram(residual) + &prior.psi_s;
        let dist = InverseWishart::new(prior.nu_s + num_points as f64, scale)?;
        self.current = dist.sample(rng)?;
        Ok(())
    }
}
