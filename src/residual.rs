use faer::Mat;

use crate::{
    error::{validation, DramError, Result},
    math::all_finite,
    model::{Calibration, ModelError, ModelFunc},
    spd_matrix::gram,
};

/// Result of evaluating every dataset's residual at one parameter vector.
#[derive(Debug)]
pub enum ResidualOutcome {
    /// `n×N` residual matrix, one column per dataset.
    Finite(Mat<f64>),
    /// Some residual was NaN or infinite.
    NonFinite,
    /// A model returned an error marked as recoverable.
    Recoverable,
}

/// Evaluate the residual of every dataset at `params`.
///
/// Unrecoverable model errors and residuals of the wrong length are fatal.
pub fn evaluate_residuals<F: ModelFunc>(
    calibration: &Calibration<F>,
    params: &[f64],
) -> Result<ResidualOutcome> {
    let n = calibration.num_points();
    let mut err = Mat::<f64>::zeros(n, calibration.num_datasets());
    for (dataset, (data, model)) in calibration.iter().enumerate() {
        let residual = match model
            .func
            .residual(params, &data.xdata, &data.ydata, &model.extra)
        {
            Ok(residual) => residual,
            Err(e) if e.is_recoverable() => return Ok(ResidualOutcome::Recoverable),
            Err(e) => return Err(DramError::ModelFailure(Box::new(e))),
        };
        if residual.len() != n {
            return Err(DramError::ResidualLength {
                dataset,
                expected: n,
                found: residual.len(),
            });
        }
        if !all_finite(&residual) {
            return Ok(ResidualOutcome::NonFinite);
        }
        residual
            .iter()
            .enumerate()
            .for_each(|(i, &r)| err[(i, dataset)] = r);
    }
    Ok(ResidualOutcome::Finite(err))
}

/// `trace(errᵀ err Σ⁻¹)` using the joint inverse residual covariance.
pub fn sum_of_squares(err: &Mat<f64>, cov_err_inv: &Mat<f64>) -> Result<f64> {
    let k = err.ncols();
    if cov_err_inv.nrows() != k || cov_err_inv.ncols() != k {
        return Err(validation(format!(
            "inverse residual covariance must be {k}x{k}, got {}x{}",
            cov_err_inv.nrows(),
            cov_err_inv.ncols()
        )));
    }
    let gram = gram(err);
    let weighted = &gram * cov_err_inv;
    Ok(weighted.diagonal().column_vector().iter().sum())
}
