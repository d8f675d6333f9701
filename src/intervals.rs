//! Credible and prediction bands from a finished chain.
//!
//! Sampled parameter vectors are pushed through the model. The spread of the
//! responses gives the credible band, adding residual noise drawn from the
//! matching residual covariance gives the prediction band.

use std::path::Path;

use faer::Mat;
use rand::Rng;

use crate::{
    chain::ChainState,
    csv_storage::CsvTable,
    distributions::sample_multivariate_normal,
    error::{validation, DramError, Result},
    math::{interpolate_sorted, sort_floats},
    model::{Calibration, ModelFunc},
    spd_matrix::SpdMatrix,
};

/// Lower bound, median and upper bound of a central 95% band.
pub const QUANTILES: [f64; 3] = [0.025, 0.5, 0.975];

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalBands {
    /// Per dataset, `3×n` quantiles of the model response.
    pub credible: Vec<Mat<f64>>,
    /// Per dataset, `3×n` quantiles of the response plus residual noise.
    pub prediction: Vec<Mat<f64>>,
}

impl IntervalBands {
    pub fn median(&self, dataset: usize) -> Vec<f64> {
        let band = &self.credible[dataset];
        (0..band.ncols()).map(|j| band[(1, j)]).collect()
    }

    /// Write `credible_{i}.csv` and `prediction_{i}.csv` for every dataset
    /// into `dir`, one row per quantile level.
    pub fn write_csv(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        for (kind, bands) in [("credible", &self.credible), ("prediction", &self.prediction)] {
            for (i, band) in bands.iter().enumerate() {
                let mut header = vec!["level".to_string()];
                header.extend((0..band.ncols()).map(|j| format!("x{}", j)));
                let path = dir.join(format!("{}_{}.csv", kind, i));
                let mut table = CsvTable::create(&path, &header, None)?;
                for (row, level) in QUANTILES.iter().enumerate() {
                    table.write_row(
                        std::iter::once(*level).chain((0..band.ncols()).map(|j| band[(row, j)])),
                    )?;
                }
                table.finish()?;
            }
        }
        Ok(())
    }
}

/// Chain rows to propagate: all of them in order if `num_samples` equals the
/// chain length, otherwise uniform draws with replacement.
pub fn sample_indices<R: Rng + ?Sized>(rng: &mut R, len: usize, num_samples: usize) -> Vec<usize> {
    if num_samples == len {
        (0..len).collect()
    } else {
        (0..num_samples).map(|_| rng.random_range(0..len)).collect()
    }
}

/// Monte Carlo credible and prediction bands at every data point.
///
/// Each selected row contributes one noise vector of length `N`; component
/// `i` is added to every point of dataset `i`.
pub fn propagate_intervals<F: ModelFunc, R: Rng + ?Sized>(
    rng: &mut R,
    calibration: &Calibration<F>,
    chain: &ChainState,
    num_samples: usize,
) -> Result<IntervalBands> {
    chain.validate()?;
    let num_sets = calibration.num_datasets();
    let n = calibration.num_points();
    if chain.num_datasets() != num_sets {
        return Err(validation(format!(
            "chain has {}x{} residual covariances for {} datasets",
            chain.num_datasets(),
            chain.num_datasets(),
            num_sets
        )));
    }
    if num_samples == 0 {
        return Err(validation("at least one sample is required"));
    }

    let indices = sample_indices(rng, chain.len(), num_samples);
    let mut responses: Vec<Mat<f64>> = (0..num_sets).map(|_| Mat::zeros(num_samples, n)).collect();
    let mut predictions: Vec<Mat<f64>> = (0..num_sets).map(|_| Mat::zeros(num_samples, n)).collect();

    for (s, &index) in indices.iter().enumerate() {
        let q = chain.row(index);
        let cov_err = SpdMatrix::new(chain.chain_cov_err[index].clone(), "residual covariance")?;
        let noise = sample_multivariate_normal(rng, &cov_err);
        for (i, (data, model)) in calibration.iter().enumerate() {
            let y = model
                .func
                .response(&q, &data.xdata, &model.extra)
                .map_err(|e| DramError::ModelFailure(Box::new(e)))?;
            if y.len() != n {
                return Err(DramError::ResidualLength {
                    dataset: i,
                    expected: n,
                    found: y.len(),
                });
            }
            for (j, y) in y.into_iter().enumerate() {
                responses[i][(s, j)] = y;
                predictions[i][(s, j)] = y + noise[i];
            }
        }
    }

    Ok(IntervalBands {
        credible: responses.iter().map(quantile_band).collect(),
        prediction: predictions.iter().map(quantile_band).collect(),
    })
}

/// Quantiles of every column of a `samples×n` matrix.
fn quantile_band(samples: &Mat<f64>) -> Mat<f64> {
    let rows = samples.nrows();
    let mut band = Mat::zeros(QUANTILES.len(), samples.ncols());
    let mut column = vec![0f64; rows];
    for j in 0..samples.ncols() {
        column
            .iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = samples[(i, j)]);
        sort_floats(&mut column);
        for (k, level) in QUANTILES.iter().enumerate() {
            band[(k, j)] = interpolate_sorted(&column, level * (rows - 1) as f64);
        }
    }
    band
}
