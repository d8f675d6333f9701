//! Gaussian kernel density estimates of the chain marginals.

use std::path::Path;

use faer::Mat;

use crate::{
    chain::ChainState,
    csv_storage::CsvTable,
    error::{validation, DramError, Result},
    math::{gaussian_kernel_sum, interpolate_sorted, sort_floats, std_dev},
};

/// Number of grid points per parameter.
pub const GRID_POINTS: usize = 100;

/// Fraction of the sample range added on both sides of the grid.
const GRID_MARGIN: f64 = 0.08;

/// Marginal posterior densities, one column per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDensities {
    /// `100×p` evaluation grid.
    pub values: Mat<f64>,
    /// `100×p` density at the grid points.
    pub probs: Mat<f64>,
}

impl PosteriorDensities {
    pub fn num_parameters(&self) -> usize {
        self.values.ncols()
    }

    pub fn grid(&self, param: usize) -> Vec<f64> {
        (0..self.values.nrows())
            .map(|i| self.values[(i, param)])
            .collect()
    }

    pub fn density(&self, param: usize) -> Vec<f64> {
        (0..self.probs.nrows()).map(|i| self.probs[(i, param)]).collect()
    }

    /// Write `{name}_value,{name}_density` column pairs to one CSV file.
    pub fn write_csv<S: AsRef<str>>(&self, path: &Path, names: &[S]) -> anyhow::Result<()> {
        anyhow::ensure!(
            names.len() == self.num_parameters(),
            "{} names for {} parameters",
            names.len(),
            self.num_parameters()
        );
        let header: Vec<String> = names
            .iter()
            .flat_map(|name| {
                let name = name.as_ref();
                [format!("{}_value", name), format!("{}_density", name)]
            })
            .collect();
        let mut table = CsvTable::create(path, &header, None)?;
        for i in 0..self.values.nrows() {
            table.write_row(
                (0..self.num_parameters()).flat_map(|j| [self.values[(i, j)], self.probs[(i, j)]]),
            )?;
        }
        table.finish()
    }
}

/// Densities of every parameter column of a chain.
pub fn estimate_densities(chain: &ChainState) -> Result<PosteriorDensities> {
    estimate_densities_of(&chain.chain_q)
}

/// Densities of every column of a `rows×p` sample matrix.
pub fn estimate_densities_of(samples: &Mat<f64>) -> Result<PosteriorDensities> {
    if samples.nrows() == 0 || samples.ncols() == 0 {
        return Err(validation("cannot estimate densities of an empty chain"));
    }
    let mut values = Mat::zeros(GRID_POINTS, samples.ncols());
    let mut probs = Mat::zeros(GRID_POINTS, samples.ncols());
    for j in 0..samples.ncols() {
        let column: Vec<f64> = (0..samples.nrows()).map(|i| samples[(i, j)]).collect();
        let (grid, density) = kernel_density(&column).map_err(|e| match e {
            DramError::Validation(msg) => validation(format!("parameter {}: {}", j, msg)),
            e => e,
        })?;
        for i in 0..GRID_POINTS {
            values[(i, j)] = grid[i];
            probs[(i, j)] = density[i];
        }
    }
    Ok(PosteriorDensities { values, probs })
}

/// Silverman bandwidth `1.06 min(σ, IQR / 1.34) n^(-1/5)`.
///
/// `σ` divides by `n`. If the interquartile range is not positive, `σ` is
/// used alone.
pub fn bandwidth(samples: &[f64]) -> Result<f64> {
    if samples.iter().any(|x| !x.is_finite()) {
        return Err(validation("samples must be finite"));
    }
    let n = samples.len();
    let sigma = std_dev(samples);
    if !(sigma > 0.) {
        return Err(validation("samples have zero spread"));
    }

    let mut sorted = samples.to_vec();
    sort_floats(&mut sorted);
    let quarter = (n as f64 + 1.) / 4.;
    // One-based fractional ranks (n + 1)/4 and 3(n + 1)/4.
    let q1 = interpolate_sorted(&sorted, quarter - 1.);
    let q3 = interpolate_sorted(&sorted, 3. * quarter - 1.);
    let iqr = q3 - q1;

    let scale = if iqr <= 0. { sigma } else { sigma.min(iqr / 1.34) };
    Ok(1.06 * scale * (n as f64).powf(-0.2))
}

/// Grid and density values for one parameter.
pub fn kernel_density(samples: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
    let s = bandwidth(samples)?;
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let range = max - min;
    let start = min - GRID_MARGIN * range;
    let end = max + GRID_MARGIN * range;
    let step = (end - start) / (GRID_POINTS - 1) as f64;

    let norm = 1. / (samples.len() as f64 * s);
    let grid: Vec<f64> = (0..GRID_POINTS)
        .map(|i| {
            if i == GRID_POINTS - 1 {
                end
            } else {
                start + i as f64 * step
            }
        })
        .collect();
    let density = grid
        .iter()
        .map(|&x| gaussian_kernel_sum(x, samples, 1. / s) * norm)
        .collect();
    Ok((grid, density))
}
