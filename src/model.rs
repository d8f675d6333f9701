//! Caller-supplied models and the data they are calibrated against.
//!
//! A calibration problem consists of `N` datasets, each paired with a
//! [`ModelSpec`]. All datasets share one parameter vector and must contain
//! the same number of points `n`.

use std::{convert::Infallible, fmt::Debug};

use crate::error::{validation, Result};

/// Errors returned by a model function.
pub trait ModelError: std::error::Error + Send + Sync + 'static {
    /// Recoverable errors reject the current candidate, unrecoverable
    /// errors stop sampling.
    fn is_recoverable(&self) -> bool;
}

impl ModelError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// A parametric forward model.
///
/// `Extra` carries auxiliary fixed values. It is stored per dataset in
/// [`ModelSpec`] and passed through to every call unchanged.
pub trait ModelFunc {
    type Extra: Debug;
    type Error: ModelError;

    /// Predicted response at every point of `xdata`.
    fn response(
        &self,
        params: &[f64],
        xdata: &[f64],
        extra: &Self::Extra,
    ) -> std::result::Result<Vec<f64>, Self::Error>;

    /// Residual series for `params`. Defaults to predicted minus observed.
    fn residual(
        &self,
        params: &[f64],
        xdata: &[f64],
        ydata: &[f64],
        extra: &Self::Extra,
    ) -> std::result::Result<Vec<f64>, Self::Error> {
        let mut out = self.response(params, xdata, extra)?;
        out.iter_mut().zip(ydata).for_each(|(r, y)| *r -= y);
        Ok(out)
    }
}

/// An independent variable series and the matching observations.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub xdata: Vec<f64>,
    pub ydata: Vec<f64>,
}

impl Dataset {
    pub fn new(xdata: Vec<f64>, ydata: Vec<f64>) -> Self {
        Self { xdata, ydata }
    }
}

#[derive(Debug)]
pub struct ModelSpec<F: ModelFunc> {
    pub func: F,
    pub extra: F::Extra,
}

impl<F: ModelFunc> ModelSpec<F> {
    pub fn new(func: F, extra: F::Extra) -> Self {
        Self { func, extra }
    }
}

/// Validated datasets and their models.
#[derive(Debug)]
pub struct Calibration<F: ModelFunc> {
    datasets: Vec<Dataset>,
    models: Vec<ModelSpec<F>>,
    num_points: usize,
}

impl<F: ModelFunc> Calibration<F> {
    pub fn new(datasets: Vec<Dataset>, models: Vec<ModelSpec<F>>) -> Result<Self> {
        if datasets.is_empty() {
            return Err(validation("at least one dataset is required"));
        }
        if datasets.len() != models.len() {
            return Err(validation(format!(
                "unequal numbers of sets: {} datasets but {} models",
                datasets.len(),
                models.len()
            )));
        }
        let num_points = datasets[0].xdata.len();
        if num_points == 0 {
            return Err(validation("datasets must not be empty"));
        }
        for (i, data) in datasets.iter().enumerate() {
            if data.xdata.len() != num_points || data.ydata.len() != num_points {
                return Err(validation(format!(
                    "unequal numbers of data points: dataset {i} has {} inputs and {} outputs, expected {num_points}",
                    data.xdata.len(),
                    data.ydata.len()
                )));
            }
        }
        Ok(Self {
            datasets,
            models,
            num_points,
        })
    }

    /// Number of datasets `N`.
    pub fn num_datasets(&self) -> usize {
        self.datasets.len()
    }

    /// Number of points `n` in every dataset.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn models(&self) -> &[ModelSpec<F>] {
        &self.models
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Dataset, &ModelSpec<F>)> {
        self.datasets.iter().zip(self.models.iter())
    }
}

/// Names, starting values and bounds of the calibrated parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub names: Vec<String>,
    pub values: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Parameters {
    /// Unbounded parameters with default names `theta1, theta2, ...`.
    pub fn new(values: Vec<f64>) -> Self {
        let dim = values.len();
        Self {
            names: (0..dim).map(|i| format!("theta{}", i + 1)).collect(),
            values,
            lower: vec![f64::NEG_INFINITY; dim],
            upper: vec![f64::INFINITY; dim],
        }
    }

    pub fn with_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn in_bounds(&self, q: &[f64]) -> bool {
        q.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(&x, (&lo, &hi))| x >= lo && x <= hi)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let p = self.dim();
        if p == 0 {
            return Err(validation("at least one parameter is required"));
        }
        if self.names.len() != p || self.lower.len() != p || self.upper.len() != p {
            return Err(validation(format!(
                "parameter table mismatch: {p} values, {} names, {} lower and {} upper limits",
                self.names.len(),
                self.lower.len(),
                self.upper.len()
            )));
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(validation("initial parameter values must be finite"));
        }
        if !self.in_bounds(&self.values) {
            return Err(validation("initial parameter values violate their limits"));
        }
        Ok(())
    }
}
