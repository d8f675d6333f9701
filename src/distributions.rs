//! Correlated normal and inverse-Wishart draws on top of [`SpdMatrix`].

use faer::Mat;
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use crate::{
    error::{DramError, Result},
    spd_matrix::{mul_vec, symmetric_part, SpdMatrix},
};

pub(crate) fn fill_standard_normal<R: Rng + ?Sized>(rng: &mut R, dest: &mut [f64]) {
    dest.iter_mut().for_each(|x| *x = rng.sample(StandardNormal));
}

/// Draw from `N(0, cov)` as `L z` with `L` the lower Cholesky factor.
pub fn sample_multivariate_normal<R: Rng + ?Sized>(rng: &mut R, cov: &SpdMatrix) -> Vec<f64> {
    let mut z = vec![0f64; cov.dim()];
    fill_standard_normal(rng, &mut z);
    mul_vec(cov.cholesky_lower(), &z)
}

/// Inverse-Wishart distribution `IW(df, scale)`.
///
/// A draw `X` satisfies `X⁻¹ ~ W(df, scale⁻¹)`; the Wishart draw uses the
/// Bartlett decomposition.
#[derive(Debug, Clone)]
pub struct InverseWishart {
    df: f64,
    /// Lower Cholesky factor of `scale⁻¹`.
    precision_lower: Mat<f64>,
    chi_squared: Vec<ChiSquared<f64>>,
}

impl InverseWishart {
    pub fn new(df: f64, scale: Mat<f64>) -> Result<Self> {
        let dim = scale.nrows();
        if !(df > (dim as f64) - 1.) {
            return Err(DramError::InvalidDistribution(format!(
                "inverse-Wishart needs more than {} degrees of freedom, got {df}",
                dim as f64 - 1.
            )));
        }
        let scale = SpdMatrix::new(scale, "inverse-Wishart scale")?;
        let precision = SpdMatrix::new(scale.inverse().clone(), "inverse-Wishart scale inverse")?;
        let chi_squared = (0..dim)
            .map(|i| {
                ChiSquared::new(df - i as f64)
                    .map_err(|e| DramError::InvalidDistribution(format!("{e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            df,
            precision_lower: precision.cholesky_lower().clone(),
            chi_squared,
        })
    }

    pub fn df(&self) -> f64 {
        self.df
    }

    pub fn dim(&self) -> usize {
        self.precision_lower.nrows()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SpdMatrix> {
        let dim = self.dim();
        let mut bartlett = Mat::<f64>::zeros(dim, dim);
        for row in 0..dim {
            bartlett[(row, row)] = self.chi_squared[row].sample(rng).sqrt();
            for col in 0..row {
                bartlett[(row, col)] = rng.sample(StandardNormal);
            }
        }

        let la = &self.precision_lower * &bartlett;
        let wishart = symmetric_part(&(la.as_ref() * la.transpose()));

        let wishart = SpdMatrix::new(wishart, "Wishart draw")?;
        SpdMatrix::new(wishart.inverse().clone(), "inverse-Wishart draw")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn too_few_degrees_of_freedom() {
        let scale = Mat::<f64>::identity(3, 3);
        let err = InverseWishart::new(1.5, scale).unwrap_err();
        assert!(matches!(err, DramError::InvalidDistribution(_)));
    }

    #[test]
    fn singular_scale_is_fatal() {
        let scale = Mat::<f64>::zeros(2, 2);
        let err = InverseWishart::new(10., scale).unwrap_err();
        assert!(matches!(err, DramError::NotPositiveDefinite { .. }));
    }

    #[test]
    fn inverse_wishart_mean() {
        // E[X] = scale / (df - dim - 1)
        let dim = 2;
        let df = 20.;
        let scale = Mat::from_fn(dim, dim, |i, j| if i == j { 2. } else { 0.6 });
        let dist = InverseWishart::new(df, scale.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        let draws = 20_000;
        let mut sum = Mat::<f64>::zeros(dim, dim);
        for _ in 0..draws {
            sum += dist.sample(&mut rng).unwrap().matrix();
        }
        let denom = df - dim as f64 - 1.;
        for i in 0..dim {
            for j in 0..dim {
                let mean = sum[(i, j)] / draws as f64;
                let expected = scale[(i, j)] / denom;
                assert!(
                    (mean - expected).abs() < 0.05 * expected.abs().max(0.05),
                    "entry ({i},{j}): {mean} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn one_dimensional_inverse_wishart_is_inverse_gamma() {
        // IW(df, s) in one dimension has mean s / (df - 2).
        let dist = InverseWishart::new(12., Mat::from_fn(1, 1, |_, _| 5.)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 20_000;
        let mean = (0..draws)
            .map(|_| dist.sample(&mut rng).unwrap().matrix()[(0, 0)])
            .sum::<f64>()
            / draws as f64;
        assert!((mean - 0.5).abs() < 0.02, "{mean}");
    }

    #[test]
    fn multivariate_normal_covariance() {
        let cov = Mat::from_fn(2, 2, |i, j| [[1., 0.8], [0.8, 2.]][i][j]);
        let cov = SpdMatrix::new(cov, "cov").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let draws = 50_000;
        let mut acc = [0f64; 3];
        for _ in 0..draws {
            let x = sample_multivariate_normal(&mut rng, &cov);
            acc[0] += x[0] * x[0];
            acc[1] += x[0] * x[1];
            acc[2] += x[1] * x[1];
        }
        let n = draws as f64;
        assert!((acc[0] / n - 1.).abs() < 0.03);
        assert!((acc[1] / n - 0.8).abs() < 0.03);
        assert!((acc[2] / n - 2.).abs() < 0.05);
    }
}
