use faer::{
    linalg::solvers::{Llt, Solve},
    Col, Mat, Scale, Side,
};

use crate::error::{validation, DramError, Result};

const SYMMETRY_REL_TOL: f64 = 1e-8;
const SYMMETRY_ABS_TOL: f64 = 1e-12;

/// A symmetric positive definite matrix together with its lower Cholesky
/// factor and its inverse.
///
/// Construction fails if the factorization fails, so a value of this type
/// can always be used to draw correlated normals or evaluate quadratic forms.
#[derive(Debug, Clone)]
pub struct SpdMatrix {
    matrix: Mat<f64>,
    lower: Mat<f64>,
    inverse: Mat<f64>,
}

impl SpdMatrix {
    /// Factorize `matrix`. `what` names the matrix in the error message.
    pub fn new(matrix: Mat<f64>, what: &'static str) -> Result<Self> {
        let n = matrix.nrows();
        if n == 0 || matrix.ncols() != n {
            return Err(validation(format!(
                "{what} must be a non-empty square matrix, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if !is_finite(&matrix) || !is_symmetric(&matrix) {
            return Err(DramError::NotPositiveDefinite { what });
        }

        let llt = Llt::new(matrix.as_ref(), Side::Lower)
            .map_err(|_| DramError::NotPositiveDefinite { what })?;
        let factor = llt.L().to_owned();
        let lower = Mat::from_fn(n, n, |i, j| if j <= i { factor[(i, j)] } else { 0. });
        let inverse = symmetric_part(&llt.solve(Mat::<f64>::identity(n, n).as_ref()));
        if !is_finite(&inverse) {
            return Err(DramError::NotPositiveDefinite { what });
        }

        Ok(Self {
            matrix,
            lower,
            inverse,
        })
    }

    /// Initial proposal covariance: `(0.05 q_i)²` on the diagonal, `1` where `q_i == 0`.
    pub fn diagonal_heuristic(initial: &[f64]) -> Result<Self> {
        let n = initial.len();
        let cov = Mat::from_fn(n, n, |i, j| {
            if i != j {
                0.
            } else if initial[i] == 0. {
                1.
            } else {
                (0.05 * initial[i]).powi(2)
            }
        });
        Self::new(cov, "initial proposal covariance")
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &Mat<f64> {
        &self.matrix
    }

    /// Lower triangular `L` with `L Lᵀ` equal to the matrix.
    pub fn cholesky_lower(&self) -> &Mat<f64> {
        &self.lower
    }

    pub fn inverse(&self) -> &Mat<f64> {
        &self.inverse
    }

    pub fn into_inner(self) -> Mat<f64> {
        self.matrix
    }
}

fn is_finite(matrix: &Mat<f64>) -> bool {
    (0..matrix.ncols()).all(|j| (0..matrix.nrows()).all(|i| matrix[(i, j)].is_finite()))
}

fn is_symmetric(matrix: &Mat<f64>) -> bool {
    let n = matrix.nrows();
    for j in 0..n {
        for i in (j + 1)..n {
            let a = matrix[(i, j)];
            let b = matrix[(j, i)];
            let scale = a.abs().max(b.abs());
            if (a - b).abs() > SYMMETRY_ABS_TOL + SYMMETRY_REL_TOL * scale {
                return false;
            }
        }
    }
    true
}

/// `(A + Aᵀ) / 2`, exactly symmetric.
pub(crate) fn symmetric_part(a: &Mat<f64>) -> Mat<f64> {
    let mut out = a.as_ref() + a.transpose();
    out *= Scale(0.5);
    out
}

/// `Aᵀ A` for an `n×k` matrix, returned as a `k×k` matrix.
pub(crate) fn gram(a: &Mat<f64>) -> Mat<f64> {
    symmetric_part(&(a.transpose() * a.as_ref()))
}

/// `A z` for a plain slice `z`.
pub(crate) fn mul_vec(a: &Mat<f64>, z: &[f64]) -> Vec<f64> {
    let col = Col::from_fn(z.len(), |i| z[i]);
    let out = a * &col;
    out.as_ref().iter().copied().collect()
}
