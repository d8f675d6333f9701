use faer::Mat;
use itertools::izip;
use multiversion::multiversion;

use crate::spd_matrix::mul_vec;

const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Compute `xᵀ A x` for a square matrix `A`.
pub(crate) fn quadratic_form(x: &[f64], a: &Mat<f64>) -> f64 {
    vector_dot(x, &mul_vec(a, x))
}

/// `out = a - b`
pub(crate) fn sub_into(a: &[f64], b: &[f64], out: &mut [f64]) {
    assert!(a.len() == b.len() && a.len() == out.len());
    izip!(a, b, out).for_each(|(a, b, out)| *out = a - b);
}

pub(crate) fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|x| x.is_finite())
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by `n`).
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    let mu = mean(values);
    let ss: f64 = values.iter().map(|x| (x - mu) * (x - mu)).sum();
    (ss / values.len() as f64).sqrt()
}

/// Sum of standard normal kernels `Σ φ((x - sample_i) · inv_bandwidth)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn gaussian_kernel_sum(x: f64, samples: &[f64], inv_bandwidth: f64) -> f64 {
    samples
        .iter()
        .map(|&s| {
            let z = (x - s) * inv_bandwidth;
            (-0.5 * z * z).exp()
        })
        .sum::<f64>()
        * INV_SQRT_2PI
}

/// Linearly interpolate sorted order statistics at a fractional rank.
///
/// Ranks below 0 or above `len - 1` clamp to the extreme values.
pub(crate) fn interpolate_sorted(sorted: &[f64], rank: f64) -> f64 {
    assert!(!sorted.is_empty());
    let last = sorted.len() - 1;
    if rank <= 0. {
        return sorted[0];
    }
    if rank >= last as f64 {
        return sorted[last];
    }
    let lo = rank.floor() as usize;
    let frac = rank - lo as f64;
    if frac == 0. {
        return sorted[lo];
    }
    (1. - frac) * sorted[lo] + frac * sorted[lo + 1]
}

pub(crate) fn sort_floats(values: &mut [f64]) {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
}
