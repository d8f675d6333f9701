//! Running mean and covariance of the chain for adaptive Metropolis.
//!
//! No statistics are collected during the first `interval` rows. At row
//! `interval - 1` mean and covariance are computed directly from the chain,
//! afterwards both are updated recursively with every new row. The proposal
//! covariance is only replaced at the end of each adaptation interval.

use faer::{Col, Mat, Scale};

use crate::spd_matrix::gram;

/// Tracks the empirical mean and covariance (with `n - 1` normalization) of
/// the chain rows.
#[derive(Debug, Clone)]
pub struct CovarianceTracker {
    interval: usize,
    offset: usize,
    mean: Vec<f64>,
    cov: Mat<f64>,
}

impl CovarianceTracker {
    /// Tracker for a chain starting at row `offset` with the given seed
    /// statistics. The seed is replaced by a batch estimate if row
    /// `interval - 1` is still ahead.
    pub fn new(interval: usize, offset: usize, mean: Vec<f64>, cov: Mat<f64>) -> Self {
        assert!(interval >= 2);
        assert!(cov.nrows() == mean.len() && cov.ncols() == mean.len());
        Self {
            interval,
            offset,
            mean,
            cov,
        }
    }

    /// Seeded from the mean of an existing chain and the proposal covariance
    /// it ended with.
    pub fn resumed(interval: usize, chain_q: &Mat<f64>, last_cov_q: &Mat<f64>) -> Self {
        let rows = chain_q.nrows();
        let mean = column_means(chain_q, rows);
        Self::new(interval, rows, mean, last_cov_q.clone())
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.cov
    }

    /// Update the statistics with row `k` of `chain_q`, which must already
    /// hold rows `0..=k`.
    ///
    /// Returns the covariance to commit as new proposal covariance at the
    /// end of an adaptation interval.
    pub fn observe(&mut self, k: usize, chain_q: &Mat<f64>) -> Option<Mat<f64>> {
        let interval = self.interval;
        if k + 1 == interval {
            self.mean = column_means(chain_q, interval);
            self.cov = sample_covariance(chain_q, interval, &self.mean);
            return None;
        }
        if k < interval {
            return None;
        }

        let dim = self.mean.len();
        let kf = k as f64;
        // Deviation from the previous mean, then the Haario mean update.
        let delta = Col::from_fn(dim, |i| chain_q[(k, i)] - self.mean[i]);
        self.mean
            .iter_mut()
            .zip(delta.as_ref().iter())
            .for_each(|(m, d)| *m += d / (kf + 1.));
        // Equal to ((k-1)/k) C + (1/k) (k m_old m_oldᵀ - (k+1) m mᵀ + q qᵀ)
        // without the cancellation of the large outer products.
        let mut outer = delta.as_ref() * delta.transpose();
        outer *= Scale((kf + 1.).recip());
        self.cov *= Scale((kf - 1.) / kf);
        self.cov += &outer;

        if (k + self.offset) % interval == 0 {
            Some(self.cov.clone())
        } else {
            None
        }
    }
}

fn column_means(rows: &Mat<f64>, count: usize) -> Vec<f64> {
    (0..rows.ncols())
        .map(|j| (0..count).map(|i| rows[(i, j)]).sum::<f64>() / count as f64)
        .collect()
}

/// Covariance of the first `count` rows with `count - 1` in the denominator.
fn sample_covariance(rows: &Mat<f64>, count: usize, mean: &[f64]) -> Mat<f64> {
    let centered = Mat::from_fn(count, mean.len(), |i, j| rows[(i, j)] - mean[j]);
    let mut cov = gram(&centered);
    cov *= Scale((count as f64 - 1.).recip());
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn random_chain(rows: usize, seed: u64) -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut chain = Mat::<f64>::zeros(rows, 3);
        for i in 0..rows {
            let z: [f64; 3] = [
                rng.sample(StandardNormal),
                rng.sample(StandardNormal),
                rng.sample(StandardNormal),
            ];
            // Correlated, offset and with very different scales.
            chain[(i, 0)] = 1e3 + z[0];
            chain[(i, 1)] = 0.5 * z[0] + 1e-3 * z[1];
            chain[(i, 2)] = -4. + 10. * z[2];
        }
        chain
    }

    #[test]
    fn recursion_matches_batch_at_every_interval() {
        let interval = 100;
        let chain = random_chain(1000, 17);
        let mut tracker = CovarianceTracker::new(interval, 1, vec![0.; 3], Mat::identity(3, 3));
        for k in 1..chain.nrows() {
            tracker.observe(k, &chain);
            if k >= interval - 1 && (k + 1) % interval == 0 {
                let mean = column_means(&chain, k + 1);
                let cov = sample_covariance(&chain, k + 1, &mean);
                for a in 0..3 {
                    assert!((tracker.mean()[a] - mean[a]).abs() <= 1e-9 * mean[a].abs().max(1.));
                    for b in 0..3 {
                        let scale = (cov[(a, a)] * cov[(b, b)]).sqrt();
                        assert!(
                            (tracker.covariance()[(a, b)] - cov[(a, b)]).abs() <= 1e-9 * scale,
                            "k={k} ({a},{b}): {} vs {}",
                            tracker.covariance()[(a, b)],
                            cov[(a, b)]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn commits_only_at_interval_ends() {
        let chain = random_chain(450, 3);
        let mut tracker = CovarianceTracker::new(100, 1, vec![0.; 3], Mat::identity(3, 3));
        let commits: Vec<usize> = (1..450)
            .filter(|&k| tracker.observe(k, &chain).is_some())
            .collect();
        assert_eq!(commits, vec![199, 299, 399]);
    }

    #[test]
    fn resumed_tracker_uses_offset() {
        let chain = random_chain(350, 5);
        let previous = Mat::from_fn(250, 3, |i, j| chain[(i, j)]);
        let mut tracker = CovarianceTracker::resumed(100, &previous, &Mat::identity(3, 3));
        assert_eq!(tracker.mean(), column_means(&previous, 250).as_slice());

        let commits: Vec<usize> = (250..350)
            .filter(|&k| tracker.observe(k, &chain).is_some())
            .collect();
        // (k + 250) % 100 == 0
        assert_eq!(commits, vec![250]);
    }
}
