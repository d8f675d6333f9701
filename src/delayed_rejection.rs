//! Two-stage delayed-rejection Metropolis step.
//!
//! A first proposal is drawn with step matrix `R1`. If it is rejected, a
//! second, smaller proposal is drawn with `R2` and accepted with the
//! delayed-rejection probability, which keeps the chain reversible.

use faer::{Mat, Scale};
use rand::Rng;

use crate::{
    distributions::fill_standard_normal,
    error::{validation, Result},
    math::{quadratic_form, sub_into},
    model::{Calibration, ModelFunc, Parameters},
    residual::{evaluate_residuals, sum_of_squares, ResidualOutcome},
    spd_matrix::{mul_vec, SpdMatrix},
};

/// Lower triangular step matrices of both stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalSteps {
    first: Mat<f64>,
    second: Mat<f64>,
}

impl ProposalSteps {
    /// `R1 = scale · chol(cov_q)`, `R2 = R1 / shrink`.
    pub fn new(cov_q: &SpdMatrix, scale: f64, shrink: f64) -> Self {
        let mut first = cov_q.cholesky_lower().clone();
        first *= Scale(scale);
        let mut second = first.clone();
        second *= Scale(shrink.recip());
        Self { first, second }
    }

    pub fn dim(&self) -> usize {
        self.first.nrows()
    }

    pub fn first_stage(&self) -> &Mat<f64> {
        &self.first
    }

    pub fn second_stage(&self) -> &Mat<f64> {
        &self.second
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OutOfBounds,
    NonFinite,
    RecoverableModelError,
}

/// A proposed parameter vector after the bounds and residual checks.
#[derive(Debug)]
pub enum Candidate {
    Valid {
        q: Vec<f64>,
        residual: Mat<f64>,
        sum_squares: f64,
    },
    Rejected {
        q: Vec<f64>,
        reason: RejectReason,
    },
}

impl Candidate {
    pub fn position(&self) -> &[f64] {
        match self {
            Candidate::Valid { q, .. } | Candidate::Rejected { q, .. } => q,
        }
    }

    /// Rejected candidates count as infinitely bad fits.
    pub fn sum_squares(&self) -> f64 {
        match self {
            Candidate::Valid { sum_squares, .. } => *sum_squares,
            Candidate::Rejected { .. } => f64::INFINITY,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Candidate::Valid { .. } => None,
            Candidate::Rejected { reason, .. } => Some(*reason),
        }
    }
}

/// Check bounds, then evaluate residuals and their sum of squares.
///
/// The model is not called for candidates outside the bounds.
pub fn evaluate_candidate<F: ModelFunc>(
    calibration: &Calibration<F>,
    parameters: &Parameters,
    q: Vec<f64>,
    cov_err_inv: &Mat<f64>,
) -> Result<Candidate> {
    if !parameters.in_bounds(&q) {
        return Ok(Candidate::Rejected {
            q,
            reason: RejectReason::OutOfBounds,
        });
    }
    let candidate = match evaluate_residuals(calibration, &q)? {
        ResidualOutcome::Finite(residual) => {
            let sum_squares = sum_of_squares(&residual, cov_err_inv)?;
            Candidate::Valid {
                q,
                residual,
                sum_squares,
            }
        }
        ResidualOutcome::NonFinite => Candidate::Rejected {
            q,
            reason: RejectReason::NonFinite,
        },
        ResidualOutcome::Recoverable => Candidate::Rejected {
            q,
            reason: RejectReason::RecoverableModelError,
        },
    };
    Ok(candidate)
}

/// The three possible results of one iteration.
#[derive(Debug)]
pub enum StepOutcome {
    FirstStage { q: Vec<f64>, residual: Mat<f64> },
    SecondStage { q: Vec<f64>, residual: Mat<f64> },
    Rejected,
}

#[derive(Debug)]
pub struct StepReport {
    pub outcome: StepOutcome,
    /// Why the first and second stage candidates were invalid, if they were.
    pub invalid: [Option<RejectReason>; 2],
}

/// The accepted state a step starts from.
#[derive(Debug, Clone, Copy)]
pub struct CurrentState<'a> {
    pub q: &'a [f64],
    pub residual: &'a Mat<f64>,
}

/// `min(1, exp(-(SS1 - SS0) / 2))`, zero for a rejected candidate with `SS1 = ∞`.
pub(crate) fn first_stage_acceptance(ss0: f64, ss1: f64) -> f64 {
    (-0.5 * (ss1 - ss0)).exp().min(1.)
}

/// Delayed-rejection acceptance of the second stage candidate,
/// `min(1, pi20 · J(q1|q2) / J(q1|q0) · (1 - alpha12) / (1 - alpha10))`.
///
/// `d12` and `d10` are the squared distances of `q1 - q2` and `q1 - q0` in
/// the metric of the inverse proposal covariance. The likelihood and
/// proposal ratios are combined in log space.
pub(crate) fn second_stage_acceptance(
    ss0: f64,
    ss1: f64,
    ss2: f64,
    alpha10: f64,
    d12: f64,
    d10: f64,
) -> f64 {
    let alpha12 = first_stage_acceptance(ss2, ss1);
    if alpha12 == 1. {
        return 0.;
    }
    let log_ratio = -0.5 * (ss2 - ss0) - 0.5 * (d12 - d10);
    (log_ratio.exp() * (1. - alpha12) / (1. - alpha10)).min(1.)
}

/// Proposal and acceptance for one iteration.
///
/// Draw order from `rng`: `p` normals and one uniform for the first stage,
/// then on rejection `p` normals and one uniform for the second stage.
#[allow(clippy::too_many_arguments)]
pub fn delayed_rejection_step<F: ModelFunc, R: Rng + ?Sized>(
    rng: &mut R,
    calibration: &Calibration<F>,
    parameters: &Parameters,
    steps: &ProposalSteps,
    current: CurrentState<'_>,
    cov_err_inv: &Mat<f64>,
    cov_q_inv: &Mat<f64>,
) -> Result<StepReport> {
    let dim = parameters.dim();
    if current.q.len() != dim
        || steps.dim() != dim
        || cov_q_inv.nrows() != dim
        || cov_q_inv.ncols() != dim
    {
        return Err(validation(format!(
            "state, proposal steps and inverse proposal covariance must all have dimension {dim}"
        )));
    }
    let q0 = current.q;
    let ss0 = sum_of_squares(current.residual, cov_err_inv)?;

    let q1 = propose(rng, q0, steps.first_stage());
    let first = evaluate_candidate(calibration, parameters, q1, cov_err_inv)?;
    let ss1 = first.sum_squares();
    let alpha10 = first_stage_acceptance(ss0, ss1);

    let u1: f64 = rng.random();
    let first = match first {
        Candidate::Valid { q, residual, .. } if alpha10 > u1 => {
            return Ok(StepReport {
                outcome: StepOutcome::FirstStage { q, residual },
                invalid: [None, None],
            });
        }
        first => first,
    };

    let q2 = propose(rng, q0, steps.second_stage());
    let second = evaluate_candidate(calibration, parameters, q2, cov_err_inv)?;
    let alpha210 = match &second {
        Candidate::Valid { q: q2, sum_squares: ss2, .. } => {
            let q1 = first.position();
            let mut diff = vec![0f64; dim];
            sub_into(q1, q2, &mut diff);
            let d12 = quadratic_form(&diff, cov_q_inv);
            sub_into(q1, q0, &mut diff);
            let d10 = quadratic_form(&diff, cov_q_inv);
            second_stage_acceptance(ss0, ss1, *ss2, alpha10, d12, d10)
        }
        Candidate::Rejected { .. } => 0.,
    };
    let invalid = [first.reject_reason(), second.reject_reason()];

    let u2: f64 = rng.random();
    let outcome = match second {
        Candidate::Valid { q, residual, .. } if alpha210 > u2 => StepOutcome::SecondStage { q, residual },
        _ => StepOutcome::Rejected,
    };
    Ok(StepReport { outcome, invalid })
}

/// `q0 + R z` with standard normal `z`.
fn propose<R: Rng + ?Sized>(rng: &mut R, q0: &[f64], step: &Mat<f64>) -> Vec<f64> {
    let mut z = vec![0f64; q0.len()];
    fill_standard_normal(rng, &mut z);
    let mut q = mul_vec(step, &z);
    q.iter_mut().zip(q0).for_each(|(q, q0)| *q += q0);
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::DramError,
        model::{test_models::LinearModel, Dataset, ModelSpec},
    };
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn linear() -> Calibration<LinearModel> {
        let x: Vec<f64> = (0..11).map(|i| i as f64 / 10.).collect();
        let y = x.iter().map(|x| 0.8 * x).collect();
        Calibration::new(vec![Dataset::new(x, y)], vec![ModelSpec::new(LinearModel, ())]).unwrap()
    }

    fn residual_at(calibration: &Calibration<LinearModel>, q: &[f64]) -> Mat<f64> {
        match evaluate_residuals(calibration, q).unwrap() {
            ResidualOutcome::Finite(err) => err,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn direct_second_stage(ss0: f64, ss1: f64, ss2: f64, d12: f64, d10: f64) -> f64 {
        let pi20 = (-0.5 * (ss2 - ss0)).exp();
        let j12 = (-0.5 * d12).exp();
        let j10 = (-0.5 * d10).exp();
        let alpha10 = (-0.5 * (ss1 - ss0)).exp().min(1.);
        let alpha12 = (-0.5 * (ss1 - ss2)).exp().min(1.);
        (pi20 * j12 / j10 * (1. - alpha12) / (1. - alpha10)).min(1.)
    }

    #[test]
    fn second_stage_acceptance_matches_direct_formula() {
        let (ss0, ss1, ss2, d12, d10) = (10., 14., 11., 0.7, 1.3);
        let alpha10 = first_stage_acceptance(ss0, ss1);
        assert_relative_eq!(alpha10, (-2f64).exp(), epsilon = 1e-15);
        let alpha210 = second_stage_acceptance(ss0, ss1, ss2, alpha10, d12, d10);
        assert!(alpha210 > 0. && alpha210 < 1., "{alpha210}");
        assert_relative_eq!(
            alpha210,
            direct_second_stage(ss0, ss1, ss2, d12, d10),
            max_relative = 1e-12
        );

        // A much better second candidate saturates at one.
        let alpha210 = second_stage_acceptance(ss0, ss1, 2., alpha10, d12, d10);
        assert_eq!(alpha210, 1.);
    }

    #[test]
    fn second_stage_is_refused_when_it_is_no_better_than_the_first() {
        // alpha12 == 1 whenever SS2 >= SS1.
        assert_eq!(second_stage_acceptance(10., 14., 14., (-2f64).exp(), 0.1, 0.9), 0.);
        assert_eq!(second_stage_acceptance(10., 14., 16., (-2f64).exp(), 0.1, 0.9), 0.);
    }

    #[test]
    fn rejected_first_candidate_leaves_plain_ratio() {
        // SS1 = ∞ gives alpha10 = 0 and alpha12 = 0.
        let ss1 = f64::INFINITY;
        let alpha10 = first_stage_acceptance(10., ss1);
        assert_eq!(alpha10, 0.);
        assert_eq!(first_stage_acceptance(10.4, ss1), 0.);

        let alpha210 = second_stage_acceptance(10., ss1, 10.4, alpha10, 0.2, 0.5);
        assert_relative_eq!(alpha210, (-0.05f64).exp(), max_relative = 1e-12);
        assert_relative_eq!(
            alpha210,
            direct_second_stage(10., ss1, 10.4, 0.2, 0.5),
            max_relative = 1e-12
        );
    }

    #[test]
    fn mismatched_dimensions_are_an_error() {
        let calibration = linear();
        let parameters = Parameters::new(vec![1.0, 0.01]);
        let cov_q = SpdMatrix::diagonal_heuristic(&parameters.values).unwrap();
        let steps = ProposalSteps::new(&cov_q, 1., 5.);
        let residual = residual_at(&calibration, &parameters.values);
        let mut rng = StdRng::seed_from_u64(2);

        let wrong_q = delayed_rejection_step(
            &mut rng,
            &calibration,
            &parameters,
            &steps,
            CurrentState { q: &[1.0], residual: &residual },
            &Mat::identity(1, 1),
            cov_q.inverse(),
        );
        assert!(matches!(wrong_q, Err(DramError::Validation(_))));

        let wrong_cov_err = delayed_rejection_step(
            &mut rng,
            &calibration,
            &parameters,
            &steps,
            CurrentState { q: &parameters.values, residual: &residual },
            &Mat::identity(2, 2),
            cov_q.inverse(),
        );
        assert!(matches!(wrong_cov_err, Err(DramError::Validation(_))));
    }

    #[test]
    fn out_of_bounds_candidate_skips_model() {
        struct Panicking;
        impl ModelFunc for Panicking {
            type Extra = ();
            type Error = std::convert::Infallible;
            fn response(&self, _: &[f64], _: &[f64], _: &()) -> std::result::Result<Vec<f64>, Self::Error> {
                panic!("model must not be called out of bounds")
            }
        }
        let calibration = Calibration::new(
            vec![Dataset::new(vec![0.], vec![0.])],
            vec![ModelSpec::new(Panicking, ())],
        )
        .unwrap();
        let parameters = Parameters::new(vec![0.5]).with_bounds(vec![0.], vec![1.]);
        let inv = Mat::<f64>::identity(1, 1);
        let candidate = evaluate_candidate(&calibration, &parameters, vec![1.5], &inv).unwrap();
        assert_eq!(candidate.reject_reason(), Some(RejectReason::OutOfBounds));
        assert_eq!(candidate.sum_squares(), f64::INFINITY);
    }

    #[test]
    fn out_of_bounds_is_always_rejected() {
        // The true value sits far outside the allowed box, so every better fit
        // is out of bounds.
        let calibration = linear();
        let parameters = Parameters::new(vec![0.1, 0.0]).with_bounds(vec![0.09, -0.01], vec![0.11, 0.01]);
        let cov_q = SpdMatrix::new(Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0. }), "cov").unwrap();
        let steps = ProposalSteps::new(&cov_q, 1., 5.);
        let inv = Mat::<f64>::identity(1, 1);
        let mut rng = StdRng::seed_from_u64(1);

        let mut q = vec![0.1, 0.0];
        let mut residual = residual_at(&calibration, &q);
        for _ in 0..500 {
            let report = delayed_rejection_step(
                &mut rng,
                &calibration,
                &parameters,
                &steps,
                CurrentState { q: &q, residual: &residual },
                &inv,
                cov_q.inverse(),
            )
            .unwrap();
            match report.outcome {
                StepOutcome::FirstStage { q: new, residual: r }
                | StepOutcome::SecondStage { q: new, residual: r } => {
                    assert!(parameters.in_bounds(&new), "accepted {new:?}");
                    q = new;
                    residual = r;
                }
                StepOutcome::Rejected => {}
            }
        }
        assert!(parameters.in_bounds(&q));
    }

    #[test]
    fn identical_streams_give_identical_steps() {
        let calibration = linear();
        let parameters = Parameters::new(vec![1.0, 0.01]);
        let cov_q = SpdMatrix::diagonal_heuristic(&parameters.values).unwrap();
        let steps = ProposalSteps::new(&cov_q, 1., 5.);
        let inv = Mat::from_fn(1, 1, |_, _| 100.);
        let residual = residual_at(&calibration, &parameters.values);

        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| {
                    let report = delayed_rejection_step(
                        &mut rng,
                        &calibration,
                        &parameters,
                        &steps,
                        CurrentState { q: &parameters.values, residual: &residual },
                        &inv,
                        cov_q.inverse(),
                    )
                    .unwrap();
                    match report.outcome {
                        StepOutcome::FirstStage { q, .. } => (1, q),
                        StepOutcome::SecondStage { q, .. } => (2, q),
                        StepOutcome::Rejected => (0, vec![]),
                    }
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(5), run(5));
    }

    #[test]
    fn tiny_steps_are_accepted_in_first_stage() {
        // Tiny steps barely change the fit, so alpha10 is close to one.
        let calibration = linear();
        let parameters = Parameters::new(vec![2.0, 0.0]);
        let cov_q = SpdMatrix::new(Mat::from_fn(2, 2, |i, j| if i == j { 1e-10 } else { 0. }), "cov").unwrap();
        let steps = ProposalSteps::new(&cov_q, 1., 5.);
        let inv = Mat::from_fn(1, 1, |_, _| 1.);
        let residual = residual_at(&calibration, &parameters.values);
        let mut rng = StdRng::seed_from_u64(9);
        let mut first = 0;
        for _ in 0..200 {
            let report = delayed_rejection_step(
                &mut rng,
                &calibration,
                &parameters,
                &steps,
                CurrentState { q: &parameters.values, residual: &residual },
                &inv,
                cov_q.inverse(),
            )
            .unwrap();
            if let StepOutcome::FirstStage { .. } = report.outcome {
                first += 1;
            }
        }
        assert!(first > 150, "{first}");
    }
}
