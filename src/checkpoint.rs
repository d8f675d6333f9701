//! Persisting chain state during and after a run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use faer::Mat;

use crate::{
    chain::ChainState,
    csv_storage::{read_table, CsvTable},
    residual_cov::PriorHyperparams,
};

/// Destination for chain snapshots.
///
/// `iteration` is `Some(k)` for the periodic snapshot taken at the start of
/// iteration `k` and `None` for the final state. Later saves replace earlier
/// ones.
pub trait CheckpointStore {
    fn save(&mut self, iteration: Option<usize>, state: &ChainState) -> Result<()>;

    /// The final state of a previous run, if there is one.
    fn load(&self) -> Result<Option<ChainState>>;
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoint;

impl CheckpointStore for NoCheckpoint {
    fn save(&mut self, _iteration: Option<usize>, _state: &ChainState) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<Option<ChainState>> {
        Ok(None)
    }
}

/// Keeps the most recent snapshot in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpoint {
    latest: Option<ChainState>,
    saves: Vec<(Option<usize>, usize)>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&ChainState> {
        self.latest.as_ref()
    }

    /// Iteration and row count of every save so far.
    pub fn saves(&self) -> &[(Option<usize>, usize)] {
        &self.saves
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn save(&mut self, iteration: Option<usize>, state: &ChainState) -> Result<()> {
        self.saves.push((iteration, state.len()));
        self.latest = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<ChainState>> {
        Ok(self.latest.clone())
    }
}

/// A directory of CSV files per snapshot.
///
/// Periodic snapshots go to `chains_{k}/`, the final state to `chains/`.
/// Each directory holds `prior.csv`, `chain_q.csv`, `last_cov_q.csv` and
/// `chain_cov_err.csv`, the latter with one row-major flattened matrix per
/// chain row.
#[derive(Debug, Clone)]
pub struct CsvCheckpoint {
    root: PathBuf,
}

impl CsvCheckpoint {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn snapshot_dir(&self, iteration: Option<usize>) -> PathBuf {
        match iteration {
            Some(k) => self.root.join(format!("chains_{}", k)),
            None => self.root.join("chains"),
        }
    }

    pub fn write_dir(dir: &Path, state: &ChainState) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

        let n = state.num_datasets();
        let mut header = vec!["nu_s".to_string()];
        header.extend(matrix_header("psi_s", n));
        let mut prior = CsvTable::create(&dir.join("prior.csv"), &header, None)?;
        prior.write_row(std::iter::once(state.prior.nu_s).chain(flatten(&state.prior.psi_s)))?;
        prior.finish()?;

        let p = state.num_parameters();
        let param_header: Vec<String> = (0..p).map(|j| format!("q{}", j)).collect();
        write_matrix(&dir.join("chain_q.csv"), &param_header, &state.chain_q)?;
        write_matrix(&dir.join("last_cov_q.csv"), &param_header, &state.last_cov_q)?;

        let mut cov_err =
            CsvTable::create(&dir.join("chain_cov_err.csv"), &matrix_header("cov_err", n), None)?;
        for cov in &state.chain_cov_err {
            cov_err.write_row(flatten(cov))?;
        }
        cov_err.finish()
    }

    pub fn read_dir(dir: &Path) -> Result<ChainState> {
        let (_, prior_rows) = read_table(&dir.join("prior.csv"))?;
        let [prior_row] = prior_rows.as_slice() else {
            bail!("prior.csv must contain exactly one row");
        };
        let Some((&nu_s, psi_s)) = prior_row.split_first() else {
            bail!("prior.csv has no degrees of freedom");
        };
        let n = square_side(psi_s.len()).context("prior.csv has a malformed scale")?;
        let prior = PriorHyperparams {
            nu_s,
            psi_s: unflatten(psi_s, n),
        };

        let (_, q_rows) = read_table(&dir.join("chain_q.csv"))?;
        let (header, cov_rows) = read_table(&dir.join("last_cov_q.csv"))?;
        let p = header.len();
        if cov_rows.len() != p {
            bail!("last_cov_q.csv must have {} rows, found {}", p, cov_rows.len());
        }
        check_widths("last_cov_q.csv", &cov_rows, p)?;
        check_widths("chain_q.csv", &q_rows, p)?;
        let chain_q = Mat::from_fn(q_rows.len(), p, |i, j| q_rows[i][j]);
        let last_cov_q = Mat::from_fn(p, p, |i, j| cov_rows[i][j]);

        let (_, err_rows) = read_table(&dir.join("chain_cov_err.csv"))?;
        check_widths("chain_cov_err.csv", &err_rows, n * n)?;
        let chain_cov_err = err_rows.iter().map(|row| unflatten(row, n)).collect();

        let state = ChainState {
            prior,
            chain_q,
            last_cov_q,
            chain_cov_err,
        };
        state
            .validate()
            .with_context(|| format!("Inconsistent checkpoint in {:?}", dir))?;
        Ok(state)
    }
}

impl CheckpointStore for CsvCheckpoint {
    fn save(&mut self, iteration: Option<usize>, state: &ChainState) -> Result<()> {
        Self::write_dir(&self.snapshot_dir(iteration), state)
    }

    fn load(&self) -> Result<Option<ChainState>> {
        let dir = self.snapshot_dir(None);
        if !dir.exists() {
            return Ok(None);
        }
        Self::read_dir(&dir).map(Some)
    }
}

fn matrix_header(name: &str, n: usize) -> Vec<String> {
    (0..n)
        .flat_map(|i| (0..n).map(move |j| format!("{}_{}_{}", name, i, j)))
        .collect()
}

fn flatten(m: &Mat<f64>) -> impl Iterator<Item = f64> + '_ {
    (0..m.nrows()).flat_map(move |i| (0..m.ncols()).map(move |j| m[(i, j)]))
}

fn unflatten(values: &[f64], n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| values[i * n + j])
}

fn check_widths(file: &str, rows: &[Vec<f64>], width: usize) -> Result<()> {
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
        bail!("{} row {} has {} values, expected {}", file, i, row.len(), width);
    }
    Ok(())
}

fn square_side(len: usize) -> Option<usize> {
    let side = (len as f64).sqrt().round() as usize;
    (side > 0 && side * side == len).then_some(side)
}

fn write_matrix(path: &Path, header: &[String], m: &Mat<f64>) -> Result<()> {
    let mut table = CsvTable::create(path, header, None)?;
    for i in 0..m.nrows() {
        table.write_row((0..m.ncols()).map(|j| m[(i, j)]))?;
    }
    table.finish()
}
