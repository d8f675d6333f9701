//! Plain CSV tables of floating point values.
//!
//! Used for checkpoints and for density and interval records. Values are
//! written in their shortest round-trip representation unless a precision is
//! set, so a checkpoint read back is bit-identical to the one written.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Writer for one CSV file with a header row.
pub(crate) struct CsvTable {
    writer: BufWriter<File>,
    precision: Option<usize>,
    columns: usize,
}

impl CsvTable {
    pub(crate) fn create<S: AsRef<str>>(
        path: &Path,
        header: &[S],
        precision: Option<usize>,
    ) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
        let mut writer = BufWriter::new(file);
        let header: Vec<&str> = header.iter().map(|h| h.as_ref()).collect();
        writeln!(writer, "{}", header.join(","))?;
        Ok(Self {
            writer,
            precision,
            columns: header.len(),
        })
    }

    pub(crate) fn write_row(&mut self, values: impl IntoIterator<Item = f64>) -> Result<()> {
        let row: Vec<String> = values
            .into_iter()
            .map(|v| format_value(v, self.precision))
            .collect();
        if row.len() != self.columns {
            bail!("row has {} values, header has {}", row.len(), self.columns);
        }
        writeln!(self.writer, "{}", row.join(","))?;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush CSV file")
    }
}

fn format_value(v: f64, precision: Option<usize>) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        match precision {
            Some(prec) => format!("{:.prec$}", v),
            None => format!("{:?}", v),
        }
    }
}

fn parse_value(field: &str) -> Result<f64> {
    match field.trim() {
        "NA" => Ok(f64::NAN),
        "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .with_context(|| format!("Invalid number in CSV: {:?}", other)),
    }
}

/// Header and rows of a CSV file written by [`CsvTable`].
pub(crate) fn read_table(path: &Path) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let header: Vec<String> = match lines.next() {
        Some(line) => line?.split(',').map(|s| s.trim().to_string()).collect(),
        None => bail!("CSV file {:?} is empty", path),
    };
    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split(',')
            .map(parse_value)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Bad row {} in {:?}", i + 1, path))?;
        if row.len() != header.len() {
            bail!(
                "row {} in {:?} has {} values, header has {}",
                i + 1,
                path,
                row.len(),
                header.len()
            );
        }
        rows.push(row);
    }
    Ok((header, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn table_round_trip_is_exact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("table.csv");
        let values = [0.1 + 0.2, -1e-300, f64::INFINITY, 12345.678901234567];

        let mut table = CsvTable::create(&path, &["a", "b"], None)?;
        table.write_row(values[..2].iter().copied())?;
        table.write_row(values[2..].iter().copied())?;
        table.finish()?;

        let (header, rows) = read_table(&path)?;
        assert_eq!(header, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(rows, vec![values[..2].to_vec(), values[2..].to_vec()]);
        Ok(())
    }

    #[test]
    fn precision_and_width_checks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("table.csv");
        let mut table = CsvTable::create(&path, &["x"], Some(2))?;
        table.write_row([1.23456])?;
        assert!(table.write_row([1., 2.]).is_err());
        table.finish()?;
        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content, "x\n1.23\n");
        Ok(())
    }
}
