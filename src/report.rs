//! Plain text outputs of every stage, and readers for the ones later runs reload.
//!
//! Floats use Rust's shortest round-trip formatting, so reading a file back gives the exact
//! values that were written. Mode numbers in files are 1-based (`K3M1` is the major mode).

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::across_k::{AcrossKAlignment, EdgeAlignment};
use crate::error::{AlignError, Result};
use crate::matrix::{MembershipMatrix, ReplicateSet};
use crate::pipeline::{KResult, PipelineResult};
use crate::within_k::WithinKResult;

pub const INPUT_DIR: &str = "input";
pub const WITHIN_K_DIR: &str = "alignment_withinK";
pub const MODES_DIR: &str = "modes";
pub const ACROSS_K_DIR: &str = "alignment_acrossK";
pub const VISUALIZATION_DIR: &str = "visualization";

fn join_usize(values: &[usize]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

fn parse_error(path: &Path, line: usize, detail: impl Into<String>) -> AlignError {
    AlignError::Parse {
        path: path.display().to_string(),
        line,
        detail: detail.into(),
    }
}

fn parse_usize_list(text: &str, path: &Path, line: usize) -> Result<Vec<usize>> {
    text.split_whitespace()
        .map(|t| {
            t.parse::<usize>()
                .map_err(|_| parse_error(path, line, format!("invalid index '{}'", t)))
        })
        .collect()
}

fn parse_f64(text: &str, path: &Path, line: usize) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| parse_error(path, line, format!("invalid number '{}'", text)))
}

/// Data lines of a CSV file with the expected header, split on commas
fn read_csv(path: &Path, header: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if idx == 0 {
            if line.trim() != header {
                return Err(parse_error(path, 1, format!("expected header '{}'", header)));
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        out.push((idx + 1, line.split(',').map(|s| s.to_string()).collect()));
    }
    Ok(out)
}

pub fn write_matrix(path: &Path, matrix: &MembershipMatrix) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for i in 0..matrix.rows() {
        let row: Vec<String> = matrix.row(i).iter().map(|v| v.to_string()).collect();
        writeln!(writer, "{}", row.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_matrix(path: &Path) -> Result<MembershipMatrix> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|t| parse_f64(t, path, idx + 1))
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    MembershipMatrix::from_rows(&rows)
}

pub const WITHIN_K_HEADER: &str = "replicate_a,replicate_b,cost,permutation";

/// One line of a within-K alignment table; gaps have neither cost nor permutation
#[derive(Debug, Clone, PartialEq)]
pub struct WithinKRecord {
    pub replicate_a: String,
    pub replicate_b: String,
    pub cost: Option<f64>,
    pub permutation: Option<Vec<usize>>,
}

pub fn write_within_k(path: &Path, within: &WithinKResult) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", WITHIN_K_HEADER)?;
    let r = within.replicate_count();
    for i in 0..r {
        for j in (i + 1)..r {
            match within.alignments.get(&(i, j)) {
                Some(alignment) => writeln!(
                    writer,
                    "{},{},{},{}",
                    within.names[i],
                    within.names[j],
                    alignment.cost,
                    join_usize(&alignment.permutation)
                )?,
                None => writeln!(writer, "{},{},NA,", within.names[i], within.names[j])?,
            }
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn read_within_k(path: &Path) -> Result<Vec<WithinKRecord>> {
    let mut out = Vec::new();
    for (line, fields) in read_csv(path, WITHIN_K_HEADER)? {
        if fields.len() != 4 {
            return Err(parse_error(path, line, "expected 4 fields"));
        }
        let (cost, permutation) = if fields[2] == "NA" {
            (None, None)
        } else {
            (
                Some(parse_f64(&fields[2], path, line)?),
                Some(parse_usize_list(&fields[3], path, line)?),
            )
        };
        out.push(WithinKRecord {
            replicate_a: fields[0].clone(),
            replicate_b: fields[1].clone(),
            cost,
            permutation,
        });
    }
    Ok(out)
}

pub const MODE_LABELS_HEADER: &str = "replicate,name,mode";

#[derive(Debug, Clone, PartialEq)]
pub struct ModeLabelRecord {
    pub replicate: usize,
    pub name: String,
    /// 0-based mode id
    pub mode: usize,
}

pub fn write_mode_labels(path: &Path, result: &KResult) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", MODE_LABELS_HEADER)?;
    for (r, &mode) in result.detection.labels.iter().enumerate() {
        writeln!(writer, "{},{},{}", r + 1, result.within.names[r], mode + 1)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_mode_labels(path: &Path) -> Result<Vec<ModeLabelRecord>> {
    let mut out = Vec::new();
    for (line, fields) in read_csv(path, MODE_LABELS_HEADER)? {
        if fields.len() != 3 {
            return Err(parse_error(path, line, "expected 3 fields"));
        }
        let number = |s: &str| -> Result<usize> {
            match s.trim().parse::<usize>() {
                Ok(v) if v >= 1 => Ok(v - 1),
                _ => Err(parse_error(path, line, format!("invalid 1-based index '{}'", s))),
            }
        };
        out.push(ModeLabelRecord {
            replicate: number(&fields[0])?,
            name: fields[1].clone(),
            mode: number(&fields[2])?,
        });
    }
    Ok(out)
}

fn mode_name(k: usize, mode: usize) -> String {
    format!("K{}M{}", k, mode + 1)
}

pub fn write_mode_stats(path: &Path, per_k: &[KResult]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "K,mode,size,representative,mean_cost,var_cost,mean_cost_to_rep")?;
    for result in per_k {
        for summary in &result.extraction.modes {
            writeln!(
                writer,
                "{},{},{},{},{},{},{}",
                result.k,
                summary.mode + 1,
                summary.stats.size,
                result.within.names[summary.representative],
                summary.stats.mean_cost,
                summary.stats.var_cost,
                summary.stats.mean_cost_to_rep
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_alignment_to_modes(path: &Path, per_k: &[KResult]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "K,replicate,mode,cost,permutation")?;
    for result in per_k {
        for summary in &result.extraction.modes {
            for member in &summary.members {
                writeln!(
                    writer,
                    "{},{},{},{},{}",
                    result.k,
                    result.within.names[member.replicate],
                    summary.mode + 1,
                    member.cost,
                    join_usize(&member.permutation)
                )?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_edges(path: &Path, edges: &[EdgeAlignment]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "mode_low,mode_high,cost,matching")?;
    for edge in edges {
        let matching: Vec<String> = edge.matching.iter().map(|(a, b)| format!("{}-{}", a, b)).collect();
        writeln!(
            writer,
            "{},{},{},{}",
            mode_name(edge.low.k, edge.low.mode),
            mode_name(edge.high.k, edge.high.mode),
            edge.cost,
            matching.join(" ")
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn write_lineages(path: &Path, across: &AcrossKAlignment) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "K,mode,column,label,parent,inherited")?;
    for entry in &across.lineages {
        let parent = entry
            .parent
            .map(|(k, m, c)| format!("{}C{}", mode_name(k, m), c))
            .unwrap_or_default();
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            entry.k,
            entry.mode + 1,
            entry.column,
            entry.label,
            parent,
            entry.inherited
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Edge table, best pairs and lineages for one anchor kind
pub fn write_across_k(dir: &Path, across: &AcrossKAlignment) -> Result<()> {
    fs::create_dir_all(dir)?;
    let suffix = across.anchor.suffix();
    write_edges(&dir.join(format!("alignment_acrossK_{}.csv", suffix)), &across.edges)?;
    write_edges(&dir.join(format!("best_pairs_{}.csv", suffix)), &across.best_pairs)?;
    write_lineages(&dir.join(format!("lineages_{}.csv", suffix)), across)?;
    Ok(())
}

/// Persist every stage under `output`
pub fn write_results(output: &Path, replicates: &ReplicateSet, result: &PipelineResult) -> Result<()> {
    let input_dir = output.join(INPUT_DIR);
    let within_dir = output.join(WITHIN_K_DIR);
    let modes_dir = output.join(MODES_DIR);
    for dir in [&input_dir, &within_dir, &modes_dir] {
        fs::create_dir_all(dir)?;
    }

    for k_result in &result.per_k {
        let k = k_result.k;
        for (r, replicate) in replicates.replicates(k).iter().enumerate() {
            write_matrix(&input_dir.join(format!("K{}R{}.Q", k, r + 1)), &replicate.matrix)?;
        }
        write_within_k(&within_dir.join(format!("K{}.csv", k)), &k_result.within)?;
        write_mode_labels(&modes_dir.join(format!("K{}_modes.csv", k)), k_result)?;
        for summary in &k_result.extraction.modes {
            let name = mode_name(k, summary.mode);
            write_matrix(&modes_dir.join(format!("{}_rep.Q", name)), &summary.representative_matrix)?;
            write_matrix(&modes_dir.join(format!("{}_avg.Q", name)), &summary.consensus)?;
        }
    }
    write_mode_stats(&modes_dir.join("mode_stats.csv"), &result.per_k)?;
    write_alignment_to_modes(&modes_dir.join("alignment_to_modes.csv"), &result.per_k)?;
    write_across_k(&output.join(ACROSS_K_DIR), &result.across_k)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::within_k::tests_support::within_from_costs;

    #[test]
    fn matrix_values_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.Q");
        let m = MembershipMatrix::normalized_rows(&[
            vec![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
            vec![0.1, 0.2, 0.7],
            vec![0.123456789012345, 0.5, 0.376543210987655],
        ])
        .unwrap();
        write_matrix(&path, &m).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), m);
    }

    #[test]
    fn within_k_table_keeps_costs_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("K2.csv");
        let within = within_from_costs(
            2,
            &[
                vec![Some(0.0), Some(0.1 + 0.2), None],
                vec![Some(0.1 + 0.2), Some(0.0), Some(0.05)],
                vec![None, Some(0.05), Some(0.0)],
            ],
        );
        write_within_k(&path, &within).unwrap();
        let records = read_within_k(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].cost, Some(0.1 + 0.2));
        assert_eq!(records[0].permutation, Some(vec![0, 1]));
        assert_eq!(records[1].replicate_b, "rep2");
        assert_eq!(records[1].cost, None);
        assert_eq!(records[2].cost, Some(0.05));
    }

    #[test]
    fn wrong_header_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(matches!(read_mode_labels(&path), Err(AlignError::Parse { line: 1, .. })));
    }
}
