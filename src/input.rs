use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AlignError, Result};
use crate::matrix::{MembershipMatrix, ReplicateSet};

/// Supported replicate file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Whitespace separated memberships, leading label columns allowed
    GeneralQ,
    /// ADMIXTURE `.Q` output
    Admixture,
    /// fastStructure `.meanQ` output
    FastStructure,
    /// STRUCTURE `_f` result file
    Structure,
}

impl InputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            InputFormat::GeneralQ => "generalQ",
            InputFormat::Admixture => "admixture",
            InputFormat::FastStructure => "fastStructure",
            InputFormat::Structure => "structure",
        }
    }

    /// Whether a file name belongs to this format
    pub fn accepts(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') {
            return false;
        }
        match self {
            InputFormat::GeneralQ => file_name.ends_with(".Q") || file_name.ends_with(".txt"),
            InputFormat::Admixture => file_name.ends_with(".Q"),
            InputFormat::FastStructure => file_name.ends_with(".meanQ"),
            InputFormat::Structure => file_name.ends_with("_f") || file_name.ends_with("_f.txt"),
        }
    }

    /// Parse one file's text into raw membership rows
    pub fn parse(&self, text: &str, path: &str) -> Result<Vec<Vec<f64>>> {
        let rows = match self {
            InputFormat::GeneralQ => parse_q_rows(text, path, true)?,
            InputFormat::Admixture | InputFormat::FastStructure => parse_q_rows(text, path, false)?,
            InputFormat::Structure => parse_structure_rows(text, path)?,
        };
        if rows.is_empty() {
            return Err(AlignError::Parse {
                path: path.to_string(),
                line: 0,
                detail: "no membership rows found".to_string(),
            });
        }
        Ok(rows)
    }
}

impl std::str::FromStr for InputFormat {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generalq" => Ok(InputFormat::GeneralQ),
            "admixture" => Ok(InputFormat::Admixture),
            "faststructure" => Ok(InputFormat::FastStructure),
            "structure" => Ok(InputFormat::Structure),
            _ => Err(format!(
                "Unknown input format: {}. Supported formats: structure, fastStructure, admixture, generalQ",
                s
            )),
        }
    }
}

fn push_row(rows: &mut Vec<Vec<f64>>, row: Vec<f64>, path: &str, line: usize) -> Result<()> {
    if let Some(first) = rows.first() {
        if first.len() != row.len() {
            return Err(AlignError::Parse {
                path: path.to_string(),
                line,
                detail: format!("expected {} memberships, found {}", first.len(), row.len()),
            });
        }
    }
    rows.push(row);
    Ok(())
}

/// One individual per non-empty line.
///
/// With `skip_labels`, leading tokens are dropped up to the longest all-numeric tail.
fn parse_q_rows(text: &str, path: &str, skip_labels: bool) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() || tokens[0].starts_with('#') {
            continue;
        }
        let parsed: Vec<Option<f64>> = tokens.iter().map(|t| t.parse::<f64>().ok()).collect();
        let start = if skip_labels {
            parsed.iter().rposition(|v| v.is_none()).map_or(0, |p| p + 1)
        } else {
            match tokens.iter().zip(&parsed).find(|(_, v)| v.is_none()) {
                Some((bad, _)) => {
                    return Err(AlignError::Parse {
                        path: path.to_string(),
                        line: idx + 1,
                        detail: format!("non-numeric membership '{}'", bad),
                    })
                }
                None => 0,
            }
        };
        let row: Vec<f64> = parsed[start..].iter().flatten().copied().collect();
        if row.is_empty() {
            return Err(AlignError::Parse {
                path: path.to_string(),
                line: idx + 1,
                detail: "line holds no memberships".to_string(),
            });
        }
        push_row(&mut rows, row, path, idx + 1)?;
    }
    Ok(rows)
}

/// Rows of the "Inferred ancestry of individuals" block; memberships follow the `:`
fn parse_structure_rows(text: &str, path: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    let mut in_block = false;
    for (idx, line) in text.lines().enumerate() {
        if !in_block {
            if line.contains("Inferred ancestry of individuals") {
                in_block = true;
            }
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if rows.is_empty() {
                continue;
            }
            break;
        }
        let Some((_, values)) = trimmed.split_once(':') else {
            continue;
        };
        let row: Vec<f64> = values
            .split_whitespace()
            .map_while(|t| t.parse::<f64>().ok())
            .collect();
        // Header line: "Label (%Miss) :  Inferred clusters"
        if row.is_empty() {
            continue;
        }
        push_row(&mut rows, row, path, idx + 1)?;
    }
    if !in_block {
        return Err(AlignError::Parse {
            path: path.to_string(),
            line: 0,
            detail: "no 'Inferred ancestry of individuals' block".to_string(),
        });
    }
    Ok(rows)
}

/// Files of `format` in `dir`, in lexicographic order
pub fn list_replicate_files(dir: &Path, format: InputFormat) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if format.accepts(&name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Parse and normalize one replicate file
pub fn load_matrix(path: &Path, format: InputFormat) -> Result<MembershipMatrix> {
    let display = path.display().to_string();
    let text = fs::read_to_string(path)?;
    let rows = format.parse(&text, &display)?;
    MembershipMatrix::normalized_rows(&rows).map_err(|e| match e {
        AlignError::InvalidMatrix { context, reason } => AlignError::InvalidMatrix {
            context: format!("{} {}", display, context),
            reason,
        },
        other => other,
    })
}

/// Load every replicate in `dir` and group them by K
pub fn load_replicates(dir: &Path, format: InputFormat) -> Result<ReplicateSet> {
    let files = list_replicate_files(dir, format)?;
    if files.is_empty() {
        return Err(AlignError::Configuration(format!(
            "no {} files found in {}",
            format.name(),
            dir.display()
        )));
    }
    let mut named = Vec::with_capacity(files.len());
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        named.push((name, load_matrix(path, format)?));
    }
    ReplicateSet::from_named(named)
}
