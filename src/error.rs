use thiserror::Error;

use crate::within_k::WithinKResult;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Input mismatch ({context}): left is {left_rows}x{left_cols}, right is {right_rows}x{right_cols}")]
    InputMismatch {
        context: String,
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },
    #[error("Invalid membership matrix ({context}): {reason}")]
    InvalidMatrix { context: String, reason: String },
    #[error("Degenerate replicate graph at K={k}: {detail}")]
    DegenerateGraph { k: usize, detail: String },
    #[error("Across-K optimization has no usable solution: {0}")]
    OptimizationInfeasible(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No alignment stored for replicates {a} and {b} at K={k}")]
    MissingPair { k: usize, a: usize, b: usize },
    #[error("K={k} has no modes")]
    EmptyPartition { k: usize },
    /// `partial` holds every within-K result computed before the stop, finished pairs intact
    #[error(
        "Run cancelled during {stage} ({} finished replicate pair(s) kept)",
        .partial.iter().map(|w| w.alignments.len()).sum::<usize>()
    )]
    Cancelled {
        stage: String,
        partial: Vec<WithinKResult>,
    },
    #[error("Failed to parse {path} (line {line}): {detail}")]
    Parse {
        path: String,
        line: usize,
        detail: String,
    },
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Plot rendering failed: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, AlignError>;
