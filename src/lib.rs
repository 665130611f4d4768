//! Align replicate membership matrices within and across K.

use std::io::{BufWriter, Write};

pub mod across_k;
pub mod assignment;
pub mod distance;
pub mod error;
pub mod extract;
pub mod input;
pub mod matrix;
pub mod modes;
pub mod pairwise;
pub mod pipeline;
pub mod plot;
pub mod progress;
pub mod report;
pub mod within_k;

pub use error::{AlignError, Result};

// Version information constants
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timestamped run log written next to the results
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }
}
