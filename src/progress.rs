use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Completion counter shared by parallel workers, printed on one console line
pub struct StageProgress {
    label: String,
    total: usize,
    done: AtomicUsize,
}

impl StageProgress {
    pub fn new(label: &str, total: usize) -> Self {
        Self {
            label: label.to_string(),
            total,
            done: AtomicUsize::new(0),
        }
    }

    /// Count one finished unit and refresh the line
    pub fn tick(&self) -> io::Result<usize> {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let percentage = if self.total > 0 { done * 100 / self.total } else { 100 };
        let mut out = io::stdout().lock();
        write!(out, "\r[Progressing] {} {}/{} ({}%)", self.label, done, self.total, percentage)?;
        out.flush()?;
        Ok(done)
    }

    pub fn finish(&self) -> io::Result<()> {
        println!("\r[Progressing] {} {}/{} (100%)", self.label, self.total, self.total);
        io::stdout().flush()
    }
}

/// Format time as "xx h xx m xx.xxx s" format
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!("[Time used] {:02} h {:02} m {:05.3} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}
