//! Aggregated benchmark results.

use core::fmt::{self, Display, Formatter};
use std::error::Error;

use serde::Serialize;

use crate::{engine::Run, WorkerStat};

/// Percentiles reported, in percent.
pub const PERCENTILES: [u64; 9] = [50, 65, 75, 80, 90, 95, 98, 99, 100];

/// Report output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Latency at the given percentile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentile {
    pub percent: u64,
    /// Latency in milliseconds.
    pub ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Number of requests completed.
    pub requests: u64,
    pub elapsed_secs: f64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub requests_per_sec: f64,
    /// Human-scaled transfer rate.
    pub transfer_per_sec: String,
    pub errors: u64,
    pub percentiles: Vec<Percentile>,
    pub connections: usize,
    pub connections_done: usize,
    pub connections_aborted: usize,
    /// Whether some connections gave up before completion.
    pub partial: bool,
}

impl Report {
    /// Reduces the given run into the report.
    pub fn new(run: &Run) -> Self {
        let mut report = Self::from_stats(&run.stats, run.completed, run.elapsed.as_secs_f64());
        report.connections = run.connections;
        report.connections_done = run.num_done;
        report.connections_aborted = run.num_aborted;
        report.partial = run.is_partial();

        report
    }

    /// Sums per-worker statistics and computes rates over the given elapsed
    /// time.
    pub fn from_stats(stats: &[WorkerStat], requests: u64, elapsed_secs: f64) -> Self {
        let bytes_read: u64 = stats.iter().map(WorkerStat::bytes_rx).sum();
        let bytes_written: u64 = stats.iter().map(WorkerStat::bytes_tx).sum();
        let errors = stats.iter().map(WorkerStat::num_errors).sum();

        let mut timings: Vec<u64> = stats.iter().flat_map(|s| s.timings().iter().copied()).collect();
        timings.sort_unstable();

        let percentiles = PERCENTILES
            .iter()
            .filter_map(|&percent| percentile(&timings, percent).map(|ms| Percentile { percent, ms }))
            .collect();

        let (requests_per_sec, transfer_per_sec) = match elapsed_secs > 0.0 {
            true => (
                requests as f64 / elapsed_secs,
                (bytes_read + bytes_written) as f64 / elapsed_secs,
            ),
            false => (0.0, 0.0),
        };

        Self {
            requests,
            elapsed_secs,
            bytes_read,
            bytes_written,
            requests_per_sec,
            transfer_per_sec: format_flow(transfer_per_sec),
            errors,
            percentiles,
            connections: stats.len(),
            connections_done: stats.len(),
            connections_aborted: 0,
            partial: false,
        }
    }

    /// Renders this report in the given format.
    pub fn render(&self, format: Format) -> Result<String, Box<dyn Error>> {
        let out = match format {
            Format::Text => self.to_string(),
            Format::Json => serde_json::to_string_pretty(self)? + "\n",
            Format::Yaml => serde_yaml::to_string(self)?,
        };

        Ok(out)
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} requests in {:.2}s, {} read, {} write",
            self.requests,
            self.elapsed_secs,
            format_flow(self.bytes_read as f64),
            format_flow(self.bytes_written as f64)
        )?;
        writeln!(f, "Requests/sec: {:.2}", self.requests_per_sec)?;
        writeln!(f, "Transfer/sec: {}", self.transfer_per_sec)?;
        writeln!(f, "Error(s)    : {}", self.errors)?;
        writeln!(f, "Percentage of the requests served within a certain time (ms)")?;
        for p in &self.percentiles {
            writeln!(f, "   {:>3}%\t\t\t\t{}", p.percent, p.ms)?;
        }

        Ok(())
    }
}

/// Returns the value at the given percentile of the sorted sequence.
///
/// The value is taken at index `ceil(p / 100 * N) - 1`. Returns `None` for
/// an empty sequence.
pub fn percentile(sorted: &[u64], percent: u64) -> Option<u64> {
    let len = sorted.len() as u64;
    let rank = (percent * len).div_ceil(100);

    sorted.get(rank.max(1) as usize - 1).copied()
}

/// Formats the number of bytes using human-scaled units.
pub fn format_flow(size: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let (v, suffix) = if size > GB {
        (size / GB, "GB")
    } else if size > MB {
        (size / MB, "MB")
    } else if size > KB {
        (size / KB, "KB")
    } else {
        (size, "bytes")
    };

    format!("{v:.2}{suffix}")
}
