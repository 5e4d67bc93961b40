//! Operation timings
//!
//! Every facade call that touches a table reports its duration here, keyed by
//! table and operation. The registry exposes the aggregate as a report for an
//! external admin surface, plus a plain-text rendering of it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Samples kept per (table, operation) for the trimmed average
const SAMPLE_WINDOW: usize = 1000;

/// Share of samples dropped from each end for the trimmed average
const TRIM_FRACTION: f64 = 0.1;

/// Facade operations that are timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Open,
    Insert,
    Update,
    Delete,
    InsertOrUpdate,
    Truncate,
    Select,
    NextSequence,
    NextSecondarySequence,
    ResetSequence,
    Compact,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::InsertOrUpdate => "insert_or_update",
            Operation::Truncate => "truncate",
            Operation::Select => "select",
            Operation::NextSequence => "next_sequence",
            Operation::NextSecondarySequence => "next_secondary_sequence",
            Operation::ResetSequence => "reset_sequence",
            Operation::Compact => "compact",
        }
    }

    /// Whether the operation changes durable state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Open | Operation::Select)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct TimingStats {
    count: u64,
    total: Duration,
    fastest: Duration,
    slowest: Duration,
    samples: VecDeque<Duration>,
    last_recorded: DateTime<Utc>,
}

impl TimingStats {
    fn new(elapsed: Duration) -> Self {
        let mut samples = VecDeque::with_capacity(16);
        samples.push_back(elapsed);
        TimingStats {
            count: 1,
            total: elapsed,
            fastest: elapsed,
            slowest: elapsed,
            samples,
            last_recorded: Utc::now(),
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.fastest = self.fastest.min(elapsed);
        self.slowest = self.slowest.max(elapsed);
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        self.last_recorded = Utc::now();
    }

    fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total.as_nanos() / self.count as u128) as u64)
    }
}

/// Mean after dropping the fastest and slowest tenth of the samples
pub fn trimmed_average(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted = samples.to_vec();
    sorted.sort();

    let trim = (sorted.len() as f64 * TRIM_FRACTION).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    let total: u128 = kept.iter().map(Duration::as_nanos).sum();
    Duration::from_nanos((total / kept.len() as u128) as u64)
}

/// One row of the timing report
#[derive(Debug, Clone, PartialEq)]
pub struct TimingReport {
    pub table: String,
    pub operation: Operation,
    pub count: u64,
    pub fastest: Duration,
    pub slowest: Duration,
    pub average: Duration,
    pub trimmed_average: Duration,
    pub total: Duration,
    pub last_recorded: DateTime<Utc>,
}

/// Aggregated timings for every table of a registry
#[derive(Debug, Default)]
pub struct TimingRegistry {
    stats: DashMap<(String, Operation), TimingStats>,
}

impl TimingRegistry {
    pub fn new() -> Self {
        TimingRegistry {
            stats: DashMap::new(),
        }
    }

    pub fn record(&self, table: &str, operation: Operation, elapsed: Duration) {
        self.stats
            .entry((table.to_string(), operation))
            .and_modify(|s| s.record(elapsed))
            .or_insert_with(|| TimingStats::new(elapsed));
    }

    /// Report rows sorted by table, then operation
    pub fn report(&self) -> Vec<TimingReport> {
        let mut rows: Vec<TimingReport> = self
            .stats
            .iter()
            .map(|entry| {
                let (table, operation) = entry.key();
                let stats = entry.value();
                let samples: Vec<Duration> = stats.samples.iter().copied().collect();
                TimingReport {
                    table: table.clone(),
                    operation: *operation,
                    count: stats.count,
                    fastest: stats.fastest,
                    slowest: stats.slowest,
                    average: stats.average(),
                    trimmed_average: trimmed_average(&samples),
                    total: stats.total,
                    last_recorded: stats.last_recorded,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.table.cmp(&b.table).then(a.operation.cmp(&b.operation)));
        rows
    }

    pub fn reset(&self) {
        self.stats.clear();
    }
}

/// Render a report as a fixed-width text table
pub fn format_report(rows: &[TimingReport]) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{} {} {:>8} {:>10} {:>10} {:>10} {:>10} {:>12}  {}\n",
        pad_right("Table", 20),
        pad_right("Operation", 24),
        "Count",
        "Fastest",
        "Slowest",
        "Average",
        "Trimmed",
        "Total",
        "Last"
    ));
    output.push_str(&"─".repeat(132));
    output.push('\n');

    if rows.is_empty() {
        output.push_str("No operations recorded.\n");
        return output;
    }

    for row in rows {
        output.push_str(&format!(
            "{} {} {:>8} {:>10} {:>10} {:>10} {:>10} {:>12}  {}\n",
            pad_right(&row.table, 20),
            pad_right(row.operation.as_str(), 24),
            row.count,
            format_micros(row.fastest),
            format_micros(row.slowest),
            format_micros(row.average),
            format_micros(row.trimmed_average),
            format_micros(row.total),
            row.last_recorded.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    output
}

fn format_micros(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros >= 1_000_000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if micros >= 1000 {
        format!("{:.2}ms", micros as f64 / 1000.0)
    } else {
        format!("{}µs", micros)
    }
}

fn pad_right(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        s.chars().take(width).collect()
    } else {
        format!("{}{}", s, " ".repeat(width - len))
    }
}
