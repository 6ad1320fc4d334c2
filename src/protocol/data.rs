//! Sampled data as delivered by a sampler, and helpers to number and print it.

use itertools::Itertools;

use crate::Error;

/// One sampled value of a tracked OD address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampledValue {
    /// Value of the tracked OD address
    pub value: i64,
    /// Collection time in milliseconds, relative to the beginning of the execution
    pub collect_time_msec: u64,
}

/// A batch of sampled values.
///
/// The values of sample *k* occupy `sampled_values[k * n..k * n + n]` where `n` is
/// the number of tracked addresses, in tracked address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleData {
    /// Iteration number. Starts at 0 and only increases in repetitive mode.
    pub iteration_number: u64,
    /// The sampled values, `n` per sample
    pub sampled_values: Vec<SampledValue>,
}

impl SampleData {
    /// Splits the batch into samples of `tracked` values.
    ///
    /// Fails if the number of values is not a multiple of `tracked`.
    pub fn samples(&self, tracked: usize) -> Result<std::slice::Chunks<'_, SampledValue>, Error> {
        if tracked == 0 || self.sampled_values.len() % tracked != 0 {
            return Err(Error::Protocol(format!(
                "{} sampled values can't be split into samples of {} tracked addresses",
                self.sampled_values.len(),
                tracked
            )));
        }
        Ok(self.sampled_values.chunks(tracked))
    }
}

/// One sample with its position in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    /// Iteration the sample belongs to
    pub iteration: u64,
    /// Zero-based index of the sample within its iteration
    pub sample_number: u64,
    /// One value per tracked address
    pub values: Vec<SampledValue>,
}

/// Assigns sample numbers to drained batches.
///
/// Sample numbers count up across batches and restart at 0 whenever the
/// iteration number changes.
#[derive(Debug, Clone)]
pub struct SampleNumbering {
    tracked: usize,
    last_iteration: u64,
    sample_number: u64,
}

impl SampleNumbering {
    /// Creates a numbering for `tracked` addresses per sample.
    pub fn new(tracked: usize) -> Self {
        Self {
            tracked,
            last_iteration: 0,
            sample_number: 0,
        }
    }

    /// Restarts at iteration 0, sample 0.
    pub fn reset(&mut self) {
        self.last_iteration = 0;
        self.sample_number = 0;
    }

    /// The iteration of the last numbered batch.
    pub fn last_iteration(&self) -> u64 {
        self.last_iteration
    }

    /// Numbers the samples of `batches`, in order.
    pub fn number(&mut self, batches: &[SampleData]) -> Result<Vec<SampleRow>, Error> {
        let mut rows = Vec::new();
        for batch in batches {
            let samples = batch.samples(self.tracked)?;
            if batch.iteration_number != self.last_iteration {
                self.sample_number = 0;
                self.last_iteration = batch.iteration_number;
            }
            for values in samples {
                rows.push(SampleRow {
                    iteration: self.last_iteration,
                    sample_number: self.sample_number,
                    values: values.to_vec(),
                });
                self.sample_number += 1;
            }
        }
        Ok(rows)
    }
}

const HORIZONTAL_LINE: &str = "------------------------------------------------------------";

/// Renders sample rows as a fixed width text table. The header is printed once.
#[derive(Debug, Clone)]
pub struct SampleTable {
    names: Vec<String>,
    header_printed: bool,
}

impl SampleTable {
    /// Creates a table with one column pair (value, time) per tracked address name.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            header_printed: false,
        }
    }

    /// Renders `rows`, preceded by the header on the first call.
    pub fn render(&mut self, rows: &[SampleRow]) -> String {
        let mut out = String::new();
        if rows.is_empty() {
            return out;
        }
        if !self.header_printed {
            let columns = self
                .names
                .iter()
                .map(|name| format!("{:<14}{:<8}", format!("[{}]", name), "Time"))
                .join("");
            out.push_str(HORIZONTAL_LINE);
            out.push('\n');
            out.push_str(&format!("{:<10}{:<10}{}\n", "Iteration", "Sample", columns));
            out.push_str(HORIZONTAL_LINE);
            out.push('\n');
            self.header_printed = true;
        }
        for row in rows {
            let values = row
                .values
                .iter()
                .map(|v| format!("{:<14}{:<8}", v.value, v.collect_time_msec))
                .join("");
            out.push_str(&format!(
                "{:<10}{:<10}{}\n",
                row.iteration, row.sample_number, values
            ));
        }
        out
    }
}
