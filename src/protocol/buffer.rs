//! Firmware sample buffers.
//!
//! A firmware sampler stores its values in [`BUFFER_COUNT`] buffers of
//! [`BUFFER_CAPACITY`] values each. A tracked address may use several
//! consecutive buffers, but a buffer never holds values of two addresses.

use std::collections::VecDeque;
use std::ops::Range;

use crate::{ConfigError, SampledValue};

/// Number of firmware sample buffers.
pub const BUFFER_COUNT: usize = 12;

/// Number of values one firmware buffer holds.
pub const BUFFER_CAPACITY: usize = 254;

/// Values all firmware buffers hold together.
pub const TOTAL_CAPACITY: usize = BUFFER_COUNT * BUFFER_CAPACITY;

/// Assignment of firmware buffers to tracked addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    tracked: usize,
    buffers_per_address: usize,
    samples_per_address: usize,
}

impl BufferLayout {
    /// Plans the buffers for `samples` values of each of `tracked` addresses.
    pub fn plan(tracked: usize, samples: usize) -> Result<Self, ConfigError> {
        let max = Self::max_samples(tracked);
        if tracked == 0 || samples == 0 || samples > max {
            return Err(ConfigError::BufferCapacity {
                samples,
                max,
                tracked,
            });
        }
        Ok(Self {
            tracked,
            buffers_per_address: samples.div_ceil(BUFFER_CAPACITY),
            samples_per_address: samples,
        })
    }

    /// The largest number of samples per address `tracked` addresses can store.
    pub fn max_samples(tracked: usize) -> usize {
        if tracked == 0 {
            return 0;
        }
        (TOTAL_CAPACITY / tracked).min((BUFFER_COUNT / tracked) * BUFFER_CAPACITY)
    }

    /// The buffers holding the values of the tracked address at `column`.
    pub fn buffers(&self, column: usize) -> Range<usize> {
        let first = column * self.buffers_per_address;
        first..first + self.buffers_per_address
    }

    /// Number of buffers in use.
    pub fn buffers_used(&self) -> usize {
        self.tracked * self.buffers_per_address
    }

    /// Capacity of the buffers of one tracked address.
    pub fn capacity_per_address(&self) -> usize {
        self.buffers_per_address * BUFFER_CAPACITY
    }

    /// The planned number of samples per address.
    pub fn samples_per_address(&self) -> usize {
        self.samples_per_address
    }
}

/// A fixed-capacity circular store for the values of one tracked address.
///
/// When full, pushing overwrites the oldest value.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    capacity: usize,
    values: VecDeque<SampledValue>,
    overwritten: u64,
}

impl SampleBuffer {
    /// Creates an empty buffer holding up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity.min(TOTAL_CAPACITY)),
            overwritten: 0,
        }
    }

    /// Stores a value. Returns `false` if the oldest value had to be dropped.
    pub fn push(&mut self, value: SampledValue) -> bool {
        if self.capacity == 0 {
            self.overwritten += 1;
            return false;
        }
        let mut kept = true;
        if self.values.len() == self.capacity {
            self.values.pop_front();
            self.overwritten += 1;
            kept = false;
        }
        self.values.push_back(value);
        kept
    }

    /// Removes and returns all stored values, oldest first.
    pub fn drain(&mut self) -> Vec<SampledValue> {
        self.values.drain(..).collect()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `true` if the next push overwrites a value.
    pub fn is_full(&self) -> bool {
        self.values.len() >= self.capacity
    }

    /// Number of values dropped since the buffer was created.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }
}
