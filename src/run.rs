//! The tick driven sampler engine.
//!
//! A [`SamplingRun`] executes one [`SamplerConfiguration`]. It does no timing
//! and no I/O of its own: the owner calls [`SamplingRun::tick`] once per
//! sampling period with the elapsed time and a register reader. This keeps the
//! engine deterministic, the same code serves device side workers and tests.

use std::collections::VecDeque;

use crate::protocol::buffer::{BufferLayout, SampleBuffer};
use crate::state::StateMachine;
use crate::{
    ConfigError, DeviceError, OdIndex, SampleData, SampledValue, SamplerConfiguration,
    SamplerMode, SamplerState, SamplerTrigger, UsageError,
};

/// Values kept per tracked address by software samplers between two drains.
pub const SOFTWARE_BUFFER_CAPACITY: usize = 4096;

/// What a call to [`SamplingRun::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// State after the tick
    pub state: SamplerState,
    /// `true` if the tick changed the state
    pub state_changed: bool,
    /// `true` if the tick collected a sample
    pub sampled: bool,
}

/// One execution of a sampler configuration.
#[derive(Debug)]
pub struct SamplingRun {
    config: SamplerConfiguration,
    machine: StateMachine<DeviceError>,
    columns: Vec<SampleBuffer>,
    finished: VecDeque<SampleData>,
    quota: Option<usize>,
    iteration: u64,
    iteration_started_at: u64,
    samples_in_iteration: usize,
    start_previous: Option<i64>,
    stop_previous: Option<i64>,
}

impl SamplingRun {
    /// Prepares a run. Firmware configurations get buffers according to their [`BufferLayout`].
    pub fn new(config: SamplerConfiguration) -> Result<Self, ConfigError> {
        config.validate()?;
        let tracked = config.tracked_addresses.len();
        let (capacity, quota) = match config.number_of_samples() {
            Some(samples) => {
                let layout = BufferLayout::plan(tracked, samples as usize)?;
                (layout.capacity_per_address(), Some(layout.samples_per_address()))
            }
            None => (SOFTWARE_BUFFER_CAPACITY, None),
        };


        Ok(Self {
            columns: (0..tracked).map(|_| SampleBuffer::new(capacity)).collect(),
            config,
            machine: StateMachine::configured(),
            finished: VecDeque::new(),
            quota,
            iteration: 0,
            iteration_started_at: 0,
            samples_in_iteration: 0,
            start_previous: None,
            stop_previous: None,
        })
    }

    /// The configuration being executed.
    pub fn config(&self) -> &SamplerConfiguration {
        &self.config
    }

    /// The current state.
    pub fn state(&self) -> SamplerState {
        self.machine.state()
    }

    /// The error that failed the run.
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.machine.last_error()
    }

    /// The current iteration number.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// `Configured -> Ready`: from now on each tick checks the start trigger.
    pub fn arm(&mut self) -> Result<(), UsageError> {
        self.machine.arm()
    }

    /// Cancels the run. Returns `false` if it had already ended.
    pub fn cancel(&mut self) -> bool {
        self.machine.cancel()
    }

    /// Advances the run by one sampling period.
    ///
    /// `elapsed_msec` is the time since the beginning of the execution and
    /// becomes the collection time of the values read during this tick. A failed
    /// read fails the run.
    pub fn tick<R>(&mut self, elapsed_msec: u64, mut read: R) -> TickOutcome
    where
        R: FnMut(OdIndex) -> Result<i64, DeviceError>,
    {
        let before = self.machine.state();
        let mut sampled = false;

        if let Err(e) = self.step(elapsed_msec, &mut read, &mut sampled) {
            log::error!("sampling failed at {} ms: {}", elapsed_msec, e);
            self.machine.fail(e);
        }

        let state = self.machine.state();
        TickOutcome {
            state,
            state_changed: state != before,
            sampled,
        }
    }

    fn step<R>(&mut self, elapsed: u64, read: &mut R, sampled: &mut bool) -> Result<(), DeviceError>
    where
        R: FnMut(OdIndex) -> Result<i64, DeviceError>,
    {
        if self.machine.state() == SamplerState::Ready {
            if !trigger_met(&self.config.start_trigger, &mut self.start_previous, read)? {
                return Ok(());
            }
            self.machine.trigger_fired();
            self.iteration_started_at = elapsed;
            self.samples_in_iteration = 0;
            self.stop_previous = None;
            log::debug!(
                "start trigger fired at {} ms, iteration {}",
                elapsed,
                self.iteration
            );
        }

        if self.machine.state() != SamplerState::Running {
            return Ok(());
        }

        let duration = u64::from(self.config.duration_milliseconds);
        if self.config.using_software_implementation
            && duration > 0
            && elapsed.saturating_sub(self.iteration_started_at) >= duration
        {
            self.finish_iteration();
            return Ok(());
        }

        self.sample(elapsed, read)?;
        *sampled = true;

        if let Some(quota) = self.quota {
            if self.samples_in_iteration >= quota {
                self.finish_iteration();
                return Ok(());
            }
        }

        if self.config.stop_trigger.is_set()
            && trigger_met(&self.config.stop_trigger, &mut self.stop_previous, read)?
        {
            log::debug!("stop trigger fired at {} ms", elapsed);
            self.finish_iteration();
        }
        Ok(())
    }

    fn sample<R>(&mut self, elapsed: u64, read: &mut R) -> Result<(), DeviceError>
    where
        R: FnMut(OdIndex) -> Result<i64, DeviceError>,
    {
        // read the whole row first, a failed read must not leave a partial sample
        let mut row = Vec::with_capacity(self.config.tracked_addresses.len());
        for &address in &self.config.tracked_addresses {
            row.push(SampledValue {
                value: read(address)?,
                collect_time_msec: elapsed,
            });
        }
        log::trace!("sample {} at {} ms: {:?}", self.samples_in_iteration, elapsed, row);

        for (column, value) in self.columns.iter_mut().zip(row) {
            if !column.push(value) && column.overwritten() == 1 {
                log::warn!("sample buffer full, oldest values are being overwritten");
            }
        }
        self.samples_in_iteration += 1;
        Ok(())
    }

    fn finish_iteration(&mut self) {
        self.flush_columns();
        let repeat = self.config.mode == SamplerMode::Repetitive;
        self.machine.iteration_finished(repeat);
        log::debug!(
            "iteration {} finished with {} samples",
            self.iteration,
            self.samples_in_iteration
        );
        if repeat {
            self.iteration += 1;
            self.start_previous = None;
        }
    }

    fn flush_columns(&mut self) {
        let columns: Vec<Vec<SampledValue>> = self.columns.iter_mut().map(SampleBuffer::drain).collect();
        let samples = columns.iter().map(Vec::len).min().unwrap_or(0);
        if samples == 0 {
            return;
        }
        let sampled_values = (0..samples)
            .flat_map(|k| columns.iter().map(move |column| column[k]))
            .collect();
        self.finished.push_back(SampleData {
            iteration_number: self.iteration,
            sampled_values,
        });
    }

    /// Removes and returns everything sampled so far, oldest first.
    pub fn take_data(&mut self) -> Vec<SampleData> {
        self.flush_columns();
        self.finished.drain(..).collect()
    }
}

fn trigger_met<R>(
    trigger: &SamplerTrigger,
    previous: &mut Option<i64>,
    read: &mut R,
) -> Result<bool, DeviceError>
where
    R: FnMut(OdIndex) -> Result<i64, DeviceError>,
{
    if !trigger.condition.requires_address() {
        return Ok(trigger.is_met(0, 0));
    }
    let current = read(trigger.address)?;
    // the first observation is its own predecessor, edges need two reads
    let previous = previous.replace(current).unwrap_or(current);
    Ok(trigger.is_met(previous, current))
}
