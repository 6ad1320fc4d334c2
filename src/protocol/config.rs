use num_derive::FromPrimitive;
use zerocopy::AsBytes;

use crate::protocol::buffer::BufferLayout;
use crate::protocol::trigger::SamplerTrigger;
use crate::{ConfigError, OdIndex};

/// The format tag of [`SamplerConfiguration`].
pub const SAMPLER_CONFIGURATION_VERSION: u32 = 0x0100_0000;

/// Up to 12 OD addresses can be tracked by one sampler.
pub const MAX_TRACKED_ADDRESSES: usize = 12;

/// How a sampler repeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum SamplerMode {
    /// Single, oneshot execution.
    #[default]
    Normal = 0,
    /// Starts again after it is finished. The start trigger is checked before
    /// each iteration and [`crate::SampleData::iteration_number`] increases by one.
    Repetitive = 1,
    /// Endless. The start trigger is checked only once. Software mode only.
    Continuous = 2,
}

/// A sampler configuration.
///
/// Build one with [`SamplerConfiguration::new`] and the `with_*` methods, then
/// submit it with [`crate::SamplerSession::configure`]. Invalid configurations
/// are rejected as a whole, see [`SamplerConfiguration::validate`].
///
/// ```rust
/// use od_sampler::{OdIndex, SamplerConfiguration, SamplerMode, SamplerTrigger, TriggerCondition};
///
/// let config = SamplerConfiguration::new(SamplerMode::Normal)
///     .with_period(1000)
///     .with_duration(4000)
///     .with_start_trigger(SamplerTrigger::new(
///         TriggerCondition::Greater,
///         OdIndex::new(0x2400, 0x01),
///         10,
///     ))
///     .track(OdIndex::new(0x230F, 0x00))
///     .track(OdIndex::new(0x4014, 0x03));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.number_of_samples(), Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfiguration {
    /// The version of the structure, [`SAMPLER_CONFIGURATION_VERSION`].
    pub version: u32,
    /// Mode of the sampler
    pub mode: SamplerMode,
    /// Trigger evaluation and timing done by the client instead of the firmware
    pub using_software_implementation: bool,
    /// Use the newer firmware sampler interface (firmware >= v2400)
    pub using_new_fw_sampler_implementation: bool,
    /// Sampling period in milliseconds, 1..=65535
    pub period_milliseconds: u16,
    /// Duration in milliseconds. 0 means no fixed duration.
    pub duration_milliseconds: u32,
    /// Pre-trigger number of samples. Currently not used.
    pub pre_trigger_number_of_samples: u16,
    /// Start trigger, required
    pub start_trigger: SamplerTrigger,
    /// Stop trigger, `TC_FALSE` if absent
    pub stop_trigger: SamplerTrigger,
    /// Up to 12 OD addresses to track. The order defines the column order of the sampled values.
    pub tracked_addresses: Vec<OdIndex>,
}

impl Default for SamplerConfiguration {
    fn default() -> Self {
        Self {
            version: SAMPLER_CONFIGURATION_VERSION,
            mode: SamplerMode::Normal,
            using_software_implementation: false,
            using_new_fw_sampler_implementation: false,
            period_milliseconds: 0,
            duration_milliseconds: 0,
            pre_trigger_number_of_samples: 0,
            start_trigger: SamplerTrigger::default(),
            stop_trigger: SamplerTrigger::default(),
            tracked_addresses: Vec::new(),
        }
    }
}

impl SamplerConfiguration {
    /// Creates an empty configuration for `mode`. Continuous mode selects the software implementation.
    pub fn new(mode: SamplerMode) -> Self {
        Self {
            mode,
            using_software_implementation: mode == SamplerMode::Continuous,
            ..Self::default()
        }
    }

    /// Selects the software or the firmware implementation.
    pub fn with_software_implementation(mut self, software: bool) -> Self {
        self.using_software_implementation = software;
        self
    }

    /// Sets the sampling period in milliseconds.
    pub fn with_period(mut self, period_milliseconds: u16) -> Self {
        self.period_milliseconds = period_milliseconds;
        self
    }

    /// Sets the duration in milliseconds.
    pub fn with_duration(mut self, duration_milliseconds: u32) -> Self {
        self.duration_milliseconds = duration_milliseconds;
        self
    }

    /// Sets the start trigger.
    pub fn with_start_trigger(mut self, trigger: SamplerTrigger) -> Self {
        self.start_trigger = trigger;
        self
    }

    /// Sets the stop trigger.
    pub fn with_stop_trigger(mut self, trigger: SamplerTrigger) -> Self {
        self.stop_trigger = trigger;
        self
    }

    /// Replaces the tracked addresses.
    pub fn with_tracked_addresses<I>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = OdIndex>,
    {
        self.tracked_addresses = addresses.into_iter().collect();
        self
    }

    /// Appends one tracked address.
    pub fn track(mut self, address: OdIndex) -> Self {
        self.tracked_addresses.push(address);
        self
    }

    /// The number of samples per iteration a firmware sampler takes: `1 + duration / period`.
    ///
    /// Returns `None` for software samplers and configurations without a duration or period.
    pub fn number_of_samples(&self) -> Option<u32> {
        if self.using_software_implementation
            || self.duration_milliseconds == 0
            || self.period_milliseconds == 0
        {
            return None;
        }
        Some(1 + self.duration_milliseconds / u32::from(self.period_milliseconds))
    }

    /// Checks the whole configuration. Nothing is partially applied on error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SAMPLER_CONFIGURATION_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        let tracked = self.tracked_addresses.len();
        if tracked == 0 || tracked > MAX_TRACKED_ADDRESSES {
            return Err(ConfigError::TrackedAddressCount(tracked));
        }
        if self.period_milliseconds == 0 {
            return Err(ConfigError::InvalidPeriod);
        }
        if !self.start_trigger.is_set() {
            return Err(ConfigError::MissingStartTrigger);
        }
        validate_mode(
            self.mode,
            self.using_software_implementation,
            self.duration_milliseconds,
            self.stop_trigger.is_set(),
        )?;
        if let Some(samples) = self.number_of_samples() {
            BufferLayout::plan(tracked, samples as usize)?;
        }
        Ok(())
    }
}

/// The legality matrix of mode, implementation, duration and stop trigger.
///
/// | mode                 | software | duration | stop trigger | outcome                           |
/// |----------------------|----------|----------|--------------|-----------------------------------|
/// | Normal / Repetitive  | no       | 0        | any          | [`ConfigError::DurationRequired`] |
/// | Normal / Repetitive  | no       | > 0      | any          | ok                                |
/// | Normal / Repetitive  | yes      | 0        | no           | [`ConfigError::NoEndCondition`]   |
/// | Normal / Repetitive  | yes      | 0        | yes          | ok                                |
/// | Normal / Repetitive  | yes      | > 0      | any          | ok                                |
/// | Continuous           | no       | any      | any          | [`ConfigError::ContinuousInFirmware`] |
/// | Continuous           | yes      | 0        | no           | ok                                |
/// | Continuous           | yes      | other    | other        | [`ConfigError::ContinuousWithEndCondition`] |
pub fn validate_mode(
    mode: SamplerMode,
    using_software: bool,
    duration_milliseconds: u32,
    has_stop_trigger: bool,
) -> Result<(), ConfigError> {
    match (mode, using_software) {
        (SamplerMode::Normal | SamplerMode::Repetitive, false) => {
            if duration_milliseconds == 0 {
                return Err(ConfigError::DurationRequired);
            }
        }
        (SamplerMode::Normal | SamplerMode::Repetitive, true) => {
            if duration_milliseconds == 0 && !has_stop_trigger {
                return Err(ConfigError::NoEndCondition);
            }
        }
        (SamplerMode::Continuous, false) => return Err(ConfigError::ContinuousInFirmware),
        (SamplerMode::Continuous, true) => {
            if duration_milliseconds != 0 || has_stop_trigger {
                return Err(ConfigError::ContinuousWithEndCondition);
            }
        }
    }
    Ok(())
}
