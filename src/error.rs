use std::time::Duration;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

/// Errors that can occur when configuring, running or reading a sampler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The configuration was rejected locally. It never reached the device.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The device access layer reported a failure (bus, transport or device side).
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// The device answered with something the sampler protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The session was used in a way its contract forbids.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
    /// A bounded wait gave up.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A notification handler panicked. The panic was caught at the dispatch boundary.
    #[error("notification handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Error codes reported by a device access layer.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    GeneralError = 1,
    InvalidArguments = 2,
    TimeoutError = 3,
    Busy = 4,
    ResourceUnavailable = 5,
    ProtocolError = 6,
    NotConnected = 7,
    InvalidHandle = 8,
    OdAddressNotFound = 9,
}

impl ErrorCode {
    /// Maps a raw code as reported by a device library. Unknown codes become [`ErrorCode::GeneralError`].
    pub fn from_raw(raw: u32) -> Self {
        ErrorCode::from_u32(raw).unwrap_or(ErrorCode::GeneralError)
    }
}

/// A failure reported by the device access layer.
///
/// Besides the [`ErrorCode`], devices may attach a vendor specific extended code
/// (for example a CANopen SDO abort code).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description} ({code:?}, extended 0x{extended:08X})")]
pub struct DeviceError {
    /// The error category
    pub code: ErrorCode,
    /// Vendor specific extended error code, 0 if not available
    pub extended: u32,
    /// Human readable description
    pub description: String,
}

impl DeviceError {
    /// Creates a new [`DeviceError`] without an extended code.
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            extended: 0,
            description: description.into(),
        }
    }

    /// Attaches a vendor specific extended code.
    pub fn with_extended(mut self, extended: u32) -> Self {
        self.extended = extended;
        self
    }
}

impl From<ConfigError> for DeviceError {
    fn from(e: ConfigError) -> Self {
        DeviceError::new(e.code(), e.to_string())
    }
}

/// Reasons a [`crate::SamplerConfiguration`] is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The `version` field does not match [`crate::SAMPLER_CONFIGURATION_VERSION`].
    #[error("unsupported configuration version 0x{0:08X}")]
    UnsupportedVersion(u32),
    /// Between 1 and [`crate::MAX_TRACKED_ADDRESSES`] addresses can be tracked.
    #[error("{0} tracked addresses given, between 1 and 12 are allowed")]
    TrackedAddressCount(usize),
    /// The sampling period must be between 1 and 65535 ms.
    #[error("sampling period must be between 1 and 65535 ms")]
    InvalidPeriod,
    /// The start trigger is mandatory and can't be `TC_FALSE`.
    #[error("start trigger is required and cannot be TC_FALSE")]
    MissingStartTrigger,
    /// Firmware samplers need the duration to calculate the number of samples.
    #[error("the duration is required to calculate the number of samples")]
    DurationRequired,
    /// Neither a duration nor a stop trigger would ever end the sampling.
    #[error("no conditions to end sampling")]
    NoEndCondition,
    /// Continuous sampling only exists in software mode.
    #[error("continuous sampling is not supported in firmware mode")]
    ContinuousInFirmware,
    /// Continuous sampling runs until stopped, it has no duration or stop trigger.
    #[error("duration and stop condition are incompatible with continuous mode")]
    ContinuousWithEndCondition,
    /// The firmware buffers can't hold the requested number of samples.
    #[error("{samples} samples per address exceed the firmware buffers ({max} max for {tracked} tracked addresses)")]
    BufferCapacity {
        /// requested samples per tracked address
        samples: usize,
        /// allowed samples per tracked address
        max: usize,
        /// number of tracked addresses
        tracked: usize,
    },
    /// A stored configuration record could not be decoded.
    #[error("malformed configuration record: {0}")]
    MalformedRecord(String),
}

impl ConfigError {
    /// The device error code a device layer reports for this rejection.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidArguments
    }
}

/// Violations of the session contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Polling is not available when a notification handler receives the data.
    #[error("poll() is not available while a notification handler is registered")]
    PollWithNotification,
    /// `start()` requires a configured (or reconfigured) sampler.
    #[error("sampler is not configured")]
    NotConfigured,
    /// The sampler is waiting for its trigger or running.
    #[error("sampler is already active")]
    AlreadyActive,
    /// `start()` and `configure()` must not be called from a notification handler.
    #[error("start() and configure() must not be called from a notification handler")]
    ReentrantCall,
    /// Another session already owns this device handle.
    #[error("device handle {0} is already bound to a sampler session")]
    HandleAlreadyBound(u32),
}
