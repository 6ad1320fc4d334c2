//! The device access layer a sampler session talks to.
//!
//! Bus protocols, connection handling and the sampler firmware live behind
//! [`DeviceAccess`]. [`SimulatedDevice`] is an in-memory implementation used by
//! the tests and the demo.

use std::fmt;
use std::sync::mpsc;

use crate::{DeviceError, OdIndex, SampleData, SamplerConfiguration, SamplerState};

mod simulated;

pub use simulated::SimulatedDevice;

/// Opaque handle of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A notification raised by a running sampler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNotification {
    /// Set when the sampler failed
    pub last_error: Option<DeviceError>,
    /// State of the sampler when the notification was raised
    pub state: SamplerState,
    /// Data sampled since the previous notification
    pub data: Vec<SampleData>,
    /// The application data passed to [`DeviceAccess::sampler_start`]
    pub application_data: i64,
}

/// The sending half of a notification queue.
///
/// Device implementations may send from any thread. Sending never blocks.
#[derive(Debug, Clone)]
pub struct NotifySender {
    tx: mpsc::Sender<DeviceNotification>,
}

impl NotifySender {
    /// Queues a notification. Returns `false` if nobody listens anymore.
    pub fn send(&self, notification: DeviceNotification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

/// Creates a notification queue.
pub fn notification_channel() -> (NotifySender, mpsc::Receiver<DeviceNotification>) {
    let (tx, rx) = mpsc::channel();
    (NotifySender { tx }, rx)
}

/// Operations a device library provides to the sampler.
///
/// All methods may block on I/O, bounded by the timeouts of the underlying
/// transport. Implementations must be usable from several threads at once.
pub trait DeviceAccess: Send + Sync {
    /// Writes `value` to `address` using `bit_length` bits (8, 16, 32 or 64).
    fn write_register(
        &self,
        handle: DeviceHandle,
        value: i64,
        address: OdIndex,
        bit_length: u8,
    ) -> Result<(), DeviceError>;

    /// Reads `address` as a signed integer.
    fn read_register(&self, handle: DeviceHandle, address: OdIndex) -> Result<i64, DeviceError>;

    /// Stores a sampler configuration on the device.
    fn sampler_configure(
        &self,
        handle: DeviceHandle,
        config: &SamplerConfiguration,
    ) -> Result<(), DeviceError>;

    /// Reads back the stored sampler configuration.
    fn sampler_get_configuration(
        &self,
        handle: DeviceHandle,
    ) -> Result<SamplerConfiguration, DeviceError>;

    /// Starts the configured sampler.
    ///
    /// With a `notify` sender the data is delivered through notifications,
    /// without one it is buffered for [`DeviceAccess::sampler_get_data`].
    fn sampler_start(
        &self,
        handle: DeviceHandle,
        notify: Option<NotifySender>,
        application_data: i64,
    ) -> Result<(), DeviceError>;

    /// Stops the sampler. Stopping a sampler that is not running succeeds.
    fn sampler_stop(&self, handle: DeviceHandle) -> Result<(), DeviceError>;

    /// The current sampler state.
    fn sampler_get_state(&self, handle: DeviceHandle) -> Result<SamplerState, DeviceError>;

    /// Removes and returns the buffered sample data.
    fn sampler_get_data(&self, handle: DeviceHandle) -> Result<Vec<SampleData>, DeviceError>;

    /// The error that failed the sampler, if any.
    fn sampler_get_last_error(&self, handle: DeviceHandle) -> Option<DeviceError>;
}
