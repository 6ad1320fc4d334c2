//! A rust client for the triggered data samplers of motor controllers.
//!
//! A sampler periodically records object dictionary (OD) entries of a device,
//! starting and stopping on [trigger conditions](TriggerCondition). It runs in
//! one of three [modes](SamplerMode), either in the device firmware or driven by
//! software, and hands its data over by polling or through notifications.
//!
//! The device itself is reached through a [`DeviceAccess`] implementation;
//! [`SimulatedDevice`] provides one in memory.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true
)]
#![deny(
// missing_debug_implementations,
missing_docs,
trivial_casts,
trivial_numeric_casts,
unused_extern_crates,
unused_import_braces,
unused_qualifications,
// unused_results
)]
#![warn(clippy::unwrap_used)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod device;
mod dispatcher;
mod error;
mod od;
mod protocol;
mod run;
mod session;
mod state;

pub use device::{DeviceAccess, DeviceHandle, DeviceNotification, NotifySender, SimulatedDevice};
pub use dispatcher::{Notification, SamplerNotify};
pub use error::*;
pub use od::OdIndex;
pub use protocol::buffer;
pub use protocol::{
    validate_mode, SampleData, SampleNumbering, SampleRow, SampleTable, SampledValue,
    SamplerConfiguration, SamplerMode, SamplerTrigger, TriggerCondition, MAX_TRACKED_ADDRESSES,
    SAMPLER_CONFIGURATION_VERSION,
};
pub use run::{SamplingRun, TickOutcome, SOFTWARE_BUFFER_CAPACITY};
pub use session::{SamplerSession, SessionOptions, StopHandle};
pub use state::{SamplerState, StateMachine};

/// Locks `mutex`, recovering the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
