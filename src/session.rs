//! A sampler session: one configured sampler on one device.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::device::{notification_channel, DeviceAccess, DeviceHandle, DeviceNotification};
use crate::dispatcher::{Notification, NotificationDispatcher, NotificationSink, SamplerNotify};
use crate::state::StateMachine;
use crate::{
    lock, DeviceError, Error, SampleData, SampleNumbering, SampleRow, SamplerConfiguration,
    SamplerState, UsageError,
};

/// Tuning of a [`SamplerSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// How often the bounded waits ask the device for its state. Also how long
    /// an idle dispatcher waits before it closes a run the session ended.
    pub state_poll_interval: Duration,
    /// Limit of [`SamplerSession::wait_until_running`] and [`SamplerSession::wait_until_finished`]
    pub wait_timeout: Duration,
    /// Drive the start trigger address on start: write the trigger value before the
    /// sampler starts and the trigger value + 1 once it runs.
    pub arm_trigger: bool,
    /// Bit length used for the start trigger writes
    pub trigger_bit_length: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            state_poll_interval: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(30),
            arm_trigger: true,
            trigger_bit_length: 32,
        }
    }
}

/// Devices handles bound to a session, keyed by device identity.
static BINDINGS: Mutex<BTreeSet<(usize, DeviceHandle)>> = Mutex::new(BTreeSet::new());

#[derive(Debug)]
struct Binding {
    key: (usize, DeviceHandle),
}

impl Binding {
    fn acquire(key: (usize, DeviceHandle)) -> Result<Self, UsageError> {
        if !lock(&BINDINGS).insert(key) {
            return Err(UsageError::HandleAlreadyBound(key.1 .0));
        }
        Ok(Self { key })
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        lock(&BINDINGS).remove(&self.key);
    }
}

/// State shared between the caller and the dispatcher thread.
#[derive(Debug)]
struct Shared {
    machine: StateMachine<Error>,
    tracked: usize,
    numbering: SampleNumbering,
    notify_bound: bool,
    dispatching: bool,
    dispatcher_thread: Option<ThreadId>,
    handler_error: Option<Error>,
}

impl Shared {
    fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            tracked: 0,
            numbering: SampleNumbering::new(0),
            notify_bound: false,
            dispatching: false,
            dispatcher_thread: None,
            handler_error: None,
        }
    }

    /// Follows a state reported by the device.
    fn apply(&mut self, reported: SamplerState, error: Option<DeviceError>) {
        if self.machine.state().is_terminal() {
            return;
        }
        if reported == SamplerState::Failed {
            let error = error.map(Error::Device).unwrap_or_else(|| {
                Error::Protocol("sampler failed without reporting an error".to_string())
            });
            log::error!("sampler failed: {}", error);
            self.machine.fail(error);
            return;
        }
        if let Err(unexpected) = self.machine.follow(reported) {
            let error = Error::Protocol(format!(
                "device reported {} while the sampler is {}",
                unexpected,
                self.machine.state()
            ));
            log::error!("{}", error);
            self.machine.fail(error);
        }
    }

    /// Checks that every batch holds whole samples.
    fn check_data(&mut self, data: &[SampleData]) -> Result<(), Error> {
        for batch in data {
            if let Err(e) = batch.samples(self.tracked) {
                log::error!("{}", e);
                self.machine.fail(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    fn last_error(&self) -> Option<Error> {
        self.machine
            .last_error()
            .or(self.handler_error.as_ref())
            .cloned()
    }
}

struct SessionSink<D: ?Sized> {
    device: Arc<D>,
    handle: DeviceHandle,
    shared: Arc<Mutex<Shared>>,
    application_data: i64,
}

impl<D: DeviceAccess + ?Sized + 'static> NotificationSink for SessionSink<D> {
    fn accept(&self, notification: DeviceNotification) -> Notification {
        let mut shared = lock(&self.shared);
        let numbered = shared
            .check_data(&notification.data)
            .and_then(|()| shared.numbering.number(&notification.data));
        let malformed = numbered.is_err();
        if !malformed {
            shared.apply(notification.state, notification.last_error);
        }
        let delivered = Notification {
            last_error: shared.last_error(),
            state: shared.machine.state(),
            data: if malformed {
                Vec::new()
            } else {
                notification.data
            },
            rows: numbered.unwrap_or_default(),
            application_data: notification.application_data,
        };
        drop(shared);

        if malformed {
            if let Err(e) = self.device.sampler_stop(self.handle) {
                log::warn!("failed to stop sampler after malformed data: {}", e);
            }
        }
        delivered
    }

    fn closing(&self) -> Option<Notification> {
        let shared = lock(&self.shared);
        let state = shared.machine.state();
        if !state.is_terminal() {
            return None;
        }
        Some(Notification {
            last_error: shared.last_error(),
            state,
            data: Vec::new(),
            rows: Vec::new(),
            application_data: self.application_data,
        })
    }

    fn handler_panicked(&self, error: Error) {
        lock(&self.shared).handler_error = Some(error);
    }

    fn finished(&self) {
        lock(&self.shared).dispatching = false;
    }
}

/// Stops a session from any thread, including from a notification handler.
pub struct StopHandle<D: ?Sized> {
    device: Arc<D>,
    handle: DeviceHandle,
    shared: Arc<Mutex<Shared>>,
}

impl<D: ?Sized> Clone for StopHandle<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            handle: self.handle,
            shared: self.shared.clone(),
        }
    }
}

impl<D: ?Sized> fmt::Debug for StopHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<D: DeviceAccess + ?Sized> StopHandle<D> {
    /// Stops the sampler. Any state that is not terminal becomes `Cancelled`.
    ///
    /// Safe to call at any time and any number of times: once the run ended,
    /// this does nothing.
    pub fn stop(&self) -> Result<(), Error> {
        let state = lock(&self.shared).machine.state();
        if state.is_terminal() {
            return Ok(());
        }
        if state != SamplerState::Unconfigured {
            if let Err(e) = self.device.sampler_stop(self.handle) {
                log::error!("failed to stop sampler on device {}: {}", self.handle, e);
                lock(&self.shared).machine.fail(e.clone().into());
                return Err(e.into());
            }
        }
        if lock(&self.shared).machine.cancel() {
            log::debug!("sampler on device {} cancelled", self.handle);
        }
        Ok(())
    }
}

/// Runs a sampler on one device.
///
/// A session exclusively binds its device handle: a second session for the
/// same device and handle fails with [`UsageError::HandleAlreadyBound`] until
/// the first one is dropped.
///
/// Data is delivered either by polling ([`SamplerSession::start`] then
/// [`SamplerSession::poll`]) or by notifications
/// ([`SamplerSession::start_with_notify`]), never both for the same run.
///
/// ```rust
/// use std::sync::Arc;
/// use od_sampler::{
///     OdIndex, SamplerConfiguration, SamplerMode, SamplerSession, SamplerState, SamplerTrigger,
///     SimulatedDevice,
/// };
///
/// let device = Arc::new(SimulatedDevice::new());
/// let handle = device.add_device();
/// device.declare_register(handle, OdIndex::new(0x4014, 0x03), 16, 35).unwrap();
///
/// let mut session = SamplerSession::bind(device, handle).unwrap();
/// session
///     .configure(
///         SamplerConfiguration::new(SamplerMode::Normal)
///             .with_software_implementation(true)
///             .with_period(5)
///             .with_duration(20)
///             .with_start_trigger(SamplerTrigger::immediate())
///             .track(OdIndex::new(0x4014, 0x03)),
///     )
///     .unwrap();
/// session.start(0).unwrap();
///
/// let mut rows = Vec::new();
/// while session.state().is_active() {
///     rows.extend(session.poll_rows().unwrap());
///     std::thread::sleep(std::time::Duration::from_millis(5));
/// }
/// assert_eq!(session.state(), SamplerState::Completed);
/// assert_eq!(rows.len(), 4);
/// ```
pub struct SamplerSession<D: DeviceAccess + ?Sized + 'static> {
    device: Arc<D>,
    handle: DeviceHandle,
    options: SessionOptions,
    config: Option<SamplerConfiguration>,
    shared: Arc<Mutex<Shared>>,
    dispatcher: Option<NotificationDispatcher>,
    _binding: Binding,
}

impl<D: DeviceAccess + ?Sized + 'static> fmt::Debug for SamplerSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplerSession")
            .field("handle", &self.handle)
            .field("options", &self.options)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: DeviceAccess + ?Sized + 'static> SamplerSession<D> {
    /// Binds a session with default [`SessionOptions`] to `handle`.
    pub fn bind(device: Arc<D>, handle: DeviceHandle) -> Result<Self, Error> {
        Self::bind_with_options(device, handle, SessionOptions::default())
    }

    /// Binds a session to `handle`.
    pub fn bind_with_options(
        device: Arc<D>,
        handle: DeviceHandle,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let identity = Arc::as_ptr(&device).cast::<()>() as usize;
        let binding = Binding::acquire((identity, handle))?;
        log::debug!("sampler session bound to device {}", handle);
        Ok(Self {
            device,
            handle,
            options,
            config: None,
            shared: Arc::new(Mutex::new(Shared::new())),
            dispatcher: None,
            _binding: binding,
        })
    }

    /// The bound device handle.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// The options given at bind time.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The last accepted configuration.
    pub fn config(&self) -> Option<&SamplerConfiguration> {
        self.config.as_ref()
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn reject_reentrant_call(&self) -> Result<(), UsageError> {
        if self.shared().dispatcher_thread == Some(thread::current().id()) {
            return Err(UsageError::ReentrantCall);
        }
        Ok(())
    }

    fn fail(&self, error: impl Into<Error>) -> Error {
        let error = error.into();
        self.shared().machine.fail(error.clone());
        error
    }

    fn join_dispatcher(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.is_current_thread() {
                log::warn!("session released from its own notification handler, dispatcher is detached");
                return;
            }
            dispatcher.join();
        }
    }

    /// Validates `config` and stores it on the device.
    ///
    /// An invalid configuration is rejected as a whole and leaves the state
    /// unchanged. On success the sample numbering restarts at iteration 0,
    /// sample 0.
    pub fn configure(&mut self, config: SamplerConfiguration) -> Result<(), Error> {
        self.reject_reentrant_call()?;
        config.validate()?;
        if self.shared().machine.state().is_active() {
            return Err(UsageError::AlreadyActive.into());
        }
        self.join_dispatcher();

        if let Err(e) = self.device.sampler_configure(self.handle, &config) {
            log::error!("device {} rejected the sampler configuration: {}", self.handle, e);
            return Err(self.fail(e));
        }

        let tracked = config.tracked_addresses.len();
        let mut shared = self.shared();
        shared.machine.configure()?;
        shared.tracked = tracked;
        shared.numbering = SampleNumbering::new(tracked);
        shared.notify_bound = false;
        shared.handler_error = None;
        drop(shared);

        log::debug!("sampler on device {} configured", self.handle);
        self.config = Some(config);
        Ok(())
    }

    /// Starts the configured sampler. The data is collected with [`SamplerSession::poll`].
    pub fn start(&mut self, application_data: i64) -> Result<(), Error> {
        self.start_inner(None, application_data)
    }

    /// Starts the configured sampler, delivering data and state changes to `handler`.
    ///
    /// The handler runs on a dispatcher thread. `application_data` is passed
    /// back with every notification.
    pub fn start_with_notify<H>(&mut self, handler: H, application_data: i64) -> Result<(), Error>
    where
        H: SamplerNotify,
    {
        self.start_inner(Some(Box::new(handler)), application_data)
    }

    fn start_inner(
        &mut self,
        handler: Option<Box<dyn SamplerNotify>>,
        application_data: i64,
    ) -> Result<(), Error> {
        self.reject_reentrant_call()?;
        match self.shared().machine.state() {
            SamplerState::Configured => {}
            SamplerState::Ready | SamplerState::Running => {
                return Err(UsageError::AlreadyActive.into())
            }
            _ => return Err(UsageError::NotConfigured.into()),
        }
        let trigger = self
            .config
            .as_ref()
            .map(|config| config.start_trigger)
            .ok_or(UsageError::NotConfigured)?;
        let arm_trigger = self.options.arm_trigger && trigger.condition.requires_address();
        let inactive = i64::from(trigger.value);

        if arm_trigger {
            if let Err(e) = self.device.write_register(
                self.handle,
                inactive,
                trigger.address,
                self.options.trigger_bit_length,
            ) {
                log::error!("failed to deactivate start trigger {}: {}", trigger.address, e);
                return Err(self.fail(e));
            }
        }

        self.join_dispatcher();
        let notify = match handler {
            Some(handler) => {
                let (tx, rx) = notification_channel();
                let sink = SessionSink {
                    device: self.device.clone(),
                    handle: self.handle,
                    shared: self.shared.clone(),
                    application_data,
                };
                let dispatcher = NotificationDispatcher::spawn(
                    format!("sampler-notify-{}", self.handle.0),
                    rx,
                    sink,
                    handler,
                    self.options.state_poll_interval,
                )?;
                // the dispatcher can't finish before `tx` is dropped
                let mut shared = self.shared();
                shared.notify_bound = true;
                shared.dispatching = true;
                shared.dispatcher_thread = Some(dispatcher.thread_id());
                drop(shared);
                self.dispatcher = Some(dispatcher);
                Some(tx)
            }
            None => {
                let mut shared = self.shared();
                shared.notify_bound = false;
                shared.dispatcher_thread = None;
                None
            }
        };

        self.shared().machine.arm()?;
        if let Err(e) = self
            .device
            .sampler_start(self.handle, notify, application_data)
        {
            log::error!("failed to start sampler on device {}: {}", self.handle, e);
            let error = self.fail(e);
            // the notification sender went down with the failed start
            self.join_dispatcher();
            return Err(error);
        }

        if arm_trigger {
            if let Err(e) = self.device.write_register(
                self.handle,
                inactive + 1,
                trigger.address,
                self.options.trigger_bit_length,
            ) {
                log::error!("failed to activate start trigger {}: {}", trigger.address, e);
                let error = self.fail(e);
                if let Err(stop_error) = self.device.sampler_stop(self.handle) {
                    log::warn!("failed to stop sampler after trigger failure: {}", stop_error);
                }
                self.join_dispatcher();
                return Err(error);
            }
        }

        log::debug!(
            "sampler on device {} started (application data {})",
            self.handle,
            application_data
        );
        Ok(())
    }

    /// Returns and clears the data the device buffered since the last poll.
    ///
    /// Not available while a notification handler receives the data. The
    /// state is refreshed before the data is taken, so once a poll reports a
    /// terminal [`SamplerSession::state`] it returned everything.
    pub fn poll(&mut self) -> Result<Vec<SampleData>, Error> {
        {
            let shared = self.shared();
            if shared.notify_bound {
                return Err(UsageError::PollWithNotification.into());
            }
            if shared.machine.state() == SamplerState::Unconfigured {
                return Err(UsageError::NotConfigured.into());
            }
        }
        self.refresh_state()?;
        let data = match self.device.sampler_get_data(self.handle) {
            Ok(data) => data,
            Err(e) => return Err(self.fail(e)),
        };
        let checked = self.shared().check_data(&data);
        if let Err(e) = checked {
            if let Err(stop_error) = self.device.sampler_stop(self.handle) {
                log::warn!("failed to stop sampler after malformed data: {}", stop_error);
            }
            return Err(e);
        }
        Ok(data)
    }

    /// Like [`SamplerSession::poll`], with the samples split and numbered.
    pub fn poll_rows(&mut self) -> Result<Vec<SampleRow>, Error> {
        let data = self.poll()?;
        self.shared().numbering.number(&data)
    }

    /// Stops the sampler, see [`StopHandle::stop`].
    pub fn stop(&self) -> Result<(), Error> {
        self.stop_handle().stop()
    }

    /// A handle that stops this session from another thread or a notification handler.
    pub fn stop_handle(&self) -> StopHandle<D> {
        StopHandle {
            device: self.device.clone(),
            handle: self.handle,
            shared: self.shared.clone(),
        }
    }

    /// The session state. Never blocks on the device.
    pub fn state(&self) -> SamplerState {
        self.shared().machine.state()
    }

    /// Asks the device for its sampler state and follows it.
    pub fn refresh_state(&self) -> Result<SamplerState, Error> {
        let reported = match self.device.sampler_get_state(self.handle) {
            Ok(state) => state,
            Err(e) => return Err(self.fail(e)),
        };
        let error = if reported == SamplerState::Failed {
            self.device.sampler_get_last_error(self.handle)
        } else {
            None
        };
        let mut shared = self.shared();
        shared.apply(reported, error);
        Ok(shared.machine.state())
    }

    /// The error that failed the run, or the last caught handler panic.
    pub fn last_error(&self) -> Option<Error> {
        self.shared().last_error()
    }

    /// Reads the configuration back from the device.
    pub fn device_configuration(&self) -> Result<SamplerConfiguration, Error> {
        Ok(self.device.sampler_get_configuration(self.handle)?)
    }

    fn current_state(&self) -> Result<(SamplerState, bool), Error> {
        let notify_bound = self.shared().notify_bound;
        let state = if notify_bound {
            self.state()
        } else {
            self.refresh_state()?
        };
        Ok((state, self.shared().dispatching))
    }

    fn wait_for<F>(&self, done: F) -> Result<SamplerState, Error>
    where
        F: Fn(SamplerState, bool) -> bool,
    {
        let timeout = self.options.wait_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let (state, dispatching) = self.current_state()?;
            if done(state, dispatching) {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(self.options.state_poll_interval.min(deadline - now));
        }
    }

    /// Waits until the start trigger fired or the run ended, whichever comes first.
    ///
    /// Gives up with [`Error::Timeout`] after [`SessionOptions::wait_timeout`].
    pub fn wait_until_running(&self) -> Result<SamplerState, Error> {
        self.wait_for(|state, _| {
            state == SamplerState::Running || state.is_terminal()
        })
    }

    /// Waits until the run ended and its last notification was delivered.
    ///
    /// Gives up with [`Error::Timeout`] after [`SessionOptions::wait_timeout`].
    pub fn wait_until_finished(&self) -> Result<SamplerState, Error> {
        self.wait_for(|state, dispatching| {
            state.is_terminal() && !dispatching
        })
    }
}

impl<D: DeviceAccess + ?Sized + 'static> Drop for SamplerSession<D> {
    fn drop(&mut self) {
        let state = self.state();
        if state.is_active() {
            log::warn!(
                "sampler session on device {} dropped while {}, stopping it first",
                self.handle,
                state
            );
            if let Err(e) = self.stop() {
                log::error!("failed to stop sampler on drop: {}", e);
            }
        }
        self.join_dispatcher();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    use super::*;
    use crate::{
        ConfigError, ErrorCode, NotifySender, OdIndex, SamplerMode, SamplerTrigger,
        SimulatedDevice, TriggerCondition,
    };

    const UP_TIME: OdIndex = OdIndex::new(0x230F, 0x00);
    const TEMPERATURE: OdIndex = OdIndex::new(0x4014, 0x03);
    const TRIGGER: OdIndex = OdIndex::new(0x2400, 0x01);

    type Session = SamplerSession<SimulatedDevice>;

    fn device() -> (Arc<SimulatedDevice>, DeviceHandle) {
        let device = Arc::new(SimulatedDevice::new());
        let handle = device.add_device();
        device.declare_uptime(handle, UP_TIME).unwrap();
        device.declare_register(handle, TEMPERATURE, 16, 35).unwrap();
        device.declare_register(handle, TRIGGER, 32, 0).unwrap();
        (device, handle)
    }

    fn options() -> SessionOptions {
        SessionOptions {
            state_poll_interval: Duration::from_millis(2),
            wait_timeout: Duration::from_secs(5),
            ..SessionOptions::default()
        }
    }

    fn session() -> (Arc<SimulatedDevice>, DeviceHandle, Session) {
        let (device, handle) = device();
        let session = Session::bind_with_options(device.clone(), handle, options()).unwrap();
        (device, handle, session)
    }

    fn config(mode: SamplerMode, duration: u32) -> SamplerConfiguration {
        SamplerConfiguration::new(mode)
            .with_software_implementation(true)
            .with_period(10)
            .with_duration(duration)
            .with_start_trigger(SamplerTrigger::new(TriggerCondition::Greater, TRIGGER, 10))
            .track(UP_TIME)
            .track(TEMPERATURE)
    }

    fn drain(session: &mut Session) -> Vec<SampleRow> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut rows = Vec::new();
        loop {
            rows.extend(session.poll_rows().unwrap());
            if !session.state().is_active() || Instant::now() > deadline {
                return rows;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn polled_lifecycle() {
        let (device, handle, mut session) = session();
        assert_eq!(session.state(), SamplerState::Unconfigured);
        assert_eq!(
            session.poll().unwrap_err(),
            Error::Usage(UsageError::NotConfigured)
        );
        assert_eq!(
            session.start(0).unwrap_err(),
            Error::Usage(UsageError::NotConfigured)
        );

        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        assert_eq!(session.state(), SamplerState::Configured);
        session.start(0).unwrap();
        // the start trigger was activated with value + 1
        assert_eq!(device.read_register(handle, TRIGGER).unwrap(), 11);
        assert_eq!(
            session.start(0).unwrap_err(),
            Error::Usage(UsageError::AlreadyActive)
        );

        let rows = drain(&mut session);
        assert_eq!(session.state(), SamplerState::Completed);
        assert_eq!(
            rows.iter().map(|r| r.sample_number).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(rows.iter().all(|r| r.iteration == 0 && r.values[1].value == 35));
        assert_eq!(session.last_error(), None);

        // stopping a finished run changes nothing
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Completed);

        // a finished run can be configured and started again
        session.configure(config(SamplerMode::Normal, 30)).unwrap();
        session.start(0).unwrap();
        let rows = drain(&mut session);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].sample_number, 0);
    }

    #[test]
    fn invalid_configurations_change_nothing() {
        let (_device, _handle, mut session) = session();
        let err = session
            .configure(config(SamplerMode::Normal, 0).with_software_implementation(false))
            .unwrap_err();
        assert_eq!(err, Error::Config(ConfigError::DurationRequired));
        assert_eq!(session.state(), SamplerState::Unconfigured);

        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        let err = session
            .configure(config(SamplerMode::Continuous, 50))
            .unwrap_err();
        assert_eq!(err, Error::Config(ConfigError::ContinuousWithEndCondition));
        assert_eq!(session.state(), SamplerState::Configured);
        assert_eq!(
            session.config().map(|c| c.duration_milliseconds),
            Some(50)
        );
    }

    #[test]
    fn configuration_round_trip() {
        let (_device, _handle, mut session) = session();
        let config = config(SamplerMode::Repetitive, 50);
        session.configure(config.clone()).unwrap();
        assert_eq!(session.device_configuration().unwrap(), config);
    }

    #[test]
    fn notifications_exclude_polling() {
        let (_device, _handle, mut session) = session();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .start_with_notify(move |n: &Notification| tx.send(n.clone()).unwrap(), 42)
            .unwrap();
        assert_eq!(
            session.poll().unwrap_err(),
            Error::Usage(UsageError::PollWithNotification)
        );
        assert_eq!(session.wait_until_finished().unwrap(), SamplerState::Completed);

        let notifications: Vec<Notification> = rx.try_iter().collect();
        assert!(notifications.iter().all(|n| n.application_data == 42));
        assert_eq!(notifications.last().unwrap().state, SamplerState::Completed);
        assert_eq!(
            notifications.iter().filter(|n| n.state.is_terminal()).count(),
            1
        );
        let rows: Vec<SampleRow> = notifications.into_iter().flat_map(|n| n.rows).collect();
        assert_eq!(
            rows.iter().map(|r| r.sample_number).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );

        // a new configuration returns to polling
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        assert!(session.poll().unwrap().is_empty());
    }

    #[test]
    fn stop_cancels_once() {
        let (device, handle, mut session) = session();
        session.configure(config(SamplerMode::Continuous, 0)).unwrap();
        session.start(0).unwrap();
        assert_eq!(session.wait_until_running().unwrap(), SamplerState::Running);
        thread::sleep(Duration::from_millis(30));

        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);
        assert_eq!(session.last_error(), None);

        // data sampled before the stop is still there
        assert!(!session.poll().unwrap().is_empty());
        assert_eq!(session.state(), SamplerState::Cancelled);
    }

    #[test]
    fn stop_before_start() {
        let (_device, _handle, mut session) = session();
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);

        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);
        assert_eq!(
            session.start(0).unwrap_err(),
            Error::Usage(UsageError::NotConfigured)
        );
    }

    #[test]
    fn stop_from_a_handler() {
        let (_device, _handle, mut session) = session();
        session.configure(config(SamplerMode::Continuous, 0)).unwrap();
        let stop = session.stop_handle();
        let mut samples = 0;
        session
            .start_with_notify(
                move |n: &Notification| {
                    samples += n.data.len();
                    if samples >= 3 {
                        stop.stop().unwrap();
                    }
                },
                0,
            )
            .unwrap();
        assert_eq!(session.wait_until_finished().unwrap(), SamplerState::Cancelled);
    }

    #[test]
    fn failed_start_leaves_the_trigger_inactive() {
        let (device, handle, mut session) = session();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        device.fail_next_start(handle).unwrap();

        let err = session.start(0).unwrap_err();
        assert!(matches!(err, Error::Device(ref e) if e.code == ErrorCode::GeneralError));
        assert_eq!(session.state(), SamplerState::Failed);
        assert_eq!(session.last_error(), Some(err));
        assert_eq!(device.read_register(handle, TRIGGER).unwrap(), 10);
    }

    #[test]
    fn failed_trigger_activation_stops_the_sampler() {
        let (device, handle, mut session) = session();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        // the deactivation passes, the activation fails
        device.fail_write(handle, TRIGGER, 1).unwrap();

        let err = session.start(0).unwrap_err();
        assert!(matches!(err, Error::Device(ref e) if e.code == ErrorCode::TimeoutError));
        assert_eq!(session.state(), SamplerState::Failed);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
    }

    #[test]
    fn failed_trigger_deactivation_never_starts() {
        let (device, handle, mut session) = session();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        device.fail_next_write(handle, TRIGGER).unwrap();

        assert!(session.start(0).is_err());
        assert_eq!(session.state(), SamplerState::Failed);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Configured
        );
    }

    #[test]
    fn sampling_errors_fail_the_session() {
        let (device, handle, mut session) = session();
        device.fail_reads(handle, TEMPERATURE, true).unwrap();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        session.start(0).unwrap();
        drain(&mut session);
        assert_eq!(session.state(), SamplerState::Failed);
        assert!(matches!(
            session.last_error(),
            Some(Error::Device(e)) if e.code == ErrorCode::TimeoutError
        ));
    }

    #[test]
    fn repetitive_iterations_are_numbered() {
        let (_device, _handle, mut session) = session();
        session.configure(config(SamplerMode::Repetitive, 50)).unwrap();
        session.start(0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut rows = Vec::new();
        while rows.last().map_or(true, |r: &SampleRow| r.iteration < 3) {
            assert!(Instant::now() < deadline);
            rows.extend(session.poll_rows().unwrap());
            thread::sleep(Duration::from_millis(2));
        }
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);
        rows.extend(session.poll_rows().unwrap());

        for iteration in 0..3 {
            let numbers: Vec<u64> = rows
                .iter()
                .filter(|r| r.iteration == iteration)
                .map(|r| r.sample_number)
                .collect();
            assert_eq!(numbers, vec![0, 1, 2, 3, 4], "iteration {}", iteration);
        }
        // nothing runs after the stop
        thread::sleep(Duration::from_millis(30));
        assert!(session.poll().unwrap().is_empty());
    }

    #[test]
    fn one_session_per_handle() {
        let (device, handle) = device();
        let session = Session::bind(device.clone(), handle).unwrap();
        assert_eq!(
            Session::bind(device.clone(), handle).unwrap_err(),
            Error::Usage(UsageError::HandleAlreadyBound(handle.0))
        );

        let other = device.add_device();
        let _other_session = Session::bind(device.clone(), other).unwrap();

        drop(session);
        assert!(Session::bind(device, handle).is_ok());
    }

    #[test]
    fn start_and_configure_are_rejected_from_handlers() {
        let (device, handle) = device();
        let session = Arc::new(Mutex::new(
            Session::bind_with_options(device, handle, options()).unwrap(),
        ));
        let (tx, rx) = mpsc::channel();

        {
            let mut guard = session.lock().unwrap();
            guard.configure(config(SamplerMode::Continuous, 0)).unwrap();
            let session = session.clone();
            let mut first = true;
            guard
                .start_with_notify(
                    move |_: &Notification| {
                        if std::mem::take(&mut first) {
                            let mut session = session.lock().unwrap();
                            let configured =
                                session.configure(config(SamplerMode::Continuous, 0));
                            let started = session.start(0);
                            tx.send((configured, started)).unwrap();
                        }
                    },
                    0,
                )
                .unwrap();
        }

        let (configured, started) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(configured, Err(Error::Usage(UsageError::ReentrantCall)));
        assert_eq!(started, Err(Error::Usage(UsageError::ReentrantCall)));

        let guard = session.lock().unwrap();
        guard.stop().unwrap();
        assert_eq!(guard.wait_until_finished().unwrap(), SamplerState::Cancelled);
    }

    #[test]
    fn handler_panics_are_reported() {
        let (_device, _handle, mut session) = session();
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        session
            .start_with_notify(|_: &Notification| panic!("broken handler"), 0)
            .unwrap();
        assert_eq!(session.wait_until_finished().unwrap(), SamplerState::Completed);
        assert_eq!(
            session.last_error(),
            Some(Error::HandlerPanicked("broken handler".to_string()))
        );
    }

    #[test]
    fn dropping_an_active_session_stops_the_sampler() {
        let (device, handle, mut session) = session();
        session.configure(config(SamplerMode::Continuous, 0)).unwrap();
        session.start(0).unwrap();
        drop(session);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
    }

    #[test]
    fn waits_are_bounded() {
        let (device, handle) = device();
        let mut session = Session::bind_with_options(
            device.clone(),
            handle,
            SessionOptions {
                wait_timeout: Duration::from_millis(30),
                arm_trigger: false,
                ..options()
            },
        )
        .unwrap();
        // nobody activates the trigger
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        session.start(0).unwrap();
        assert_eq!(
            session.wait_until_running().unwrap_err(),
            Error::Timeout(Duration::from_millis(30))
        );
        assert_eq!(session.state(), SamplerState::Ready);
        session.stop().unwrap();
        assert_eq!(session.state(), SamplerState::Cancelled);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
    }

    #[test]
    fn firmware_runs_take_one_sample_more_than_duration_over_period() {
        let (_device, _handle, mut session) = session();
        session
            .configure(config(SamplerMode::Normal, 50).with_software_implementation(false))
            .unwrap();
        session.start(0).unwrap();
        let rows = drain(&mut session);
        assert_eq!(session.state(), SamplerState::Completed);
        assert_eq!(
            rows.iter()
                .map(|r| r.values[0].collect_time_msec)
                .collect::<Vec<_>>(),
            vec![0, 10, 20, 30, 40, 50]
        );

        // the same run in software stops before the duration is reached
        session.configure(config(SamplerMode::Normal, 50)).unwrap();
        session.start(0).unwrap();
        assert_eq!(drain(&mut session).len(), 5);
    }

    #[test]
    fn firmware_buffers_bound_the_configuration() {
        let (_device, _handle, mut session) = session();
        let err = session
            .configure(
                config(SamplerMode::Normal, 1524)
                    .with_software_implementation(false)
                    .with_period(1),
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::Config(ConfigError::BufferCapacity {
                samples: 1525,
                max: 1524,
                tracked: 2
            })
        );
        assert_eq!(session.state(), SamplerState::Unconfigured);
        // nothing reached the device
        assert!(matches!(
            session.device_configuration(),
            Err(Error::Device(e)) if e.code == ErrorCode::ResourceUnavailable
        ));
    }

    #[test]
    fn notified_rows_restart_with_each_iteration() {
        let (_device, _handle, mut session) = session();
        session.configure(config(SamplerMode::Repetitive, 30)).unwrap();
        let (tx, rx) = mpsc::channel();
        let stop = session.stop_handle();
        session
            .start_with_notify(
                move |n: &Notification| {
                    if n.rows.iter().any(|r| r.iteration >= 2) {
                        stop.stop().unwrap();
                    }
                    tx.send(n.rows.clone()).unwrap();
                },
                0,
            )
            .unwrap();
        assert_eq!(session.wait_until_finished().unwrap(), SamplerState::Cancelled);

        let rows: Vec<SampleRow> = rx.try_iter().flatten().collect();
        for iteration in 0..2 {
            let numbers: Vec<u64> = rows
                .iter()
                .filter(|r| r.iteration == iteration)
                .map(|r| r.sample_number)
                .collect();
            assert_eq!(numbers, vec![0, 1, 2], "iteration {}", iteration);
        }
        assert_eq!(
            rows.iter().find(|r| r.iteration == 2).map(|r| r.sample_number),
            Some(0)
        );
    }

    /// Delegates to a [`SimulatedDevice`] but loses the first stop request.
    struct LosesFirstStop {
        device: SimulatedDevice,
        lose_stop: AtomicBool,
    }

    impl DeviceAccess for LosesFirstStop {
        fn write_register(
            &self,
            handle: DeviceHandle,
            value: i64,
            address: OdIndex,
            bit_length: u8,
        ) -> Result<(), DeviceError> {
            self.device.write_register(handle, value, address, bit_length)
        }

        fn read_register(&self, handle: DeviceHandle, address: OdIndex) -> Result<i64, DeviceError> {
            self.device.read_register(handle, address)
        }

        fn sampler_configure(
            &self,
            handle: DeviceHandle,
            config: &SamplerConfiguration,
        ) -> Result<(), DeviceError> {
            self.device.sampler_configure(handle, config)
        }

        fn sampler_get_configuration(
            &self,
            handle: DeviceHandle,
        ) -> Result<SamplerConfiguration, DeviceError> {
            self.device.sampler_get_configuration(handle)
        }

        fn sampler_start(
            &self,
            handle: DeviceHandle,
            notify: Option<NotifySender>,
            application_data: i64,
        ) -> Result<(), DeviceError> {
            self.device.sampler_start(handle, notify, application_data)
        }

        fn sampler_stop(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
            if self.lose_stop.swap(false, Ordering::SeqCst) {
                return Err(DeviceError::new(ErrorCode::TimeoutError, "stop request lost"));
            }
            self.device.sampler_stop(handle)
        }

        fn sampler_get_state(&self, handle: DeviceHandle) -> Result<SamplerState, DeviceError> {
            self.device.sampler_get_state(handle)
        }

        fn sampler_get_data(&self, handle: DeviceHandle) -> Result<Vec<SampleData>, DeviceError> {
            self.device.sampler_get_data(handle)
        }

        fn sampler_get_last_error(&self, handle: DeviceHandle) -> Option<DeviceError> {
            self.device.sampler_get_last_error(handle)
        }
    }

    #[test]
    fn failed_stop_releases_the_dispatcher() {
        let device = SimulatedDevice::new();
        let handle = device.add_device();
        device.declare_register(handle, TEMPERATURE, 16, 35).unwrap();
        device.declare_register(handle, TRIGGER, 32, 0).unwrap();
        let device = Arc::new(LosesFirstStop {
            device,
            lose_stop: AtomicBool::new(true),
        });
        let mut session = SamplerSession::bind_with_options(
            device.clone(),
            handle,
            SessionOptions {
                arm_trigger: false,
                ..options()
            },
        )
        .unwrap();

        // nobody activates the trigger, the run stays ready
        session
            .configure(config(SamplerMode::Normal, 50).with_tracked_addresses([TEMPERATURE]))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .start_with_notify(move |n: &Notification| tx.send(n.state).unwrap(), 0)
            .unwrap();

        let err = session.stop().unwrap_err();
        assert!(matches!(err, Error::Device(ref e) if e.code == ErrorCode::TimeoutError));
        assert_eq!(session.state(), SamplerState::Failed);
        assert_eq!(session.wait_until_finished().unwrap(), SamplerState::Failed);
        let states: Vec<SamplerState> = rx.try_iter().collect();
        assert_eq!(states.last(), Some(&SamplerState::Failed));

        // the device run survived the lost stop, configure returns instead of hanging
        let err = session
            .configure(config(SamplerMode::Normal, 50).with_tracked_addresses([TEMPERATURE]))
            .unwrap_err();
        assert!(matches!(err, Error::Device(ref e) if e.code == ErrorCode::Busy));

        device.sampler_stop(handle).unwrap();
        session
            .configure(config(SamplerMode::Normal, 50).with_tracked_addresses([TEMPERATURE]))
            .unwrap();
        assert_eq!(session.state(), SamplerState::Configured);
    }
}
