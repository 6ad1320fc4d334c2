//! An in-memory device with a software driven sampler.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::device::{DeviceAccess, DeviceHandle, DeviceNotification, NotifySender};
use crate::run::SamplingRun;
use crate::{
    lock, DeviceError, ErrorCode, OdIndex, SampleData, SamplerConfiguration, SamplerState,
};

/// SDO abort code: object does not exist in the object dictionary.
const ABORT_OBJECT_DOES_NOT_EXIST: u32 = 0x0602_0000;

fn not_found(address: OdIndex) -> DeviceError {
    DeviceError::new(
        ErrorCode::OdAddressNotFound,
        format!("object {} does not exist", address),
    )
    .with_extended(ABORT_OBJECT_DOES_NOT_EXIST)
}

#[derive(Debug)]
enum Cell {
    /// Little endian bytes of the written width
    Stored(Vec<u8>),
    /// Whole seconds since power on, read only
    UpTime,
}

#[derive(Debug)]
struct RegisterMap {
    cells: BTreeMap<OdIndex, Cell>,
    failing_reads: BTreeSet<OdIndex>,
    /// Successful writes left before the next write to an address fails
    failing_writes: BTreeMap<OdIndex, usize>,
    powered_on: Instant,
}

impl RegisterMap {
    fn new() -> Self {
        Self {
            cells: BTreeMap::new(),
            failing_reads: BTreeSet::new(),
            failing_writes: BTreeMap::new(),
            powered_on: Instant::now(),
        }
    }

    fn read(&self, address: OdIndex) -> Result<i64, DeviceError> {
        if self.failing_reads.contains(&address) {
            return Err(DeviceError::new(
                ErrorCode::TimeoutError,
                format!("no response reading {}", address),
            ));
        }
        match self.cells.get(&address) {
            Some(Cell::Stored(bytes)) => decode(bytes),
            Some(Cell::UpTime) => Ok(self.powered_on.elapsed().as_secs() as i64),
            None => Err(not_found(address)),
        }
    }

    fn write(&mut self, address: OdIndex, value: i64, bit_length: u8) -> Result<(), DeviceError> {
        if let Some(left) = self.failing_writes.get_mut(&address) {
            if *left > 0 {
                *left -= 1;
            } else {
                self.failing_writes.remove(&address);
                return Err(DeviceError::new(
                    ErrorCode::TimeoutError,
                    format!("no response writing {}", address),
                ));
            }
        }
        let cell = self
            .cells
            .get_mut(&address)
            .ok_or_else(|| not_found(address))?;
        let Cell::Stored(bytes) = cell else {
            return Err(DeviceError::new(
                ErrorCode::InvalidArguments,
                format!("{} is read only", address),
            ));
        };
        *bytes = encode(value, bit_length)?;
        log::trace!("{} <- {} [{}]", address, value, hex::encode(bytes.as_slice()));
        Ok(())
    }
}

fn encode(value: i64, bit_length: u8) -> Result<Vec<u8>, DeviceError> {
    let mut buf = Vec::with_capacity(8);
    // narrower widths keep the low bytes
    let written = match bit_length {
        8 => buf.write_u8(value as u8),
        16 => buf.write_u16::<LE>(value as u16),
        32 => buf.write_u32::<LE>(value as u32),
        64 => buf.write_i64::<LE>(value),
        other => {
            return Err(DeviceError::new(
                ErrorCode::InvalidArguments,
                format!("unsupported bit length {}", other),
            ))
        }
    };
    written.map_err(|e| DeviceError::new(ErrorCode::GeneralError, e.to_string()))?;
    Ok(buf)
}

fn decode(bytes: &[u8]) -> Result<i64, DeviceError> {
    let mut rdr = Cursor::new(bytes);
    let value = match bytes.len() {
        1 => rdr.read_i8().map(i64::from),
        2 => rdr.read_i16::<LE>().map(i64::from),
        4 => rdr.read_i32::<LE>().map(i64::from),
        _ => rdr.read_i64::<LE>(),
    };
    value.map_err(|e| DeviceError::new(ErrorCode::ProtocolError, e.to_string()))
}

#[derive(Debug, Default)]
struct SamplerStatus {
    state: SamplerState,
    last_error: Option<DeviceError>,
    data: Vec<SampleData>,
}

impl SamplerStatus {
    /// Buffers batches for polling, merging consecutive batches of one iteration.
    fn buffer(&mut self, batches: Vec<SampleData>) {
        for batch in batches {
            match self.data.last_mut() {
                Some(last) if last.iteration_number == batch.iteration_number => {
                    last.sampled_values.extend(batch.sampled_values)
                }
                _ => self.data.push(batch),
            }
        }
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Stop,
}

#[derive(Debug)]
struct Worker {
    command_tx: mpsc::Sender<WorkerCommand>,
    join_handle: thread::JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        if let Err(err) = self.command_tx.send(WorkerCommand::Stop) {
            log::debug!(
                "asked to stop sampler but the worker already finished (command send failed: {:?})",
                err
            );
        }
        if let Err(err) = self.join_handle.join() {
            log::warn!("failed to join sampler worker: {:?}", err);
        }
    }
}

struct WorkerContext {
    run: SamplingRun,
    registers: Arc<Mutex<RegisterMap>>,
    status: Arc<Mutex<SamplerStatus>>,
    notify: Option<NotifySender>,
    application_data: i64,
    command_rx: mpsc::Receiver<WorkerCommand>,
}

impl WorkerContext {
    fn sample(mut self) {
        let period = u64::from(self.run.config().period_milliseconds);
        let started = Instant::now();
        let mut tick: u64 = 0;

        loop {
            // timestamps are taken on the sampling grid, the clock only paces the ticks
            let registers = &self.registers;
            let outcome = self
                .run
                .tick(tick * period, |address| lock(registers).read(address));
            self.publish(outcome.state_changed);
            if outcome.state.is_terminal() {
                break;
            }

            tick += 1;
            let deadline = started + Duration::from_millis(tick * period);
            match self
                .command_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(WorkerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    self.run.cancel();
                    self.publish(true);
                    break;
                }
            }
        }
        log::debug!("sampler worker finished in state {}", self.run.state());
    }

    fn publish(&mut self, state_changed: bool) {
        let data = self.run.take_data();
        let state = self.run.state();
        let last_error = self.run.last_error().cloned();

        {
            let mut status = lock(&self.status);
            status.state = state;
            status.last_error = last_error.clone();
            if self.notify.is_none() {
                status.buffer(data);
                return;
            }
        }

        if let Some(notify) = &self.notify {
            if !state_changed && data.is_empty() {
                return;
            }
            let sent = notify.send(DeviceNotification {
                last_error,
                state,
                data,
                application_data: self.application_data,
            });
            if !sent {
                log::debug!("notification receiver is gone, dropping notification ({})", state);
            }
        }
    }
}

#[derive(Debug)]
struct Node {
    registers: Arc<Mutex<RegisterMap>>,
    status: Arc<Mutex<SamplerStatus>>,
    /// The configuration as the device stores it
    record: Option<Vec<u8>>,
    worker: Option<Worker>,
    fail_next_start: bool,
}

impl Node {
    fn new() -> Self {
        Self {
            registers: Arc::new(Mutex::new(RegisterMap::new())),
            status: Arc::new(Mutex::new(SamplerStatus::default())),
            record: None,
            worker: None,
            fail_next_start: false,
        }
    }
}

/// A set of simulated devices, each with an object dictionary and a sampler.
///
/// Registers must be declared before they can be accessed. The sampler runs on
/// a worker thread per device, sampling every period with the software timing
/// rules. Faults can be injected to exercise error paths.
///
/// ```rust
/// use od_sampler::{DeviceAccess, OdIndex, SimulatedDevice};
///
/// let device = SimulatedDevice::new();
/// let handle = device.add_device();
/// let trigger = OdIndex::new(0x2400, 0x01);
/// device.declare_register(handle, trigger, 32, 10).unwrap();
/// device.write_register(handle, 11, trigger, 32).unwrap();
/// assert_eq!(device.read_register(handle, trigger).unwrap(), 11);
/// ```
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    nodes: Mutex<BTreeMap<DeviceHandle, Node>>,
    next_handle: AtomicU32,
}

impl SimulatedDevice {
    /// Creates an empty set of devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new device and returns its handle.
    pub fn add_device(&self) -> DeviceHandle {
        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.nodes).insert(handle, Node::new());
        log::debug!("simulated device {} connected", handle);
        handle
    }

    fn with_node<T, F>(&self, handle: DeviceHandle, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut Node) -> Result<T, DeviceError>,
    {
        let mut nodes = lock(&self.nodes);
        let node = nodes.get_mut(&handle).ok_or_else(|| {
            DeviceError::new(ErrorCode::InvalidHandle, format!("no device {}", handle))
        })?;
        f(node)
    }

    fn registers(&self, handle: DeviceHandle) -> Result<Arc<Mutex<RegisterMap>>, DeviceError> {
        self.with_node(handle, |node| Ok(node.registers.clone()))
    }

    /// Declares a register of `bit_length` bits holding `value`.
    pub fn declare_register(
        &self,
        handle: DeviceHandle,
        address: OdIndex,
        bit_length: u8,
        value: i64,
    ) -> Result<(), DeviceError> {
        let bytes = encode(value, bit_length)?;
        let registers = self.registers(handle)?;
        lock(&registers).cells.insert(address, Cell::Stored(bytes));
        Ok(())
    }

    /// Declares a read only register counting the seconds since the device was connected.
    pub fn declare_uptime(&self, handle: DeviceHandle, address: OdIndex) -> Result<(), DeviceError> {
        let registers = self.registers(handle)?;
        lock(&registers).cells.insert(address, Cell::UpTime);
        Ok(())
    }

    /// Makes the next write to `address` fail with a timeout.
    pub fn fail_next_write(&self, handle: DeviceHandle, address: OdIndex) -> Result<(), DeviceError> {
        self.fail_write(handle, address, 0)
    }

    /// Lets `succeeding` more writes to `address` pass, then fails the next one with a timeout.
    pub fn fail_write(
        &self,
        handle: DeviceHandle,
        address: OdIndex,
        succeeding: usize,
    ) -> Result<(), DeviceError> {
        let registers = self.registers(handle)?;
        lock(&registers).failing_writes.insert(address, succeeding);
        Ok(())
    }

    /// Makes every read of `address` fail with a timeout until called again with `false`.
    pub fn fail_reads(
        &self,
        handle: DeviceHandle,
        address: OdIndex,
        failing: bool,
    ) -> Result<(), DeviceError> {
        let registers = self.registers(handle)?;
        let mut registers = lock(&registers);
        if failing {
            registers.failing_reads.insert(address);
        } else {
            registers.failing_reads.remove(&address);
        }
        Ok(())
    }

    /// Makes the next sampler start fail.
    pub fn fail_next_start(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        self.with_node(handle, |node| {
            node.fail_next_start = true;
            Ok(())
        })
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        let nodes = self.nodes.get_mut().unwrap_or_else(PoisonError::into_inner);
        for node in nodes.values_mut() {
            if let Some(worker) = node.worker.take() {
                worker.stop();
            }
        }
    }
}

impl DeviceAccess for SimulatedDevice {
    fn write_register(
        &self,
        handle: DeviceHandle,
        value: i64,
        address: OdIndex,
        bit_length: u8,
    ) -> Result<(), DeviceError> {
        let registers = self.registers(handle)?;
        let written = lock(&registers).write(address, value, bit_length);
        written
    }

    fn read_register(&self, handle: DeviceHandle, address: OdIndex) -> Result<i64, DeviceError> {
        let registers = self.registers(handle)?;
        let read = lock(&registers).read(address);
        read
    }

    fn sampler_configure(
        &self,
        handle: DeviceHandle,
        config: &SamplerConfiguration,
    ) -> Result<(), DeviceError> {
        config.validate()?;
        self.with_node(handle, |node| {
            if lock(&node.status).state.is_active() {
                return Err(DeviceError::new(ErrorCode::Busy, "sampler is active"));
            }
            node.record = Some(config.to_record());
            *lock(&node.status) = SamplerStatus {
                state: SamplerState::Configured,
                ..SamplerStatus::default()
            };
            log::debug!("device {} sampler configured: {:?}", handle, config);
            Ok(())
        })
    }

    fn sampler_get_configuration(
        &self,
        handle: DeviceHandle,
    ) -> Result<SamplerConfiguration, DeviceError> {
        self.with_node(handle, |node| {
            let record = node.record.as_ref().ok_or_else(|| {
                DeviceError::new(ErrorCode::ResourceUnavailable, "sampler is not configured")
            })?;
            Ok(SamplerConfiguration::from_record(record)?)
        })
    }

    fn sampler_start(
        &self,
        handle: DeviceHandle,
        notify: Option<NotifySender>,
        application_data: i64,
    ) -> Result<(), DeviceError> {
        self.with_node(handle, |node| {
            if node.fail_next_start {
                node.fail_next_start = false;
                return Err(DeviceError::new(
                    ErrorCode::GeneralError,
                    "sampler start rejected by the device",
                ));
            }
            if lock(&node.status).state.is_active() {
                return Err(DeviceError::new(ErrorCode::Busy, "sampler is active"));
            }
            let record = node.record.as_ref().ok_or_else(|| {
                DeviceError::new(ErrorCode::InvalidArguments, "sampler is not configured")
            })?;
            let mut run = SamplingRun::new(SamplerConfiguration::from_record(record)?)?;
            run.arm()
                .map_err(|e| DeviceError::new(ErrorCode::InvalidArguments, e.to_string()))?;

            // workers never lock the node map, joining a finished one here is fine
            if let Some(previous) = node.worker.take() {
                previous.stop();
            }
            *lock(&node.status) = SamplerStatus {
                state: SamplerState::Ready,
                ..SamplerStatus::default()
            };

            let (command_tx, command_rx) = mpsc::channel();
            let context = WorkerContext {
                run,
                registers: node.registers.clone(),
                status: node.status.clone(),
                notify,
                application_data,
                command_rx,
            };
            let join_handle = thread::Builder::new()
                .name(format!("sampler-{}", handle.0))
                .spawn(move || context.sample())
                .map_err(|e| DeviceError::new(ErrorCode::ResourceUnavailable, e.to_string()))?;
            node.worker = Some(Worker {
                command_tx,
                join_handle,
            });
            log::debug!("device {} sampler started", handle);
            Ok(())
        })
    }

    fn sampler_stop(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        let worker = self.with_node(handle, |node| {
            let worker = node.worker.take();
            if worker.is_none() {
                let mut status = lock(&node.status);
                if status.state != SamplerState::Unconfigured && !status.state.is_terminal() {
                    status.state = SamplerState::Cancelled;
                }
            }
            Ok(worker)
        })?;
        if let Some(worker) = worker {
            worker.stop();
            log::debug!("device {} sampler stopped", handle);
        }
        Ok(())
    }

    fn sampler_get_state(&self, handle: DeviceHandle) -> Result<SamplerState, DeviceError> {
        self.with_node(handle, |node| Ok(lock(&node.status).state))
    }

    fn sampler_get_data(&self, handle: DeviceHandle) -> Result<Vec<SampleData>, DeviceError> {
        self.with_node(handle, |node| Ok(std::mem::take(&mut lock(&node.status).data)))
    }

    fn sampler_get_last_error(&self, handle: DeviceHandle) -> Option<DeviceError> {
        self.with_node(handle, |node| Ok(lock(&node.status).last_error.clone()))
            .unwrap_or_else(Some)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::device::notification_channel;
    use crate::{SamplerMode, SamplerTrigger, TriggerCondition};

    const UP_TIME: OdIndex = OdIndex::new(0x230F, 0x00);
    const TEMPERATURE: OdIndex = OdIndex::new(0x4014, 0x03);
    const TRIGGER: OdIndex = OdIndex::new(0x2400, 0x01);

    fn device() -> (SimulatedDevice, DeviceHandle) {
        let device = SimulatedDevice::new();
        let handle = device.add_device();
        device.declare_uptime(handle, UP_TIME).unwrap();
        device.declare_register(handle, TEMPERATURE, 16, 35).unwrap();
        device.declare_register(handle, TRIGGER, 32, 0).unwrap();
        (device, handle)
    }

    fn config(mode: SamplerMode, duration: u32) -> SamplerConfiguration {
        SamplerConfiguration::new(mode)
            .with_software_implementation(true)
            .with_period(10)
            .with_duration(duration)
            .with_start_trigger(SamplerTrigger::immediate())
            .track(UP_TIME)
            .track(TEMPERATURE)
    }

    fn wait_for_end(device: &SimulatedDevice, handle: DeviceHandle) -> SamplerState {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = device.sampler_get_state(handle).unwrap();
            if state.is_terminal() || Instant::now() > deadline {
                return state;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn registers_keep_their_width() {
        let (device, handle) = device();
        device.declare_register(handle, OdIndex::new(0x6060, 0), 8, 0).unwrap();
        device.write_register(handle, 0xFF, OdIndex::new(0x6060, 0), 8).unwrap();
        assert_eq!(device.read_register(handle, OdIndex::new(0x6060, 0)).unwrap(), -1);

        device.write_register(handle, 0x1_0000_0005, TRIGGER, 32).unwrap();
        assert_eq!(device.read_register(handle, TRIGGER).unwrap(), 5);
        device.write_register(handle, i64::MIN, TRIGGER, 64).unwrap();
        assert_eq!(device.read_register(handle, TRIGGER).unwrap(), i64::MIN);

        let err = device.write_register(handle, 1, TRIGGER, 12).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
        assert_eq!(device.read_register(handle, TEMPERATURE).unwrap(), 35);
        assert!(device.read_register(handle, UP_TIME).unwrap() >= 0);
    }

    #[test]
    fn register_errors() {
        let (device, handle) = device();
        let missing = OdIndex::new(0x6064, 0x00);
        let err = device.read_register(handle, missing).unwrap_err();
        assert_eq!(err.code, ErrorCode::OdAddressNotFound);
        assert_eq!(err.extended, ABORT_OBJECT_DOES_NOT_EXIST);

        let err = device.read_register(DeviceHandle(42), TRIGGER).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHandle);

        let err = device.write_register(handle, 1, UP_TIME, 32).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);

        device.fail_next_write(handle, TRIGGER).unwrap();
        assert!(device.write_register(handle, 1, TRIGGER, 32).is_err());
        assert!(device.write_register(handle, 1, TRIGGER, 32).is_ok());
        device.fail_write(handle, TRIGGER, 2).unwrap();
        assert!(device.write_register(handle, 2, TRIGGER, 32).is_ok());
        assert!(device.write_register(handle, 3, TRIGGER, 32).is_ok());
        assert!(device.write_register(handle, 4, TRIGGER, 32).is_err());
        assert!(device.write_register(handle, 1, TRIGGER, 32).is_ok());

        device.fail_reads(handle, TRIGGER, true).unwrap();
        assert_eq!(
            device.read_register(handle, TRIGGER).unwrap_err().code,
            ErrorCode::TimeoutError
        );
        device.fail_reads(handle, TRIGGER, false).unwrap();
        assert_eq!(device.read_register(handle, TRIGGER).unwrap(), 1);
    }

    #[test]
    fn configuration_round_trip() {
        let (device, handle) = device();
        assert_eq!(
            device.sampler_get_configuration(handle).unwrap_err().code,
            ErrorCode::ResourceUnavailable
        );
        let config = config(SamplerMode::Repetitive, 50).with_stop_trigger(SamplerTrigger::new(
            TriggerCondition::Set,
            TRIGGER,
            3,
        ));
        device.sampler_configure(handle, &config).unwrap();
        assert_eq!(device.sampler_get_configuration(handle).unwrap(), config);
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Configured
        );

        let invalid = config.with_duration(0).with_stop_trigger(SamplerTrigger::default());
        let err = device.sampler_configure(handle, &invalid).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArguments);
    }

    #[test]
    fn polled_run() {
        let (device, handle) = device();
        assert!(device.sampler_start(handle, None, 0).is_err());

        device
            .sampler_configure(handle, &config(SamplerMode::Normal, 50))
            .unwrap();
        device.sampler_start(handle, None, 0).unwrap();
        assert_eq!(wait_for_end(&device, handle), SamplerState::Completed);

        let data = device.sampler_get_data(handle).unwrap();
        assert_eq!(data.len(), 1);
        let times: Vec<u64> = data[0]
            .sampled_values
            .iter()
            .step_by(2)
            .map(|v| v.collect_time_msec)
            .collect();
        assert_eq!(times, vec![0, 10, 20, 30, 40]);
        assert!(data[0].sampled_values.iter().skip(1).step_by(2).all(|v| v.value == 35));
        assert!(device.sampler_get_data(handle).unwrap().is_empty());
        assert_eq!(device.sampler_get_last_error(handle), None);
    }

    #[test]
    fn notified_run() {
        let (device, handle) = device();
        device
            .sampler_configure(handle, &config(SamplerMode::Normal, 50))
            .unwrap();
        let (tx, rx) = notification_channel();
        device.sampler_start(handle, Some(tx), 77).unwrap();

        let mut notifications = Vec::new();
        while let Ok(n) = rx.recv_timeout(Duration::from_secs(5)) {
            let terminal = n.state.is_terminal();
            notifications.push(n);
            if terminal {
                break;
            }
        }
        let last = notifications.last().unwrap();
        assert_eq!(last.state, SamplerState::Completed);
        assert!(notifications.iter().all(|n| n.application_data == 77));
        let values: usize = notifications
            .iter()
            .flat_map(|n| &n.data)
            .map(|d| d.sampled_values.len())
            .sum();
        assert_eq!(values, 10);
        // nothing is buffered for polling
        assert!(device.sampler_get_data(handle).unwrap().is_empty());
    }

    #[test]
    fn stopping_a_continuous_run() {
        let (device, handle) = device();
        device
            .sampler_configure(handle, &config(SamplerMode::Continuous, 0))
            .unwrap();
        device.sampler_start(handle, None, 0).unwrap();
        assert_eq!(
            device.sampler_start(handle, None, 0).unwrap_err().code,
            ErrorCode::Busy
        );
        assert_eq!(
            device
                .sampler_configure(handle, &config(SamplerMode::Continuous, 0))
                .unwrap_err()
                .code,
            ErrorCode::Busy
        );
        thread::sleep(Duration::from_millis(50));
        device.sampler_stop(handle).unwrap();
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
        assert!(!device.sampler_get_data(handle).unwrap().is_empty());
        device.sampler_stop(handle).unwrap();
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Cancelled
        );
    }

    #[test]
    fn read_failures_fail_the_sampler() {
        let (device, handle) = device();
        device.fail_reads(handle, TEMPERATURE, true).unwrap();
        device
            .sampler_configure(handle, &config(SamplerMode::Normal, 50))
            .unwrap();
        device.sampler_start(handle, None, 0).unwrap();
        assert_eq!(wait_for_end(&device, handle), SamplerState::Failed);
        assert_eq!(
            device.sampler_get_last_error(handle).map(|e| e.code),
            Some(ErrorCode::TimeoutError)
        );
        assert_eq!(
            device.sampler_get_last_error(DeviceHandle(9)).map(|e| e.code),
            Some(ErrorCode::InvalidHandle)
        );
    }

    #[test]
    fn injected_start_failure() {
        let (device, handle) = device();
        device
            .sampler_configure(handle, &config(SamplerMode::Normal, 50))
            .unwrap();
        device.fail_next_start(handle).unwrap();
        assert!(device.sampler_start(handle, None, 0).is_err());
        assert_eq!(
            device.sampler_get_state(handle).unwrap(),
            SamplerState::Configured
        );
        device.sampler_start(handle, None, 0).unwrap();
        assert_eq!(wait_for_end(&device, handle), SamplerState::Completed);
    }
}
