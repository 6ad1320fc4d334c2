//! Runs the sampler in normal, repetitive and continuous mode against a simulated
//! controller, first polling for data and then with notifications.
//!
//! ```text
//! cargo run --example sampler -- [-v|-vv] [--fast]
//! ```

mod _logging;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Parser};
use od_sampler::{
    DeviceHandle, Error, Notification, OdIndex, SampleTable, SamplerConfiguration,
    SamplerMode, SamplerNotify, SamplerSession, SamplerState, SamplerTrigger, SimulatedDevice,
    TriggerCondition,
};

const UP_TIME: OdIndex = OdIndex::new(0x230F, 0x00);
const TEMPERATURE: OdIndex = OdIndex::new(0x4014, 0x03);
const TRIGGER: OdIndex = OdIndex::new(0x2400, 0x01);

/// Repetitive runs are stopped once this iteration shows up.
const LAST_ITERATION: u64 = 4;
/// Continuous runs are stopped after this many polling cycles.
const MAX_CYCLES: u32 = 10;

type Session = SamplerSession<SimulatedDevice>;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// More log output, repeat for trace level
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    /// Divide the sampling period and duration by ten
    #[arg(long)]
    fast: bool,
}

struct DemoSettings {
    tracked: Vec<(OdIndex, &'static str)>,
    trigger_condition: TriggerCondition,
    trigger_value: u32,
    period_milliseconds: u16,
    duration_milliseconds: u32,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            tracked: vec![(UP_TIME, "Up time"), (TEMPERATURE, "Temperature")],
            trigger_condition: TriggerCondition::Greater,
            trigger_value: 10,
            period_milliseconds: 1000,
            duration_milliseconds: 4000,
        }
    }
}

impl DemoSettings {
    fn fast(mut self) -> Self {
        self.period_milliseconds /= 10;
        self.duration_milliseconds /= 10;
        self
    }

    fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_milliseconds))
    }

    fn configuration(&self, mode: SamplerMode) -> SamplerConfiguration {
        let config = SamplerConfiguration::new(mode)
            .with_period(self.period_milliseconds)
            .with_start_trigger(SamplerTrigger::new(
                self.trigger_condition,
                TRIGGER,
                self.trigger_value,
            ))
            .with_tracked_addresses(self.tracked.iter().map(|(address, _)| *address));
        match mode {
            SamplerMode::Continuous => config,
            _ => config.with_duration(self.duration_milliseconds),
        }
    }

    fn table(&self) -> SampleTable {
        SampleTable::new(self.tracked.iter().map(|(_, name)| *name))
    }
}

fn simulated_controller(settings: &DemoSettings) -> Result<(Arc<SimulatedDevice>, DeviceHandle), Error> {
    let device = Arc::new(SimulatedDevice::new());
    let handle = device.add_device();
    device.declare_uptime(handle, UP_TIME)?;
    device.declare_register(handle, TEMPERATURE, 16, 36)?;
    device.declare_register(handle, TRIGGER, 32, i64::from(settings.trigger_value))?;
    log::info!("simulated controller {} ready", handle);
    Ok((device, handle))
}

/// Fails with the error of the run if it didn't end cleanly.
fn finish(session: &Session) -> Result<(), Error> {
    match (session.state(), session.last_error()) {
        (SamplerState::Failed, Some(error)) => Err(error),
        (state, _) => {
            log::info!("sampler {}", state);
            Ok(())
        }
    }
}

/// Polls every period and prints what came in, until `stop` says so or the run ended.
///
/// `stop` gets the number of polling cycles and the last iteration seen.
fn poll_until<F>(session: &mut Session, settings: &DemoSettings, mut stop: F) -> Result<(), Error>
where
    F: FnMut(u32, u64) -> bool,
{
    let mut table = settings.table();
    let mut cycle = 0;
    let mut last_iteration = 0;
    loop {
        thread::sleep(settings.period());
        let rows = session.poll_rows()?;
        print!("{}", table.render(&rows));
        if let Some(row) = rows.last() {
            last_iteration = row.iteration;
        }
        cycle += 1;

        if !session.state().is_active() {
            break;
        }
        if stop(cycle, last_iteration) {
            session.stop()?;
            print!("{}", table.render(&session.poll_rows()?));
            break;
        }
    }
    finish(session)
}

fn sample_without_notification(session: &mut Session, settings: &DemoSettings) -> Result<(), Error> {
    println!("\nSampler without notification in normal mode:");
    session.configure(settings.configuration(SamplerMode::Normal))?;
    session.start(0)?;
    poll_until(session, settings, |_, _| false)?;

    println!("\nSampler without notification in repetitive mode:");
    session.configure(settings.configuration(SamplerMode::Repetitive))?;
    session.start(0)?;
    session.wait_until_running()?;
    poll_until(session, settings, |_, iteration| iteration >= LAST_ITERATION)?;

    println!("\nSampler without notification in continuous mode:");
    session.configure(settings.configuration(SamplerMode::Continuous))?;
    session.start(0)?;
    poll_until(session, settings, |cycle, _| cycle >= MAX_CYCLES)
}

/// Prints the rows of each notification and publishes the last iteration seen.
struct TablePrinter {
    table: SampleTable,
    last_iteration: Arc<AtomicU64>,
}

impl TablePrinter {
    fn new(settings: &DemoSettings) -> (Self, Arc<AtomicU64>) {
        let last_iteration = Arc::new(AtomicU64::new(0));
        let printer = Self {
            table: settings.table(),
            last_iteration: last_iteration.clone(),
        };
        (printer, last_iteration)
    }
}

impl SamplerNotify for TablePrinter {
    fn notify(&mut self, notification: &Notification) {
        if let Some(error) = &notification.last_error {
            log::error!("sampler reported: {}", error);
        }
        print!("{}", self.table.render(&notification.rows));
        if let Some(row) = notification.rows.last() {
            self.last_iteration.store(row.iteration, Ordering::SeqCst);
        }
        log::debug!(
            "notification {} in state {}",
            notification.application_data,
            notification.state
        );
    }
}

fn sample_with_notification(session: &mut Session, settings: &DemoSettings) -> Result<(), Error> {
    println!("\nSampler with notification in normal mode:");
    session.configure(settings.configuration(SamplerMode::Normal))?;
    let (printer, _) = TablePrinter::new(settings);
    session.start_with_notify(printer, 1)?;
    session.wait_until_finished()?;
    finish(session)?;

    println!("\nSampler with notification in repetitive mode:");
    session.configure(settings.configuration(SamplerMode::Repetitive))?;
    let (printer, last_iteration) = TablePrinter::new(settings);
    session.start_with_notify(printer, 2)?;
    session.wait_until_running()?;
    while session.state().is_active() {
        if last_iteration.load(Ordering::SeqCst) >= LAST_ITERATION {
            session.stop()?;
            break;
        }
        thread::sleep(settings.period());
    }
    session.wait_until_finished()?;
    finish(session)?;

    println!("\nSampler with notification in continuous mode:");
    session.configure(settings.configuration(SamplerMode::Continuous))?;
    let (printer, _) = TablePrinter::new(settings);
    session.start_with_notify(printer, 3)?;
    thread::sleep(settings.period() * MAX_CYCLES);
    session.stop()?;
    session.wait_until_finished()?;
    finish(session)
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    _logging::init("od_sampler", args.verbose.min(2) as i8);

    let settings = if args.fast {
        DemoSettings::default().fast()
    } else {
        DemoSettings::default()
    };

    let (device, handle) = simulated_controller(&settings)?;
    let mut session = SamplerSession::bind(device, handle)?;

    sample_without_notification(&mut session, &settings)?;
    sample_with_notification(&mut session, &settings)?;

    log::info!("sampler demo finished");
    Ok(())
}
