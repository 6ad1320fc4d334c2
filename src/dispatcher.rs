//! Delivery of sampler notifications on a dedicated thread.
//!
//! Device libraries raise notifications on threads of their own. They only
//! queue them; one dispatcher thread per run takes them off the queue and calls
//! the handler, so notifications of a run are delivered in order and never
//! concurrently. A panicking handler is caught at this boundary.
//!
//! When the session ended a run on its own, such as after a stop the device
//! never confirmed, the dispatcher delivers the terminal notification itself
//! once the queue is idle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::device::DeviceNotification;
use crate::{DeviceError, Error, ErrorCode, SampleData, SampleRow, SamplerState};

/// A notification as seen by a [`SamplerNotify`] handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The error that failed the run, or the last caught handler panic
    pub last_error: Option<Error>,
    /// Session state after this notification was applied
    pub state: SamplerState,
    /// Data sampled since the previous notification
    pub data: Vec<SampleData>,
    /// `data` split into samples, numbered by the session
    pub rows: Vec<SampleRow>,
    /// The application data given to [`crate::SamplerSession::start_with_notify`]
    pub application_data: i64,
}

/// Receives the notifications of a sampler run.
///
/// Handlers run on the dispatcher thread. They may stop the run through a
/// [`crate::StopHandle`], but must not start or configure a session.
/// Closures taking a `&Notification` implement this trait.
pub trait SamplerNotify: Send + 'static {
    /// Called once per notification, in order.
    fn notify(&mut self, notification: &Notification);
}

impl<F> SamplerNotify for F
where
    F: FnMut(&Notification) + Send + 'static,
{
    fn notify(&mut self, notification: &Notification) {
        self(notification)
    }
}

/// The session side of a dispatcher.
pub(crate) trait NotificationSink: Send + 'static {
    /// Applies a device notification and returns what the handler gets to see.
    fn accept(&self, notification: DeviceNotification) -> Notification;

    /// The terminal notification of a run the session ended by itself, if it did.
    fn closing(&self) -> Option<Notification>;

    /// A handler panicked while handling a notification.
    fn handler_panicked(&self, error: Error);

    /// The last notification was delivered.
    fn finished(&self);
}

/// Owns the thread delivering the notifications of one run.
#[derive(Debug)]
pub(crate) struct NotificationDispatcher {
    join_handle: thread::JoinHandle<()>,
}

impl NotificationDispatcher {
    /// Starts delivering `notifications` to `handler`.
    ///
    /// The sink is asked for [`NotificationSink::closing`] whenever no
    /// notification arrived for `idle_check`.
    pub(crate) fn spawn<S>(
        name: String,
        notifications: mpsc::Receiver<DeviceNotification>,
        sink: S,
        mut handler: Box<dyn SamplerNotify>,
        idle_check: Duration,
    ) -> Result<Self, Error>
    where
        S: NotificationSink,
    {
        let join_handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                loop {
                    let notification = match notifications.recv_timeout(idle_check) {
                        Ok(device_notification) => sink.accept(device_notification),
                        Err(RecvTimeoutError::Timeout) => match sink.closing() {
                            Some(last) => {
                                log::debug!("run ended by the session, closing dispatcher");
                                last
                            }
                            None => continue,
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let terminal = notification.state.is_terminal();

                    let delivered =
                        panic::catch_unwind(AssertUnwindSafe(|| handler.notify(&notification)));
                    if let Err(payload) = delivered {
                        let message = panic_message(payload.as_ref());
                        log::error!("notification handler panicked: {}", message);
                        sink.handler_panicked(Error::HandlerPanicked(message));
                    }

                    if terminal {
                        break;
                    }
                }
                sink.finished();
                log::debug!("notification dispatcher finished");
            })
            .map_err(|e| DeviceError::new(ErrorCode::ResourceUnavailable, e.to_string()))?;
        Ok(Self { join_handle })
    }

    /// The dispatcher thread.
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.join_handle.thread().id()
    }

    /// `true` when called from a notification handler of this dispatcher.
    pub(crate) fn is_current_thread(&self) -> bool {
        self.thread_id() == thread::current().id()
    }

    /// Waits for the last notification to be delivered.
    pub(crate) fn join(self) {
        if let Err(err) = self.join_handle.join() {
            log::warn!("failed to join notification dispatcher: {:?}", err);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
