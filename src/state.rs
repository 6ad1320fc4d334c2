//! The sampler state machine.
//!
//! ```text
//! Unconfigured -> Configured -> Ready -> Running -> Completed
//!                                 ^         |   \-> Failed
//!                                 \---------/    \-> Cancelled
//!                          (repetitive iterations)
//! ```
//!
//! Only `Completed`, `Failed` and `Cancelled` are terminal. Once terminal, the
//! machine ignores everything but a new `configure`.

use std::fmt;

use num_derive::FromPrimitive;

use crate::UsageError;

/// State of a sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum SamplerState {
    /// Not yet configured
    #[default]
    Unconfigured = 0,
    /// Configured but not started
    Configured = 1,
    /// Configured and waiting for the start trigger
    Ready = 2,
    /// Running now
    Running = 3,
    /// Completed successfully
    Completed = 4,
    /// Finished due to an error
    Failed = 5,
    /// Cancelled from the application
    Cancelled = 6,
}

impl SamplerState {
    /// `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SamplerState::Completed | SamplerState::Failed | SamplerState::Cancelled
        )
    }

    /// `Ready` and `Running`: the sampler may produce data or notifications.
    pub fn is_active(&self) -> bool {
        matches!(self, SamplerState::Ready | SamplerState::Running)
    }
}

impl fmt::Display for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the [`SamplerState`] and the error that ended a run.
///
/// `E` is the error type recorded on failure: device side runs record device
/// errors, sessions record the crate [`crate::Error`].
#[derive(Debug, Clone)]
pub struct StateMachine<E> {
    state: SamplerState,
    last_error: Option<E>,
}

impl<E: Clone> Default for StateMachine<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> StateMachine<E> {
    /// A new machine in [`SamplerState::Unconfigured`].
    pub fn new() -> Self {
        Self {
            state: SamplerState::Unconfigured,
            last_error: None,
        }
    }

    /// A new machine holding an accepted configuration.
    pub fn configured() -> Self {
        Self {
            state: SamplerState::Configured,
            last_error: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// The error that moved the machine to [`SamplerState::Failed`].
    pub fn last_error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    fn transition(&mut self, to: SamplerState) {
        if self.state != to {
            log::debug!("sampler state {} -> {}", self.state, to);
            self.state = to;
        }
    }

    /// Accepts a new configuration. Not allowed while `Ready` or `Running`.
    pub fn configure(&mut self) -> Result<(), UsageError> {
        if self.state.is_active() {
            return Err(UsageError::AlreadyActive);
        }
        self.last_error = None;
        self.transition(SamplerState::Configured);
        Ok(())
    }

    /// `Configured -> Ready`. A finished run must be configured again first.
    pub fn arm(&mut self) -> Result<(), UsageError> {
        match self.state {
            SamplerState::Configured => {
                self.transition(SamplerState::Ready);
                Ok(())
            }
            SamplerState::Ready | SamplerState::Running => Err(UsageError::AlreadyActive),
            _ => Err(UsageError::NotConfigured),
        }
    }

    /// `Ready -> Running`, the start trigger fired. Returns `false` in any other state.
    pub fn trigger_fired(&mut self) -> bool {
        if self.state != SamplerState::Ready {
            return false;
        }
        self.transition(SamplerState::Running);
        true
    }

    /// The current iteration ended naturally: `Running -> Ready` when another
    /// iteration follows, `Running -> Completed` otherwise.
    pub fn iteration_finished(&mut self, repeat: bool) -> bool {
        if self.state != SamplerState::Running {
            return false;
        }
        if repeat {
            self.transition(SamplerState::Ready);
        } else {
            self.transition(SamplerState::Completed);
        }
        true
    }

    /// External stop. Every non-terminal state becomes `Cancelled`.
    ///
    /// Returns `true` only for the call that actually cancelled, so concurrent
    /// stop requests resolve to exactly one cancellation.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.transition(SamplerState::Cancelled);
        true
    }

    /// Moves to `Failed` carrying `error`, unless the run already ended.
    pub fn fail(&mut self, error: E) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.last_error = Some(error);
        self.transition(SamplerState::Failed);
        true
    }

    /// Follows a state reported by the sampler implementation.
    ///
    /// Reports arriving after the run ended are ignored (`Ok(false)`). A report
    /// that is not reachable from the current state is returned as `Err` with
    /// the offending state, and the machine is left untouched. A reported
    /// `Failed` must go through [`StateMachine::fail`] to carry its error.
    pub fn follow(&mut self, reported: SamplerState) -> Result<bool, SamplerState> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        let allowed = match (self.state, reported) {
            (from, to) if from == to => return Ok(false),
            (SamplerState::Ready, SamplerState::Running) => true,
            (SamplerState::Running, SamplerState::Ready) => true,
            (SamplerState::Ready | SamplerState::Running, SamplerState::Completed) => true,
            (_, SamplerState::Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return Err(reported);
        }
        self.transition(reported);
        Ok(true)
    }
}
