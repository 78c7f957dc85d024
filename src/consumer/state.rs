//! Consumer state machine
//!
//! Tracks a consumer from construction to shutdown:
//!
//! ```text
//!   Stopped ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
//! ```
//!
//! The final `Stopped` is terminal. A consumer is started at most once.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Consumer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    /// Not running (before start, or after shutdown)
    Stopped = 0,
    /// Opening the queue receiver
    Starting = 1,
    /// Pulling and processing deliveries
    Running = 2,
    /// Intake stopped, draining the in-flight delivery and releasing resources
    Stopping = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Starting,
            2 => ConsumerState::Running,
            3 => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Lock-free holder for a [`ConsumerState`]
#[derive(Debug)]
pub(crate) struct StateCell {
    state: AtomicU8,
    started: AtomicBool,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the current state is not `from`
    pub(crate) fn transition(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the one allowed start
    pub(crate) fn begin_start(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.transition(ConsumerState::Stopped, ConsumerState::Starting)
    }

    /// Enter `Stopping` from any live state
    pub(crate) fn begin_stop(&self) {
        let _ = self.transition(ConsumerState::Starting, ConsumerState::Stopping)
            || self.transition(ConsumerState::Running, ConsumerState::Stopping);
    }

    pub(crate) fn finish_stop(&self) {
        self.state
            .store(ConsumerState::Stopped as u8, Ordering::Release);
    }

    /// Mark the one allowed start as used without running
    pub(crate) fn retire(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
