//! Call orchestration
//!
//! [`Caller`] and [`Callee`] wire the stream nodes into a live topology and
//! tear it down again. Start and stop are guarded by a compare-and-swap
//! flag: the first caller in wins and a concurrent call returns
//! [`Transition::Busy`] without waiting.

pub mod callee;
pub mod caller;

pub use callee::{Callee, CalleeStats};
pub use caller::{CallStats, Caller};

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio::host::{FaultReporter, StreamFault};
use crate::constants::FAULT_QUEUE_DEPTH;

/// Outcome of a start or stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed
    Applied,
    /// Another start or stop was in flight; nothing was done
    Busy,
    /// Already in the requested state
    Unchanged,
}

/// Non-blocking reentrancy fence
#[derive(Debug, Default)]
pub struct TransitionGuard {
    busy: AtomicBool,
}

impl TransitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a transition is already in flight
    pub fn try_enter(&self) -> Option<TransitionTicket<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TransitionTicket { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of a transition; releases the guard on every exit
/// path
#[must_use]
pub struct TransitionTicket<'a> {
    guard: &'a TransitionGuard,
}

impl Drop for TransitionTicket<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Bounded queue of asynchronous device faults
pub struct FaultChannel {
    tx: Sender<StreamFault>,
    rx: Receiver<StreamFault>,
}

impl FaultChannel {
    pub fn new() -> Self {
        let (tx, rx) = bounded(FAULT_QUEUE_DEPTH);
        Self { tx, rx }
    }

    pub fn reporter(&self) -> FaultReporter {
        FaultReporter::new(self.tx.clone())
    }

    /// Everything reported since the last drain
    pub fn drain(&self) -> Vec<StreamFault> {
        self.rx.try_iter().collect()
    }
}

impl Default for FaultChannel {
    fn default() -> Self {
        Self::new()
    }
}
