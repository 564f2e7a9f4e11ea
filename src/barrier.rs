//! Exchange completion barrier.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::NetSortError;

#[derive(Debug, Default)]
struct BarrierState {
    inbound: usize,
    outbound: usize,
    failure: Option<NetSortError>,
}

/// Gate between the exchange and the final sort.
///
/// Tracks two independent countdowns, both expecting one completion per peer:
/// * inbound - buckets fully served to peers,
/// * outbound - peer streams fully received and delivered to the result set.
///
/// [`CompletionBarrier::wait`] returns once both countdowns reach zero, in any order. A failed
/// transfer releases waiters immediately with the failure.
#[derive(Debug)]
pub struct CompletionBarrier {
    expected: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl CompletionBarrier {
    /// Creates a barrier expecting `expected` inbound and `expected` outbound completions.
    pub fn new(expected: usize) -> Self {
        CompletionBarrier {
            expected,
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Records a completed inbound transfer.
    pub fn inbound_done(&self) {
        let mut state = self.lock();
        if state.inbound == self.expected {
            log::warn!("unexpected inbound completion ignored");
            return;
        }
        state.inbound += 1;
        log::debug!("inbound transfers done: {}/{}", state.inbound, self.expected);
        self.cond.notify_all();
    }

    /// Records a completed outbound transfer.
    pub fn outbound_done(&self) {
        let mut state = self.lock();
        if state.outbound == self.expected {
            log::warn!("unexpected outbound completion ignored");
            return;
        }
        state.outbound += 1;
        log::debug!("outbound transfers done: {}/{}", state.outbound, self.expected);
        self.cond.notify_all();
    }

    /// Records a failed transfer. Only the first failure is kept.
    pub fn fail(&self, err: NetSortError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(err);
        } else {
            log::error!("additional exchange failure: {}", err);
        }
        self.cond.notify_all();
    }

    /// Returns current `(inbound, outbound)` completion counts.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.inbound, state.outbound)
    }

    /// Blocks until all inbound and all outbound transfers are done or one of them failed.
    ///
    /// # Arguments
    /// * `timeout` - Maximum time to wait. If [`None`] waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), NetSortError> {
        let pending = |state: &mut BarrierState| {
            state.failure.is_none() && (state.inbound < self.expected || state.outbound < self.expected)
        };

        let guard = self.lock();
        let mut state = match timeout {
            None => self.cond.wait_while(guard, pending).unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (state, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner);
                state
            }
        };

        if let Some(err) = state.failure.take() {
            return Err(err);
        }
        if state.inbound < self.expected || state.outbound < self.expected {
            return Err(NetSortError::BarrierTimeout {
                inbound: state.inbound,
                outbound: state.outbound,
                expected: self.expected,
            });
        }

        return Ok(());
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
