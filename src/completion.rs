// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Synchronous completion tracking for asynchronous driver callbacks.
//!
//! Each instance owns one [`RequestCompletion`]. A request bumps the
//! submitted counter, hands a [`CompletionTag`] carrying that sequence number
//! to the driver, then polls until the callback has bumped the completed
//! counter to match, or until the timeout. Callbacks whose sequence number is
//! not the one currently outstanding are stale and ignored, so a job that
//! finishes after its request gave up cannot corrupt the next request. Their
//! sequence numbers are kept so the instance knows which timed-out jobs are
//! done with their buffers.

use crate::descriptor::{CompletionStatus, RequestResults};
use crate::driver::{DriverResult, DriverStatus};
use crate::error::{QatError, QatResult};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Submitted/completed counters plus the last callback's outcome.
#[derive(Debug, Default)]
pub struct RequestCompletion {
    submitted: AtomicU32,
    completed: AtomicU32,
    status: AtomicI32,
    results: Mutex<RequestResults>,
    late: Mutex<Vec<u32>>,
}

/// Identifies one submitted request to the completion callback.
#[derive(Debug, Clone)]
pub struct CompletionTag {
    record: Arc<RequestCompletion>,
    seq: u32,
}

impl CompletionTag {
    /// Sequence number of the request this tag belongs to.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Record a finished job.
    pub fn complete(&self, status: i32, results: &RequestResults) {
        self.record.signal(self.seq, status, results);
    }
}

/// Completion callback registered with every hardware session.
pub fn on_completion(tag: &CompletionTag, status: i32, results: &RequestResults) {
    tag.complete(status, results);
}

impl RequestCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request and return its tag.
    pub fn begin(self: &Arc<Self>) -> CompletionTag {
        let seq = self.submitted.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.status.store(0, Ordering::Relaxed);
        *self.lock_results() = RequestResults::default();
        CompletionTag {
            record: Arc::clone(self),
            seq,
        }
    }

    fn signal(&self, seq: u32, status: i32, results: &RequestResults) {
        let outstanding = self.submitted.load(Ordering::Acquire);
        if seq != outstanding || self.is_complete() {
            log::debug!(
                "Ignoring stale completion {} (outstanding {})",
                seq,
                outstanding
            );
            self.late
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(seq);
            return;
        }
        *self.lock_results() = *results;
        self.status.store(status, Ordering::Relaxed);
        self.completed.store(seq, Ordering::Release);
    }

    /// Returns true when no request is outstanding.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) == self.submitted.load(Ordering::Acquire)
    }

    /// Mark the outstanding request as done without a callback.
    pub fn force_complete(&self) {
        self.completed
            .store(self.submitted.load(Ordering::Acquire), Ordering::Release);
    }

    /// Sequence numbers of earlier requests whose callbacks arrived since the
    /// last call.
    pub fn take_late(&self) -> Vec<u32> {
        std::mem::take(&mut *self.late.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Status delivered by the last accepted callback.
    pub fn status(&self) -> CompletionStatus {
        CompletionStatus::from(self.status.load(Ordering::Relaxed))
    }

    /// Result record delivered by the last accepted callback.
    pub fn results(&self) -> RequestResults {
        *self.lock_results()
    }

    /// `(submitted, completed)`.
    pub fn counters(&self) -> (u32, u32) {
        (
            self.submitted.load(Ordering::Acquire),
            self.completed.load(Ordering::Acquire),
        )
    }

    /// Busy-poll until the outstanding request completes.
    ///
    /// A poll failure or timeout force-completes the request so the counters
    /// are equal again for the next one.
    pub fn wait<P>(&self, timeout: Duration, mut poll: P) -> QatResult<()>
    where
        P: FnMut() -> DriverResult<()>,
    {
        let start = Instant::now();
        loop {
            match poll() {
                Ok(()) | Err(DriverStatus::Retry) => {}
                Err(status) => {
                    self.force_complete();
                    log::error!("Polling failed, polling status: {}", status);
                    return Err(QatError::Driver {
                        call: "poll",
                        status,
                    });
                }
            }
            if self.is_complete() {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed > timeout {
                self.force_complete();
                log::error!("Polling time out after {:?}", elapsed);
                return Err(QatError::PollTimeout { elapsed });
            }
            core::hint::spin_loop();
        }
    }

    fn lock_results(&self) -> std::sync::MutexGuard<'_, RequestResults> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
