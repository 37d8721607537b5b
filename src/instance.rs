// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Instance records, the instance pool and per-instance lazy setup.
//!
//! Each [`QatInstance`] is owned by at most one thread at a time. Ownership is
//! taken with an atomic test-and-set on the instance's lock flag and handed out
//! as an [`InstanceGuard`]; dropping the guard clears the flag. Everything
//! behind the flag (buffers, the hardware session, the started flag) is only
//! touched through the guard.
//!
//! Setup is lazy and ordered: memory, then the hardware instance, then the
//! session. A step is only marked done once it fully succeeded, so a failed
//! step is retried by the next request that lands on the instance.
//!
//! A request that times out leaves its job on the hardware, still owning the
//! destination buffer. The instance keeps such buffers until the job's late
//! completion arrives. Once it holds [`MAX_ORPHANED_BUFFERS`] of them it is
//! stopped, which cancels the stuck jobs, and the next request starts it again.
//! An instance the driver refuses to stop is retired from the pool.

use crate::completion::{on_completion, RequestCompletion};
use crate::config::{Config, INTERMEDIATE_BUFFER_SIZE, MAX_BLOCK_SIZE, MAX_ORPHANED_BUFFERS};
use crate::descriptor::{
    BufferList, Capabilities, CompletionStatus, OpData, RequestResults, SessionSetup,
};
use crate::discovery::DiscoveredInstance;
use crate::driver::{Driver, DriverCall, DriverStatus, InstanceHandle};
use crate::error::{QatError, QatResult};
use crate::memory::{virt_to_phys, DmaBuffer};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Buffers allocated on first use of an instance.
struct InstanceMemory {
    intermediate: Vec<BufferList>,
    src: BufferList,
    dst: BufferList,
}

impl InstanceMemory {
    fn allocate(driver: &dyn Driver, handle: InstanceHandle, contiguous: bool) -> QatResult<Self> {
        let meta_size = driver
            .buffer_list_meta_size(handle, 1)
            .during("buffer_list_meta_size")?;
        let count = driver
            .num_intermediate_buffers(handle)
            .during("num_intermediate_buffers")?;

        // Partial allocations are released on the error path by Drop.
        let intermediate = (0..count)
            .map(|_| BufferList::with_backing(INTERMEDIATE_BUFFER_SIZE, meta_size, contiguous))
            .collect::<QatResult<Vec<_>>>()?;
        let src = if contiguous {
            BufferList::with_backing(MAX_BLOCK_SIZE, meta_size, true)?
        } else {
            BufferList::unbound(meta_size, false)?
        };
        let dst = BufferList::unbound(meta_size, contiguous)?;

        Ok(Self {
            intermediate,
            src,
            dst,
        })
    }
}

/// Destination buffer of a timed-out job, tagged with the job's sequence number.
struct Orphan {
    seq: u32,
    _buffer: DmaBuffer,
}

/// Drop the orphans whose jobs have completed since the last call.
fn reclaim_orphans(orphans: &mut Vec<Orphan>, completion: &RequestCompletion, index: usize) {
    let late = completion.take_late();
    if late.is_empty() || orphans.is_empty() {
        return;
    }
    let before = orphans.len();
    orphans.retain(|o| !late.contains(&o.seq));
    if orphans.len() != before {
        log::debug!(
            "Instance {} released {} orphaned buffers",
            index,
            before - orphans.len()
        );
    }
}

/// Hardware session currently initialised on an instance.
struct HwSession {
    memory: DmaBuffer,
    setup: SessionSetup,
}

#[derive(Default)]
struct InstanceState {
    memory: Option<InstanceMemory>,
    started: bool,
    session: Option<HwSession>,
    orphans: Vec<Orphan>,
}

/// One hardware execution context.
pub struct QatInstance {
    index: usize,
    handle: InstanceHandle,
    package_id: u32,
    requires_contiguous: bool,
    capabilities: Capabilities,
    lock: AtomicBool,
    retired: AtomicBool,
    state: UnsafeCell<InstanceState>,
    completion: Arc<RequestCompletion>,
}

// SAFETY: `state` is only accessed by the thread that set `lock` (through an
// `InstanceGuard`) or by `InstancePool::teardown`, which takes the same lock.
// The raw buffer addresses inside refer to memory owned by the state itself or
// borrowed for the duration of one guarded request.
unsafe impl Send for QatInstance {}
unsafe impl Sync for QatInstance {}

impl QatInstance {
    fn new(index: usize, found: DiscoveredInstance) -> Self {
        Self {
            index,
            handle: found.handle,
            package_id: found.info.package_id,
            requires_contiguous: found.requires_contiguous,
            capabilities: found.capabilities,
            lock: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            state: UnsafeCell::new(InstanceState::default()),
            completion: Arc::new(RequestCompletion::new()),
        }
    }

    /// Position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn package_id(&self) -> u32 {
        self.package_id
    }

    pub fn requires_contiguous(&self) -> bool {
        self.requires_contiguous
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns true while some thread owns the instance.
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Returns true once the instance was taken out of service.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.lock.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for QatInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QatInstance")
            .field("index", &self.index)
            .field("handle", &self.handle)
            .field("package_id", &self.package_id)
            .field("requires_contiguous", &self.requires_contiguous)
            .field("locked", &self.is_locked())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Fixed array of instances shared by all requests.
pub struct InstancePool {
    driver: Arc<dyn Driver>,
    instances: Box<[QatInstance]>,
    closed: AtomicBool,
}

impl InstancePool {
    /// Build a pool in discovery order.
    pub fn new(driver: Arc<dyn Driver>, discovered: Vec<DiscoveredInstance>) -> Self {
        let instances = discovered
            .into_iter()
            .enumerate()
            .map(|(index, found)| QatInstance::new(index, found))
            .collect();
        Self {
            driver,
            instances,
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[QatInstance] {
        &self.instances
    }

    /// Returns true after teardown; no instance can be acquired any more.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Try to take ownership of an instance.
    ///
    /// Starts at `hint` (or 0 when absent or out of range) and scans the whole
    /// array, up to `max_retry` times, skipping retired instances. Never
    /// blocks. Fails once the pool is torn down.
    pub fn try_acquire(&self, hint: Option<usize>, max_retry: u32) -> Option<InstanceGuard<'_>> {
        let n = self.instances.len();
        if n == 0 || self.is_closed() {
            return None;
        }
        let start = hint.filter(|&i| i < n).unwrap_or(0);
        for _ in 0..max_retry.max(1) {
            for k in 0..n {
                let inst = &self.instances[(start + k) % n];
                if inst.is_retired() || !inst.try_lock() {
                    continue;
                }
                // Teardown may have released this instance after closing.
                if self.is_closed() {
                    inst.unlock();
                    log::debug!("Instance pool closed");
                    return None;
                }
                return Some(InstanceGuard { pool: self, inst });
            }
            core::hint::spin_loop();
        }
        log::debug!("All {} instances busy after {} scans", n, max_retry);
        None
    }

    /// Remove sessions, stop instances and free their memory.
    ///
    /// Waits for any request still holding an instance to release it.
    pub(crate) fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        for inst in self.instances.iter() {
            while !inst.try_lock() {
                core::hint::spin_loop();
            }
            let mut guard = InstanceGuard { pool: self, inst };
            guard.shutdown();
        }
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("instances", &self.instances)
            .finish()
    }
}

/// Result of reconciling the session configuration of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    /// No session existed; one was initialised.
    Created,
    /// The existing session already matched.
    Reused,
    /// The existing session was removed and initialised again.
    Replaced,
}

/// Exclusive ownership of one instance. Releases it on drop.
pub struct InstanceGuard<'a> {
    pool: &'a InstancePool,
    inst: &'a QatInstance,
}

impl<'a> InstanceGuard<'a> {
    pub fn index(&self) -> usize {
        self.inst.index
    }

    pub fn instance(&self) -> &'a QatInstance {
        self.inst
    }

    #[inline]
    fn driver(&self) -> &'a dyn Driver {
        let pool: &'a InstancePool = self.pool;
        &*pool.driver
    }

    #[inline]
    fn state(&mut self) -> &mut InstanceState {
        // SAFETY: the guard holds the instance lock, and `&mut self` keeps
        // this the only live reference to the state.
        unsafe { &mut *self.inst.state.get() }
    }

    /// Allocate buffers if this instance has none yet.
    pub fn ensure_memory(&mut self) -> QatResult<()> {
        let (driver, handle, contiguous) =
            (self.driver(), self.inst.handle, self.inst.requires_contiguous);
        let index = self.inst.index;
        let state = self.state();
        if state.memory.is_none() {
            state.memory = Some(InstanceMemory::allocate(driver, handle, contiguous)?);
            log::debug!("Memory set up for instance {}", index);
        }
        Ok(())
    }

    /// Start the hardware instance if it is not running yet.
    pub fn ensure_started(&mut self) -> QatResult<()> {
        self.ensure_memory()?;
        let (driver, handle, index) = (self.driver(), self.inst.handle, self.inst.index);
        let state = self.state();
        if state.started {
            return Ok(());
        }
        let memory = state.memory.as_ref().ok_or(QatError::NotStarted)?;
        driver
            .set_address_translation(handle, virt_to_phys)
            .during("set_address_translation")?;
        driver
            .start_instance(handle, &memory.intermediate)
            .during("start_instance")?;
        state.started = true;
        log::debug!("Instance {} started", index);
        Ok(())
    }

    /// Make the instance's hardware session match `setup`.
    ///
    /// If removing a mismatched session fails, the old session stays in place
    /// and the request fails.
    pub fn ensure_session(&mut self, setup: &SessionSetup) -> QatResult<SessionChange> {
        let (driver, handle, contiguous) =
            (self.driver(), self.inst.handle, self.inst.requires_contiguous);
        let index = self.inst.index;

        let replaced = match self.session_setup() {
            Some(current) if current == *setup => return Ok(SessionChange::Reused),
            Some(current) => {
                log::debug!(
                    "Instance {} session level {} -> {}",
                    index,
                    current.level,
                    setup.level
                );
                self.drain();
                let state = self.state();
                if let Some(session) = state.session.as_mut() {
                    driver
                        .remove_session(handle, &mut session.memory)
                        .during("remove_session")?;
                }
                state.session = None;
                true
            }
            None => false,
        };

        let size = driver.session_size(handle, setup).during("session_size")?;
        let mut memory = DmaBuffer::zeroed(size.session as usize, contiguous)?;
        driver
            .init_session(handle, &mut memory, setup, on_completion)
            .during("init_session")?;
        self.state().session = Some(HwSession {
            memory,
            setup: *setup,
        });
        log::debug!("Session set up for instance {} at level {}", index, setup.level);

        Ok(if replaced {
            SessionChange::Replaced
        } else {
            SessionChange::Created
        })
    }

    /// Setup currently loaded on the instance, if any.
    pub fn session_setup(&mut self) -> Option<SessionSetup> {
        self.state().session.as_ref().map(|s| s.setup)
    }

    /// Poll until the driver has no response ready.
    pub fn drain(&mut self) {
        let (driver, handle) = (self.driver(), self.inst.handle);
        loop {
            match driver.poll(handle, 0) {
                Ok(()) => continue,
                Err(DriverStatus::Retry) => break,
                Err(status) => {
                    log::warn!("Draining instance {} failed: {}", self.inst.index, status);
                    break;
                }
            }
        }
    }

    /// Keep the destination buffer of the request that just timed out alive
    /// until its job completes or the instance is stopped.
    pub fn adopt_orphan(&mut self, buffer: DmaBuffer) {
        let inst = self.inst;
        let (seq, _) = inst.completion.counters();
        let state = self.state();
        reclaim_orphans(&mut state.orphans, &inst.completion, inst.index);
        state.orphans.push(Orphan {
            seq,
            _buffer: buffer,
        });
        let held = state.orphans.len();
        log::debug!("Instance {} holds {} orphaned buffers", inst.index, held);

        if held >= MAX_ORPHANED_BUFFERS {
            log::warn!(
                "Instance {} has {} jobs that never completed, stopping it",
                inst.index,
                held
            );
            if self.stop() {
                self.state().orphans.clear();
            } else {
                inst.retired.store(true, Ordering::Release);
                log::error!("Instance {} retired", inst.index);
            }
        }
    }

    /// Destination buffers still held for timed-out jobs.
    pub fn orphan_count(&mut self) -> usize {
        self.state().orphans.len()
    }

    /// Compress `src` into `dst` and wait for the result.
    ///
    /// The instance must be started with a session. `src` is copied when the
    /// instance needs contiguous memory and referenced otherwise. Both
    /// bindings are cleared before returning, on every path.
    pub fn compress(
        &mut self,
        src: &[u8],
        dst: &mut DmaBuffer,
        config: &Config,
    ) -> QatResult<RequestResults> {
        let (driver, inst) = (self.driver(), self.inst);
        let handle = inst.handle;
        let InstanceState {
            memory,
            session,
            orphans,
            ..
        } = self.state();
        let (Some(memory), Some(session)) = (memory.as_mut(), session.as_ref()) else {
            return Err(QatError::NotStarted);
        };
        reclaim_orphans(orphans, &inst.completion, inst.index);

        if inst.requires_contiguous {
            if !memory.src.fill(src) {
                return Err(QatError::BlockTooLarge {
                    len: src.len(),
                    max: MAX_BLOCK_SIZE,
                });
            }
        } else {
            memory.src.bind(src.as_ptr().cast_mut(), src.len());
        }
        memory.dst.bind(dst.as_mut_ptr(), dst.len());
        let memory = scopeguard::guard(memory, |m| {
            m.src.unbind();
            m.dst.unbind();
        });

        let op = OpData::final_verified();
        let tag = inst.completion.begin();
        let attempts = config.max_submit_retry.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            // SAFETY: `src` and `dst` outlive this call. On success we wait
            // for the completion; on timeout the caller hands `dst` to
            // `adopt_orphan`, and `src` is only read by the device.
            let submitted = unsafe {
                driver.compress(
                    handle,
                    &session.memory,
                    &memory.src,
                    &memory.dst,
                    &op,
                    tag.clone(),
                )
            };
            match submitted {
                Ok(()) => break,
                Err(DriverStatus::Retry) if attempt < attempts => core::hint::spin_loop(),
                Err(DriverStatus::Retry) => {
                    inst.completion.force_complete();
                    log::error!("Submission still busy after {} attempts", attempt);
                    return Err(QatError::SubmitRetriesExhausted { retries: attempt });
                }
                Err(status) => {
                    inst.completion.force_complete();
                    log::error!("cpaDcCompressData2 failed, status: {}", status);
                    return Err(QatError::Driver {
                        call: "compress",
                        status,
                    });
                }
            }
        }

        inst
            .completion
            .wait(config.poll_timeout, || driver.poll(handle, 0))?;
        reclaim_orphans(orphans, &inst.completion, inst.index);

        match inst.completion.status() {
            CompletionStatus::Ok => Ok(inst.completion.results()),
            CompletionStatus::Failed(status) => {
                log::error!("Completion callback reported status {}", status);
                Err(QatError::CallbackFailed { status })
            }
        }
    }

    /// Remove the session and stop the hardware instance, keeping its memory.
    ///
    /// Returns false if the driver failed to stop it; jobs may still be
    /// running then.
    fn stop(&mut self) -> bool {
        let (driver, handle, index) = (self.driver(), self.inst.handle, self.inst.index);
        if self.state().session.is_some() {
            self.drain();
        }
        let state = self.state();
        if let Some(mut session) = state.session.take() {
            if let Err(status) = driver.remove_session(handle, &mut session.memory) {
                log::error!("Removing session of instance {} failed: {}", index, status);
            }
        }
        if state.started {
            if let Err(status) = driver.stop_instance(handle) {
                log::error!("Stopping instance {} failed: {}", index, status);
                return false;
            }
            state.started = false;
        }
        true
    }

    fn shutdown(&mut self) {
        self.stop();
        let index = self.inst.index;
        let state = self.state();
        state.started = false;
        state.memory = None;
        state.orphans.clear();
        log::debug!("Instance {} torn down", index);
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.inst.unlock();
    }
}
