// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software QAT driver.
//!
//! [`SimulatedDriver`] implements [`Driver`] without hardware. Jobs are queued
//! on submission and executed by [`Driver::poll`], which runs a greedy LZ4S
//! encoder over the source, writes the token stream to the destination and
//! invokes the session callback, just as the real driver delivers responses.
//!
//! Faults can be injected at runtime through [`SimFaults`], and every driver
//! call is counted in [`SimStats`].

use crate::completion::CompletionTag;
use crate::descriptor::{
    BufferList, Capabilities, CompressionType, OpData, RequestResults, SessionSetup,
};
use crate::driver::{
    AddressTranslator, CompletionCallback, Driver, DriverResult, DriverStatus, InstanceHandle,
    InstanceInfo, SessionSize,
};
use crate::memory::DmaBuffer;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const META_SIZE: u32 = 64;
const NUM_INTERMEDIATE_BUFFERS: u16 = 2;
const SESSION_SIZE: u32 = 256;
const HASH_LOG: u32 = 12;
const MAX_OFFSET: usize = u16::MAX as usize;
const MIN_MATCH: usize = 3;

/// Driver status reported in the result record when the output did not fit.
pub const STATUS_OVERFLOW: i32 = -11;

/// One simulated instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInstanceSpec {
    pub package_id: u32,
    pub capabilities: Capabilities,
    pub requires_contiguous: bool,
}

impl SimInstanceSpec {
    /// Instance able to produce LZ4S sequences.
    pub fn lz4s(package_id: u32) -> Self {
        Self {
            package_id,
            capabilities: Capabilities::REQUIRED
                | Capabilities::STATELESS_DEFLATE
                | Capabilities::CHECKSUM_CRC32
                | Capabilities::CHECKSUM_ADLER32,
            requires_contiguous: false,
        }
    }

    /// Deflate-only instance, unusable for sequence production.
    pub fn deflate_only(package_id: u32) -> Self {
        Self {
            package_id,
            capabilities: Capabilities::STATELESS_DEFLATE | Capabilities::CHECKSUM_CRC32,
            requires_contiguous: false,
        }
    }

    pub fn contiguous(mut self) -> Self {
        self.requires_contiguous = true;
        self
    }
}

/// Injected failures. All off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Report zero devices.
    pub no_devices: bool,
    /// Fail starting the user-mode driver.
    pub fail_user_start: bool,
    /// Fail instance enumeration.
    pub fail_enumeration: bool,
    /// Answer this many submissions with RETRY.
    pub busy_submissions: u32,
    /// Reject submissions with FAIL.
    pub fail_submit: bool,
    /// Fail every poll.
    pub fail_poll: bool,
    /// Accept jobs that never complete.
    pub never_complete: bool,
    /// Fail starting instances.
    pub fail_instance_start: bool,
    /// Fail stopping instances.
    pub fail_instance_stop: bool,
    /// Fail initialising sessions.
    pub fail_session_init: bool,
    /// Report one byte fewer consumed than submitted.
    pub short_consume: bool,
    /// Deliver completions with a failure status.
    pub fail_completion: bool,
}

/// Snapshot of driver call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub user_starts: u64,
    pub user_stops: u64,
    pub instances_started: u64,
    pub instances_stopped: u64,
    pub sessions_initialized: u64,
    pub sessions_removed: u64,
    pub submissions: u64,
    pub polls: u64,
}

#[derive(Debug, Default)]
struct Counters {
    user_starts: AtomicU64,
    user_stops: AtomicU64,
    instances_started: AtomicU64,
    instances_stopped: AtomicU64,
    sessions_initialized: AtomicU64,
    sessions_removed: AtomicU64,
    submissions: AtomicU64,
    polls: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SimStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SimStats {
            user_starts: get(&self.user_starts),
            user_stops: get(&self.user_stops),
            instances_started: get(&self.instances_started),
            instances_stopped: get(&self.instances_stopped),
            sessions_initialized: get(&self.sessions_initialized),
            sessions_removed: get(&self.sessions_removed),
            submissions: get(&self.submissions),
            polls: get(&self.polls),
        }
    }
}

struct SimSession {
    setup: SessionSetup,
    callback: CompletionCallback,
}

struct Job {
    input: Vec<u8>,
    /// Destination address; kept as an integer so the driver stays `Send`.
    dst: usize,
    dst_len: usize,
    session: usize,
    tag: CompletionTag,
    stuck: bool,
}

#[derive(Default)]
struct SimState {
    faults: SimFaults,
    user_started: bool,
    started: HashSet<InstanceHandle>,
    sessions: HashMap<usize, SimSession>,
    pending: HashMap<InstanceHandle, VecDeque<Job>>,
}

/// Software implementation of the QAT driver.
pub struct SimulatedDriver {
    specs: Vec<SimInstanceSpec>,
    literal_split: usize,
    state: Mutex<SimState>,
    counters: Counters,
}

impl SimulatedDriver {
    pub fn new(specs: Vec<SimInstanceSpec>) -> Self {
        Self {
            specs,
            literal_split: 0,
            state: Mutex::new(SimState::default()),
            counters: Counters::default(),
        }
    }

    /// `per_device` LZ4S-capable instances on each of `devices` packages,
    /// enumerated device by device.
    pub fn with_instances(devices: u32, per_device: usize) -> Self {
        let specs = (0..devices)
            .flat_map(|pkg| std::iter::repeat(SimInstanceSpec::lz4s(pkg)).take(per_device))
            .collect();
        Self::new(specs)
    }

    /// Split literal runs longer than `len` with zero-length matches.
    pub fn with_literal_split(mut self, len: usize) -> Self {
        self.literal_split = len;
        self
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.lock().faults = faults;
    }

    pub fn update_faults<F: FnOnce(&mut SimFaults)>(&self, f: F) {
        f(&mut self.lock().faults);
    }

    pub fn faults(&self) -> SimFaults {
        self.lock().faults.clone()
    }

    pub fn stats(&self) -> SimStats {
        self.counters.snapshot()
    }

    /// Live hardware sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Levels of the live hardware sessions.
    pub fn session_levels(&self) -> Vec<i32> {
        let mut levels: Vec<_> = self.lock().sessions.values().map(|s| s.setup.level).collect();
        levels.sort_unstable();
        levels
    }

    /// Jobs queued on any instance, completed or not.
    pub fn pending_jobs(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    /// Let jobs accepted under `never_complete` finish on their next poll.
    pub fn release_stuck(&self) {
        let mut state = self.lock();
        for job in state.pending.values_mut().flat_map(|queue| queue.iter_mut()) {
            job.stuck = false;
        }
    }

    fn spec(&self, instance: InstanceHandle) -> DriverResult<&SimInstanceSpec> {
        usize::try_from(instance.0)
            .ok()
            .and_then(|i| self.specs.get(i))
            .ok_or(DriverStatus::InvalidParam)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(&self, job: Job, callback: CompletionCallback, faults: &SimFaults) {
        let encoded = encode_lz4s(&job.input, self.literal_split);
        let mut results = RequestResults {
            status: 0,
            consumed: job.input.len() as u32,
            produced: encoded.len() as u32,
            checksum: 0,
        };
        if encoded.len() > job.dst_len {
            results.status = STATUS_OVERFLOW;
            results.produced = 0;
        } else {
            // SAFETY: `compress` callers keep the destination valid and
            // writable until the job completes or the instance is stopped.
            let dst = unsafe { std::slice::from_raw_parts_mut(job.dst as *mut u8, job.dst_len) };
            dst[..encoded.len()].copy_from_slice(&encoded);
        }
        if faults.short_consume {
            results.consumed = results.consumed.saturating_sub(1);
        }
        let status = if faults.fail_completion || results.status != 0 {
            DriverStatus::Fail.code()
        } else {
            0
        };
        callback(&job.tag, status, &results);
    }
}

impl std::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("instances", &self.specs.len())
            .field("literal_split", &self.literal_split)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Driver for SimulatedDriver {
    fn num_devices(&self) -> DriverResult<u32> {
        if self.lock().faults.no_devices {
            return Ok(0);
        }
        let packages: BTreeSet<u32> = self.specs.iter().map(|s| s.package_id).collect();
        Ok(packages.len() as u32)
    }

    fn user_start(&self, section: &str) -> DriverResult<()> {
        let mut state = self.lock();
        if state.faults.fail_user_start {
            return Err(DriverStatus::Fail);
        }
        log::debug!("Simulated user process started for {}", section);
        state.user_started = true;
        Counters::bump(&self.counters.user_starts);
        Ok(())
    }

    fn user_stop(&self) {
        let mut state = self.lock();
        state.user_started = false;
        state.started.clear();
        state.sessions.clear();
        state.pending.clear();
        Counters::bump(&self.counters.user_stops);
    }

    fn num_instances(&self) -> DriverResult<u16> {
        let state = self.lock();
        if !state.user_started || state.faults.fail_enumeration {
            return Err(DriverStatus::Fail);
        }
        Ok(self.specs.len() as u16)
    }

    fn instances(&self, count: u16) -> DriverResult<Vec<InstanceHandle>> {
        if count as usize > self.specs.len() {
            return Err(DriverStatus::InvalidParam);
        }
        Ok((0..count as u64).map(InstanceHandle).collect())
    }

    fn instance_info(&self, instance: InstanceHandle) -> DriverResult<InstanceInfo> {
        let spec = self.spec(instance)?;
        Ok(InstanceInfo {
            package_id: spec.package_id,
            instance_id: instance.0 as u32,
            requires_contiguous: spec.requires_contiguous,
        })
    }

    fn query_capabilities(&self, instance: InstanceHandle) -> DriverResult<Capabilities> {
        Ok(self.spec(instance)?.capabilities)
    }

    fn buffer_list_meta_size(
        &self,
        instance: InstanceHandle,
        num_buffers: u32,
    ) -> DriverResult<u32> {
        self.spec(instance)?;
        Ok(META_SIZE * num_buffers)
    }

    fn num_intermediate_buffers(&self, instance: InstanceHandle) -> DriverResult<u16> {
        self.spec(instance)?;
        Ok(NUM_INTERMEDIATE_BUFFERS)
    }

    fn set_address_translation(
        &self,
        instance: InstanceHandle,
        _translate: AddressTranslator,
    ) -> DriverResult<()> {
        self.spec(instance).map(|_| ())
    }

    fn start_instance(
        &self,
        instance: InstanceHandle,
        intermediate: &[BufferList],
    ) -> DriverResult<()> {
        self.spec(instance)?;
        let mut state = self.lock();
        if state.faults.fail_instance_start {
            return Err(DriverStatus::Resource);
        }
        if intermediate.len() != NUM_INTERMEDIATE_BUFFERS as usize
            || intermediate.iter().any(|b| !b.buffer.is_bound())
        {
            return Err(DriverStatus::InvalidParam);
        }
        state.started.insert(instance);
        Counters::bump(&self.counters.instances_started);
        Ok(())
    }

    fn stop_instance(&self, instance: InstanceHandle) -> DriverResult<()> {
        let mut state = self.lock();
        if state.faults.fail_instance_stop || !state.started.remove(&instance) {
            return Err(DriverStatus::Fail);
        }
        state.pending.remove(&instance);
        Counters::bump(&self.counters.instances_stopped);
        Ok(())
    }

    fn session_size(
        &self,
        instance: InstanceHandle,
        _setup: &SessionSetup,
    ) -> DriverResult<SessionSize> {
        self.spec(instance)?;
        Ok(SessionSize {
            session: SESSION_SIZE,
            context: 0,
        })
    }

    fn init_session(
        &self,
        instance: InstanceHandle,
        session: &mut DmaBuffer,
        setup: &SessionSetup,
        callback: CompletionCallback,
    ) -> DriverResult<()> {
        let mut state = self.lock();
        if state.faults.fail_session_init {
            return Err(DriverStatus::Fail);
        }
        if !state.started.contains(&instance) || session.len() < SESSION_SIZE as usize {
            return Err(DriverStatus::InvalidParam);
        }
        if setup.comp_type != CompressionType::Lz4s {
            return Err(DriverStatus::Unsupported);
        }
        state.sessions.insert(
            session.as_ptr() as usize,
            SimSession {
                setup: *setup,
                callback,
            },
        );
        Counters::bump(&self.counters.sessions_initialized);
        Ok(())
    }

    fn remove_session(
        &self,
        _instance: InstanceHandle,
        session: &mut DmaBuffer,
    ) -> DriverResult<()> {
        let key = session.as_ptr() as usize;
        let mut state = self.lock();
        state
            .sessions
            .remove(&key)
            .ok_or(DriverStatus::InvalidParam)?;
        Counters::bump(&self.counters.sessions_removed);
        Ok(())
    }

    unsafe fn compress(
        &self,
        instance: InstanceHandle,
        session: &DmaBuffer,
        src: &BufferList,
        dst: &BufferList,
        op: &OpData,
        tag: CompletionTag,
    ) -> DriverResult<()> {
        let mut state = self.lock();
        if !state.started.contains(&instance) {
            return Err(DriverStatus::Fail);
        }
        let key = session.as_ptr() as usize;
        if !state.sessions.contains_key(&key) || !dst.buffer.is_bound() {
            return Err(DriverStatus::InvalidParam);
        }
        if state.faults.fail_submit {
            return Err(DriverStatus::Fail);
        }
        if state.faults.busy_submissions > 0 {
            state.faults.busy_submissions -= 1;
            return Err(DriverStatus::Retry);
        }
        let input = if src.buffer.len == 0 {
            Vec::new()
        } else if src.buffer.is_bound() {
            // SAFETY: the caller guarantees `src` describes readable memory.
            std::slice::from_raw_parts(src.buffer.data, src.buffer.len as usize).to_vec()
        } else {
            return Err(DriverStatus::InvalidParam);
        };
        log::trace!(
            "Simulated job on instance {:?}: {} bytes, flush {:?}",
            instance,
            input.len(),
            op.flush
        );
        let stuck = state.faults.never_complete;
        state.pending.entry(instance).or_default().push_back(Job {
            input,
            dst: dst.buffer.data as usize,
            dst_len: dst.buffer.len as usize,
            session: key,
            tag,
            stuck,
        });
        Counters::bump(&self.counters.submissions);
        Ok(())
    }

    fn poll(&self, instance: InstanceHandle, quota: u32) -> DriverResult<()> {
        Counters::bump(&self.counters.polls);
        let (ready, faults) = {
            let mut state = self.lock();
            if state.faults.fail_poll {
                return Err(DriverStatus::Fail);
            }
            let faults = state.faults.clone();
            let limit = if quota == 0 { usize::MAX } else { quota as usize };
            let mut ready = Vec::new();
            let SimState {
                pending, sessions, ..
            } = &mut *state;
            if let Some(queue) = pending.get_mut(&instance) {
                let mut kept = VecDeque::with_capacity(queue.len());
                while let Some(job) = queue.pop_front() {
                    if job.stuck || ready.len() >= limit {
                        kept.push_back(job);
                        continue;
                    }
                    match sessions.get(&job.session) {
                        Some(session) => ready.push((job, session.callback)),
                        None => log::debug!("Dropping job of removed session"),
                    }
                }
                *queue = kept;
            }
            (ready, faults)
        };

        if ready.is_empty() {
            return Err(DriverStatus::Retry);
        }
        for (job, callback) in ready {
            self.execute(job, callback, &faults);
        }
        Ok(())
    }
}

/// Greedy LZ4S encoder with a 3-byte hash and 64 KiB reach.
///
/// Literal runs longer than `literal_split` (when non-zero) are cut into
/// pieces joined by zero-length matches.
pub fn encode_lz4s(input: &[u8], literal_split: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 255 + 16);
    let mut table = vec![usize::MAX; 1 << HASH_LOG];
    let mut anchor = 0;
    let mut i = 0;

    while i + MIN_MATCH <= input.len() {
        let h = hash3(&input[i..i + MIN_MATCH]);
        let candidate = table[h];
        table[h] = i;
        if candidate != usize::MAX
            && i - candidate <= MAX_OFFSET
            && input[candidate..candidate + MIN_MATCH] == input[i..i + MIN_MATCH]
        {
            let mut len = MIN_MATCH;
            while i + len < input.len() && input[candidate + len] == input[i + len] {
                len += 1;
            }
            let literals = split_literals(&mut out, &input[anchor..i], literal_split);
            write_token(&mut out, literals, Some(((i - candidate) as u16, len - 2)));
            i += len;
            anchor = i;
        } else {
            i += 1;
        }
    }

    let literals = split_literals(&mut out, &input[anchor..], literal_split);
    write_token(&mut out, literals, None);
    out
}

#[inline]
fn hash3(bytes: &[u8]) -> usize {
    let v = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
}

/// Emit zero-length-match tokens for all but the last `split` bytes.
fn split_literals<'a>(out: &mut Vec<u8>, mut literals: &'a [u8], split: usize) -> &'a [u8] {
    if split > 0 {
        while literals.len() > split {
            let (head, tail) = literals.split_at(split);
            write_token(out, head, Some((0, 0)));
            literals = tail;
        }
    }
    literals
}

fn write_token(out: &mut Vec<u8>, literals: &[u8], matched: Option<(u16, usize)>) {
    let lit = literals.len();
    let code = matched.map_or(0, |(_, code)| code);
    out.push(((lit.min(15) << 4) | code.min(15)) as u8);
    if lit >= 15 {
        write_extension(out, lit - 15);
    }
    out.extend_from_slice(literals);
    if let Some((offset, code)) = matched {
        out.extend_from_slice(&offset.to_le_bytes());
        if code >= 15 {
            write_extension(out, code - 15);
        }
    }
}

fn write_extension(out: &mut Vec<u8>, mut n: usize) {
    while n >= 255 {
        out.push(255);
        n -= 255;
    }
    out.push(n as u8);
}
