// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Sequence producer entry points.

use crate::config::{
    Config, COMP_LEVEL_MAX, COMP_LEVEL_MIN, LZ4S_SCRATCH_SIZE, MAX_BLOCK_SIZE, MIN_WINDOW_SIZE,
};
use crate::driver::Driver;
use crate::error::{QatError, QatResult};
use crate::instance::SessionChange;
use crate::lz4s::decode_lz4s;
use crate::registry::{require_ready, InitStatus, Registry};
use crate::sequence::Sequence;
use crate::session::SeqProdSession;
use std::sync::Arc;

/// Returned by [`SequenceProducer::sequence_producer`] for any failure.
///
/// The host library answers this value by finding matches in software.
pub const SEQUENCE_PRODUCER_ERROR: usize = usize::MAX;

/// Offloads block match finding to QAT.
///
/// Cloning is cheap; clones share the same hardware registry. A producer is
/// typically created once per process and used by every compression context.
///
/// # Example
///
/// ```rust
/// use qat_seqprod::{Config, Sequence, SequenceProducer, SimulatedDriver};
/// use std::sync::Arc;
///
/// let driver = Arc::new(SimulatedDriver::with_instances(1, 2));
/// let producer = SequenceProducer::new(driver, Config::default());
/// producer.start_device()?;
///
/// let mut session = producer.create_session();
/// let block = b"abcabcabcabcabcabc".repeat(100);
/// let mut seqs = vec![Sequence::default(); block.len() + 1];
/// let n = producer.produce_sequences(&mut session, &mut seqs, &block, None, 1, block.len())?;
/// assert!(n > 0);
///
/// producer.free_session(session);
/// producer.stop_device();
/// # Ok::<(), qat_seqprod::QatError>(())
/// ```
#[derive(Clone, Debug)]
pub struct SequenceProducer {
    registry: Arc<Registry>,
}

impl SequenceProducer {
    pub fn new(driver: Arc<dyn Driver>, config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new(driver, config)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hardware status.
    pub fn status(&self) -> InitStatus {
        self.registry.status()
    }

    /// Number of usable instances.
    pub fn instance_count(&self) -> usize {
        self.registry.instance_count()
    }

    /// Start the hardware and take a reference on it.
    ///
    /// Pair every call with [`stop_device`](Self::stop_device), whether it
    /// succeeded or not.
    pub fn start_device(&self) -> QatResult<()> {
        self.registry.start()
    }

    /// Drop a reference; the last one stops the hardware.
    pub fn stop_device(&self) {
        self.registry.stop()
    }

    /// New session for one compression context.
    pub fn create_session(&self) -> SeqProdSession {
        SeqProdSession::new()
    }

    /// Release a session and its scratch buffer.
    pub fn free_session(&self, session: SeqProdSession) {
        log::debug!(
            "Freeing session (last instance {:?}, scratch: {})",
            session.last_instance(),
            session.has_scratch()
        );
        drop(session);
    }

    /// Produce sequences for one block.
    ///
    /// Returns the number of sequences written to `out`. The last one is
    /// always literal-only. On error nothing in `out` is meaningful.
    pub fn produce_sequences(
        &self,
        session: &mut SeqProdSession,
        out: &mut [Sequence],
        src: &[u8],
        dict: Option<&[u8]>,
        level: i32,
        window_size: usize,
    ) -> QatResult<usize> {
        check_request(src.len(), dict, level, window_size)?;
        self.check_ready(session)?;

        let config = self.registry.config();
        session.setup.level = level;

        let pool = self.registry.pool().ok_or(QatError::NotStarted)?;
        let mut inst = pool
            .try_acquire(session.inst_hint, config.max_grab_retry)
            .ok_or_else(|| {
                log::error!("Failed to grab instance");
                QatError::NoInstanceAvailable
            })?;
        session.inst_hint = Some(inst.index());
        session.requires_contiguous = inst.instance().requires_contiguous();

        inst.ensure_memory()?;
        inst.ensure_started()?;
        if inst.ensure_session(&session.setup)? == SessionChange::Replaced {
            log::debug!("Session of instance {} reconfigured", inst.index());
        }

        let scratch = session.scratch()?;
        let results = match inst.compress(src, scratch, config) {
            Ok(results) => results,
            Err(err @ QatError::PollTimeout { .. }) => {
                // The job may still write the scratch buffer.
                if let Some(buffer) = session.scratch.take() {
                    inst.adopt_orphan(buffer);
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if results.consumed < src.len() as u32
            || results.produced == 0
            || results.produced as usize > LZ4S_SCRATCH_SIZE
            || results.status != 0
        {
            log::error!(
                "QAT result error, srcSize: {}, consumed: {}, produced: {}, res.status: {}",
                src.len(),
                results.consumed,
                results.produced,
                results.status
            );
            return Err(QatError::InvalidResult {
                src_len: src.len(),
                consumed: results.consumed,
                produced: results.produced,
                capacity: LZ4S_SCRATCH_SIZE,
                status: results.status,
            });
        }
        log::debug!(
            "srcSize: {}, consumed: {}, produced: {}",
            src.len(),
            results.consumed,
            results.produced
        );

        let stream = &scratch.as_slice()[..results.produced as usize];
        let count = decode_lz4s(stream, out)?;
        drop(inst);

        log::debug!("Produced {} sequences", count);
        Ok(count)
    }

    /// [`produce_sequences`](Self::produce_sequences) with the host library's
    /// error convention: failures return [`SEQUENCE_PRODUCER_ERROR`].
    pub fn sequence_producer(
        &self,
        session: &mut SeqProdSession,
        out: &mut [Sequence],
        src: &[u8],
        dict: Option<&[u8]>,
        level: i32,
        window_size: usize,
    ) -> usize {
        match self.produce_sequences(session, out, src, dict, level, window_size) {
            Ok(count) => count,
            Err(err) => {
                if err.is_configuration() {
                    log::debug!("Block not offloaded: {}", err);
                } else {
                    log::warn!("Block not offloaded: {}", err);
                }
                SEQUENCE_PRODUCER_ERROR
            }
        }
    }

    /// Run one request on the tokio blocking pool.
    ///
    /// The session is moved into the task and handed back with the result.
    #[cfg(feature = "async")]
    pub async fn produce_async(
        &self,
        mut session: SeqProdSession,
        src: Vec<u8>,
        capacity: usize,
        level: i32,
        window_size: usize,
    ) -> QatResult<(SeqProdSession, QatResult<Vec<Sequence>>)> {
        let producer = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = vec![Sequence::default(); capacity];
            let result = producer
                .produce_sequences(&mut session, &mut out, &src, None, level, window_size)
                .map(|count| {
                    out.truncate(count);
                    out
                });
            (session, result)
        })
        .await
        .map_err(|err| QatError::TaskJoin(err.to_string()))
    }

    /// Fail unless the hardware is ready, restarting it every
    /// `restart_interval` failed blocks.
    fn check_ready(&self, session: &mut SeqProdSession) -> QatResult<()> {
        if self.registry.is_ready() {
            return Ok(());
        }
        session.fail_offload_count += 1;
        if session.fail_offload_count < self.registry.config().restart_interval {
            log::error!("The hardware was not successfully started");
            return Err(QatError::NotStarted);
        }
        session.fail_offload_count = 0;
        if let Err(err) = self.registry.restart() {
            log::error!("Tried to restart QAT device, but failed: {}", err);
            return Err(QatError::RestartFailed);
        }
        require_ready(&self.registry)
    }
}

/// Reject requests QAT cannot serve before touching any hardware.
fn check_request(
    src_len: usize,
    dict: Option<&[u8]>,
    level: i32,
    window_size: usize,
) -> QatResult<()> {
    if let Some(dict) = dict {
        log::debug!("Dictionaries are not supported, dictSize: {}", dict.len());
        return Err(QatError::UnsupportedDictionary {
            dict_len: dict.len(),
        });
    }
    let required = src_len.min(MIN_WINDOW_SIZE);
    if window_size < required {
        log::debug!(
            "windowSize {} below required {} for srcSize {}",
            window_size,
            required,
            src_len
        );
        return Err(QatError::WindowTooSmall {
            window: window_size,
            required,
        });
    }
    if src_len > MAX_BLOCK_SIZE {
        return Err(QatError::BlockTooLarge {
            len: src_len,
            max: MAX_BLOCK_SIZE,
        });
    }
    if !(COMP_LEVEL_MIN..=COMP_LEVEL_MAX).contains(&level) {
        log::error!(
            "Only can offload L1-L12 to QAT, current compression level: {}",
            level
        );
        return Err(QatError::UnsupportedLevel { level });
    }
    Ok(())
}
