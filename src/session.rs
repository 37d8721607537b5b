// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-context session state.

use crate::config::LZ4S_SCRATCH_SIZE;
use crate::descriptor::SessionSetup;
use crate::error::QatResult;
use crate::memory::DmaBuffer;

/// State one compression context keeps between blocks.
///
/// A session is never shared between threads; each compression context
/// creates its own.
#[derive(Debug, Default)]
pub struct SeqProdSession {
    /// Instance used by the last request, tried first next time.
    pub(crate) inst_hint: Option<usize>,
    /// LZ4S output of the hardware, allocated on first use.
    pub(crate) scratch: Option<DmaBuffer>,
    /// Whether the last instance needed contiguous buffers.
    pub(crate) requires_contiguous: bool,
    /// Configuration requested from the hardware.
    pub(crate) setup: SessionSetup,
    /// Consecutive blocks that failed because the hardware was not ready.
    pub(crate) fail_offload_count: u32,
}

impl SeqProdSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hardware configuration the next request will ask for.
    pub fn setup(&self) -> &SessionSetup {
        &self.setup
    }

    /// Instance used by the last request.
    pub fn last_instance(&self) -> Option<usize> {
        self.inst_hint
    }

    /// Whether the last instance needed pinned buffers.
    pub fn requires_contiguous(&self) -> bool {
        self.requires_contiguous
    }

    pub fn fail_offload_count(&self) -> u32 {
        self.fail_offload_count
    }

    /// Returns true once the scratch buffer exists.
    pub fn has_scratch(&self) -> bool {
        self.scratch.is_some()
    }

    /// Scratch buffer of [`LZ4S_SCRATCH_SIZE`] bytes, allocating it if needed.
    ///
    /// An existing buffer is reused as is; it is never resized.
    pub(crate) fn scratch(&mut self) -> QatResult<&mut DmaBuffer> {
        let buffer = match self.scratch.take() {
            Some(buffer) => buffer,
            None => {
                let buffer = DmaBuffer::zeroed(LZ4S_SCRATCH_SIZE, self.requires_contiguous)?;
                log::debug!(
                    "Allocated {} byte scratch buffer (pinned: {})",
                    buffer.len(),
                    buffer.is_pinned()
                );
                buffer
            }
        };
        Ok(self.scratch.insert(buffer))
    }
}
