// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for QAT offload operations.

use crate::driver::DriverStatus;
use std::time::Duration;
use thiserror::Error;

/// Faults raised while decoding an LZ4S token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The stream ended in the middle of a token, length extension or offset.
    #[error("LZ4S stream truncated at byte {at}")]
    Truncated { at: usize },

    /// The stream needs more sequences than the output slice can hold.
    #[error("LZ4S stream needs more than {capacity} sequences")]
    OutputOverflow { capacity: usize },

    /// A non-empty match carried a zero offset.
    #[error("zero match offset at byte {at}")]
    InvalidOffset { at: usize },
}

/// Errors that can occur while offloading a block to QAT.
#[derive(Debug, Error)]
pub enum QatError {
    /// Compression level outside the range QAT can handle.
    #[error("compression level {level} cannot be offloaded (supported: 1..=12)")]
    UnsupportedLevel { level: i32 },

    /// A dictionary was supplied; offload only handles dictionary-free blocks.
    #[error("dictionaries are not supported (dict_len={dict_len})")]
    UnsupportedDictionary { dict_len: usize },

    /// The window is smaller than the block needs.
    #[error("window size {window} below required {required}")]
    WindowTooSmall { window: usize, required: usize },

    /// Block larger than the accelerator's source buffer.
    #[error("block of {len} bytes exceeds maximum {max}")]
    BlockTooLarge { len: usize, max: usize },

    /// The hardware subsystem is not ready.
    #[error("QAT hardware not started")]
    NotStarted,

    /// A throttled restart of the hardware subsystem failed.
    #[error("QAT hardware restart failed")]
    RestartFailed,

    /// Every instance was busy for the whole retry budget.
    #[error("no QAT instance available")]
    NoInstanceAvailable,

    /// The driver reports zero accelerator devices.
    #[error("no QAT device found")]
    NoDeviceFound,

    /// Instances exist but none supports LZ4S with XXHash32 under the memory policy.
    #[error("none of {found} QAT instances qualifies")]
    NoQualifyingInstance { found: usize },

    /// An instance reports a package id beyond the supported device count.
    #[error("instance package id {package_id} exceeds device limit {max}")]
    DeviceIdOutOfRange { package_id: u32, max: u32 },

    /// A driver call returned a non-success status.
    #[error("driver call {call} failed: {status}")]
    Driver {
        call: &'static str,
        status: DriverStatus,
    },

    /// Buffer allocation failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Submission kept returning RETRY.
    #[error("submission still busy after {retries} attempts")]
    SubmitRetriesExhausted { retries: u32 },

    /// No completion within the configured latency bound.
    #[error("polling timed out after {elapsed:?}")]
    PollTimeout { elapsed: Duration },

    /// The completion callback reported a failure status.
    #[error("completion callback reported status {status}")]
    CallbackFailed { status: i32 },

    /// The driver reported success but the result record is out of bounds.
    #[error(
        "invalid result: src_len={src_len}, consumed={consumed}, produced={produced}, \
         capacity={capacity}, status={status}"
    )]
    InvalidResult {
        src_len: usize,
        consumed: u32,
        produced: u32,
        capacity: usize,
        status: i32,
    },

    /// The hardware token stream could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking task behind the async wrapper failed.
    #[error("offload task failed: {0}")]
    TaskJoin(String),
}

impl QatError {
    /// Returns true for requests rejected before any hardware was touched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedLevel { .. }
                | Self::UnsupportedDictionary { .. }
                | Self::WindowTooSmall { .. }
                | Self::BlockTooLarge { .. }
        )
    }

    /// Returns true if the same request may succeed when issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotStarted
                | Self::NoInstanceAvailable
                | Self::SubmitRetriesExhausted { .. }
                | Self::PollTimeout { .. }
        )
    }
}

/// Result type alias for QAT operations.
pub type QatResult<T> = Result<T, QatError>;
