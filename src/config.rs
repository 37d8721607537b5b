// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Runtime configuration and fixed protocol constants.

use std::time::Duration;

/// Lowest compression level QAT accepts.
pub const COMP_LEVEL_MIN: i32 = 1;

/// Highest compression level QAT accepts.
pub const COMP_LEVEL_MAX: i32 = 12;

/// Largest block the host library hands to a sequence producer (128 KiB).
pub const MAX_BLOCK_SIZE: usize = 128 * 1024;

/// Size of each per-instance intermediate buffer.
pub const INTERMEDIATE_BUFFER_SIZE: usize = 2 * MAX_BLOCK_SIZE;

/// Worst-case LZ4S output for one block: `len + ceil(len / 2000) * 11 + 1024`.
pub const LZ4S_SCRATCH_SIZE: usize = MAX_BLOCK_SIZE + 1024 + MAX_BLOCK_SIZE.div_ceil(2000) * 11;

/// Timed-out destination buffers an instance may hold before it is stopped
/// to cancel the jobs still writing them.
pub const MAX_ORPHANED_BUFFERS: usize = 4;

/// Blocks up to this size must fit entirely in the window.
pub const MIN_WINDOW_SIZE: usize = 32 * 1024;

/// Environment variable overriding the driver section name.
pub const SECTION_NAME_ENV: &str = "QAT_SECTION_NAME";

const DEFAULT_SECTION_NAME: &str = "SHIM";
const SECTION_NAME_MAX: usize = 31;

const DEFAULT_MAX_GRAB_RETRY: u32 = 10;
const DEFAULT_MAX_SUBMIT_RETRY: u32 = 5;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RESTART_INTERVAL: u32 = 1000;
const DEFAULT_MAX_DEVICES: u32 = 256;

/// How instances that need physically contiguous memory are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContiguousPolicy {
    /// Skip instances whose driver requires contiguous memory.
    Reject,
    /// Use pinned allocations for every instance.
    Pinned,
}

impl Default for ContiguousPolicy {
    fn default() -> Self {
        if cfg!(feature = "pinned-memory") {
            Self::Pinned
        } else {
            Self::Reject
        }
    }
}

/// Tunables for discovery and the request protocol.
#[derive(Debug, Clone)]
pub struct Config {
    /// Driver user-mode section name.
    pub section_name: String,
    /// Full scans of the instance array before giving up on acquisition.
    pub max_grab_retry: u32,
    /// Submission attempts while the driver answers RETRY.
    pub max_submit_retry: u32,
    /// Wall-clock bound on polling for one request.
    pub poll_timeout: Duration,
    /// Consecutive failed blocks before a session tries to restart the hardware.
    pub restart_interval: u32,
    /// Package ids at or above this are rejected during discovery.
    pub max_devices: u32,
    /// Contiguous-memory handling.
    pub contiguous_policy: ContiguousPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            section_name: DEFAULT_SECTION_NAME.to_string(),
            max_grab_retry: DEFAULT_MAX_GRAB_RETRY,
            max_submit_retry: DEFAULT_MAX_SUBMIT_RETRY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            max_devices: DEFAULT_MAX_DEVICES,
            contiguous_policy: ContiguousPolicy::default(),
        }
    }
}

impl Config {
    /// Defaults, with the section name taken from `QAT_SECTION_NAME` if set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(SECTION_NAME_ENV) {
            Ok(name) if !name.is_empty() => config.with_section_name(&name),
            _ => config,
        }
    }

    /// Set the section name, truncated to what the driver accepts.
    pub fn with_section_name(mut self, name: &str) -> Self {
        self.section_name = truncate_section_name(name);
        self
    }

    /// Set the acquisition retry budget.
    pub fn with_max_grab_retry(mut self, retries: u32) -> Self {
        self.max_grab_retry = retries;
        self
    }

    /// Set the submission retry budget.
    pub fn with_max_submit_retry(mut self, retries: u32) -> Self {
        self.max_submit_retry = retries;
        self
    }

    /// Set the polling timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set how many failed blocks pass between restart attempts.
    pub fn with_restart_interval(mut self, blocks: u32) -> Self {
        self.restart_interval = blocks;
        self
    }

    /// Set the contiguous-memory policy.
    pub fn with_contiguous_policy(mut self, policy: ContiguousPolicy) -> Self {
        self.contiguous_policy = policy;
        self
    }
}

fn truncate_section_name(name: &str) -> String {
    if name.len() <= SECTION_NAME_MAX {
        return name.to_string();
    }
    log::warn!(
        "The length of {} exceeds the limit of {} bytes",
        SECTION_NAME_ENV,
        SECTION_NAME_MAX
    );
    let mut end = SECTION_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
