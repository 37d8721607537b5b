// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interface to the QAT user-space driver.
//!
//! The crate never talks to the accelerator directly. Everything it needs
//! from the driver is expressed by the [`Driver`] trait: device and instance
//! enumeration, instance lifecycle, hardware sessions, job submission and
//! polling. A binding to the vendor library implements the trait; the
//! [`sim`](crate::sim) module provides a software implementation.

use crate::completion::CompletionTag;
use crate::descriptor::{BufferList, Capabilities, OpData, RequestResults, SessionSetup};
use crate::error::{QatError, QatResult};
use crate::memory::DmaBuffer;

/// Opaque handle of one driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(pub u64);

/// Static information about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Physical device (package) the instance lives on.
    pub package_id: u32,
    /// Driver-assigned instance id, for logging.
    pub instance_id: u32,
    /// The driver only accepts physically contiguous buffers.
    pub requires_contiguous: bool,
}

/// Session memory requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSize {
    /// Bytes of session memory the caller must provide.
    pub session: u32,
    /// Context bytes for stateful sessions.
    pub context: u32,
}

/// Non-success driver status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Unspecified failure.
    Fail,
    /// Resource temporarily busy; the call may be repeated.
    Retry,
    /// Out of resources.
    Resource,
    /// Invalid parameter.
    InvalidParam,
    /// Unrecoverable driver or device error.
    Fatal,
    /// Operation not supported.
    Unsupported,
    /// Code without a named variant.
    Unknown(i32),
}

impl DriverStatus {
    /// Map a raw driver return code. `0` is success and yields `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            -1 => Some(Self::Fail),
            -2 => Some(Self::Retry),
            -3 => Some(Self::Resource),
            -4 => Some(Self::InvalidParam),
            -5 => Some(Self::Fatal),
            -6 => Some(Self::Unsupported),
            other => Some(Self::Unknown(other)),
        }
    }

    /// Raw driver code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Fail => -1,
            Self::Retry => -2,
            Self::Resource => -3,
            Self::InvalidParam => -4,
            Self::Fatal => -5,
            Self::Unsupported => -6,
            Self::Unknown(code) => *code,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Fail => "FAIL",
            Self::Retry => "RETRY",
            Self::Resource => "RESOURCE",
            Self::InvalidParam => "INVALID_PARAM",
            Self::Fatal => "FATAL",
            Self::Unsupported => "UNSUPPORTED",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Result of a driver call.
pub type DriverResult<T> = Result<T, DriverStatus>;

/// Attach the name of the failing driver call to a [`DriverResult`].
pub(crate) trait DriverCall<T> {
    fn during(self, call: &'static str) -> QatResult<T>;
}

impl<T> DriverCall<T> for DriverResult<T> {
    #[inline]
    fn during(self, call: &'static str) -> QatResult<T> {
        self.map_err(|status| {
            log::error!("{} failed, status: {}", call, status);
            QatError::Driver { call, status }
        })
    }
}

/// Translates a virtual address to what the device can DMA from.
pub type AddressTranslator = fn(*const u8) -> u64;

/// Invoked by the driver when a job finishes, with the tag given at
/// submission, the job status and the filled result record.
pub type CompletionCallback = fn(&CompletionTag, i32, &RequestResults);

/// Calls consumed from the QAT user-space driver.
///
/// All methods may be called concurrently from different threads, but never
/// concurrently for the same instance handle.
pub trait Driver: Send + Sync {
    /// Number of accelerator devices present.
    fn num_devices(&self) -> DriverResult<u32>;

    /// Start the user-mode driver process for `section`.
    fn user_start(&self, section: &str) -> DriverResult<()>;

    /// Stop the user-mode driver process.
    fn user_stop(&self);

    /// Number of data-compression instances.
    fn num_instances(&self) -> DriverResult<u16>;

    /// Handles of the first `count` instances.
    fn instances(&self, count: u16) -> DriverResult<Vec<InstanceHandle>>;

    fn instance_info(&self, instance: InstanceHandle) -> DriverResult<InstanceInfo>;

    fn query_capabilities(&self, instance: InstanceHandle) -> DriverResult<Capabilities>;

    /// Private metadata bytes needed per buffer list of `num_buffers` buffers.
    fn buffer_list_meta_size(&self, instance: InstanceHandle, num_buffers: u32)
        -> DriverResult<u32>;

    /// Number of intermediate buffers the instance must be started with.
    fn num_intermediate_buffers(&self, instance: InstanceHandle) -> DriverResult<u16>;

    fn set_address_translation(
        &self,
        instance: InstanceHandle,
        translate: AddressTranslator,
    ) -> DriverResult<()>;

    /// Start the instance. The intermediate buffers must outlive the instance.
    fn start_instance(
        &self,
        instance: InstanceHandle,
        intermediate: &[BufferList],
    ) -> DriverResult<()>;

    fn stop_instance(&self, instance: InstanceHandle) -> DriverResult<()>;

    fn session_size(
        &self,
        instance: InstanceHandle,
        setup: &SessionSetup,
    ) -> DriverResult<SessionSize>;

    /// Initialise a hardware session inside `session`.
    fn init_session(
        &self,
        instance: InstanceHandle,
        session: &mut DmaBuffer,
        setup: &SessionSetup,
        callback: CompletionCallback,
    ) -> DriverResult<()>;

    fn remove_session(&self, instance: InstanceHandle, session: &mut DmaBuffer)
        -> DriverResult<()>;

    /// Submit a compression job. Completion is reported through the session
    /// callback from a later [`poll`](Self::poll).
    ///
    /// # Safety
    ///
    /// - `src` must describe readable memory and `dst` writable memory that
    ///   stay valid until the job's callback ran or the instance is drained
    /// - `session` must have been initialised on `instance`
    unsafe fn compress(
        &self,
        instance: InstanceHandle,
        session: &DmaBuffer,
        src: &BufferList,
        dst: &BufferList,
        op: &OpData,
        tag: CompletionTag,
    ) -> DriverResult<()>;

    /// Process finished jobs, invoking their callbacks.
    ///
    /// `Err(DriverStatus::Retry)` means no response was ready. A `quota` of 0
    /// processes everything available.
    fn poll(&self, instance: InstanceHandle, quota: u32) -> DriverResult<()>;
}
