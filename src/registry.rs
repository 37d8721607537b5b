// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Process-wide hardware registry.
//!
//! The registry owns the driver handle, the initialisation status and the
//! instance pool. Start and stop calls are reference counted; only the call
//! that drops the count to zero tears the hardware down. All transitions run
//! under one mutex, so concurrent first use from several sessions starts the
//! hardware exactly once.

use crate::config::Config;
use crate::discovery::{discover_instances, start_user};
use crate::driver::Driver;
use crate::error::{QatError, QatResult};
use crate::instance::InstancePool;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Initialisation status of the hardware subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitStatus {
    /// Not started, or the last attempt failed before the driver came up.
    Failed = 0,
    /// The user-mode driver is running but no instance qualified.
    Started = 1,
    /// At least one instance is usable.
    Ready = 2,
}

impl InitStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Ready,
            1 => Self::Started,
            _ => Self::Failed,
        }
    }
}

struct RegistryInner {
    pool: Option<Arc<InstancePool>>,
    refs: usize,
}

/// Hardware subsystem shared by every session of a producer.
pub struct Registry {
    driver: Arc<dyn Driver>,
    config: Config,
    status: AtomicU8,
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(driver: Arc<dyn Driver>, config: Config) -> Self {
        Self {
            driver,
            config,
            status: AtomicU8::new(InitStatus::Failed as u8),
            inner: Mutex::new(RegistryInner {
                pool: None,
                refs: 0,
            }),
        }
    }

    /// Current status, readable without the lock.
    #[inline]
    pub fn status(&self) -> InitStatus {
        InitStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.status() == InitStatus::Ready
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of usable instances, 0 unless ready.
    pub fn instance_count(&self) -> usize {
        self.lock().pool.as_ref().map_or(0, |pool| pool.len())
    }

    /// The instance pool, if the registry is ready.
    pub fn pool(&self) -> Option<Arc<InstancePool>> {
        self.lock().pool.clone()
    }

    /// Take a reference and start the hardware if needed.
    ///
    /// The reference is taken even when starting fails; it is returned by
    /// [`stop`](Self::stop).
    pub fn start(&self) -> QatResult<()> {
        let mut inner = self.lock();
        inner.refs += 1;
        log::debug!("Registry reference taken ({} held)", inner.refs);
        self.ensure_started(&mut inner)
    }

    /// Start the hardware without taking a reference.
    pub fn restart(&self) -> QatResult<()> {
        let mut inner = self.lock();
        self.ensure_started(&mut inner)
    }

    /// Return a reference; the last one tears the hardware down.
    pub fn stop(&self) {
        let mut inner = self.lock();
        match inner.refs {
            0 => log::warn!("Registry stopped without a matching start"),
            1 => {
                inner.refs = 0;
                self.teardown(&mut inner);
            }
            _ => {
                inner.refs -= 1;
                log::debug!("Registry reference returned ({} held)", inner.refs);
            }
        }
    }

    /// References currently held.
    pub fn refs(&self) -> usize {
        self.lock().refs
    }

    fn ensure_started(&self, inner: &mut RegistryInner) -> QatResult<()> {
        if self.status() == InitStatus::Ready {
            return Ok(());
        }
        if self.status() == InitStatus::Failed {
            start_user(&*self.driver, &self.config)?;
            self.set_status(InitStatus::Started);
        }

        let discovered = discover_instances(&*self.driver, &self.config)?;
        let pool = InstancePool::new(Arc::clone(&self.driver), discovered);
        log::info!("QAT ready with {} instances", pool.len());
        inner.pool = Some(Arc::new(pool));
        self.set_status(InitStatus::Ready);
        Ok(())
    }

    fn teardown(&self, inner: &mut RegistryInner) {
        let status = self.status();
        if let Some(pool) = inner.pool.take() {
            pool.teardown();
        }
        if status != InitStatus::Failed {
            self.driver.user_stop();
            log::info!("QAT stopped");
        }
        self.set_status(InitStatus::Failed);
    }

    #[inline]
    fn set_status(&self, status: InitStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let status = self.status();
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let mut taken = RegistryInner {
            pool: inner.pool.take(),
            refs: std::mem::take(&mut inner.refs),
        };
        if taken.pool.is_some() || status != InitStatus::Failed {
            log::debug!("Registry dropped with {} references held", taken.refs);
            self.teardown(&mut taken);
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `NotStarted` unless the registry is ready.
pub(crate) fn require_ready(registry: &Registry) -> QatResult<()> {
    if registry.is_ready() {
        Ok(())
    } else {
        Err(QatError::NotStarted)
    }
}
