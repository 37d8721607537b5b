// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Hardware-visible buffer allocation.
//!
//! QAT instances either accept ordinary pageable memory or require memory
//! that stays resident for the whole lifetime of a request. [`DmaBuffer`]
//! covers both: pageable buffers are plain zeroed heap slices, pinned buffers
//! are anonymous mappings locked into RAM with `mlock`.
//!
//! # Platform Support
//!
//! Pinned allocations are only available on Linux; elsewhere they fail with
//! [`QatError::AllocationFailed`].

use crate::error::{QatError, QatResult};

/// Zero-initialised buffer handed to the accelerator.
pub struct DmaBuffer {
    backing: Backing,
}

enum Backing {
    Heap(Box<[u8]>),
    #[cfg(target_os = "linux")]
    Pinned { ptr: *mut u8, len: usize },
}

// SAFETY: the pinned mapping is owned exclusively by this buffer and is only
// reachable through it; access follows the usual `&`/`&mut` rules.
unsafe impl Send for DmaBuffer {}

// SAFETY: shared access only hands out `&[u8]` or `*const u8`.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `len` zeroed bytes, pinned if `contiguous` is set.
    pub fn zeroed(len: usize, contiguous: bool) -> QatResult<Self> {
        if contiguous && len > 0 {
            Self::pinned(len)
        } else {
            Ok(Self::pageable(len))
        }
    }

    /// Allocate ordinary heap memory.
    pub fn pageable(len: usize) -> Self {
        Self {
            backing: Backing::Heap(vec![0u8; len].into_boxed_slice()),
        }
    }

    #[cfg(target_os = "linux")]
    fn pinned(len: usize) -> QatResult<Self> {
        // MAP_ANONYMOUS pages come back zero-filled.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(QatError::AllocationFailed(format!(
                "mmap of {} pinned bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }

        if unsafe { libc::mlock(ptr, len) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr, len);
            }
            return Err(QatError::Io(err));
        }

        Ok(Self {
            backing: Backing::Pinned {
                ptr: ptr as *mut u8,
                len,
            },
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn pinned(len: usize) -> QatResult<Self> {
        Err(QatError::AllocationFailed(format!(
            "pinned allocation of {} bytes requires Linux",
            len
        )))
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Heap(buf) => buf.len(),
            #[cfg(target_os = "linux")]
            Backing::Pinned { len, .. } => *len,
        }
    }

    /// Returns true for a zero-length buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the pages are locked in memory.
    pub fn is_pinned(&self) -> bool {
        !matches!(self.backing, Backing::Heap(_))
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Heap(buf) => buf.as_ptr(),
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, .. } => *ptr as *const u8,
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.backing {
            Backing::Heap(buf) => buf.as_mut_ptr(),
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, .. } => *ptr,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Heap(buf) => &buf[..],
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Heap(buf) => &mut buf[..],
            #[cfg(target_os = "linux")]
            Backing::Pinned { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Backing::Pinned { ptr, len } = self.backing {
            unsafe {
                libc::munlock(ptr as *const libc::c_void, len);
                libc::munmap(ptr as *mut libc::c_void, len);
            }
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &self.len())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Address translator registered with every instance.
///
/// Without a user-space DMA allocator the driver sees process virtual
/// addresses directly, so translation is the identity.
pub fn virt_to_phys(addr: *const u8) -> u64 {
    addr as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pageable_is_zeroed() {
        let buf = DmaBuffer::zeroed(4096, false).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(!buf.is_pinned());
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_never_pinned() {
        let buf = DmaBuffer::zeroed(0, true).unwrap();
        assert!(buf.is_empty());
        assert!(!buf.is_pinned());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pinned_roundtrip() {
        // Small enough to fit under the default RLIMIT_MEMLOCK.
        match DmaBuffer::zeroed(4096, true) {
            Ok(mut buf) => {
                assert!(buf.is_pinned());
                buf.as_mut_slice()[10] = 0xAB;
                assert_eq!(buf.as_slice()[10], 0xAB);
                assert_eq!(buf.as_slice()[11], 0);
            }
            Err(e) => println!("pinned allocation unavailable: {}", e),
        }
    }

    #[test]
    fn test_identity_translation() {
        let buf = DmaBuffer::pageable(16);
        assert_eq!(virt_to_phys(buf.as_ptr()), buf.as_ptr() as u64);
    }
}
