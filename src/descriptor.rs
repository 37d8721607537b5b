// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! QAT data-compression session and request structures.
//!
//! These mirror the driver's session setup record, buffer lists, per-request
//! operation data and result record. Buffers are described by raw addresses
//! because the hardware reads and writes them asynchronously to the call that
//! submitted them.

use crate::error::QatResult;
use crate::memory::DmaBuffer;
use bitflags::bitflags;

bitflags! {
    /// Data-compression capabilities reported per instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Stateless DEFLATE compression.
        const STATELESS_DEFLATE = 1 << 0;
        /// Stateless LZ4 compression.
        const STATELESS_LZ4 = 1 << 1;
        /// Stateless LZ4S (LZ4 sequences) compression.
        const STATELESS_LZ4S = 1 << 2;
        /// CRC32 checksum.
        const CHECKSUM_CRC32 = 1 << 8;
        /// Adler-32 checksum.
        const CHECKSUM_ADLER32 = 1 << 9;
        /// XXHash32 checksum.
        const CHECKSUM_XXHASH32 = 1 << 10;
        /// Compress-and-verify.
        const COMPRESS_AND_VERIFY = 1 << 16;
    }
}

impl Capabilities {
    /// What an instance needs to produce sequences for zstd.
    pub const REQUIRED: Self = Self::STATELESS_LZ4S.union(Self::CHECKSUM_XXHASH32);

    /// Returns true if LZ4S sequence production is supported.
    #[inline]
    pub fn supports_sequence_production(&self) -> bool {
        self.contains(Self::REQUIRED)
    }
}

/// Compression algorithm of a hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    Deflate,
    Lz4,
    Lz4s,
}

/// Checksum computed alongside compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumType {
    None,
    Crc32,
    Adler32,
    XxHash32,
}

/// Huffman table selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HuffmanType {
    Static,
    Dynamic,
}

/// Minimum match length searched by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MinMatch {
    ThreeBytes,
    FourBytes,
}

/// Direction of a hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionDirection {
    Compress,
    Decompress,
    Combined,
}

/// Whether requests share history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stateless,
    Stateful,
}

/// Configuration a hardware session is initialised with.
///
/// Two setups are interchangeable only if every field matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionSetup {
    pub level: i32,
    pub comp_type: CompressionType,
    pub checksum: ChecksumType,
    pub huffman: HuffmanType,
    pub min_match: MinMatch,
    pub direction: SessionDirection,
    pub state: SessionState,
    pub auto_select_best_huffman: bool,
}

impl SessionSetup {
    /// Stateless LZ4S compression with XXHash32 at `level`.
    pub const fn lz4s(level: i32) -> Self {
        Self {
            level,
            comp_type: CompressionType::Lz4s,
            checksum: ChecksumType::XxHash32,
            huffman: HuffmanType::Static,
            min_match: MinMatch::ThreeBytes,
            direction: SessionDirection::Compress,
            state: SessionState::Stateless,
            auto_select_best_huffman: false,
        }
    }
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self::lz4s(crate::config::COMP_LEVEL_MIN)
    }
}

/// One contiguous region referenced by a buffer list.
#[derive(Debug, Clone, Copy)]
pub struct FlatBuffer {
    /// Start address, null while unbound.
    pub data: *mut u8,
    /// Length in bytes.
    pub len: u32,
}

impl FlatBuffer {
    pub const fn unbound() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        !self.data.is_null()
    }
}

/// Single-buffer list with driver metadata.
///
/// A list either owns its data region (`backing`) or points at memory owned
/// elsewhere for the duration of one request.
#[derive(Debug)]
pub struct BufferList {
    pub buffer: FlatBuffer,
    metadata: Option<DmaBuffer>,
    backing: Option<DmaBuffer>,
}

impl BufferList {
    /// List with private metadata and no data region.
    pub fn unbound(meta_size: u32, contiguous: bool) -> QatResult<Self> {
        let metadata = if meta_size > 0 {
            Some(DmaBuffer::zeroed(meta_size as usize, contiguous)?)
        } else {
            None
        };
        Ok(Self {
            buffer: FlatBuffer::unbound(),
            metadata,
            backing: None,
        })
    }

    /// List that owns a zeroed data region of `len` bytes.
    pub fn with_backing(len: usize, meta_size: u32, contiguous: bool) -> QatResult<Self> {
        let mut list = Self::unbound(meta_size, contiguous)?;
        let mut backing = DmaBuffer::zeroed(len, contiguous)?;
        list.buffer = FlatBuffer {
            data: backing.as_mut_ptr(),
            len: len as u32,
        };
        list.backing = Some(backing);
        Ok(list)
    }

    /// Point the list at external memory.
    #[inline]
    pub fn bind(&mut self, data: *mut u8, len: usize) {
        self.buffer = FlatBuffer {
            data,
            len: len as u32,
        };
    }

    /// Copy `src` into the owned region and describe exactly `src.len()` bytes.
    ///
    /// Returns false if there is no owned region or it is too small.
    pub fn fill(&mut self, src: &[u8]) -> bool {
        match self.backing.as_mut() {
            Some(backing) if backing.len() >= src.len() => {
                backing.as_mut_slice()[..src.len()].copy_from_slice(src);
                self.buffer = FlatBuffer {
                    data: backing.as_mut_ptr(),
                    len: src.len() as u32,
                };
                true
            }
            _ => false,
        }
    }

    /// Forget external memory; owned regions stay attached.
    pub fn unbind(&mut self) {
        if self.backing.is_none() {
            self.buffer = FlatBuffer::unbound();
        }
    }

    /// Returns true if the data region belongs to this list.
    pub fn owns_data(&self) -> bool {
        self.backing.is_some()
    }

    /// Driver metadata region.
    pub fn metadata(&self) -> Option<&DmaBuffer> {
        self.metadata.as_ref()
    }
}

/// Flush behaviour requested for a compression job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushFlag {
    None,
    Sync,
    Full,
    Final,
}

/// Per-request operation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpData {
    pub flush: FlushFlag,
    /// Have the hardware decompress its own output and compare.
    pub compress_and_verify: bool,
}

impl OpData {
    /// Final flush with compress-and-verify, as used for every offloaded block.
    pub const fn final_verified() -> Self {
        Self {
            flush: FlushFlag::Final,
            compress_and_verify: true,
        }
    }
}

/// Result record filled in by the driver for each request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestResults {
    /// Driver status code for the job (0 on success).
    pub status: i32,
    /// Source bytes consumed.
    pub consumed: u32,
    /// Destination bytes produced.
    pub produced: u32,
    /// Checksum over the consumed input.
    pub checksum: u32,
}

/// Status reported to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Job finished successfully.
    Ok,
    /// Job finished with a driver error code.
    Failed(i32),
}

impl From<i32> for CompletionStatus {
    fn from(status: i32) -> Self {
        match status {
            0 => Self::Ok,
            code => Self::Failed(code),
        }
    }
}

impl CompletionStatus {
    /// Raw driver code.
    #[inline]
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Failed(code) => *code,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_capabilities() {
        let caps = Capabilities::STATELESS_LZ4S | Capabilities::CHECKSUM_XXHASH32;
        assert!(caps.supports_sequence_production());
        assert!(!Capabilities::STATELESS_LZ4S.supports_sequence_production());
        assert!(!(Capabilities::STATELESS_DEFLATE | Capabilities::CHECKSUM_XXHASH32)
            .supports_sequence_production());
    }

    #[test]
    fn test_setup_compares_every_field() {
        let a = SessionSetup::lz4s(1);
        let mut b = a;
        assert_eq!(a, b);
        b.level = 3;
        assert_ne!(a, b);
        let mut c = a;
        c.huffman = HuffmanType::Dynamic;
        assert_ne!(a, c);
    }

    #[test]
    fn test_buffer_list_binding() {
        let mut list = BufferList::unbound(64, false).unwrap();
        assert!(!list.buffer.is_bound());
        assert_eq!(list.metadata().map(|m| m.len()), Some(64));

        let mut data = [0u8; 8];
        list.bind(data.as_mut_ptr(), data.len());
        assert!(list.buffer.is_bound());
        assert_eq!(list.buffer.len, 8);

        list.unbind();
        assert!(!list.buffer.is_bound());
    }

    #[test]
    fn test_buffer_list_fill_keeps_backing() {
        let mut list = BufferList::with_backing(16, 0, false).unwrap();
        assert!(list.owns_data());
        assert!(list.metadata().is_none());
        assert!(list.fill(b"hello"));
        assert_eq!(list.buffer.len, 5);
        assert!(!list.fill(&[0u8; 17]));

        list.unbind();
        assert!(list.buffer.is_bound());
    }

    #[test]
    fn test_completion_status() {
        assert!(CompletionStatus::from(0).is_success());
        assert_eq!(CompletionStatus::from(-11), CompletionStatus::Failed(-11));
        assert_eq!(CompletionStatus::Failed(-11).code(), -11);
    }
}
