// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # Intel QAT Sequence Producer for zstd
//!
//! This crate offloads the match-finding stage of zstd block compression to
//! Intel QuickAssist Technology (QAT). The accelerator compresses each block
//! to LZ4S, a bare LZ4 token stream, and the crate decodes those tokens into
//! the literal/match [`Sequence`]s zstd's external sequence producer returns.
//!
//! ## Components
//!
//! - [`Registry`]: process-wide hardware state, reference counted start/stop
//! - [`InstancePool`]: lock-free acquisition of QAT instances
//! - [`SeqProdSession`]: per-context state and the LZ4S scratch buffer
//! - [`SequenceProducer`]: the submit/poll/decode request path
//! - [`decode_lz4s`]: the LZ4S token decoder
//!
//! ## Drivers
//!
//! All hardware access goes through the [`Driver`] trait. A binding to the QAT
//! user-space library implements it for real devices; [`SimulatedDriver`]
//! implements it in software for tests, benchmarks and machines without QAT.
//!
//! ## Fallback
//!
//! Every failure is reported, never hidden. Through
//! [`SequenceProducer::sequence_producer`] a failure becomes
//! [`SEQUENCE_PRODUCER_ERROR`], which tells zstd to find matches in software
//! for that block.
//!
//! ## Example
//!
//! ```rust
//! use qat_seqprod::{reconstruct, Config, Sequence, SequenceProducer, SimulatedDriver};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), qat_seqprod::QatError> {
//!     let producer = SequenceProducer::new(
//!         Arc::new(SimulatedDriver::with_instances(2, 4)),
//!         Config::from_env(),
//!     );
//!     producer.start_device()?;
//!
//!     let mut session = producer.create_session();
//!     let block = b"Hello, QAT! Hello, QAT! Hello, zstd!".repeat(64);
//!     let mut seqs = vec![Sequence::default(); block.len() + 1];
//!     let n = producer.produce_sequences(&mut session, &mut seqs, &block, None, 1, block.len())?;
//!     assert_eq!(reconstruct(&block, &seqs[..n]).unwrap(), block);
//!
//!     producer.free_session(session);
//!     producer.stop_device();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `pinned-memory`: use instances that need physically contiguous memory,
//!   backing their buffers with locked pages (Linux only)
//! - `async`: [`SequenceProducer::produce_async`] on the tokio blocking pool

// Module declarations
pub mod completion;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod instance;
pub mod lz4s;
pub mod memory;
pub mod producer;
pub mod registry;
pub mod sequence;
pub mod session;
pub mod sim;

// Re-exports for convenient access
pub use config::{Config, ContiguousPolicy, MAX_BLOCK_SIZE};
pub use descriptor::{Capabilities, SessionSetup};
pub use driver::{Driver, DriverStatus, InstanceHandle};
pub use error::{DecodeError, QatError, QatResult};
pub use instance::{InstanceGuard, InstancePool, SessionChange};
pub use lz4s::decode_lz4s;
pub use producer::{SequenceProducer, SEQUENCE_PRODUCER_ERROR};
pub use registry::{InitStatus, Registry};
pub use sequence::{reconstruct, Sequence};
pub use session::SeqProdSession;
pub use sim::{SimFaults, SimInstanceSpec, SimStats, SimulatedDriver};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
