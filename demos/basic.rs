// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example of offloading a block to QAT.
//!
//! Runs on the simulated driver, so no QAT hardware is needed.
//!
//! Run with: `cargo run --example basic`

use qat_seqprod::{
    reconstruct, Config, Sequence, SequenceProducer, SimulatedDriver, SEQUENCE_PRODUCER_ERROR,
};
use std::sync::Arc;

fn main() {
    println!("QAT Sequence Producer Example (v{})", qat_seqprod::version());
    println!("=====================================\n");

    let config = Config::from_env();
    println!("Configuration:");
    println!("  Section name: {}", config.section_name);
    println!("  Poll timeout: {:?}", config.poll_timeout);
    println!("  Contiguous memory: {:?}", config.contiguous_policy);
    println!();

    // Two devices with two instances each.
    let driver = Arc::new(SimulatedDriver::with_instances(2, 2).with_literal_split(4096));
    let producer = SequenceProducer::new(driver.clone(), config);

    println!("Starting hardware...");
    if let Err(e) = producer.start_device() {
        println!("  Failed to start: {}", e);
        producer.stop_device();
        return;
    }
    println!("  Status: {:?}", producer.status());
    println!("  Usable instances: {}", producer.instance_count());
    println!();

    let mut session = producer.create_session();
    let block: Vec<u8> = b"QAT finds the matches, zstd encodes them. "
        .iter()
        .cycle()
        .take(64 * 1024)
        .copied()
        .collect();

    for level in [1, 6, 9] {
        println!("Offloading a {} byte block at level {}...", block.len(), level);
        let mut seqs = vec![Sequence::default(); block.len() + 1];
        let n = producer.sequence_producer(&mut session, &mut seqs, &block, None, level, block.len());
        if n == SEQUENCE_PRODUCER_ERROR {
            println!("  Offload failed, zstd would fall back to software");
            continue;
        }
        let seqs = &seqs[..n];
        let matched: usize = seqs.iter().map(|s| s.match_length as usize).sum();
        println!("  Sequences: {}", n);
        println!("  Matched bytes: {} of {}", matched, block.len());
        match reconstruct(&block, seqs) {
            Ok(rebuilt) => println!("  Round-trip matches: {}", rebuilt == block),
            Err(e) => println!("  Round-trip failed: {}", e),
        }
        println!();
    }

    let stats = driver.stats();
    println!("Driver statistics:");
    println!("  Submissions: {}", stats.submissions);
    println!("  Polls: {}", stats.polls);
    println!("  Sessions initialised: {}", stats.sessions_initialized);
    println!();

    producer.free_session(session);
    producer.stop_device();
    println!("Done!");
}
