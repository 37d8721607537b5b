// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! End-to-end tests of the offload path against the simulated driver.

use qat_seqprod::{
    reconstruct, Config, ContiguousPolicy, InitStatus, QatError, SeqProdSession, Sequence,
    SequenceProducer, SimFaults, SimInstanceSpec, SimulatedDriver, MAX_BLOCK_SIZE,
    SEQUENCE_PRODUCER_ERROR,
};
use qat_seqprod::config::MAX_ORPHANED_BUFFERS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn producer(sim: &Arc<SimulatedDriver>, config: Config) -> SequenceProducer {
    SequenceProducer::new(sim.clone(), config)
}

fn started(sim: &Arc<SimulatedDriver>) -> SequenceProducer {
    let producer = producer(sim, Config::default());
    producer.start_device().unwrap();
    producer
}

/// Compressible text-like data with some noise.
fn block(len: usize, seed: u32) -> Vec<u8> {
    let words: [&[u8]; 6] = [b"alpha ", b"beta ", b"gamma ", b"delta ", b"qat ", b"zstd "];
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        if state % 7 == 0 {
            out.push((state >> 16) as u8);
        } else {
            out.extend_from_slice(words[(state >> 16) as usize % words.len()]);
        }
    }
    out.truncate(len);
    out
}

fn produce(
    producer: &SequenceProducer,
    session: &mut SeqProdSession,
    src: &[u8],
    level: i32,
) -> Result<Vec<Sequence>, QatError> {
    let mut out = vec![Sequence::default(); src.len() + 1];
    let n = producer.produce_sequences(session, &mut out, src, None, level, src.len())?;
    out.truncate(n);
    Ok(out)
}

#[test]
fn test_roundtrip_block_sizes() {
    let sim = Arc::new(SimulatedDriver::with_instances(2, 2));
    let producer = started(&sim);
    let mut session = producer.create_session();

    for len in [0, 1, 2, 3, 15, 16, 255, 4096, 65_535, 100_000, MAX_BLOCK_SIZE] {
        let src = block(len, len as u32);
        let seqs = produce(&producer, &mut session, &src, 3).unwrap();
        let last = seqs.last().unwrap();
        assert_eq!(last.match_length, 0, "len {}", len);
        assert_eq!(reconstruct(&src, &seqs).unwrap(), src, "len {}", len);
    }

    producer.free_session(session);
    producer.stop_device();
}

#[test]
fn test_incompressible_block_fits_scratch() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();

    let mut state = 0x1234_5678u32;
    let src: Vec<u8> = (0..MAX_BLOCK_SIZE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
}

#[test]
fn test_zero_length_matches_merge_literals() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1).with_literal_split(64));
    let producer = started(&sim);
    let mut session = producer.create_session();

    let mut src: Vec<u8> = (0..1000u32).map(|i| (i * 131 % 256) as u8).collect();
    src.extend_from_within(..200);
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
    assert!(seqs.iter().any(|s| s.lit_length > 64));
}

#[test]
fn test_concrete_64k_level_one() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 4));
    let producer = producer(&sim, Config::default());
    producer.start_device().unwrap();
    assert_eq!(producer.status(), InitStatus::Ready);
    assert!(producer.instance_count() >= 1);

    let mut session = producer.create_session();
    let src = block(64 * 1024, 42);
    let mut out = vec![Sequence::default(); src.len() + 1];
    let n = producer.sequence_producer(&mut session, &mut out, &src, None, 1, src.len());
    assert_ne!(n, SEQUENCE_PRODUCER_ERROR);
    assert!(n > 0);
    assert_eq!(reconstruct(&src, &out[..n]).unwrap(), src);

    producer.free_session(session);
    producer.stop_device();
    assert_eq!(producer.status(), InitStatus::Failed);
    assert_eq!(sim.stats().user_stops, 1);
    assert_eq!(sim.session_count(), 0);
}

#[test]
fn test_pool_mutual_exclusion() {
    const THREADS: usize = 8;
    const INSTANCES: usize = 3;
    const ROUNDS: usize = 2000;

    let sim = Arc::new(SimulatedDriver::with_instances(1, INSTANCES));
    let producer = started(&sim);
    let pool = producer.registry().pool().unwrap();
    let occupancy: Arc<Vec<AtomicUsize>> =
        Arc::new((0..INSTANCES).map(|_| AtomicUsize::new(0)).collect());
    let acquired = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let (pool, occupancy, acquired) = (&pool, &occupancy, &acquired);
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let hint = Some((t + round) % (INSTANCES + 1));
                    if let Some(guard) = pool.try_acquire(hint, 10) {
                        let i = guard.index();
                        assert_eq!(occupancy[i].fetch_add(1, Ordering::SeqCst), 0);
                        std::hint::spin_loop();
                        assert_eq!(occupancy[i].fetch_sub(1, Ordering::SeqCst), 1);
                        acquired.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert!(acquired.load(Ordering::Relaxed) > 0);
    assert!(pool.instances().iter().all(|inst| !inst.is_locked()));
}

#[test]
fn test_concurrent_sessions_roundtrip() {
    let sim = Arc::new(SimulatedDriver::with_instances(2, 2));
    let producer = started(&sim);
    let config_retries = producer.registry().config().max_grab_retry;
    assert!(config_retries > 0);

    std::thread::scope(|scope| {
        for t in 0..6u32 {
            let producer = producer.clone();
            scope.spawn(move || {
                let mut session = producer.create_session();
                for i in 0..20u32 {
                    let src = block(8192 + (i as usize) * 97, t * 100 + i);
                    match produce(&producer, &mut session, &src, 1 + (i % 3) as i32) {
                        Ok(seqs) => assert_eq!(reconstruct(&src, &seqs).unwrap(), src),
                        Err(QatError::NoInstanceAvailable) => {}
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                }
            });
        }
    });
}

#[test]
fn test_reconciliation_counts() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(4096, 7);

    produce(&producer, &mut session, &src, 1).unwrap();
    produce(&producer, &mut session, &src, 1).unwrap();
    let stats = sim.stats();
    assert_eq!(stats.sessions_initialized, 1);
    assert_eq!(stats.sessions_removed, 0);

    produce(&producer, &mut session, &src, 5).unwrap();
    let stats = sim.stats();
    assert_eq!(stats.sessions_initialized, 2);
    assert_eq!(stats.sessions_removed, 1);
    assert_eq!(sim.session_levels(), vec![5]);
}

#[test]
fn test_unsupported_configuration_has_no_side_effects() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(4096, 1);
    let mut out = vec![Sequence::default(); src.len() + 1];
    let before = sim.stats();

    let dict = b"dictionary";
    assert_eq!(
        producer.sequence_producer(&mut session, &mut out, &src, Some(dict), 1, src.len()),
        SEQUENCE_PRODUCER_ERROR
    );
    assert_eq!(
        producer.sequence_producer(&mut session, &mut out, &src, None, 1, src.len() - 1),
        SEQUENCE_PRODUCER_ERROR
    );
    for level in [0, 13, -5] {
        assert_eq!(
            producer.sequence_producer(&mut session, &mut out, &src, None, level, src.len()),
            SEQUENCE_PRODUCER_ERROR
        );
    }

    assert_eq!(sim.stats(), before);
    assert_eq!(session.last_instance(), None);
    assert!(!session.has_scratch());
    assert_eq!(session.fail_offload_count(), 0);
}

#[test]
fn test_restart_is_throttled() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    sim.set_faults(SimFaults {
        no_devices: true,
        ..SimFaults::default()
    });
    let producer = producer(&sim, Config::default().with_restart_interval(5));
    assert!(producer.start_device().is_err());

    let mut session = producer.create_session();
    let src = block(1024, 3);
    for _ in 0..4 {
        assert!(matches!(
            produce(&producer, &mut session, &src, 1),
            Err(QatError::NotStarted)
        ));
    }
    assert_eq!(session.fail_offload_count(), 4);

    // The fifth failure triggers a restart, which still fails.
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::RestartFailed)
    ));
    assert_eq!(session.fail_offload_count(), 0);

    sim.set_faults(SimFaults::default());
    for _ in 0..4 {
        assert!(produce(&producer, &mut session, &src, 1).is_err());
    }
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
    assert_eq!(producer.status(), InitStatus::Ready);
    assert_eq!(sim.stats().user_starts, 1);

    producer.stop_device();
}

#[test]
fn test_busy_submission_retried() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(2048, 9);

    sim.update_faults(|f| f.busy_submissions = 3);
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);

    sim.update_faults(|f| f.busy_submissions = 100);
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::SubmitRetriesExhausted { retries: 5 })
    ));

    // Counters stay consistent for the next request.
    sim.update_faults(|f| f.busy_submissions = 0);
    assert!(produce(&producer, &mut session, &src, 1).is_ok());
}

#[test]
fn test_poll_failure_then_recovery() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(2048, 11);

    sim.update_faults(|f| f.fail_poll = true);
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::Driver { call: "poll", .. })
    ));

    sim.update_faults(|f| f.fail_poll = false);
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
}

#[test]
fn test_timeout_orphans_scratch() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = producer(
        &sim,
        Config::default().with_poll_timeout(Duration::from_millis(20)),
    );
    producer.start_device().unwrap();
    let mut session = producer.create_session();
    let src = block(2048, 13);

    produce(&producer, &mut session, &src, 1).unwrap();
    assert!(session.has_scratch());

    sim.update_faults(|f| f.never_complete = true);
    let err = produce(&producer, &mut session, &src, 1).unwrap_err();
    assert!(matches!(err, QatError::PollTimeout { .. }));
    assert!(err.is_retryable());
    assert!(!session.has_scratch());

    sim.update_faults(|f| f.never_complete = false);
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
    assert!(session.has_scratch());

    producer.stop_device();
    assert_eq!(sim.pending_jobs(), 0);
}

fn orphans_held(producer: &SequenceProducer) -> usize {
    let pool = producer.registry().pool().unwrap();
    let mut guard = pool.try_acquire(None, 1).unwrap();
    guard.orphan_count()
}

#[test]
fn test_late_completion_releases_orphan() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = producer(
        &sim,
        Config::default().with_poll_timeout(Duration::from_millis(20)),
    );
    producer.start_device().unwrap();
    let mut session = producer.create_session();
    let src = block(4096, 19);

    sim.update_faults(|f| f.never_complete = true);
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::PollTimeout { .. })
    ));
    assert_eq!(orphans_held(&producer), 1);

    // The stuck job finishes during the next request's poll loop.
    sim.update_faults(|f| f.never_complete = false);
    sim.release_stuck();
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
    assert_eq!(orphans_held(&producer), 0);
    assert_eq!(sim.pending_jobs(), 0);

    producer.stop_device();
}

#[test]
fn test_repeated_timeouts_stay_bounded() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = producer(
        &sim,
        Config::default().with_poll_timeout(Duration::from_millis(1)),
    );
    producer.start_device().unwrap();
    let mut session = producer.create_session();
    let src = block(2048, 23);

    sim.update_faults(|f| f.never_complete = true);
    for round in 1..=50 {
        assert!(matches!(
            produce(&producer, &mut session, &src, 1),
            Err(QatError::PollTimeout { .. })
        ));
        assert_eq!(orphans_held(&producer), round % MAX_ORPHANED_BUFFERS);
        assert!(sim.pending_jobs() < MAX_ORPHANED_BUFFERS);
    }
    assert_eq!(
        sim.stats().instances_stopped,
        (50 / MAX_ORPHANED_BUFFERS) as u64
    );
    assert_eq!(producer.status(), InitStatus::Ready);

    // The instance is started again on demand.
    sim.update_faults(|f| f.never_complete = false);
    let seqs = produce(&producer, &mut session, &src, 1).unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);

    producer.stop_device();
    assert_eq!(sim.pending_jobs(), 0);
}

#[test]
fn test_unstoppable_instance_is_retired() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = producer(
        &sim,
        Config::default().with_poll_timeout(Duration::from_millis(1)),
    );
    producer.start_device().unwrap();
    let mut session = producer.create_session();
    let src = block(2048, 27);

    sim.update_faults(|f| {
        f.never_complete = true;
        f.fail_instance_stop = true;
    });
    for _ in 0..MAX_ORPHANED_BUFFERS {
        assert!(matches!(
            produce(&producer, &mut session, &src, 1),
            Err(QatError::PollTimeout { .. })
        ));
    }
    let pool = producer.registry().pool().unwrap();
    assert!(pool.instances()[0].is_retired());
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::NoInstanceAvailable)
    ));
    assert_eq!(sim.pending_jobs(), MAX_ORPHANED_BUFFERS);

    sim.set_faults(SimFaults::default());
    drop(pool);
    producer.stop_device();
    assert_eq!(sim.pending_jobs(), 0);
}

#[test]
fn test_result_validation() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(2048, 17);

    sim.update_faults(|f| f.short_consume = true);
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::InvalidResult { src_len: 2048, consumed: 2047, .. })
    ));

    sim.update_faults(|f| {
        f.short_consume = false;
        f.fail_completion = true;
    });
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::CallbackFailed { .. })
    ));
}

#[test]
fn test_output_overflow_faults() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(8192, 19);

    let mut out = vec![Sequence::default(); 2];
    let result = producer.produce_sequences(&mut session, &mut out, &src, None, 1, src.len());
    assert!(matches!(
        result,
        Err(QatError::Decode(qat_seqprod::DecodeError::OutputOverflow { capacity: 2 }))
    ));
    // The instance was released.
    assert!(producer
        .registry()
        .pool()
        .unwrap()
        .instances()
        .iter()
        .all(|inst| !inst.is_locked()));
}

#[test]
fn test_failed_instance_start_is_retried() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 1));
    let producer = started(&sim);
    let mut session = producer.create_session();
    let src = block(1024, 23);

    sim.update_faults(|f| f.fail_instance_start = true);
    assert!(matches!(
        produce(&producer, &mut session, &src, 1),
        Err(QatError::Driver {
            call: "start_instance",
            ..
        })
    ));

    sim.update_faults(|f| f.fail_instance_start = false);
    assert!(produce(&producer, &mut session, &src, 1).is_ok());
    assert_eq!(sim.stats().instances_started, 1);
}

#[test]
fn test_discovery_filters_and_interleaves() {
    let sim = Arc::new(SimulatedDriver::new(vec![
        SimInstanceSpec::lz4s(0),
        SimInstanceSpec::lz4s(0),
        SimInstanceSpec::lz4s(1),
        SimInstanceSpec::deflate_only(1),
        SimInstanceSpec::lz4s(2).contiguous(),
    ]));
    let producer = producer(
        &sim,
        Config::default().with_contiguous_policy(ContiguousPolicy::Reject),
    );
    producer.start_device().unwrap();

    let pool = producer.registry().pool().unwrap();
    let packages: Vec<u32> = pool.instances().iter().map(|i| i.package_id()).collect();
    assert_eq!(packages, vec![0, 1, 0]);
    producer.stop_device();
}

#[test]
fn test_pinned_instances_copy_the_source() {
    let sim = Arc::new(SimulatedDriver::new(vec![
        SimInstanceSpec::lz4s(0).contiguous(),
        SimInstanceSpec::lz4s(1),
    ]));
    let producer = producer(
        &sim,
        Config::default().with_contiguous_policy(ContiguousPolicy::Pinned),
    );
    producer.start_device().unwrap();
    let pool = producer.registry().pool().unwrap();
    assert_eq!(pool.len(), 2);
    assert!(pool.instances().iter().all(|i| i.requires_contiguous()));

    let mut session = producer.create_session();
    // Larger then smaller, so a stale tail in the pinned source would show.
    for (len, seed) in [(MAX_BLOCK_SIZE, 31), (5000, 37)] {
        let src = block(len, seed);
        match produce(&producer, &mut session, &src, 1) {
            Ok(seqs) => {
                assert!(session.requires_contiguous());
                assert_eq!(reconstruct(&src, &seqs).unwrap(), src, "len {}", len);
            }
            // RLIMIT_MEMLOCK too low for the pinned buffers.
            Err(QatError::Io(err)) => {
                println!("pinned allocation unavailable: {}", err);
                break;
            }
            Err(QatError::AllocationFailed(msg)) => {
                println!("pinned allocation unavailable: {}", msg);
                break;
            }
            Err(err) => panic!("unexpected error: {}", err),
        }
    }

    drop(pool);
    producer.stop_device();
}

#[test]
fn test_no_qualifying_instance() {
    let sim = Arc::new(SimulatedDriver::new(vec![SimInstanceSpec::deflate_only(0)]));
    let producer = producer(&sim, Config::default());
    assert!(matches!(
        producer.start_device(),
        Err(QatError::NoQualifyingInstance { found: 1 })
    ));
    assert_eq!(producer.status(), InitStatus::Started);
    producer.stop_device();
    assert_eq!(sim.stats().user_stops, 1);
}

#[test]
fn test_teardown_stops_everything() {
    let sim = Arc::new(SimulatedDriver::with_instances(2, 2));
    let producer = started(&sim);
    let mut sessions: Vec<_> = (0..4).map(|_| producer.create_session()).collect();
    let src = block(4096, 29);
    for (i, session) in sessions.iter_mut().enumerate() {
        produce(&producer, session, &src, 1 + i as i32).unwrap();
    }
    let used = sim.stats().instances_started;
    assert!(used >= 1);

    producer.stop_device();
    let stats = sim.stats();
    assert_eq!(stats.instances_stopped, used);
    assert_eq!(stats.sessions_removed + sim.session_count() as u64, stats.sessions_initialized);
    assert_eq!(sim.session_count(), 0);
}

#[cfg(feature = "async")]
#[tokio::test]
async fn test_produce_async() {
    let sim = Arc::new(SimulatedDriver::with_instances(1, 2));
    let producer = started(&sim);
    let src = block(16 * 1024, 31);

    let session = producer.create_session();
    let (session, result) = producer
        .produce_async(session, src.clone(), src.len() + 1, 1, src.len())
        .await
        .unwrap();
    let seqs = result.unwrap();
    assert_eq!(reconstruct(&src, &seqs).unwrap(), src);
    assert!(session.last_instance().is_some());
    producer.stop_device();
}
