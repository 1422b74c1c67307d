mod common;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use pgas_tasking::{
    Dependency, Endpoint, ExitStatus, GlobalRef, InProcFabric, LocalBuffer, Runtime, TransferOp,
    UnitId, wait_handle, yield_now,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const UNITS: usize = 4;

/// Each unit owns one slot. In every round, unit `u` reads the slot of its
/// left neighbour from the previous round and writes the sum into its own.
#[test]
fn test_ring_exchange_over_phases() -> Result<()> {
    common::init_tracing();

    let fabric = InProcFabric::builder(UNITS).completion_delay(1).build();
    let rounds = 3u64;

    let results = common::spmd(
        &fabric,
        || Runtime::builder().worker_threads(2),
        move |unit, rt| -> Result<u64> {
            let units = rt.team_size() as u32;
            let slot = |u: u32| GlobalRef::new(UnitId(u), 0, 0);
            let mine = slot(unit.0);
            let left = slot((unit.0 + units - 1) % units);

            let init: LocalBuffer = Arc::new(Mutex::new(1u64.to_le_bytes().to_vec()));
            let handle = rt.transport().issue(
                TransferOp::Put,
                Endpoint::local(&init),
                mine.into(),
                8,
            )?;
            rt.wait_handle(&[handle])?;

            for _ in 0..rounds {
                rt.phase_advance();

                let scratch: LocalBuffer = Arc::new(Mutex::new(vec![0u8; 8]));
                let staged = GlobalRef::new(unit, 0, 64);
                {
                    let scratch = Arc::clone(&scratch);
                    rt.create_task(
                        move || {
                            let transport = pgas_tasking::transport()?;
                            let get = transport.issue(
                                TransferOp::Get,
                                left.into(),
                                Endpoint::local(&scratch),
                                8,
                            )?;
                            wait_handle(&[get])?;
                            Ok(())
                        },
                        &[Dependency::copy_in(left), Dependency::out(staged)],
                    )?;
                }

                rt.create_task(
                    move || {
                        let transport = pgas_tasking::transport()?;
                        let own: LocalBuffer = Arc::new(Mutex::new(vec![0u8; 8]));
                        let get = transport.issue(
                            TransferOp::Get,
                            mine.into(),
                            Endpoint::local(&own),
                            8,
                        )?;
                        wait_handle(&[get])?;

                        let sum = read_u64(&own)? + read_u64(&scratch)?;
                        own.lock().copy_from_slice(&sum.to_le_bytes());

                        let put =
                            transport.issue(TransferOp::Put, Endpoint::local(&own), mine.into(), 8)?;
                        wait_handle(&[put])?;
                        Ok(())
                    },
                    &[Dependency::read_write(mine), Dependency::read(staged)],
                )?;

                // Remote accesses of a phase come before local ones, so the
                // neighbour copies our slot before we overwrite it.
                rt.task_complete()?;
            }

            let out: LocalBuffer = Arc::new(Mutex::new(Vec::new()));
            let handle = rt.transport().issue(TransferOp::Get, mine.into(), Endpoint::local(&out), 8)?;
            rt.wait_handle(&[handle])?;
            read_u64(&out)
        },
    );

    for (result, status) in results {
        // Every round doubles the slot value around the ring.
        assert_eq!(result?, 1 << rounds);
        assert_eq!(status, ExitStatus::Normal);
    }
    Ok(())
}

fn read_u64(buf: &LocalBuffer) -> Result<u64> {
    let bytes = buf.lock();
    let bytes: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow!("short buffer"))?;
    Ok(u64::from_le_bytes(bytes))
}

#[test]
fn test_cancel_bcast_reaches_every_unit() -> Result<()> {
    let fabric = InProcFabric::new(2);

    let results = common::spmd(
        &fabric,
        || Runtime::builder().worker_threads(1),
        |unit, rt| -> Result<_> {
            if unit == UnitId(0) {
                rt.create_task(
                    || {
                        pgas_tasking::cancel_bcast()?;
                        Ok(())
                    },
                    &[],
                )?;
            } else {
                rt.create_task(
                    || {
                        // Unwound at a yield point once the abort arrives.
                        loop {
                            yield_now();
                        }
                    },
                    &[],
                )?;
            }

            let summary = rt.task_complete()?;
            Ok((summary, rt.should_abort()))
        },
    );

    for (result, status) in results {
        let (summary, aborting) = result?;
        // Unit 1 may learn about the abort before its task was dispatched.
        assert_eq!(summary.aborted + summary.cancelled, 1);
        assert!(!aborting);
        assert_eq!(status, ExitStatus::Cancelled);
    }
    Ok(())
}

#[test]
fn test_remote_reader_waits_for_owner_writer() -> Result<()> {
    let fabric = InProcFabric::builder(2).completion_delay(3).build();
    let shared = GlobalRef::new(UnitId(0), 0, 128);

    let results = common::spmd(
        &fabric,
        || Runtime::builder().worker_threads(2),
        move |unit, rt| -> Result<Vec<u8>> {
            let seen: LocalBuffer = Arc::new(Mutex::new(Vec::new()));

            if unit == UnitId(0) {
                rt.create_task(
                    move || {
                        let payload: LocalBuffer = Arc::new(Mutex::new(b"released".to_vec()));
                        let transport = pgas_tasking::transport()?;
                        let put = transport.issue(
                            TransferOp::Put,
                            Endpoint::local(&payload),
                            shared.into(),
                            8,
                        )?;
                        wait_handle(&[put])?;
                        Ok(())
                    },
                    &[Dependency::write(shared)],
                )?;
            }

            // Same-phase remote accesses are ordered before local ones: the
            // reader goes into the next phase to observe the write.
            rt.phase_advance();

            if unit == UnitId(1) {
                let seen = Arc::clone(&seen);
                rt.create_task(
                    move || {
                        let transport = pgas_tasking::transport()?;
                        let get = transport.issue(
                            TransferOp::Get,
                            shared.into(),
                            Endpoint::local(&seen),
                            8,
                        )?;
                        wait_handle(&[get])?;
                        Ok(())
                    },
                    &[Dependency::read(shared)],
                )?;
            }

            let summary = rt.task_complete()?;
            if summary.completed != 1 {
                return Err(anyhow!("unit {unit}: {summary:?}"));
            }

            let seen = seen.lock().clone();
            Ok(seen)
        },
    );

    let mut results = results.into_iter();
    let (owner, _) = results.next().ok_or_else(|| anyhow!("missing unit 0"))?;
    assert!(owner?.is_empty());

    let (reader, status) = results.next().ok_or_else(|| anyhow!("missing unit 1"))?;
    assert_eq!(reader?, b"released".to_vec());
    assert_eq!(status, ExitStatus::Normal);
    Ok(())
}

/// A barrier entered from a task on unit 0 must wait for unit 1's barrier,
/// not complete against the resync unit 1 runs first.
#[test]
fn test_cancel_barrier_in_task_does_not_pair_with_resync() -> Result<()> {
    common::init_tracing();

    let fabric = InProcFabric::new(2);

    let results = common::spmd(
        &fabric,
        || Runtime::builder().worker_threads(2).phase_gating(false),
        |unit, rt| -> Result<_> {
            if unit == UnitId(0) {
                let entered = Arc::new(AtomicBool::new(false));
                {
                    let entered = Arc::clone(&entered);
                    rt.create_task(
                        move || {
                            entered.store(true, Ordering::SeqCst);
                            pgas_tasking::cancel_barrier()?;
                            Ok(())
                        },
                        &[],
                    )?;
                }

                let deadline = Instant::now() + Duration::from_secs(5);
                while !entered.load(Ordering::SeqCst) {
                    if Instant::now() > deadline {
                        return Err(anyhow!("barrier task never started"));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                // Let the task reach the reduction before the root resyncs.
                thread::sleep(Duration::from_millis(20));

                let summary = rt.task_complete()?;
                Ok((summary.aborted, rt.current_phase()))
            } else {
                for _ in 0..3 {
                    rt.phase_advance();
                }
                let summary = rt.task_complete()?;
                rt.cancel_barrier()?;
                Ok((summary.aborted, rt.current_phase()))
            }
        },
    );

    let mut aborted = Vec::new();
    for (result, status) in results {
        let (n, phase) = result?;
        assert_eq!(phase, 3);
        assert_eq!(status, ExitStatus::Cancelled);
        aborted.push(n);
    }
    assert_eq!(aborted, vec![1, 0]);
    Ok(())
}
