mod common;

use anyhow::Result;
use pgas_tasking::{
    Dependency, ExitStatus, GlobalRef, Runtime, TaskingError, UnitId, create_task, current_task_id,
    should_abort,
};
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_api_without_runtime() {
    assert!(matches!(
        pgas_tasking::task_complete(),
        Err(TaskingError::NoRuntime)
    ));
    assert!(matches!(
        create_task(|| Ok(()), &[]),
        Err(TaskingError::NoRuntime)
    ));
    assert!(!should_abort());
    assert_eq!(current_task_id(), None);
}

#[test]
#[should_panic(expected = "worker_threads must be greater than 0")]
fn test_zero_workers_is_rejected() {
    let _ = Runtime::builder().worker_threads(0);
}

#[rstest]
#[case::empty(0)]
#[case::below_guard(1024)]
#[should_panic(expected = "stack_size must be at least")]
fn test_small_stack_is_rejected(#[case] bytes: usize) {
    let _ = Runtime::builder().stack_size(bytes);
}

#[test]
fn test_runtime_lifecycle() -> Result<()> {
    common::init_tracing();

    let rt = Runtime::builder().worker_threads(2).try_build()?;
    assert_eq!(rt.team_size(), 1);
    assert_eq!(rt.my_unit(), UnitId(0));

    let ran = Arc::new(AtomicUsize::new(0));
    for i in 0..32u64 {
        let ran = Arc::clone(&ran);
        rt.create_task(
            move || {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            &[Dependency::write(GlobalRef::new(UnitId(0), 0, i % 4))],
        )?;
    }

    let summary = rt.task_complete()?;
    assert_eq!(summary.completed, 32);
    assert_eq!(ran.load(Ordering::Relaxed), 32);

    let stats = rt.stats();
    assert_eq!(stats.live_tasks, 0);
    assert_eq!(stats.contexts.outstanding(), 0);

    assert_eq!(rt.fini(), ExitStatus::Normal);

    // The thread can host a new runtime afterwards.
    let rt = Runtime::builder().worker_threads(1).try_build()?;
    assert_eq!(rt.fini().code(), 0);
    Ok(())
}

#[test]
fn test_fini_drains_leftover_tasks() -> Result<()> {
    let rt = Runtime::builder().worker_threads(1).try_build()?;
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let ran = Arc::clone(&ran);
        rt.create_task(
            move || {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            &[],
        )?;
    }

    assert_eq!(rt.fini(), ExitStatus::Normal);
    assert_eq!(ran.load(Ordering::Relaxed), 8);
    Ok(())
}

#[pgas_tasking::test(worker_threads = 2)]
fn test_task_ids_are_unique() -> Result<()> {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut created = Vec::new();
    for _ in 0..16 {
        let seen = Arc::clone(&seen);
        created.push(create_task(
            move || {
                if let Some(id) = current_task_id() {
                    seen.lock().push(id);
                }
                Ok(())
            },
            &[],
        )?);
    }
    pgas_tasking::task_complete()?;

    let mut seen = seen.lock().clone();
    seen.sort();
    created.sort();
    assert_eq!(seen, created);
    seen.dedup();
    assert_eq!(seen.len(), 16);
    Ok(())
}
