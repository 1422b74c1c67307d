#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Macros for use with pgas-tasking.

mod entry;
mod parse;

/// Marks a function as a test running under a fresh tasking runtime.
///
/// The runtime is built on the test thread before the body runs. Once the
/// body returns, every task it created is drained with `task_complete` and
/// the runtime is finalized. The body may return anything a regular test
/// returns, `?` works as usual.
///
/// # Options
///
/// - `worker_threads`: number of worker threads, defaults to the number of
///   cpus (or `NUM_WORKERS`).
/// - `pool_capacity`: size of the task descriptor arena.
/// - `stack_size`: stack size of every task context, in bytes.
/// - `phase_gating`: `true` to hold tasks until their phase is made runnable.
///
/// # Usage
///
/// ```no_run
/// #[pgas_tasking::test(worker_threads = 2, pool_capacity = 16)]
/// fn my_test() -> anyhow::Result<()> {
///     pgas_tasking::create_task(|| Ok(()), &[])?;
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[pgas_tasking::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() -> anyhow::Result<()> {
///     let rt = pgas_tasking::Runtime::builder()
///         .worker_threads(2)
///         .pool_capacity(16)
///         .try_build()
///         .unwrap();
///
///     let result = (|| -> anyhow::Result<()> {
///         pgas_tasking::create_task(|| Ok(()), &[])?;
///         Ok(())
///     })();
///
///     pgas_tasking::task_complete().unwrap();
///     rt.fini();
///     result
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
