#![allow(dead_code)]

use pgas_tasking::{Builder, InProcFabric, Runtime, Transport, UnitId};
use std::sync::{Arc, Once};
use std::thread;

static TRACING: Once = Once::new();

/// Installs a subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Runs `unit_main` on one thread per unit of `fabric`. Each thread owns a
/// runtime built from `builder`, and the exit status of its `fini` is
/// returned next to the result.
pub fn spmd<F, R>(
    fabric: &InProcFabric,
    builder: impl Fn() -> Builder,
    unit_main: F,
) -> Vec<(R, pgas_tasking::ExitStatus)>
where
    F: Fn(UnitId, &Runtime) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let unit_main = Arc::new(unit_main);

    let threads = fabric
        .transports()
        .into_iter()
        .map(|transport| {
            let unit = transport.my_unit();
            let builder = builder().transport(transport as Arc<dyn Transport>);
            let unit_main = Arc::clone(&unit_main);

            thread::Builder::new()
                .name(format!("unit-{unit}"))
                .spawn(move || {
                    let rt = builder.try_build().expect("runtime builds");
                    let result = unit_main(unit, &rt);
                    (result, rt.fini())
                })
                .expect("spawn unit thread")
        })
        .collect::<Vec<_>>();

    threads
        .into_iter()
        .map(|t| match t.join() {
            Ok(out) => out,
            Err(payload) => std::panic::resume_unwind(payload),
        })
        .collect()
}
