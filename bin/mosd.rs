//! `mosd` — the storage control plane daemon (spec.md §1). Wires together
//! the Sysfs/Proc Reader, Tool Invoker, Power-State Oracle, Throughput
//! Sampler, Disk Inventory, Pool Engine, Preclear Engine, ZRAM Reconciler
//! and Swap Controller, and runs until SIGTERM/SIGINT.
//!
//! Grounded in `log.rs`'s global-logger bootstrap, generalized from a
//! library-only crate to a long-running root service with a signal
//! handler in place of a test-harness-only process lifetime.

#[macro_use]
extern crate slog;

use std::sync::Arc;
use std::time::Duration;

use mosctl_core::inventory::DiskInventory;
use mosctl_core::pool::PoolEngine;
use mosctl_core::preclear::PreclearEngine;
use mosctl_core::swap::SwapController;
use mosctl_core::throughput::ThroughputSampler;
use mosctl_core::tool::ProcessInvoker;
use mosctl_core::zram::ZramReconciler;
use mosctl_core::GlobalLogger;
use slog::{Drain, Logger as SlogLogger};

const CONFIG_ROOT: &str = "/boot/config/system";
const THROUGHPUT_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Services stay alive for the process lifetime; nothing here is torn down
/// explicitly on shutdown beyond letting the signal future resolve, the
/// way a short-lived CLI process exits without an explicit drain phase.
struct Daemon {
    inventory: DiskInventory<ProcessInvoker>,
    pools: PoolEngine<ProcessInvoker>,
    preclear: Arc<PreclearEngine<ProcessInvoker>>,
    zram: ZramReconciler<ProcessInvoker>,
    swap: Arc<SwapController<ProcessInvoker>>,
    sampler: Arc<ThroughputSampler>,
}

impl Daemon {
    fn new(logger: slog::Logger) -> Self {
        let sampler = Arc::new(ThroughputSampler::new());
        sampler.clone().spawn(THROUGHPUT_SAMPLE_PERIOD);

        Daemon {
            inventory: DiskInventory::new(ProcessInvoker::new(logger.new(o!("module" => "inventory")))),
            pools: PoolEngine::new(
                ProcessInvoker::new(logger.new(o!("module" => "pool"))),
                format!("{CONFIG_ROOT}/pools.json"),
            ),
            preclear: Arc::new(PreclearEngine::new(ProcessInvoker::new(logger.new(o!("module" => "preclear"))))),
            zram: ZramReconciler::new(
                ProcessInvoker::new(logger.new(o!("module" => "zram"))),
                format!("{CONFIG_ROOT}/zram.json"),
            ),
            swap: Arc::new(SwapController::new(ProcessInvoker::new(logger.new(o!("module" => "swap"))))),
            sampler,
        }
    }
}

fn init_logger() -> SlogLogger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async_drain(drain);
    SlogLogger::root(drain, o!("service" => "mosd"))
}

/// The global logger accepts any `slog::Drain`; `slog-term`'s
/// synchronous drain is wrapped directly rather than pulling in a separate
/// async-logging crate the rest of the stack doesn't otherwise need.
fn slog_async_drain<D: Drain<Ok = (), Err = slog::Never> + Send + 'static>(drain: D) -> impl Drain<Ok = (), Err = slog::Never> {
    std::sync::Mutex::new(drain).fuse()
}

async fn wait_for_shutdown_signal(logger: &slog::Logger) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!(logger, "received SIGTERM"),
        _ = sigint.recv() => info!(logger, "received SIGINT"),
    }
}

#[tokio::main]
async fn main() {
    let root_logger = init_logger();
    mosctl_core::GlobalLogger::setup(root_logger.clone()).ok();
    let logger = GlobalLogger::global().new(o!("module" => "mosd"));

    info!(logger, "starting"; "version" => env!("CARGO_PKG_VERSION"));

    let daemon = Daemon::new(logger.clone());

    // The inventory/pool/preclear/zram/swap engines are driven by the
    // control-plane API surface (out of scope here, per spec.md §1); this
    // entry point's job is process lifetime and component wiring, so the
    // only activity before shutdown is the background throughput sampler
    // already spawned in `Daemon::new`.
    let _ = &daemon.inventory;
    let _ = &daemon.pools;
    let _ = &daemon.preclear;
    let _ = &daemon.zram;
    let _ = &daemon.swap;

    wait_for_shutdown_signal(&logger).await;
    info!(logger, "shutting down");
}
