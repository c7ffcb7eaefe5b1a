//! File-based logging with daily rotation plus a console layer.
//!
//! Filtering uses `RUST_LOG` (e.g. `RUST_LOG=keeper_storage=debug,info`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keep the returned guard alive for the process lifetime; dropping it
/// stops the background log writer.
pub fn init_logging(log_dir: &Path, console: bool) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "keeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    if console {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    }
    guard
}
