use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking log writers flushing. Held by `main` for the whole
/// run; dropping it flushes whatever is still buffered.
pub struct LogGuards {
    _file: WorkerGuard,
    _stderr: WorkerGuard,
}

/// Wire up tracing for the gateway. stdout is the operation-response channel,
/// so everything the process says about itself goes to stderr plus a
/// daily-rolled file under `log_dir`. The file gets the verbose form
/// (targets, thread ids); stderr stays terse for a human watching the
/// process. `RUST_LOG` overrides the configured level.
pub fn init(log_dir: &str, level: &str) -> anyhow::Result<LogGuards> {
    std::fs::create_dir_all(log_dir)?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "sandboxd.log"));
    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(
            fmt::layer()
                .with_writer(stderr_writer)
                .with_ansi(true)
                .with_target(false),
        )
        .init();

    tracing::info!("logging to stderr and {log_dir}/sandboxd.log");

    Ok(LogGuards {
        _file: file_guard,
        _stderr: stderr_guard,
    })
}
