use chrono::Utc;
use slog::Drain;
use std::fs::OpenOptions;

/// Terminal logger for watching a simulated cluster live. Attach per-replica context via
/// `logger.new(slog::o!("ReplicaId" => ...))`; `SimCluster` does this for each node it spawns.
pub fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

/// File logger for runs too chatty for a terminal. One timestamped file per call.
///
/// Panics if the file can't be created; only tests call this.
pub fn create_root_logger_for_file(directory_prefix: &str, run_name: &str) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    std::fs::create_dir_all(directory_prefix).unwrap();
    let log_path = format!("{}/{}_{}.log", directory_prefix, run_name, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

/// Swallows everything. The default for assertion-driven tests.
pub fn create_root_logger_for_discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
