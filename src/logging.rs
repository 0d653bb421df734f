use slog::Drain;

/// Root logger writing to stdout through an async drain. Every record carries `"App" => name`.
pub fn create_root_logger_for_stdout(name: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stdout().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("App" => name.to_string()))
}
