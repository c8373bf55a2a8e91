use env_logger::Env;

/// Installs the process logger. Defaults to `warn` so the wrapped command's
/// terminal stays clean; `RUST_LOG` takes precedence.
pub fn setup_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();
}
