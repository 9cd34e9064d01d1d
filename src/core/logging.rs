use env_logger::{Builder, Env};

/// Initialise the global logger once. `RUST_LOG` wins over `level`.
/// Output goes to stderr so stdout stays reserved for the JSON envelope.
pub fn init_logging(level: &str) {
    let env = Env::default().default_filter_or(level.to_string());
    let _ = Builder::from_env(env)
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .try_init();
}
