//! Logging bootstrap shared by the storevol binaries.

use env_logger::Env;

/// Initialise the global logger, honouring `RUST_LOG` overrides.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_secs()
        .try_init();
}
