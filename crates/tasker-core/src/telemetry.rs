use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "TASKER_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Install a fmt subscriber for processes embedding the tasker.
///
/// Reads `TASKER_LOG`, then `RUST_LOG`, and falls back to `info`. Calling it
/// again, or after another subscriber was installed, is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::init_tracing;

    #[test]
    fn repeated_initialization_is_harmless() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialized twice");
    }
}
