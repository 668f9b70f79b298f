use tracing_subscriber::EnvFilter;

/// Subsequent calls are no-ops, so tests and binaries can both call it.
pub fn init() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init();
}
