use tracing_subscriber::EnvFilter;

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
/// Safe to call more than once; later calls are ignored.
pub fn init(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("homoprobe={level},reqwest=warn,hyper=warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
