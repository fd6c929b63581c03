use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, writing to stderr.
///
/// With no `-v`, the filter comes from `RUST_LOG` and defaults to `info`.
/// One `-v` forces `debug`, two or more force `trace`.
///
/// # Errors
///
/// Returns an error for an unparsable filter or if a subscriber is
/// already installed.
pub fn setup_logging(verbose: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?,
        1 => EnvFilter::try_new("debug")?,
        _ => EnvFilter::try_new("trace")?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose > 0)
        .with_writer(std::io::stderr)
        .try_init()
}
