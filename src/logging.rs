use tracing_subscriber::{filter::ParseError, EnvFilter};

// Installs the global fmt subscriber on stderr. RUST_LOG wins over `level`
// when set. A second call is a no-op.
pub fn init_logging(level: &str) -> Result<(), ParseError> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}
