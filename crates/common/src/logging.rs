//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the process
///
/// `RUST_LOG` wins over `default_level`. Installing a second subscriber
/// returns [`crate::Error::Config`].
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // The first call may race other tests in this binary; only the
        // second call's outcome is deterministic.
        let _ = setup_logging("debug");
        assert!(matches!(
            setup_logging("debug"),
            Err(crate::Error::Config(_))
        ));
    }
}
