//! Tracing subscriber setup for binaries and tests embedding the runtime.

/// Install a global compact stderr subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is a no-op.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_subscriber("warn");
        init_subscriber("debug");
        tracing::info!("still logging");
    }
}
