//! Tracing setup for binaries and tests embedding the core

use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g.
/// `"agent_recovery=info"`) is used. Returns false if a global subscriber was
/// already installed, so repeated calls are harmless.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("agent_recovery=debug");
        assert!(!init_tracing("agent_recovery=debug"));
    }
}
