//! Tracing setup shared by the CLI and embedding hosts.
//!
//! Filter priority: `KEEL_LOG`, then the caller's directive (CLI flag or
//! config), then `info`. Logs go to stderr so stdout stays usable for
//! command output and the service protocol.

use tracing_subscriber::EnvFilter;

use crate::config::LOG_ENV;

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global subscriber. Returns false when one was already
/// installed, which is harmless.
pub fn init_logging(directive: Option<&str>) -> bool {
    let filter = resolve_filter(std::env::var(LOG_ENV).ok().as_deref(), directive);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

fn resolve_filter(from_env: Option<&str>, directive: Option<&str>) -> EnvFilter {
    [from_env, directive]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .find_map(|candidate| EnvFilter::try_new(candidate).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::resolve_filter;

    #[test]
    fn environment_wins_over_directive() {
        let filter = resolve_filter(Some("keel_core=trace"), Some("warn"));
        assert_eq!(filter.to_string(), "keel_core=trace");
    }

    #[test]
    fn unparsable_values_fall_through() {
        let filter = resolve_filter(Some("keel_core=loud"), Some("debug"));
        assert_eq!(filter.to_string(), "debug");
        assert_eq!(resolve_filter(None, None).to_string(), "info");
    }
}
