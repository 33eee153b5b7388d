//! Logging setup for the CLI.
//!
//! Filter directive precedence: `--log-level` flag, then `KE_LOG`, then
//! `RUST_LOG`, then `warn`. Logs go to stderr; stdout carries results only.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive.
pub const LOG_ENV_VAR: &str = "KE_LOG";

const DEFAULT_DIRECTIVE: &str = "warn";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Pick the filter directive from the flag and an environment lookup.
pub fn resolve_directive(
    explicit: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| env(LOG_ENV_VAR))
        .or_else(|| env("RUST_LOG"))
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string())
}

/// Install the global subscriber. `json` switches to JSON lines.
pub fn init_logging(level: Option<&str>, json: bool) -> Result<(), LoggingError> {
    let directive = resolve_directive(level, |name| std::env::var(name).ok());
    let filter = EnvFilter::try_new(&directive).map_err(|source| LoggingError::Filter {
        directive: directive.clone(),
        source,
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_flag_wins() {
        let d = resolve_directive(Some("debug"), env_of(&[(LOG_ENV_VAR, "info")]));
        assert_eq!(d, "debug");
    }

    #[test]
    fn test_ke_log_before_rust_log() {
        let d = resolve_directive(None, env_of(&[("RUST_LOG", "trace"), (LOG_ENV_VAR, "info")]));
        assert_eq!(d, "info");
        let d = resolve_directive(None, env_of(&[("RUST_LOG", "trace")]));
        assert_eq!(d, "trace");
    }

    #[test]
    fn test_default_is_warn() {
        assert_eq!(resolve_directive(None, env_of(&[])), "warn");
    }
}
