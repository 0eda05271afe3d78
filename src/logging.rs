//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set. `verbose` raises the
//! level for this crate to `debug` without touching other targets.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Build the env filter for `level`.
pub fn env_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = if verbose {
        format!("{level},visx_ctrl=debug")
    } else {
        level.to_string()
    };
    EnvFilter::try_new(&directives).map_err(|e| anyhow!("invalid log filter '{}': {}", directives, e))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(level: &str, json: bool, verbose: bool) -> Result<()> {
    let filter = env_filter(level, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_adds_crate_directive() {
        // Only meaningful when RUST_LOG is unset
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = env_filter("info", true).unwrap();
        assert!(filter.to_string().contains("visx_ctrl=debug"));
        assert!(env_filter("not a level!!", false).is_err());
    }
}
