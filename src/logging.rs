//! Tracing subscriber setup for the CLI
//!
//! `RUST_LOG` wins when set; otherwise the crate logs at `level`
//! (default `info`) and everything else at `warn`.

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

pub const DEFAULT_LEVEL: &str = "info";

pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = level.unwrap_or(DEFAULT_LEVEL);
    let directive = format!("warn,vm_mgmt={}", level)
        .parse::<EnvFilter>()
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {}", level, e)))?;
    Ok(directive)
}

/// Install the global subscriber. Call once from `main`.
pub fn init(level: Option<&str>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}
