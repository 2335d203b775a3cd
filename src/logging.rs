// src/logging.rs

//! Logging setup for `auditflow` using `tracing` + `tracing-subscriber`.
//!
//! Where the filter comes from:
//! 1. `--log-level` CLI flag, applied to every target
//! 2. `AUDITFLOW_LOG`, a full filter spec such as
//!    `info,auditflow::reconcile=debug`
//! 3. `info`
//!
//! Logs go to stderr; stdout carries only the `validate` / `start --once`
//! reports.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "AUDITFLOW_LOG";

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    Ok(())
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::new(directive(level)));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => EnvFilter::try_new(spec).map_err(|e| anyhow!("invalid {LOG_ENV}: {e}")),
        None => Ok(EnvFilter::new("info")),
    }
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        // An unusable environment spec is ignored when the flag is given.
        assert!(build_filter(Some(LogLevel::Debug), Some("auditflow=loud")).is_ok());
    }

    #[test]
    fn environment_spec_is_validated() {
        assert!(build_filter(None, Some("info,auditflow::reconcile=debug")).is_ok());
        assert!(build_filter(None, Some("auditflow=loud")).is_err());
        assert!(build_filter(None, Some("  ")).is_ok());
    }
}
