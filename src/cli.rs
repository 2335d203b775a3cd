// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `auditflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "auditflow",
    version,
    about = "Drive website audit flows: scans, tests, case runs and notifications.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Auditflow.toml` in the current working directory. A missing
    /// file means "all defaults".
    #[arg(long, value_name = "PATH", default_value = "Auditflow.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `AUDITFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Parse and validate a flow definition, print its graph, run nothing.
    Validate {
        /// Flow definition (TOML, or JSON with a `.json` extension).
        flow: PathBuf,
    },

    /// Create a flow run and drive it with simulated handlers.
    Start {
        flow: PathBuf,

        /// Account the run is billed to.
        #[arg(long, value_name = "ID")]
        account: String,

        /// URL of the audited site.
        #[arg(long, value_name = "URL")]
        site: String,

        /// Site id; defaults to the URL.
        #[arg(long, value_name = "ID")]
        site_id: Option<String>,

        /// Exit once the queue is idle instead of serving until Ctrl-C.
        #[arg(long)]
        once: bool,
    },

    /// Run workers and the retry reconciler until Ctrl-C.
    Serve,

    /// Run a single reconciler sweep and print what it did.
    ///
    /// Only for a store no `serve` process is working on. This process cannot
    /// see another one's queue, so every job that process has queued or
    /// running looks lost and would be sent again.
    Reconcile,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_account_and_site() {
        let args = CliArgs::try_parse_from([
            "auditflow",
            "start",
            "flow.toml",
            "--account",
            "acme",
            "--site",
            "https://example.com",
            "--once",
        ])
        .unwrap();
        match args.command {
            Command::Start { account, once, site_id, .. } => {
                assert_eq!(account, "acme");
                assert!(once);
                assert!(site_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(CliArgs::try_parse_from(["auditflow", "start", "flow.toml"]).is_err());
    }
}
