//! Streamcache CLI - Command-line interface
//!
//! Inspects piece caches that a streaming server left on disk.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use streamcache_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "streamcache")]
#[command(about = "Inspect BitTorrent streaming piece caches")]
struct Cli {
    /// Console log level; the log file traces the cache crates regardless
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace log
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), &cli.logs_dir) {
        eprintln!("Failed to initialize logging: {e}");
    }

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_dir_flag() {
        let args = ["streamcache", "inspect", "--save-path", "cache", "--hash", "ab"];
        let extra = ["--piece-length", "1024", "--piece-count", "4"];

        let cli = Cli::try_parse_from(args.iter().chain(extra.iter())).unwrap();
        assert_eq!(cli.logs_dir, PathBuf::from("logs"));

        let custom = ["streamcache", "--logs-dir", "/tmp/streamcache-logs"];
        let cli = Cli::try_parse_from(custom.iter().chain(args[1..].iter()).chain(extra.iter()))
            .unwrap();
        assert_eq!(cli.logs_dir, PathBuf::from("/tmp/streamcache-logs"));
    }
}
