//! Kestrel CLI
//!
//! Commands:
//! - `kestrel run` - Start one loop per configured account
//! - `kestrel check` - Load and validate the configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-account exchange execution layer
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(author, version, about = "Safe order execution across many exchange accounts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the account loops until Ctrl-C
    Run {
        /// Directory holding default.toml and environment overrides
        #[arg(short, long, default_value = "config", env = "KESTREL_CONFIG_DIR")]
        config: PathBuf,
        /// Trade against the in-memory paper exchange
        #[arg(long)]
        paper: bool,
        /// Log a status line per account this often (seconds, 0 = never)
        #[arg(long, default_value = "60")]
        status_every: u64,
    },

    /// Validate configuration and print the account plan
    Check {
        #[arg(short, long, default_value = "config", env = "KESTREL_CONFIG_DIR")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from(["kestrel", "run", "--paper", "--config", "/etc/kestrel"]).unwrap();
        match cli.command {
            Commands::Run { config, paper, status_every } => {
                assert!(paper);
                assert_eq!(config, PathBuf::from("/etc/kestrel"));
                assert_eq!(status_every, 60);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["kestrel"]).is_err());
    }
}
