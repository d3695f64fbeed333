//! Command-line interface for airband-relay
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Push-to-talk radio channel relay
#[derive(Parser, Debug)]
#[command(
    name = "airband-relay",
    version,
    about = "Relays channelized radio audio to disk and a voice backend"
)]
pub struct Cli {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence after which a transmission ends. Examples: 120ms, 1s
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub ptt_timeout: Option<Duration>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Start the channelizers and relay every channel (default)
    Run,

    /// Load and validate the configuration, then print the channel summary
    CheckConfig,

    /// Decode an emissions designator such as 11K2F3E
    Designator {
        /// Designator code
        code: String,
    },
}

/// Parse a duration; a bare number is milliseconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

impl Cli {
    /// Default log filter for the verbosity flags, used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_command() {
        let cli = Cli::try_parse_from(["airband-relay"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert!(cli.ptt_timeout.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn test_parse_verbose_levels() {
        let cli = Cli::try_parse_from(["airband-relay", "-v"]).unwrap();
        assert_eq!(cli.log_filter(), "debug");
        let cli = Cli::try_parse_from(["airband-relay", "-vv"]).unwrap();
        assert_eq!(cli.log_filter(), "trace");
    }

    #[test]
    fn test_quiet_wins_over_verbose() {
        let cli = Cli::try_parse_from(["airband-relay", "-q", "-v"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn test_parse_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["airband-relay", "check-config", "--config", "/tmp/a.toml"])
                .unwrap();
        assert_eq!(cli.command, Some(Commands::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));
    }

    #[test]
    fn test_parse_designator() {
        let cli = Cli::try_parse_from(["airband-relay", "designator", "11K2F3E"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Designator {
                code: "11K2F3E".to_string()
            })
        );
    }

    #[test]
    fn test_parse_ptt_timeout() {
        let cli = Cli::try_parse_from(["airband-relay", "--ptt-timeout", "150ms"]).unwrap();
        assert_eq!(cli.ptt_timeout, Some(Duration::from_millis(150)));

        let cli = Cli::try_parse_from(["airband-relay", "--ptt-timeout", "2s"]).unwrap();
        assert_eq!(cli.ptt_timeout, Some(Duration::from_secs(2)));

        let cli = Cli::try_parse_from(["airband-relay", "--ptt-timeout", "200"]).unwrap();
        assert_eq!(cli.ptt_timeout, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_parse_invalid_ptt_timeout() {
        assert!(Cli::try_parse_from(["airband-relay", "--ptt-timeout", "soon"]).is_err());
    }
}
