//! Command-line surface.
//!
//! One binary, six subcommands. `start` streams human-readable log lines;
//! everything else prints structured JSON for scripting.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "auricle")]
#[command(about = "Continuous speech capture, transcription and delivery agent")]
#[command(version)]
pub struct Cli {
    /// JSON config file applied on top of the environment
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the capture → transcribe → deliver pipeline (default)
    Start,
    /// One-shot snapshot of queue, transcripts and connectivity
    Status,
    /// Exercise the microphone, the speech backend and the remote API
    Test,
    /// Show queue statistics, pending and recent items
    Queue,
    /// Reset a queue item's attempts and redeliver it
    Retry {
        /// Queue item to retry
        #[arg(long = "item-id")]
        item_id: String,
    },
    /// Remove sent queue items and transcript files older than the cutoff
    Cleanup {
        /// Age cutoff in days
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_args_parse() {
        let cli = Cli::parse_from(["auricle", "--verbose", "--config", "/tmp/auricle.json", "status"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/auricle.json")));
        assert!(matches!(cli.command, Some(Commands::Status)));
    }

    #[test]
    fn no_subcommand_defaults_to_start() {
        let cli = Cli::parse_from(["auricle"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn retry_requires_item_id() {
        assert!(Cli::try_parse_from(["auricle", "retry"]).is_err());
        let cli = Cli::parse_from(["auricle", "retry", "--item-id", "tq-1-aa"]);
        match cli.command {
            Some(Commands::Retry { item_id }) => assert_eq!(item_id, "tq-1-aa"),
            _ => panic!("expected retry command"),
        }
    }

    #[test]
    fn cleanup_days_defaults_to_thirty() {
        let cli = Cli::parse_from(["auricle", "cleanup"]);
        match cli.command {
            Some(Commands::Cleanup { days }) => assert_eq!(days, 30),
            _ => panic!("expected cleanup command"),
        }
    }
}
