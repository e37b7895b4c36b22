use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::agent::CleanupMode;

/// CertHub certificate agent
///
/// Installs client certificates delivered by CertHub into the current user's
/// certificate store and removes them again once their retention lapses.
#[derive(Parser, Debug)]
#[command(name = "certhub-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run certificate cleanup once and exit
    #[arg(long)]
    pub cleanup: bool,

    /// Cleanup mode (with --cleanup)
    #[arg(long, value_enum, default_value = "scheduled", requires = "cleanup")]
    pub mode: CleanupMode,

    /// One-shot task to delete after the cleanup run (with --cleanup)
    #[arg(long, requires = "cleanup")]
    pub task_name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory (defaults to the per-user local data directory)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pair this device with CertHub
    Setup {
        /// API base URL, e.g. https://certhub.example.com/api/v1
        #[arg(long)]
        api_url: String,

        #[arg(long)]
        device_id: String,

        /// Device token issued by the portal
        #[arg(long)]
        device_token: String,

        /// Portal URL (derived from the API URL if omitted)
        #[arg(long)]
        portal_url: Option<String>,

        /// Polling interval in seconds while jobs are pending
        #[arg(long)]
        active_interval: Option<u64>,

        /// Maximum polling interval in seconds when idle
        #[arg(long)]
        idle_interval: Option<u64>,
    },
    /// Run the agent in the foreground until interrupted
    Run,
    /// Show configuration and installed certificates
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_flags_parse() {
        let args = Args::try_parse_from([
            "certhub-agent",
            "--cleanup",
            "--mode",
            "keep_until",
            "--task-name",
            "certhub-agent-keep-until-aa11",
        ])
        .unwrap();

        assert!(args.cleanup);
        assert_eq!(args.mode, CleanupMode::KeepUntil);
        assert_eq!(args.task_name.as_deref(), Some("certhub-agent-keep-until-aa11"));
        assert!(args.command.is_none());
    }

    #[test]
    fn cleanup_defaults_to_scheduled_mode() {
        let args = Args::try_parse_from(["certhub-agent", "--cleanup"]).unwrap();
        assert_eq!(args.mode, CleanupMode::Scheduled);
    }

    #[test]
    fn mode_without_cleanup_is_rejected() {
        assert!(Args::try_parse_from(["certhub-agent", "--mode", "manual"]).is_err());
    }

    #[test]
    fn setup_takes_global_home() {
        let args = Args::try_parse_from([
            "certhub-agent",
            "setup",
            "--api-url",
            "https://h/api/v1",
            "--device-id",
            "d",
            "--device-token",
            "t",
            "--home",
            "/tmp/agent",
        ])
        .unwrap();

        assert_eq!(args.home, Some(PathBuf::from("/tmp/agent")));
        assert!(matches!(args.command, Some(Commands::Setup { .. })));
    }
}
