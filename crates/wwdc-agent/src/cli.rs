use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wwdc-agent", version, about = "Download WWDC session videos")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Database file (defaults to the application data directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Storage directory for downloaded media, for this run only
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load sessions from a catalogue JSON file
    Import { catalog: PathBuf },
    /// List catalogue sessions and whether their media is on disk
    Sessions,
    /// Download sessions and wait for them to finish
    Download {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Prefer the HLS stream over progressive files
        #[arg(long)]
        streaming: bool,
        /// Prefer SD over HD files
        #[arg(long)]
        sd: bool,
    },
    /// Delete downloaded media
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show persisted download records
    List {
        /// Only downloads that have not finished
        #[arg(long)]
        pending: bool,
    },
    /// Show settings, or set one
    Settings {
        key: Option<String>,
        value: Option<String>,
    },
    /// Restore downloads and watch the storage directory until Ctrl-C
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_flags() {
        let cli = Cli::parse_from([
            "wwdc-agent",
            "--storage",
            "/tmp/wwdc",
            "download",
            "a",
            "b",
            "--sd",
        ]);
        assert_eq!(cli.storage, Some(PathBuf::from("/tmp/wwdc")));
        match cli.command {
            Command::Download { ids, streaming, sd } => {
                assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
                assert!(!streaming);
                assert!(sd);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_download_requires_ids() {
        assert!(Cli::try_parse_from(["wwdc-agent", "download"]).is_err());
    }

    #[test]
    fn test_settings_arguments_are_optional() {
        let cli = Cli::parse_from(["wwdc-agent", "settings", "prefer_hd"]);
        assert!(matches!(
            cli.command,
            Command::Settings { key: Some(_), value: None }
        ));
    }
}
