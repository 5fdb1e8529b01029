//! Server CLI implementation.
//!
//! Provides command-line argument parsing for the codelink daemon.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use codelink_core::Settings;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for codelink_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => codelink_core::LogFormat::Text,
            CliLogFormat::Json => codelink_core::LogFormat::Json,
        }
    }
}

/// codelinkd - control daemon bridging G-code clients and the firmware.
#[derive(Debug, Parser)]
#[command(
    name = "codelinkd",
    version,
    about = "codelink daemon - code pipeline and SPI firmware link"
)]
pub struct Cli {
    /// Settings file (JSON)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Unix socket to listen on (overrides the settings file)
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Resolve the effective settings: file, then CLI overrides.
    pub fn settings(&self) -> codelink_core::Result<Settings> {
        let mut settings = match &self.config_file {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(path) = &self.socket_path {
            settings.socket_path = path.clone();
        }
        Ok(settings)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Verify the CLI configuration is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn default_values() {
        let cli = Cli::try_parse_from(["codelinkd"]).unwrap();
        assert!(cli.config_file.is_none());
        assert!(cli.socket_path.is_none());
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, CliLogFormat::Text);

        let settings = cli.settings().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn socket_override_wins() {
        let cli = Cli::try_parse_from(["codelinkd", "-s", "/tmp/test.sock"]).unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.socket_path, PathBuf::from("/tmp/test.sock"));
    }

    #[test]
    fn parse_verbosity() {
        let cli = Cli::try_parse_from(["codelinkd", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn parse_log_format() {
        let cli = Cli::try_parse_from(["codelinkd", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["codelinkd", "-c", "/nonexistent/codelink.json"]).unwrap();
        assert!(cli.settings().is_err());
    }
}
