//! Daemon configuration.
//!
//! Settings load from a JSON file and fall back to the compile-time
//! defaults in [`crate::constants`]. Field names in the file are camelCase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::CodeChannel;
use crate::constants::{
    DEFAULT_SOCKET_PATH, MAX_BUFFERED_CODES, MAX_CODES_PER_INPUT, MAX_SPI_RETRIES,
    SPI_CONNECT_RETRY_DELAY, SPI_TRANSFER_TIMEOUT,
};
use crate::error::{Error, Result};

/// Runtime settings for the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Path of the IPC socket.
    pub socket_path: PathBuf,
    /// Budget for consecutive failed transfer phases within one cycle.
    pub max_spi_retries: usize,
    /// Deadline for a single SPI exchange, in milliseconds.
    pub spi_transfer_timeout_ms: u64,
    /// Delay between connection attempts, in milliseconds.
    pub spi_connect_retry_delay_ms: u64,
    /// Queue capacity of each pipeline state.
    pub max_codes_per_input: usize,
    /// Codes the firmware stage may hold before backpressure kicks in.
    pub max_buffered_codes: usize,
    /// Channels that get a Marlin-style trailing "ok" on their replies.
    pub marlin_emulation_channels: Vec<CodeChannel>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_spi_retries: MAX_SPI_RETRIES,
            spi_transfer_timeout_ms: SPI_TRANSFER_TIMEOUT.as_millis() as u64,
            spi_connect_retry_delay_ms: SPI_CONNECT_RETRY_DELAY.as_millis() as u64,
            max_codes_per_input: MAX_CODES_PER_INPUT,
            max_buffered_codes: MAX_BUFFERED_CODES,
            marlin_emulation_channels: vec![CodeChannel::Usb, CodeChannel::Telnet],
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|err| Error::Codec {
            message: format!("invalid settings file {}: {err}", path.display()),
        })
    }

    pub fn spi_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.spi_transfer_timeout_ms)
    }

    pub fn spi_connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.spi_connect_retry_delay_ms)
    }

    /// True if replies on `channel` need the trailing "ok" marker.
    pub fn emulates_marlin(&self, channel: CodeChannel) -> bool {
        self.marlin_emulation_channels.contains(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let settings = Settings::default();
        assert_eq!(settings.max_spi_retries, MAX_SPI_RETRIES);
        assert_eq!(settings.max_codes_per_input, MAX_CODES_PER_INPUT);
        assert_eq!(settings.spi_transfer_timeout(), SPI_TRANSFER_TIMEOUT);
        assert!(settings.emulates_marlin(CodeChannel::Usb));
        assert!(!settings.emulates_marlin(CodeChannel::Http));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"maxSpiRetries": 5}"#).unwrap();
        assert_eq!(settings.max_spi_retries, 5);
        assert_eq!(settings.max_codes_per_input, MAX_CODES_PER_INPUT);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Settings::load(Path::new("/nonexistent/codelink.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
