//! Protocol and configuration constants for codelink.

use std::time::Duration;

// =============================================================================
// Wire Protocol Constants
// =============================================================================

/// Magic byte identifying a valid transfer header.
pub const FORMAT_CODE: u8 = 0x5f;

/// Format code reported by the firmware while it is still booting.
pub const FORMAT_CODE_STANDALONE: u8 = 0x60;

/// Current SPI protocol version.
pub const PROTOCOL_VERSION: u16 = 4;

/// Size of the fixed transfer header in bytes.
pub const TRANSFER_HEADER_SIZE: usize = 16;

/// Size of a packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Size of the data section of a single transfer (per direction).
pub const BUFFER_SIZE: usize = 8192;

/// Maximum length of variable-size wire strings with a u8 length field.
pub const MAX_WIRE_STRING_LENGTH: usize = 254;

/// Wire packets and payloads are padded to this alignment.
pub const PACKET_ALIGNMENT: usize = 4;

// =============================================================================
// Transfer Engine Constants
// =============================================================================

/// Consecutive bad transfers tolerated before the connection is declared dead.
pub const MAX_SPI_RETRIES: usize = 3;

/// How long to wait for the firmware to become ready for a transfer.
pub const SPI_TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between connection attempts while the firmware is unavailable.
pub const SPI_CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// Pipeline Constants
// =============================================================================

/// Bounded queue depth per pipeline stage input.
pub const MAX_CODES_PER_INPUT: usize = 32;

/// Maximum buffered codes awaiting a firmware acknowledgement per channel.
pub const MAX_BUFFERED_CODES: usize = 32;

/// Upper bound on a single reply message kept in memory.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

// =============================================================================
// Default Values
// =============================================================================

/// Default Unix socket path for the IPC server.
pub const DEFAULT_SOCKET_PATH: &str = "/run/codelink.sock";

/// Default poll interval for the simulated firmware transport.
pub const SIM_POLL_INTERVAL: Duration = Duration::from_millis(20);
