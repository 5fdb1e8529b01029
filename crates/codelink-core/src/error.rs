//! Error types for codelink-core.

use thiserror::Error;

use crate::channel::CodeChannel;

/// Main error type for codelink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed packet.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The firmware sent a header with an unexpected format code.
    #[error("bad format code: 0x{0:02x}")]
    BadFormat(u8),

    /// The firmware speaks an incompatible protocol version.
    #[error("bad protocol version: {0}")]
    BadProtocolVersion(u16),

    /// Header or data checksum mismatch.
    #[error("bad checksum: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadChecksum { expected: u32, actual: u32 },

    /// The firmware requested a resend of a packet that was never sent.
    #[error("bad resend packet id: {0}")]
    BadResendId(u16),

    /// A packet does not fit into the remaining transmit buffer.
    #[error("packet too long: {length} bytes, {remaining} remaining")]
    PacketTooLong { length: usize, remaining: usize },

    /// A wire string exceeds the protocol's length field.
    #[error("string too long: {length} bytes (max {max})")]
    StringTooLong { length: usize, max: usize },

    /// G-code could not be parsed.
    #[error("failed to parse code: {message}")]
    CodeParse { message: String },

    /// A code channel is shutting down and rejected the code.
    #[error("channel {0:?} is closed")]
    ChannelClosed(CodeChannel),

    /// The connection to the firmware was lost.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid state transition.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The operation was aborted because its code channel was invalidated.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this error is transient and retrying the transfer
    /// may help.
    ///
    /// Checksum mismatches and transport glitches are expected on a noisy
    /// SPI bus; the engine retries these up to its retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BadChecksum { .. }
                | Error::Transport { .. }
                | Error::ConnectionClosed
                | Error::Timeout
                | Error::Io(_)
        )
    }

    /// Returns true if this error is fatal and retrying won't help.
    ///
    /// Version mismatches and protocol violations indicate an incompatible
    /// or misbehaving peer; the interface tears down instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadProtocolVersion(_)
                | Error::BadResendId(_)
                | Error::Protocol { .. }
                | Error::InvalidState { .. }
        )
    }
}

/// Convenience result type for codelink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_bad_checksum() {
        let err = Error::BadChecksum {
            expected: 0xdeadbeef,
            actual: 0x12345678,
        };
        assert_eq!(
            err.to_string(),
            "bad checksum: expected 0xdeadbeef, got 0x12345678"
        );
    }

    #[test]
    fn error_display_bad_format() {
        assert_eq!(Error::BadFormat(0xc9).to_string(), "bad format code: 0xc9");
    }

    #[test]
    fn error_display_packet_too_long() {
        let err = Error::PacketTooLong {
            length: 9000,
            remaining: 128,
        };
        assert_eq!(err.to_string(), "packet too long: 9000 bytes, 128 remaining");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no spi device");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn transient_errors() {
        assert!(Error::BadChecksum {
            expected: 1,
            actual: 2
        }
        .is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(Error::Transport {
            message: "bus glitch".into()
        }
        .is_transient());

        assert!(!Error::BadProtocolVersion(99).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::BadProtocolVersion(99).is_fatal());
        assert!(Error::BadResendId(7).is_fatal());
        assert!(Error::Protocol {
            message: "bad".into()
        }
        .is_fatal());

        assert!(!Error::BadChecksum {
            expected: 1,
            actual: 2
        }
        .is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }
}
