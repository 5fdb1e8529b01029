//! SPI wire protocol.
//!
//! Fixed-layout little-endian structs, every block aligned to 4 bytes for
//! DMA-friendly transfers on the firmware side. [`header`] holds the two
//! fixed headers, [`reader`] decodes firmware packets, [`writer`] encodes
//! host packets.

pub mod checksum;
pub mod header;
pub mod reader;
pub mod request;
pub mod writer;

pub use header::{PacketHeader, TransferHeader, TransferResponse};
pub use request::{FirmwareRequest, HostRequest};

use crate::constants::PACKET_ALIGNMENT;

/// Round a length up to the next packet alignment boundary.
pub const fn padded(length: usize) -> usize {
    (length + PACKET_ALIGNMENT - 1) & !(PACKET_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded(0), 0);
        assert_eq!(padded(1), 4);
        assert_eq!(padded(4), 4);
        assert_eq!(padded(21), 24);
        assert_eq!(padded(68), 68);
    }
}
