//! Fixed wire headers.

use bytes::{Buf, BufMut};

use crate::constants::{
    BUFFER_SIZE, FORMAT_CODE, FORMAT_CODE_STANDALONE, PACKET_HEADER_SIZE, PROTOCOL_VERSION,
    TRANSFER_HEADER_SIZE,
};
use crate::error::{Error, Result};

use super::checksum;

/// Response codes exchanged after header and data phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferResponse {
    Success = 1,
    BadFormat = 2,
    BadProtocolVersion = 3,
    BadDataLength = 4,
    BadHeaderChecksum = 5,
    BadDataChecksum = 6,
    /// The peer saw garbage where it expected a response; restart the cycle.
    BadResponse = 0xfefe_fefe,
}

impl TransferResponse {
    pub fn from_wire(value: u32) -> Option<TransferResponse> {
        match value {
            1 => Some(TransferResponse::Success),
            2 => Some(TransferResponse::BadFormat),
            3 => Some(TransferResponse::BadProtocolVersion),
            4 => Some(TransferResponse::BadDataLength),
            5 => Some(TransferResponse::BadHeaderChecksum),
            6 => Some(TransferResponse::BadDataChecksum),
            0xfefe_fefe => Some(TransferResponse::BadResponse),
            _ => None,
        }
    }
}

/// Header exchanged at the start of every transfer cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub format_code: u8,
    pub num_packets: u8,
    pub protocol_version: u16,
    pub sequence_number: u16,
    pub data_length: u16,
    pub checksum_data: u32,
    pub checksum_header: u32,
}

impl TransferHeader {
    pub fn new(num_packets: u8, sequence_number: u16, data_length: u16) -> Self {
        Self {
            format_code: FORMAT_CODE,
            num_packets,
            protocol_version: PROTOCOL_VERSION,
            sequence_number,
            data_length,
            checksum_data: 0,
            checksum_header: 0,
        }
    }

    /// Fill in both checksums for the given data section.
    pub fn finalize(&mut self, data: &[u8]) {
        self.checksum_data = checksum::crc32(data);
        self.checksum_header = 0;
        let encoded = self.encode();
        self.checksum_header = checksum::crc32(&encoded[..12]);
    }

    pub fn encode(&self) -> [u8; TRANSFER_HEADER_SIZE] {
        let mut buf = [0u8; TRANSFER_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u8(self.format_code);
        cursor.put_u8(self.num_packets);
        cursor.put_u16_le(self.protocol_version);
        cursor.put_u16_le(self.sequence_number);
        cursor.put_u16_le(self.data_length);
        cursor.put_u32_le(self.checksum_data);
        cursor.put_u32_le(self.checksum_header);
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<TransferHeader> {
        if src.len() < TRANSFER_HEADER_SIZE {
            return Err(Error::Codec {
                message: format!("transfer header truncated at {} bytes", src.len()),
            });
        }
        Ok(TransferHeader {
            format_code: src.get_u8(),
            num_packets: src.get_u8(),
            protocol_version: src.get_u16_le(),
            sequence_number: src.get_u16_le(),
            data_length: src.get_u16_le(),
            checksum_data: src.get_u32_le(),
            checksum_header: src.get_u32_le(),
        })
    }

    /// Validate everything that can be checked without the data section.
    pub fn validate(&self) -> Result<()> {
        let encoded = self.encode();
        let actual = checksum::crc32(&encoded[..12]);
        if self.checksum_header != actual {
            return Err(Error::BadChecksum {
                expected: self.checksum_header,
                actual,
            });
        }
        if self.format_code == FORMAT_CODE_STANDALONE {
            return Err(Error::Protocol {
                message: "firmware is operating in standalone mode".into(),
            });
        }
        if self.format_code != FORMAT_CODE {
            return Err(Error::BadFormat(self.format_code));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(Error::BadProtocolVersion(self.protocol_version));
        }
        if self.data_length as usize > BUFFER_SIZE {
            return Err(Error::Protocol {
                message: format!("data length {} exceeds buffer", self.data_length),
            });
        }
        Ok(())
    }

    /// Validate the data section against the data checksum.
    pub fn verify_data(&self, data: &[u8]) -> Result<()> {
        checksum::verify(self.checksum_data, &data[..self.data_length as usize])
    }
}

/// Header preceding every packet in the data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Request type, interpreted per transfer direction.
    pub request: u16,
    /// Monotonic packet id, used for resend correlation.
    pub id: u16,
    /// Payload length in bytes, excluding padding.
    pub length: u16,
    /// For resend requests: the id of the packet to retransmit.
    pub resend_packet_id: u16,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u16_le(self.request);
        cursor.put_u16_le(self.id);
        cursor.put_u16_le(self.length);
        cursor.put_u16_le(self.resend_packet_id);
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<PacketHeader> {
        if src.len() < PACKET_HEADER_SIZE {
            return Err(Error::Codec {
                message: format!("packet header truncated at {} bytes", src.len()),
            });
        }
        Ok(PacketHeader {
            request: src.get_u16_le(),
            id: src.get_u16_le(),
            length: src.get_u16_le(),
            resend_packet_id: src.get_u16_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_header_layout() {
        let mut header = TransferHeader::new(4, 12345, 1436);
        header.finalize(&[]);
        let encoded = header.encode();

        assert_eq!(encoded[0], FORMAT_CODE);
        assert_eq!(encoded[1], 4);
        assert_eq!(
            u16::from_le_bytes([encoded[2], encoded[3]]),
            PROTOCOL_VERSION
        );
        assert_eq!(u16::from_le_bytes([encoded[4], encoded[5]]), 12345);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 1436);
    }

    #[test]
    fn transfer_header_roundtrip() {
        let mut header = TransferHeader::new(2, 7, 100);
        header.finalize(b"some data");
        let decoded = TransferHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn finalized_header_validates() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.finalize(&[]);
        header.validate().unwrap();
    }

    #[test]
    fn corrupt_header_checksum_is_rejected() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.finalize(&[]);
        header.sequence_number ^= 1;
        assert!(matches!(
            header.validate(),
            Err(Error::BadChecksum { .. })
        ));
    }

    #[test]
    fn wrong_format_code_is_rejected() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.format_code = 0xc9;
        header.finalize(&[]);
        // finalize recomputes the header checksum, so the format check fires
        assert!(matches!(header.validate(), Err(Error::BadFormat(0xc9))));
    }

    #[test]
    fn standalone_firmware_is_rejected_with_a_clear_error() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.format_code = FORMAT_CODE_STANDALONE;
        header.finalize(&[]);
        let err = header.validate().unwrap_err();
        assert!(err.to_string().contains("standalone"));
    }

    #[test]
    fn wrong_protocol_version_is_rejected() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.protocol_version = 99;
        header.finalize(&[]);
        assert!(matches!(
            header.validate(),
            Err(Error::BadProtocolVersion(99))
        ));
    }

    #[test]
    fn oversized_data_length_is_rejected() {
        let mut header = TransferHeader::new(1, 1, 0);
        header.data_length = (BUFFER_SIZE + 1) as u16;
        header.finalize(&[]);
        assert!(matches!(header.validate(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn data_verification() {
        let data = b"hello padding...";
        let mut header = TransferHeader::new(1, 1, data.len() as u16);
        header.finalize(data);
        header.verify_data(data).unwrap();
        assert!(header.verify_data(b"hello padding!!!").is_err());
    }

    #[test]
    fn packet_header_layout() {
        let header = PacketHeader {
            request: 2,
            id: 234,
            length: 54,
            resend_packet_id: 0,
        };
        let encoded = header.encode();
        assert_eq!(u16::from_le_bytes([encoded[0], encoded[1]]), 2);
        assert_eq!(u16::from_le_bytes([encoded[2], encoded[3]]), 234);
        assert_eq!(u16::from_le_bytes([encoded[4], encoded[5]]), 54);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 0);
        assert_eq!(PacketHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(TransferHeader::decode(&[0u8; 8]).is_err());
        assert!(PacketHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn response_codes_roundtrip() {
        for code in [
            TransferResponse::Success,
            TransferResponse::BadFormat,
            TransferResponse::BadProtocolVersion,
            TransferResponse::BadDataLength,
            TransferResponse::BadHeaderChecksum,
            TransferResponse::BadDataChecksum,
            TransferResponse::BadResponse,
        ] {
            assert_eq!(TransferResponse::from_wire(code as u32), Some(code));
        }
        assert_eq!(TransferResponse::from_wire(0), None);
    }
}
