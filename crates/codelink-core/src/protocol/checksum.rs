//! Transfer checksums.

use crate::error::{Error, Result};

/// CRC-32 over a byte slice, as used for both header and data checksums.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compare an expected checksum against the actual one.
pub fn verify(expected: u32, data: &[u8]) -> Result<()> {
    let actual = crc32(data);
    if expected == actual {
        Ok(())
    } else {
        Err(Error::BadChecksum { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // CRC-32/ISO-HDLC check value
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn empty_slice() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn verify_accepts_matching() {
        let data = b"payload";
        assert!(verify(crc32(data), data).is_ok());
    }

    #[test]
    fn verify_rejects_mismatch() {
        let err = verify(0xdeadbeef, b"payload").unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
        assert!(err.is_transient());
    }
}
