//! Page framing: `[crc32q(payload): 4, LE][payload: 252]`.
//!
//! CRC-32Q (AIXM polynomial 0x814141ab, seed 0) over the payload bytes.

use crc::{Crc, CRC_32_AIXM};
use probe_proto::{PAGE_DATA_SIZE, PAGE_SIZE};

const CRC32Q: Crc<u32> = Crc::<u32>::new(&CRC_32_AIXM);

pub fn crc32q(data: &[u8]) -> u32 {
    CRC32Q.checksum(data)
}

/// Frame a payload into a full on-disk page.
pub fn encode_page(payload: &[u8; PAGE_DATA_SIZE]) -> [u8; PAGE_SIZE] {
    let mut page = [0u8; PAGE_SIZE];
    page[..4].copy_from_slice(&crc32q(payload).to_le_bytes());
    page[4..].copy_from_slice(payload);
    page
}

/// Verify a page and extract its payload. Returns `(expected, found)` CRC
/// values on mismatch; the caller attaches the page index.
pub fn decode_page(page: &[u8; PAGE_SIZE]) -> Result<[u8; PAGE_DATA_SIZE], (u32, u32)> {
    let stored = u32::from_le_bytes(page[..4].try_into().unwrap());
    let mut payload = [0u8; PAGE_DATA_SIZE];
    payload.copy_from_slice(&page[4..]);
    let computed = crc32q(&payload);
    if computed != stored {
        return Err((computed, stored));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32q_known_vector() {
        // CRC-32/AIXM check value for "123456789".
        assert_eq!(crc32q(b"123456789"), 0x3010_bf7f);
    }

    #[test]
    fn page_round_trip() {
        let mut payload = [0u8; PAGE_DATA_SIZE];
        payload[0] = 1;
        payload[100] = 0xab;
        let page = encode_page(&payload);
        assert_eq!(decode_page(&page).unwrap(), payload);
    }

    #[test]
    fn flipped_byte_detected() {
        let payload = [7u8; PAGE_DATA_SIZE];
        let mut page = encode_page(&payload);
        page[57] ^= 0x01;
        let (expected, found) = decode_page(&page).unwrap_err();
        assert_ne!(expected, found);
    }

    #[test]
    fn flipped_crc_byte_detected() {
        let payload = [7u8; PAGE_DATA_SIZE];
        let mut page = encode_page(&payload);
        page[0] ^= 0xff;
        assert!(decode_page(&page).is_err());
    }
}
