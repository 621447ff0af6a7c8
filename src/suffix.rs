//! Plain DFU file suffix (spec.md §4.6): a 16-byte trailer carrying a CRC32
//! and optional vendor/product/release IDs, present on every plain-DFU
//! firmware file and also appended (covering the whole DfuSe container) to
//! DfuSe files.

use byteorder::{ByteOrder, BE};
use log::warn;
use std::io::{Read, Seek, SeekFrom};

use crate::error::Error;

/// A 16-bit ID that may be unset (`0xffff` on the wire means "don't care").
#[derive(Debug, Copy, Clone)]
pub struct OptionalId(pub Option<u16>);

impl OptionalId {
    pub fn matches(&self, cmp: u16) -> bool {
        match self.0 {
            None => true,
            Some(id) => id == cmp,
        }
    }
}

impl From<u16> for OptionalId {
    fn from(val: u16) -> Self {
        OptionalId(match val {
            0xffff => None,
            i => Some(i),
        })
    }
}

/// Decoded contents of a plain DFU file's 16-byte suffix.
#[derive(Debug)]
pub struct DfuSuffix {
    pub vendor_id: OptionalId,
    pub product_id: OptionalId,
    pub release_number: OptionalId,
    pub bcd_dfu: u16,
    pub expected_crc: u32,
    pub actual_crc: u32,
    pub payload_length: u64,
}

impl DfuSuffix {
    pub fn has_valid_crc(&self) -> bool {
        self.actual_crc == self.expected_crc
    }

    pub fn ensure_valid_crc(&self) -> Result<(), Error> {
        if self.has_valid_crc() {
            Ok(())
        } else {
            Err(Error::Data(format!(
                "bad CRC32 checksum: expected {:#010x}, got {:#010x}",
                self.expected_crc, self.actual_crc
            )))
        }
    }
}

/// The DFU CRC algorithm: a bitwise NOT of IEEE CRC32, per spec.md §4.6.
fn compute_crc(file: &mut impl Read) -> std::io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 4096];
    loop {
        let len = file.read(&mut buf)?;
        if len == 0 {
            break;
        }
        hasher.update(&buf[0..len]);
    }
    Ok(!hasher.finalize())
}

const MIN_SUFFIX_LEN: u8 = 0x10;
const MIN_DFU_BCD: u16 = 0x0100;

/// Parses the suffix of a DFU file and computes the actual CRC over
/// everything but the trailing CRC field. Leaves `file`'s cursor at the
/// start of the payload on return.
pub fn parse(file: &mut (impl Read + Seek)) -> Result<DfuSuffix, Error> {
    let file_len = file.seek(SeekFrom::End(0))?;
    if file_len < MIN_SUFFIX_LEN as u64 {
        return Err(Error::Data(format!(
            "file is shorter than a DFU suffix: expected at least {MIN_SUFFIX_LEN} bytes"
        )));
    }

    let mut suffix = [0u8; MIN_SUFFIX_LEN as usize];
    file.seek(SeekFrom::End(-(MIN_SUFFIX_LEN as i64)))?;
    file.read_exact(&mut suffix)?;
    suffix.reverse(); // The whole suffix is byte-swapped on disk.

    if &suffix[5..=7] != b"DFU" {
        return Err(Error::Data(
            "DFU signature is not present; is this really a DFU file?".into(),
        ));
    }

    let suffix_len = suffix[4];
    if suffix_len < MIN_SUFFIX_LEN {
        return Err(Error::Data(format!(
            "DFU suffix is shorter than allowed: expected at least {MIN_SUFFIX_LEN} bytes, got {suffix_len}"
        )));
    } else if suffix_len > MIN_SUFFIX_LEN {
        warn!(
            "{} extra bytes in DFU suffix, ignoring",
            suffix_len - MIN_SUFFIX_LEN
        );
    }

    let payload_length = file_len.checked_sub(suffix_len as u64).ok_or_else(|| {
        Error::Data(format!(
            "DFU suffix is longer than the file: suffix is {suffix_len} bytes, file is {file_len}"
        ))
    })?;

    let bcd_dfu = BE::read_u16(&suffix[8..10]);
    if bcd_dfu < MIN_DFU_BCD {
        return Err(Error::Data(format!(
            "DFU specification version too old: expected at least 1.0, got {}.{:02x}",
            bcd_dfu >> 8,
            bcd_dfu & 0xff
        )));
    }

    file.seek(SeekFrom::Start(0))?;
    let actual_crc = compute_crc(&mut file.take(file_len - 4))?;
    let expected_crc = BE::read_u32(&suffix[0..4]);

    file.seek(SeekFrom::Start(0))?;

    Ok(DfuSuffix {
        vendor_id: BE::read_u16(&suffix[10..12]).into(),
        product_id: BE::read_u16(&suffix[12..14]).into(),
        release_number: BE::read_u16(&suffix[14..16]).into(),
        bcd_dfu,
        expected_crc,
        actual_crc,
        payload_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_suffix(vendor: u16, product: u16, release: u16, bcd_dfu: u16, crc: u32) -> [u8; 16] {
        let mut s = [0u8; 16];
        BE::write_u32(&mut s[0..4], crc);
        s[4] = 0x10;
        s[5..8].copy_from_slice(b"DFU");
        BE::write_u16(&mut s[8..10], bcd_dfu);
        BE::write_u16(&mut s[10..12], vendor);
        BE::write_u16(&mut s[12..14], product);
        BE::write_u16(&mut s[14..16], release);
        s.reverse();
        s
    }

    #[test]
    fn parses_valid_suffix_with_optional_ids_unset() {
        let payload = [0xaau8, 0xbb, 0xcc];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = !hasher.finalize();

        let mut file = Vec::new();
        file.extend_from_slice(&payload);
        file.extend_from_slice(&build_suffix(0xffff, 0xffff, 0xffff, 0x0100, crc));

        let mut cursor = Cursor::new(file);
        let suffix = parse(&mut cursor).unwrap();
        assert!(suffix.has_valid_crc());
        assert_eq!(suffix.payload_length, 3);
        assert!(suffix.vendor_id.0.is_none());
        assert!(suffix.vendor_id.matches(0x1234));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut s = build_suffix(0xffff, 0xffff, 0xffff, 0x0100, 0);
        s.reverse();
        s[5..8].copy_from_slice(b"XXX");
        s.reverse();
        let mut cursor = Cursor::new(s.to_vec());
        assert!(parse(&mut cursor).is_err());
    }

    #[test]
    fn detects_crc_mismatch() {
        let payload = [1u8, 2, 3];
        let mut file = Vec::new();
        file.extend_from_slice(&payload);
        file.extend_from_slice(&build_suffix(0xffff, 0xffff, 0xffff, 0x0100, 0xdead_beef));

        let mut cursor = Cursor::new(file);
        let suffix = parse(&mut cursor).unwrap();
        assert!(suffix.ensure_valid_crc().is_err());
    }
}
