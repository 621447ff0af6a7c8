//! Plain DFU file suffix parsing against the public `suffix` API: CRC32
//! verification, vendor/product wildcard handling, and malformed-file
//! rejection (spec.md §4.6 / §6 file formats).

use byteorder::{ByteOrder, BE};
use std::io::Cursor;

use dfu_rs::suffix;

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

fn crc_of(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    !hasher.finalize()
}

#[test]
fn valid_file_with_explicit_ids_round_trips() {
    let payload = vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02];
    let crc = crc_of(&payload);

    let mut file = payload.clone();
    file.extend_from_slice(&build_suffix(0x0483, 0xdf11, 0x0200, 0x011a, crc));

    let mut cursor = Cursor::new(file);
    let parsed = suffix::parse(&mut cursor).unwrap();

    assert!(parsed.has_valid_crc());
    assert_eq!(parsed.payload_length, payload.len() as u64);
    assert!(parsed.vendor_id.matches(0x0483));
    assert!(!parsed.vendor_id.matches(0x1234));
    assert_eq!(parsed.bcd_dfu, 0x011a);
}

#[test]
fn wildcard_ids_match_anything() {
    let payload = vec![1, 2, 3];
    let crc = crc_of(&payload);
    let mut file = payload;
    file.extend_from_slice(&build_suffix(0xffff, 0xffff, 0xffff, 0x0100, crc));

    let mut cursor = Cursor::new(file);
    let parsed = suffix::parse(&mut cursor).unwrap();
    assert!(parsed.vendor_id.matches(0x0483));
    assert!(parsed.product_id.matches(0xdf11));
}

#[test]
fn file_shorter_than_suffix_is_rejected() {
    let mut cursor = Cursor::new(vec![0u8; 10]);
    assert!(suffix::parse(&mut cursor).is_err());
}

#[test]
fn bad_dfu_signature_is_rejected() {
    let mut s = build_suffix(0xffff, 0xffff, 0xffff, 0x0100, 0);
    s.reverse();
    s[5..8].copy_from_slice(b"NOT");
    s.reverse();
    let mut cursor = Cursor::new(s.to_vec());
    assert!(suffix::parse(&mut cursor).is_err());
}

#[test]
fn wrong_crc_is_detected_but_still_parses() {
    let payload = vec![9, 8, 7];
    let mut file = payload;
    file.extend_from_slice(&build_suffix(0xffff, 0xffff, 0xffff, 0x0100, 0x1111_2222));

    let mut cursor = Cursor::new(file);
    let parsed = suffix::parse(&mut cursor).unwrap();
    assert!(!parsed.has_valid_crc());
    assert!(parsed.ensure_valid_crc().is_err());
}

#[test]
fn dfu_version_below_1_0_is_rejected() {
    let payload = vec![1];
    let crc = crc_of(&payload);
    let mut file = payload;
    file.extend_from_slice(&build_suffix(0xffff, 0xffff, 0xffff, 0x0000, crc));

    let mut cursor = Cursor::new(file);
    assert!(suffix::parse(&mut cursor).is_err());
}
