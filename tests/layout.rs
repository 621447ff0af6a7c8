//! DfuSe memory layout parser: round-trip and parsing edge cases against the
//! public `dfuse::layout` API (Testable Property 6 in spec.md §8).

use dfu_rs::dfuse::layout::{self, MemoryLayout, MemoryRegion, MemorySegment};

fn serialize(layout: &MemoryLayout) -> String {
    let mut out = String::new();
    for seg in &layout.segments {
        out.push('@');
        out.push_str(&seg.name);
        for r in &seg.regions {
            out.push('/');
            out.push_str(&format!("0x{:08x}", r.start_address));
            out.push('/');
            let mode = match (r.readable, r.writable, r.erasable) {
                (true, false, false) => 'a',
                (false, false, true) => 'b',
                (true, false, true) => 'c',
                (false, true, false) => 'd',
                (true, true, false) => 'e',
                (false, true, true) => 'f',
                (true, true, true) => 'g',
                (false, false, false) => 'a',
            };
            out.push_str(&format!("{:02}*{:03}K{}", r.sector_count, r.sector_size / 1024, mode));
        }
    }
    out
}

fn regions_equal(a: &MemoryRegion, b: &MemoryRegion) -> bool {
    a.start_address == b.start_address
        && a.end_address == b.end_address
        && a.sector_count == b.sector_count
        && a.sector_size == b.sector_size
        && a.readable == b.readable
        && a.writable == b.writable
        && a.erasable == b.erasable
}

fn segments_equal(a: &MemorySegment, b: &MemorySegment) -> bool {
    a.name == b.name
        && a.regions.len() == b.regions.len()
        && a.regions.iter().zip(&b.regions).all(|(x, y)| regions_equal(x, y))
}

#[test]
fn round_trip_parse_then_serialize_then_parse() {
    let original = "@Internal Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg";
    let layout = layout::parse(original).expect("parses");
    let reserialized = serialize(&layout);
    let reparsed = layout::parse(&reserialized).expect("reparses");

    assert_eq!(layout.segments.len(), reparsed.segments.len());
    for (a, b) in layout.segments.iter().zip(&reparsed.segments) {
        assert!(segments_equal(a, b));
    }
}

#[test]
fn segments_are_ordered_and_non_overlapping() {
    let layout = layout::parse("@Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
    let regions = &layout.segments[0].regions;
    for pair in regions.windows(2) {
        assert!(pair[0].end_address < pair[1].start_address);
    }
}

#[test]
fn find_region_returns_none_outside_any_segment() {
    let layout = layout::parse("@Flash/0x08000000/04*016Kg").unwrap();
    assert!(layout.find_region(0x0900_0000).is_none());
}

#[test]
fn rejects_strings_without_leading_at() {
    assert!(layout::parse("Internal Flash/0x08000000/04*016Kg").is_none());
}

#[test]
fn megabyte_multiplier_is_honored() {
    let layout = layout::parse("@External Flash/0x90000000/01*008Mg").unwrap();
    let r = &layout.segments[0].regions[0];
    assert_eq!(r.sector_size, 8 * 1024 * 1024);
    assert_eq!(r.end_address, 0x9000_0000 + 8 * 1024 * 1024 - 1);
}
