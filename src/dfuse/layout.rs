//! DfuSe memory layout parsing (C6), grounded in
//! `examples/other_examples/*sourcebox-dfu-buddy*dfuse.rs.rs`'s
//! `MemorySegment::from_string_desc`, generalized to the original tool's
//! `parse_memory_layout`/`find_segment` (multiple named regions per
//! alt-setting, not just one).

use crate::quirks::Quirks;

/// One memory region inside a DfuSe alt-setting name string, e.g. one
/// `NN*SSSu` run within `@Internal Flash /0x08000000/04*016Kg,01*064Kg`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start_address: u32,
    pub end_address: u32,
    pub sector_count: u32,
    pub sector_size: u32,
    pub readable: bool,
    pub writable: bool,
    pub erasable: bool,
}

impl MemoryRegion {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address <= self.end_address
    }
}

/// A named memory segment (one `@name/addr/sectors` group) made of one or
/// more contiguous [`MemoryRegion`]s.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    pub name: String,
    pub regions: Vec<MemoryRegion>,
}

/// The full memory layout for one alt-setting, i.e. every segment named in
/// its `iInterface` string descriptor.
#[derive(Debug, Clone, Default)]
pub struct MemoryLayout {
    pub segments: Vec<MemorySegment>,
}

impl MemoryLayout {
    /// Finds the region covering `address`, across every segment.
    pub fn find_region(&self, address: u32) -> Option<&MemoryRegion> {
        self.segments
            .iter()
            .flat_map(|s| &s.regions)
            .find(|r| r.contains(address))
    }
}

fn decode_mode(mode: char) -> (bool, bool, bool) {
    let readable = matches!(mode, 'a' | 'c' | 'e' | 'g');
    let writable = matches!(mode, 'd' | 'e' | 'f' | 'g');
    let erasable = matches!(mode, 'b' | 'c' | 'f' | 'g');
    (readable, writable, erasable)
}

/// Parses one `N*SIZE<multiplier><mode>` sector run, e.g. `"04*016Kg"`.
fn parse_sector_run(tok: &str) -> Option<(u32, u32, char)> {
    let star = tok.find('*')?;
    let count: u32 = tok[..star].parse().ok()?;
    let rest = &tok[star + 1..];
    let mut chars = rest.chars();
    let mode = chars.next_back()?;
    let rest = chars.as_str();

    let (size_str, multiplier) = match rest.chars().next_back() {
        Some(c) if c.is_ascii_alphabetic() => (&rest[..rest.len() - 1], c),
        _ => (rest, ' '),
    };
    let size: u32 = size_str.parse().ok()?;
    let factor = match multiplier {
        'K' => 1024,
        'M' => 1024 * 1024,
        _ => 1,
    };
    Some((count, size.checked_mul(factor)?, mode))
}

/// Parses a DfuSe alt-setting name string of the form
/// `@name/addr1/N*size(mode),.../addr2/N*size(mode),...` into a
/// [`MemoryLayout`]. Mirrors `parse_memory_layout` in the original tool.
/// Returns `None` if the string isn't a recognizable DfuSe layout string
/// (plain, non-DfuSe alt-setting names are common and not an error).
pub fn parse(alt_name: &str) -> Option<MemoryLayout> {
    let alt_name = alt_name.trim();
    if !alt_name.starts_with('@') {
        return None;
    }
    let mut parts: Vec<&str> = alt_name.split('/').collect();
    let name = parts.remove(0)[1..].trim().to_string();

    let mut regions = Vec::new();
    while parts.len() >= 2 {
        let address_str = parts.remove(0).trim().trim_start_matches("0x");
        let mut address = u32::from_str_radix(address_str, 16).ok()?;

        for sector_tok in parts.remove(0).split(',') {
            let (count, size, mode) = parse_sector_run(sector_tok.trim())?;
            let (readable, writable, erasable) = decode_mode(mode);
            let span = count.checked_mul(size)?;
            if span == 0 {
                continue;
            }
            regions.push(MemoryRegion {
                start_address: address,
                end_address: address + span - 1,
                sector_count: count,
                sector_size: size,
                readable,
                writable,
                erasable,
            });
            address += span;
        }
    }

    if regions.is_empty() {
        return None;
    }

    Some(MemoryLayout {
        segments: vec![MemorySegment { name, regions }],
    })
}

/// Extension point for the `DFUSE_LAYOUT` quirk (spec.md §4.6): some
/// devices' alt-setting strings describe a layout that needs adjusting
/// after parsing before it can be trusted. No currently-supported device
/// needs an adjustment, so this is a no-op hook rather than a concrete
/// workaround.
pub fn apply_quirk(layout: &mut MemoryLayout, quirks: Quirks) {
    let _ = (&mut *layout, quirks);
}
