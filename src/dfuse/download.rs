//! DfuSe erase/write/leave pipeline (C8), grounded in
//! `dfuse_dnload_element`/`dfuse_do_leave`/`dfuse_do_upload` from the
//! original tool: per-element page erase with de-duplication, SET_ADDRESS
//! before every write chunk, and the quirk-tolerant leave sequence.

use std::io::Write;

use log::info;

use crate::dfuse::commands::{special_command, DeviceIdentity, SpecialCommand};
use crate::dfuse::layout::MemoryLayout;
use crate::error::{Error, ProtocolError};
use crate::quirks::Quirks;
use crate::request::{self, DfuState};
use crate::state;
use crate::transfer::ProgressSink;
use crate::transport::UsbTransport;

/// Writes one DfuSe element (a contiguous address range from a DfuSe
/// container, or the whole file for a raw binary download) to the device.
/// Erases every covered page first (unless `mass_erase` already erased
/// everything), skipping pages already erased by a prior element so
/// adjacent elements sharing a flash page don't double-erase it.
pub fn download_element<T: UsbTransport>(
    t: &T,
    interface: u16,
    id: &DeviceIdentity,
    layout: &MemoryLayout,
    element_address: u32,
    data: &[u8],
    transfer_size: usize,
    force: bool,
    mass_erase: bool,
    last_erased_page: &mut Option<u32>,
    progress: &mut dyn ProgressSink,
) -> Result<(), Error> {
    let last_address = element_address
        .checked_add(data.len() as u32)
        .and_then(|e| e.checked_sub(1))
        .ok_or_else(|| Error::Software("element address overflow".into()))?;

    let writable_end = layout
        .find_region(last_address)
        .map(|r| r.writable)
        .unwrap_or(false);
    if !force && !writable_end {
        return Err(ProtocolError::PageNotWriteable {
            address: last_address,
        }
        .into());
    }

    if !mass_erase {
        for (offset, chunk_len) in chunk_offsets(data.len(), transfer_size) {
            let address = element_address + offset as u32;
            let region = match layout.find_region(address) {
                Some(r) => r,
                // Not in the memory map: skip erasing, we wouldn't know the
                // right page size.
                None => continue,
            };
            if !force && !region.writable {
                return Err(ProtocolError::PageNotWriteable { address }.into());
            }
            if !region.erasable {
                continue;
            }
            let page_size = region.sector_size.max(1);

            let mut erase_addr = address;
            while erase_addr < address + chunk_len as u32 {
                let page = erase_addr & !(page_size - 1);
                if Some(page) != *last_erased_page {
                    special_command(t, interface, id, erase_addr, SpecialCommand::ErasePage)?;
                    *last_erased_page = Some(page);
                }
                erase_addr += page_size;
            }

            let last_in_chunk = address + chunk_len as u32 - 1;
            let last_page = last_in_chunk & !(page_size - 1);
            if Some(last_page) != *last_erased_page {
                info!("chunk extends into next page, erasing it as well");
                special_command(t, interface, id, last_in_chunk, SpecialCommand::ErasePage)?;
                *last_erased_page = Some(last_page);
            }
        }
    }

    for (offset, chunk_len) in chunk_offsets(data.len(), transfer_size) {
        let address = element_address + offset as u32;
        let chunk = &data[offset..offset + chunk_len];

        special_command(t, interface, id, address, SpecialCommand::SetAddress)?;

        let sent = dnload_chunk(t, interface, chunk)?;
        if sent != chunk.len() {
            return Err(ProtocolError::ShortChunk {
                address,
                expected: chunk.len(),
                actual: sent,
            }
            .into());
        }

        progress.on_progress(offset + chunk_len, Some(data.len()));
    }

    Ok(())
}

fn chunk_offsets(total: usize, chunk_size: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..total)
        .step_by(chunk_size.max(1))
        .map(move |offset| (offset, chunk_size.min(total - offset)))
}

/// `dfuse_dnload_chunk`: DNLOAD with transaction=2 (no DfuSe address
/// offset), then poll until `dfuDNLOAD_IDLE`, `dfuERROR`, `dfuMANIFEST`, or
/// (if the caller expects the device to reset mid-transfer) `dfuDNBUSY`.
fn dnload_chunk<T: UsbTransport>(t: &T, interface: u16, data: &[u8]) -> Result<usize, Error> {
    let sent = request::dnload(t, interface, 2, data)?;
    loop {
        let status = request::get_status(t, interface)?;
        std::thread::sleep(std::time::Duration::from_millis(status.poll_timeout as u64));
        match status.state {
            DfuState::dfuDNLOAD_IDLE | DfuState::dfuERROR | DfuState::dfuMANIFEST => {
                status.ensure_ok()?;
                return Ok(sent);
            }
            _ => continue,
        }
    }
}

/// `dfuse_do_leave`: optionally re-asserts the DfuSe address, then submits
/// the leave request. The `DFUSE_LEAVE` quirk tolerates the device
/// vanishing mid-request instead of treating a failed transfer as fatal.
pub fn leave<T: UsbTransport>(
    t: &T,
    interface: u16,
    id: &DeviceIdentity,
    address: Option<u32>,
    quirks: Quirks,
) -> Result<(), Error> {
    if let Some(address) = address {
        special_command(t, interface, id, address, SpecialCommand::SetAddress)?;
    }

    info!("submitting leave request");
    if quirks.contains(Quirks::DFUSE_LEAVE) {
        let _ = request::dnload(t, interface, 2, &[]);
        let _ = request::get_status(t, interface);
        Ok(())
    } else {
        dnload_chunk(t, interface, &[]).map(|_| ())
    }
}

/// Default upload bound used when no explicit length is given and the
/// target memory segment can't be determined, per spec.md §4.9.
pub const DEFAULT_UPLOAD_LIMIT: usize = 0x4000;

/// `dfuse_do_upload`: uploads from `address` (or, if `None`, lets the
/// bootloader pick the start address) for `limit` bytes -- falling back to
/// the rest of the containing memory segment, then [`DEFAULT_UPLOAD_LIMIT`].
pub fn upload<T: UsbTransport>(
    t: &T,
    interface: u16,
    id: &DeviceIdentity,
    layout: Option<&MemoryLayout>,
    address: Option<u32>,
    explicit_limit: Option<usize>,
    force: bool,
    transfer_size: usize,
    sink: &mut dyn Write,
    progress: &mut dyn ProgressSink,
) -> Result<usize, Error> {
    let limit = match (address, layout) {
        (Some(address), Some(layout)) => {
            let region = layout.find_region(address);
            if !force && !region.map(|r| r.readable).unwrap_or(false) {
                return Err(ProtocolError::SegmentNotReadable { address }.into());
            }
            explicit_limit.unwrap_or_else(|| {
                region
                    .map(|r| (r.end_address - address + 1) as usize)
                    .unwrap_or(DEFAULT_UPLOAD_LIMIT)
            })
        }
        _ => explicit_limit.unwrap_or(DEFAULT_UPLOAD_LIMIT),
    };

    if let Some(address) = address {
        special_command(t, interface, id, address, SpecialCommand::SetAddress)?;
        state::abort_to_idle(t, interface)?;
    }

    let total = crate::transfer::upload(t, interface, transfer_size, Some(limit), sink, progress)?;
    state::abort_to_idle(t, interface)?;
    Ok(total)
}
