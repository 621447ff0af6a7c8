//! The end-to-end operation (C10 logic): probe, open, transition to DFU
//! mode if needed, claim, synchronize, negotiate the transfer size, dispatch
//! to the right transfer path, and clean up. Mirrors `main()`'s control
//! flow in the original tool (spec.md §4.10 pseudocode), re-expressed as an
//! explicit sequence of phases instead of `goto`s.

use std::fs::File;
use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use log::{info, warn};

use crate::dfuse::commands::{special_command, DeviceIdentity, SpecialCommand};
use crate::dfuse::layout::{self, MemoryLayout};
use crate::dfuse::{download as dfuse_download, file as dfuse_file};
use crate::discovery::{self, InterfaceRecord, MatchField, MatchSpec};
use crate::error::{Error, ProtocolError};
use crate::request;
use crate::session::{Session, SessionMode};
use crate::state;
use crate::suffix;
use crate::transfer::{self, ProgressSink};
use crate::transport::{RusbTransport, UsbTransport};

/// Sleep between probe retries while `--wait` is in effect.
const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(20);
/// Bound on re-probe attempts after a runtime->DFU transition, before
/// giving up on the device ever reappearing.
const REPROBE_ATTEMPTS: u32 = 50;

/// What a run produced, for `main.rs` to report. The core never prints --
/// it hands back data, and the CLI layer formats it.
pub enum RunOutcome {
    /// `-l/--list`: every matching interface record found.
    DeviceList(Vec<InterfaceRecord>),
    /// Every other mode: the run completed.
    Done,
}

struct FileInfo {
    payload: Vec<u8>,
    suffix: suffix::DfuSuffix,
}

fn read_download_file(path: &std::path::Path) -> Result<FileInfo, Error> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;

    let mut cursor = std::io::Cursor::new(&buf);
    let suffix = suffix::parse(&mut cursor)?;
    suffix.ensure_valid_crc()?;

    let payload = buf[..suffix.payload_length as usize].to_vec();
    Ok(FileInfo { payload, suffix })
}

/// Restored feature 3: when downloading and the user gave no `-d`, default
/// the match filter's vendor/product to whatever the file suffix carries.
fn apply_file_defaults(spec: &mut MatchSpec, file: &FileInfo) {
    if spec.vendor == MatchField::Any {
        if let Some(v) = file.suffix.vendor_id.0 {
            spec.vendor = MatchField::Exact(v);
            spec.vendor_dfu = MatchField::Exact(v);
        }
    }
    if spec.product == MatchField::Any {
        if let Some(p) = file.suffix.product_id.0 {
            spec.product = MatchField::Exact(p);
            spec.product_dfu = MatchField::Exact(p);
        }
    }
}

/// Restored feature 4: after a device is matched, a plain file's suffix IDs
/// (if set) must match either the runtime or the DFU-mode identity.
fn ensure_file_matches_device(file: &FileInfo, record: &InterfaceRecord) -> Result<(), Error> {
    let vendor_ok = file.suffix.vendor_id.matches(record.vendor);
    let product_ok = file.suffix.product_id.matches(record.product);
    if vendor_ok && product_ok {
        return Ok(());
    }
    Err(Error::Usage(format!(
        "file and device don't match (file has {:?}:{:?}, device is {:04x}:{:04x})",
        file.suffix.vendor_id.0, file.suffix.product_id.0, record.vendor, record.product
    )))
}

fn find_device(
    context: &rusb::Context,
    record: &InterfaceRecord,
) -> Result<rusb::Device<rusb::Context>, Error> {
    use rusb::UsbContext;
    context
        .devices()
        .map_err(|e| Error::usb(e, "enumerating USB devices"))?
        .iter()
        .find(|d| d.bus_number() == record.bus_number && d.address() == record.devnum)
        .ok_or_else(|| ProtocolError::LostAfterReset.into())
}

fn probe_once(context: &rusb::Context, spec: &MatchSpec) -> Result<Vec<InterfaceRecord>, Error> {
    discovery::probe_devices(context, spec)
}

fn records_for_alt(candidates: &[InterfaceRecord], alt: u8) -> Option<&InterfaceRecord> {
    candidates.iter().find(|r| r.alt_setting == alt)
}

fn resolve_layout(record: &InterfaceRecord) -> Option<MemoryLayout> {
    layout::parse(&record.alt_name).map(|mut l| {
        layout::apply_quirk(&mut l, record.quirks);
        l
    })
}

fn identity(record: &InterfaceRecord) -> DeviceIdentity<'_> {
    DeviceIdentity {
        vendor: record.vendor,
        product: record.product,
        serial: &record.serial_name,
        quirks: record.quirks,
    }
}

/// Negotiates the wire transfer size, per spec.md §4.10: device-advertised
/// size, overridable by `-t`, clamped to 4096 (the historical Linux host
/// controller limit), floored to `bMaxPacketSize0`.
fn negotiate_transfer_size(session: &Session, record: &InterfaceRecord) -> usize {
    let mut size = session
        .transfer_size_override
        .or(record.functional.transfer_size.map(usize::from))
        .unwrap_or(0);

    if size == 0 {
        info!("no transfer size given by device or user, defaulting to 4096");
        size = 4096;
    }
    if size > 4096 {
        info!("limiting transfer size to 4096");
        size = 4096;
    }
    if size < record.max_packet_size0 as usize {
        info!("adjusting transfer size up to bMaxPacketSize0 ({})", record.max_packet_size0);
        size = record.max_packet_size0 as usize;
    }
    size
}

/// Runs the whole operation described by `session` to completion.
pub fn run(session: &Session, progress: &mut dyn ProgressSink) -> Result<RunOutcome, Error> {
    let context = rusb::Context::new().map_err(|e| Error::usb(e, "initializing libusb"))?;

    let file = match &session.mode {
        SessionMode::Download { file } => Some(read_download_file(file)?),
        _ => None,
    };

    let mut match_spec = session.match_spec.clone();
    if let Some(file) = &file {
        apply_file_defaults(&mut match_spec, file);
    }

    // Phase: Probe.
    let candidates = loop {
        let found = probe_once(&context, &match_spec)?;
        if matches!(session.mode, SessionMode::List) {
            return Ok(RunOutcome::DeviceList(found));
        }
        if !found.is_empty() {
            break found;
        }
        if session.wait_for_device {
            sleep(PROBE_RETRY_INTERVAL);
            continue;
        }
        return Err(ProtocolError::NoDevice.into());
    };

    let is_dfuse_file = file.as_ref().map(|f| f.suffix.bcd_dfu == 0x011a).unwrap_or(false);
    let mut record = discovery::select_single(&candidates, is_dfuse_file)?.clone();
    let mut all_alts: Vec<InterfaceRecord> = candidates
        .iter()
        .filter(|r| {
            r.vendor == record.vendor
                && r.product == record.product
                && r.devnum == record.devnum
                && r.path == record.path
        })
        .cloned()
        .collect();

    if let Some(file) = &file {
        ensure_file_matches_device(file, &record)?;
    }

    let device = find_device(&context, &record)?;
    let mut handle = device.open().map_err(|e| Error::usb(e, "opening device"))?;

    // Phase: Transition (runtime -> DFU mode).
    if !record.is_dfu_mode {
        {
            let transport = RusbTransport::new(&handle);
            match state::begin_runtime_detach(&transport, record.interface as u16, &record.functional)? {
                state::DetachOutcome::BusResetIssued => {
                    transport.reset()?;
                }
                state::DetachOutcome::WillDetachOnItsOwn => {}
                state::DetachOutcome::AlreadyInDfuMode => {}
            }
        }
        drop(handle);
        sleep(session.detach_delay);

        // Open question (a): force DFU-mode classification on the re-probe
        // by making the runtime-mode fields unmatchable, instead of the
        // tautological flag check the source had.
        let mut dfu_spec = match_spec.clone();
        dfu_spec.vendor = MatchField::Never;
        dfu_spec.product = MatchField::Never;

        let mut reprobed = Vec::new();
        let mut found_any = false;
        for attempt in 0..REPROBE_ATTEMPTS {
            reprobed = probe_once(&context, &dfu_spec)?;
            if !reprobed.is_empty() {
                found_any = true;
                break;
            }
            if attempt + 1 < REPROBE_ATTEMPTS {
                sleep(PROBE_RETRY_INTERVAL);
            }
        }
        if !found_any {
            return Err(ProtocolError::LostAfterReset.into());
        }

        let reprobed_record = discovery::select_single(&reprobed, is_dfuse_file)?.clone();
        if !reprobed_record.is_dfu_mode {
            return Err(ProtocolError::NotInDfuMode.into());
        }

        all_alts = reprobed
            .iter()
            .filter(|r| {
                r.vendor == reprobed_record.vendor
                    && r.product == reprobed_record.product
                    && r.devnum == reprobed_record.devnum
                    && r.path == reprobed_record.path
            })
            .cloned()
            .collect();
        record = reprobed_record;

        if let Some(file) = &file {
            ensure_file_matches_device(file, &record)?;
        }

        let device = find_device(&context, &record)?;
        handle = device.open().map_err(|e| Error::usb(e, "opening device"))?;
    }

    // Phase: Claim.
    let transport = RusbTransport::new(&handle);
    transport.claim_interface(record.interface)?;
    if record.has_multiple_alt {
        transport.set_alternate_setting(record.interface, record.alt_setting)?;
    }

    // Phase: StatusSync.
    state::sync_before_transfer(&transport, record.interface as u16)?;

    let transfer_size = negotiate_transfer_size(session, &record);
    let interface = record.interface as u16;

    // Phase: Execute.
    let result = execute(session, &transport, interface, &record, &all_alts, transfer_size, file.as_ref(), progress);

    // release_interface always runs, even on failure, so the handle isn't
    // left in a claimed state for the next invocation.
    let release_result = transport.release_interface(record.interface);
    result?;
    release_result?;

    // Phase: Finalize.
    if session.final_reset {
        info!("resetting USB to switch back to runtime mode");
        let _ = request::detach(&transport, interface, 1000);
        transport.reset()?;
    }

    Ok(RunOutcome::Done)
}

#[allow(clippy::too_many_arguments)]
fn execute<T: UsbTransport>(
    session: &Session,
    t: &T,
    interface: u16,
    record: &InterfaceRecord,
    all_alts: &[InterfaceRecord],
    transfer_size: usize,
    file: Option<&FileInfo>,
    progress: &mut dyn ProgressSink,
) -> Result<(), Error> {
    match &session.mode {
        SessionMode::List => unreachable!("handled during the probe phase"),

        SessionMode::Detach => {
            request::detach(t, interface, record.functional.detach_timeout_ms)?;
            Ok(())
        }

        SessionMode::Upload { file: out_path, upload_size } => {
            let mut out = File::create(out_path).map_err(Error::CantCreate)?;
            let limit = session.dfuse.length.or(*upload_size);

            if record.functional.is_dfuse() || session.dfuse.is_present() {
                let layout = resolve_layout(record);
                let id = identity(record);
                dfuse_download::upload(
                    t,
                    interface,
                    &id,
                    layout.as_ref(),
                    session.dfuse.address,
                    limit,
                    session.dfuse.force,
                    transfer_size,
                    &mut out,
                    progress,
                )?;
            } else {
                transfer::upload(t, interface, transfer_size, limit, &mut out, progress)?;
            }
            Ok(())
        }

        SessionMode::Download { .. } => {
            let file = file.expect("download mode always has file data");
            run_download(session, t, interface, record, all_alts, transfer_size, file, progress)
        }

        SessionMode::DfuseCommand => run_dfuse_command_only(session, t, interface, record),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_download<T: UsbTransport>(
    session: &Session,
    t: &T,
    interface: u16,
    record: &InterfaceRecord,
    all_alts: &[InterfaceRecord],
    transfer_size: usize,
    file: &FileInfo,
    progress: &mut dyn ProgressSink,
) -> Result<(), Error> {
    let is_dfuse_file = file.suffix.bcd_dfu == 0x011a;

    if is_dfuse_file {
        if session.dfuse.address.is_some() {
            return Err(Error::Usage(
                "this is a DfuSe file; --dfuse-address doesn't apply to container downloads".into(),
            ));
        }

        let container = dfuse_file::parse(&file.payload)?;

        if session.dfuse.mass_erase {
            if !session.dfuse.force {
                return Err(Error::Usage("mass-erase requires \"force\"".into()));
            }
            let id = identity(record);
            special_command(t, interface, &id, 0, SpecialCommand::MassErase)?;
        }
        if session.dfuse.unprotect {
            if !session.dfuse.force {
                return Err(Error::Usage("unprotect requires \"force\"".into()));
            }
            let id = identity(record);
            special_command(t, interface, &id, 0, SpecialCommand::ReadUnprotect)?;
            return Ok(());
        }

        download_container_targets(
            t,
            interface,
            all_alts,
            &container,
            session.dfuse.force,
            session.dfuse.mass_erase,
            transfer_size,
            progress,
        )?;

        if session.dfuse.leave {
            let id = identity(record);
            dfuse_download::leave(t, interface, &id, None, record.quirks)?;
        }
        Ok(())
    } else if session.dfuse.address.is_some() {
        let address = session.dfuse.address.unwrap();
        let layout = resolve_layout(record).unwrap_or_default();
        let id = identity(record);

        if session.dfuse.mass_erase {
            if !session.dfuse.force {
                return Err(Error::Usage("mass-erase requires \"force\"".into()));
            }
            special_command(t, interface, &id, 0, SpecialCommand::MassErase)?;
        }
        if session.dfuse.unprotect {
            if !session.dfuse.force {
                return Err(Error::Usage("unprotect requires \"force\"".into()));
            }
            special_command(t, interface, &id, 0, SpecialCommand::ReadUnprotect)?;
            return Ok(());
        }

        let mut last_erased_page = None;
        dfuse_download::download_element(
            t,
            interface,
            &id,
            &layout,
            address,
            &file.payload,
            transfer_size,
            session.dfuse.force,
            session.dfuse.mass_erase,
            &mut last_erased_page,
            progress,
        )?;

        if session.dfuse.leave {
            dfuse_download::leave(t, interface, &id, Some(address), record.quirks)?;
        }
        Ok(())
    } else if session.dfuse.is_present() {
        Err(Error::Usage(
            "DfuSe options were given but no --dfuse-address and the file isn't a DfuSe container".into(),
        ))
    } else {
        let manifestation_tolerant =
            record.functional.attributes & crate::request::ATTR_MANIFEST_TOLERANT != 0;
        transfer::download(t, interface, transfer_size, manifestation_tolerant, &file.payload, progress)
    }
}

/// Routes each target of a parsed DfuSe container to the alternate setting
/// its `alt_setting` names and downloads its elements there (spec.md §8
/// scenario S4). A target naming an alternate setting the device doesn't
/// have is skipped with a warning; the container parse already accounted
/// for its elements' byte span, so skipping here only affects what gets
/// written.
#[allow(clippy::too_many_arguments)]
pub fn download_container_targets<T: UsbTransport>(
    t: &T,
    interface: u16,
    all_alts: &[InterfaceRecord],
    container: &dfuse_file::DfuseFile,
    force: bool,
    mass_erase: bool,
    transfer_size: usize,
    progress: &mut dyn ProgressSink,
) -> Result<(), Error> {
    let mut last_erased_page = None;
    for target in &container.targets {
        let target_record = match records_for_alt(all_alts, target.alt_setting) {
            Some(r) => r,
            None => {
                warn!(
                    "no alternate setting {} (skipping elements)",
                    target.alt_setting
                );
                continue;
            }
        };
        if target_record.has_multiple_alt {
            t.set_alternate_setting(target_record.interface, target_record.alt_setting)?;
        }

        let layout = resolve_layout(target_record).unwrap_or_default();
        let id = identity(target_record);
        for element in &target.elements {
            dfuse_download::download_element(
                t,
                interface,
                &id,
                &layout,
                element.address,
                &element.data,
                transfer_size,
                force,
                mass_erase,
                &mut last_erased_page,
                progress,
            )?;
        }
    }
    Ok(())
}

fn run_dfuse_command_only<T: UsbTransport>(
    session: &Session,
    t: &T,
    interface: u16,
    record: &InterfaceRecord,
) -> Result<(), Error> {
    let id = identity(record);

    if session.dfuse.mass_erase {
        if !session.dfuse.force {
            return Err(Error::Usage("mass-erase requires \"force\"".into()));
        }
        special_command(t, interface, &id, 0, SpecialCommand::MassErase)?;
    }
    if session.dfuse.unprotect {
        if !session.dfuse.force {
            return Err(Error::Usage("unprotect requires \"force\"".into()));
        }
        special_command(t, interface, &id, 0, SpecialCommand::ReadUnprotect)?;
        return Ok(());
    }
    if session.dfuse.leave {
        dfuse_download::leave(t, interface, &id, session.dfuse.address, record.quirks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_defaults_only_apply_when_filter_unset() {
        let mut spec = MatchSpec {
            vendor: MatchField::Exact(0x1234),
            ..Default::default()
        };
        let file = FileInfo {
            payload: vec![],
            suffix: suffix::DfuSuffix {
                vendor_id: suffix::OptionalId(Some(0x0483)),
                product_id: suffix::OptionalId(Some(0xdf11)),
                release_number: suffix::OptionalId(None),
                bcd_dfu: 0x0100,
                expected_crc: 0,
                actual_crc: 0,
                payload_length: 0,
            },
        };
        apply_file_defaults(&mut spec, &file);
        assert_eq!(spec.vendor, MatchField::Exact(0x1234));
        assert_eq!(spec.product, MatchField::Exact(0xdf11));
    }

    #[test]
    fn ensure_file_matches_device_rejects_mismatch() {
        let file = FileInfo {
            payload: vec![],
            suffix: suffix::DfuSuffix {
                vendor_id: suffix::OptionalId(Some(0xaaaa)),
                product_id: suffix::OptionalId(Some(0xbbbb)),
                release_number: suffix::OptionalId(None),
                bcd_dfu: 0x0100,
                expected_crc: 0,
                actual_crc: 0,
                payload_length: 0,
            },
        };
        let record = InterfaceRecord {
            functional: request::FunctionalDescriptor::synthesize_default(),
            quirks: Default::default(),
            vendor: 0x0483,
            product: 0xdf11,
            bcd_device: 0,
            configuration: 0,
            interface: 0,
            alt_setting: 0,
            devnum: 0,
            bus_number: 0,
            path: None,
            alt_name: "UNKNOWN".into(),
            serial_name: "UNKNOWN".into(),
            is_dfu_mode: true,
            has_multiple_alt: false,
            max_packet_size0: 64,
        };
        assert!(ensure_file_matches_device(&file, &record).is_err());
    }
}
