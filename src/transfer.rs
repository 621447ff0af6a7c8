//! Plain DFU transfer engine (C5): chunked upload and download over DFU
//! 1.0/1.1, per spec.md §4.5. DfuSe's erase/write/leave pipeline builds on
//! top of this (see [`crate::dfuse::download`]) rather than duplicating it.

use crate::error::{Error, ProtocolError};
use crate::request::{self, DfuState};
use crate::state;
use crate::transport::UsbTransport;

/// Reports progress as firmware bytes move across the wire, so the CLI can
/// draw a progress bar without the transfer engine knowing about terminals.
pub trait ProgressSink {
    fn on_progress(&mut self, transferred: usize, total: Option<usize>);
}

/// A [`ProgressSink`] that does nothing, for callers that don't care.
impl ProgressSink for () {
    fn on_progress(&mut self, _transferred: usize, _total: Option<usize>) {}
}

/// Downloads `firmware` in chunks of at most `transfer_size`, per spec.md
/// §4.5 "Download": transaction counter starts at 0 and increases by 1 per
/// DNLOAD (Testable Property 1), terminated by exactly one zero-length
/// DNLOAD after the last data chunk (Testable Property 2). Manifestation is
/// polled to completion unless the device is manifestation-tolerant is
/// false, in which case a successful terminator implies manifestation
/// succeeded without further requests.
pub fn download<T: UsbTransport>(
    t: &T,
    interface: u16,
    transfer_size: usize,
    manifestation_tolerant: bool,
    firmware: &[u8],
    progress: &mut dyn ProgressSink,
) -> Result<(), Error> {
    if transfer_size == 0 {
        return Err(Error::Software("transfer size must be nonzero".into()));
    }

    let mut transaction: u16 = 0;
    let mut sent = 0usize;

    for chunk in firmware.chunks(transfer_size) {
        request::dnload(t, interface, transaction, chunk)?;
        let status = state::poll_after_dnload(t, interface)?;
        status.ensure_ok()?;
        status.ensure_state(DfuState::dfuDNLOAD_IDLE)?;

        sent += chunk.len();
        progress.on_progress(sent, Some(firmware.len()));

        transaction = transaction
            .checked_add(1)
            .ok_or(ProtocolError::FileTooLarge)?;
    }

    // Zero-length terminator (Testable Property 2).
    request::dnload(t, interface, transaction, &[])?;

    if manifestation_tolerant {
        let status = state::poll_manifestation(t, interface)?;
        status.ensure_ok()?;
        status.ensure_state(DfuState::dfuIDLE)?;
    } else {
        // The device may vanish mid-manifestation; a successful terminator
        // write is treated as success without a further GETSTATUS.
    }

    Ok(())
}

/// Uploads from the device into `sink`, per spec.md §4.5 "Upload": the
/// transaction counter starts at 2 (blocks 0 and 1 are reserved for DfuSe
/// commands even in plain-DFU mode) and a short read (fewer bytes than
/// `transfer_size`) signals the last chunk. If `limit` is `Some`, upload
/// stops once that many bytes have been collected even without a short
/// read, matching the `-Z`/`--upload-size` handling in spec.md §6.
pub fn upload<T: UsbTransport>(
    t: &T,
    interface: u16,
    transfer_size: usize,
    limit: Option<usize>,
    sink: &mut dyn std::io::Write,
    progress: &mut dyn ProgressSink,
) -> Result<usize, Error> {
    if transfer_size == 0 {
        return Err(Error::Software("transfer size must be nonzero".into()));
    }

    let mut transaction: u16 = 2;
    let mut total = 0usize;
    let mut buf = vec![0u8; transfer_size];

    loop {
        if let Some(limit) = limit {
            if total >= limit {
                break;
            }
        }

        let n = request::upload(t, interface, transaction, &mut buf)?;
        if n == 0 {
            break;
        }

        let want = match limit {
            Some(limit) => n.min(limit - total),
            None => n,
        };
        sink.write_all(&buf[..want]).map_err(Error::from)?;
        total += want;
        progress.on_progress(total, limit);

        if n < transfer_size {
            break;
        }

        transaction = transaction
            .checked_add(1)
            .ok_or(ProtocolError::FileTooLarge)?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    #[test]
    fn download_uses_monotonic_transaction_counter_and_terminator() {
        let mock = MockTransport::new();
        // Two 4-byte chunks from an 8-byte payload, transfer_size=4.
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        mock.push_status(DfuState::dfuIDLE, 0);

        download(&mock, 0, 4, true, &[1, 2, 3, 4, 5, 6, 7, 8], &mut ()).unwrap();

        let writes = mock.dnload_writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].0, 0);
        assert_eq!(writes[1].0, 1);
        assert_eq!(writes[2], (2, Vec::new()));
    }

    #[test]
    fn download_waits_through_manifest_states_before_idle() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        mock.push_status(DfuState::dfuMANIFEST_SYNC, 10);
        mock.push_status(DfuState::dfuMANIFEST, 10);
        mock.push_status(DfuState::dfuIDLE, 0);

        download(&mock, 0, 4, true, &[1, 2, 3, 4, 5, 6, 7, 8], &mut ()).unwrap();
    }

    #[test]
    fn upload_stops_on_short_read() {
        let mock = MockTransport::new();
        mock.push_upload(&[0u8; 200]);
        mock.push_upload(&[0u8; 200]);
        mock.push_upload(&[0u8; 73]);

        let mut out = Vec::new();
        let total = upload(&mock, 0, 200, None, &mut out, &mut ()).unwrap();
        assert_eq!(total, 473);
        assert_eq!(out.len(), 473);
    }

    #[test]
    fn upload_stops_at_explicit_limit() {
        let mock = MockTransport::new();
        mock.push_upload(&[0u8; 200]);
        mock.push_upload(&[0u8; 200]);

        let mut out = Vec::new();
        let total = upload(&mock, 0, 200, Some(300), &mut out, &mut ()).unwrap();
        assert_eq!(total, 300);
    }
}
