//! DFU state engine (C3): status polling with the device-supplied wait,
//! abort-to-idle, and the runtime->DFU detach handshake, per spec.md §4.3.

use std::thread::sleep;
use std::time::Duration;

use log::{debug, info};

use crate::error::Error;
use crate::request::{self, DfuState, DfuStatusResponse, FunctionalDescriptor, ATTR_WILL_DETACH};
use crate::transport::UsbTransport;

/// Number of consecutive `bwPollTimeout == 0` polls tolerated before
/// declaring the device stuck (spec.md §4.3 stall workaround ii).
const MAX_ZERO_WAIT_POLLS: u32 = 100;

/// Shared poll-loop core: GETSTATUS, sleep `bwPollTimeout`, tolerate up to
/// `MAX_ZERO_WAIT_POLLS` consecutive zero-wait polls, clear a `dfuERROR` and
/// keep polling, and keep polling while `is_busy` holds for the reported
/// state. Returns the first status that is neither `dfuERROR` nor busy.
fn poll_while<T: UsbTransport>(
    t: &T,
    interface: u16,
    is_busy: impl Fn(DfuState) -> bool,
) -> Result<DfuStatusResponse, Error> {
    let mut zero_wait_polls = 0u32;
    loop {
        let status = request::get_status(t, interface)?;
        sleep(Duration::from_millis(status.poll_timeout as u64));

        if status.poll_timeout == 0 {
            zero_wait_polls += 1;
            if zero_wait_polls >= MAX_ZERO_WAIT_POLLS {
                return Err(crate::error::ProtocolError::DeviceStuck(zero_wait_polls).into());
            }
        } else {
            zero_wait_polls = 0;
        }

        if status.state == DfuState::dfuERROR {
            debug!("device in dfuERROR during poll, clearing status");
            request::clear_status(t, interface)?;
            continue;
        }
        if is_busy(status.state) {
            continue;
        }
        return Ok(status);
    }
}

/// Repeatedly GETSTATUS, sleeping `bwPollTimeout` ms between polls, until
/// the device leaves the busy set `{dfuDNLOAD_SYNC, dfuDNBUSY}` (spec.md
/// §4.3 "Poll loop (core primitive)"). A `dfuERROR` response triggers one
/// CLRSTATUS and continues polling, per the policy in spec.md §4.3.
pub fn poll_after_dnload<T: UsbTransport>(
    t: &T,
    interface: u16,
) -> Result<DfuStatusResponse, Error> {
    poll_while(t, interface, |s| {
        matches!(s, DfuState::dfuDNLOAD_SYNC | DfuState::dfuDNBUSY)
    })
}

/// Polls after the terminator zero-length DNLOAD on a manifestation-tolerant
/// device, per spec.md §4.5: manifestation runs the device through
/// `dfuMANIFEST_SYNC`/`dfuMANIFEST` before it settles in `dfuIDLE`, and a
/// bootloader can sit in either of those states, with a nonzero poll
/// timeout, for a while. Reusing `poll_after_dnload`'s download-phase busy
/// set would return as soon as the device left `dfuDNBUSY`, well before
/// manifestation actually finished.
pub fn poll_manifestation<T: UsbTransport>(
    t: &T,
    interface: u16,
) -> Result<DfuStatusResponse, Error> {
    poll_while(t, interface, |s| {
        matches!(
            s,
            DfuState::dfuDNLOAD_SYNC
                | DfuState::dfuDNBUSY
                | DfuState::dfuMANIFEST_SYNC
                | DfuState::dfuMANIFEST
        )
    })
}

/// If the device is sitting in `dfuDNLOAD_IDLE` or `dfuUPLOAD_IDLE` (a
/// leftover transfer from a previous run), abort it and wait until it
/// reports `dfuIDLE` (spec.md §4.3 "Abort-to-idle").
pub fn abort_to_idle<T: UsbTransport>(t: &T, interface: u16) -> Result<(), Error> {
    loop {
        let status = request::get_status(t, interface)?;
        match status.state {
            DfuState::dfuDNLOAD_IDLE | DfuState::dfuUPLOAD_IDLE => {
                request::abort(t, interface)?;
            }
            DfuState::dfuIDLE => return Ok(()),
            _ => return Ok(()),
        }
    }
}

/// Outcome of the runtime->DFU detach handshake (spec.md §4.3 steps 1-3).
#[derive(Debug)]
pub enum DetachOutcome {
    /// Device advertises `bitWillDetach`; the caller should wait for it to
    /// re-enumerate on its own rather than issuing a bus reset.
    WillDetachOnItsOwn,
    /// A bus reset was issued by this call.
    BusResetIssued,
    /// GETSTATUS (or the subsequent check) found the device already in a
    /// DFU state; the caller should proceed without detaching.
    AlreadyInDfuMode,
}

/// Drives spec.md §4.3 steps 1-3: GETSTATUS (tolerating a pipe stall as
/// "assume appIDLE"), issue DETACH if the device is in `appIDLE`/
/// `appDETACH`, then either wait for self-detach or issue a bus reset. Does
/// NOT close handles, sleep `detach_delay`, or re-probe — those are session
/// concerns handled by the orchestrator (C10).
pub fn begin_runtime_detach<T: UsbTransport>(
    t: &T,
    interface: u16,
    func: &FunctionalDescriptor,
) -> Result<DetachOutcome, Error> {
    info!("determining device status");
    let status = match request::get_status(t, interface) {
        Ok(s) => s,
        Err(Error::Usb {
            source: rusb::Error::Pipe,
            ..
        }) => {
            info!("device does not implement get_status, assuming appIDLE");
            DfuStatusResponse {
                status: crate::request::DfuStatus::OK,
                poll_timeout: 0,
                state: DfuState::appIDLE,
                string_index: 0,
            }
        }
        Err(e) => return Err(e),
    };
    sleep(Duration::from_millis(status.poll_timeout as u64));

    match status.state {
        DfuState::appIDLE | DfuState::appDETACH => {
            info!("device really in run-time mode, sending DFU detach request");
            if let Err(e) = request::detach(t, interface, func.detach_timeout_ms) {
                log::warn!("error detaching: {e}");
            }
            if func.attributes & ATTR_WILL_DETACH != 0 {
                info!("device will detach and reattach on its own");
                Ok(DetachOutcome::WillDetachOnItsOwn)
            } else {
                info!("resetting USB bus");
                Ok(DetachOutcome::BusResetIssued)
            }
        }
        DfuState::dfuERROR => {
            info!("dfuERROR, clearing status");
            request::clear_status(t, interface)?;
            log::warn!(
                "device already in DFU mode? (bState={:?})",
                status.state
            );
            Ok(DetachOutcome::AlreadyInDfuMode)
        }
        other => {
            log::warn!("device already in DFU mode? (bState={other:?})");
            Ok(DetachOutcome::AlreadyInDfuMode)
        }
    }
}

/// Synchronizes with the device before dispatching an upload/download,
/// per spec.md §4.10 "status loop": clear a `dfuERROR`, abort a leftover
/// `*_IDLE` transfer, and reject if the device is still in run-time mode.
pub fn sync_before_transfer<T: UsbTransport>(
    t: &T,
    interface: u16,
) -> Result<DfuStatusResponse, Error> {
    loop {
        let status = request::get_status(t, interface)?;
        sleep(Duration::from_millis(status.poll_timeout as u64));

        match status.state {
            DfuState::appIDLE | DfuState::appDETACH => {
                return Err(crate::error::ProtocolError::StillInRuntimeMode.into());
            }
            DfuState::dfuERROR => {
                info!("clearing status");
                request::clear_status(t, interface)?;
                continue;
            }
            DfuState::dfuDNLOAD_IDLE | DfuState::dfuUPLOAD_IDLE => {
                info!("aborting previous incomplete transfer");
                request::abort(t, interface)?;
                continue;
            }
            _ => return Ok(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    #[test]
    fn abort_to_idle_sends_abort_when_dnload_idle() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        mock.push_status(DfuState::dfuIDLE, 0);
        abort_to_idle(&mock, 0).unwrap();
        assert_eq!(mock.abort_count(), 1);
    }

    #[test]
    fn poll_after_dnload_clears_error_and_continues() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuDNBUSY, 10);
        mock.push_status(DfuState::dfuERROR, 0);
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        let status = poll_after_dnload(&mock, 0).unwrap();
        assert_eq!(status.state, DfuState::dfuDNLOAD_IDLE);
        assert_eq!(mock.clrstatus_count(), 1);
    }

    #[test]
    fn poll_manifestation_waits_through_manifest_states() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuMANIFEST_SYNC, 10);
        mock.push_status(DfuState::dfuMANIFEST, 10);
        mock.push_status(DfuState::dfuIDLE, 0);
        let status = poll_manifestation(&mock, 0).unwrap();
        assert_eq!(status.state, DfuState::dfuIDLE);
    }

    #[test]
    fn poll_after_dnload_treats_manifest_sync_as_unexpected() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuMANIFEST_SYNC, 10);
        let status = poll_after_dnload(&mock, 0).unwrap();
        assert_eq!(status.state, DfuState::dfuMANIFEST_SYNC);
    }
}
