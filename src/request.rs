//! DFU class requests (C2): typed control transfers with endianness and
//! recipient set correctly, per spec.md §4.2. All multibyte wire fields are
//! little-endian.

use std::time::Duration;

use byteorder::{ByteOrder, LE};
use num_enum::TryFromPrimitive;

use crate::error::{Error, ProtocolError};
use crate::transport::{UsbTransport, CONTROL_TIMEOUT};

/// bRequest values for the seven DFU class requests (spec.md §4.2 table).
#[repr(u8)]
#[allow(non_camel_case_types)]
enum Request {
    DETACH = 0x00,
    DNLOAD = 0x01,
    UPLOAD = 0x02,
    GETSTATUS = 0x03,
    CLRSTATUS = 0x04,
    GETSTATE = 0x05,
    ABORT = 0x06,
}

/// States a DFU device can be in, taken from the USB DFU 1.1 spec
/// (spec.md §4.3).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
pub enum DfuState {
    appIDLE = 0,
    appDETACH = 1,
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
}

/// Status codes a DFU device can return in bStatus.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)]
pub enum DfuStatus {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

impl DfuStatus {
    pub fn detail(&self) -> &'static str {
        use DfuStatus::*;
        match self {
            OK => "No error condition is present.",
            errTARGET => "File is not targeted for use by this device.",
            errFILE => "File is for this device but fails some vendor-specific verification test.",
            errWRITE => "Device is unable to write memory.",
            errERASE => "Memory erase function failed.",
            errCHECK_ERASED => "Memory erase check failed.",
            errPROG => "Program memory function failed.",
            errVERIFY => "Programmed memory failed verification.",
            errADDRESS => "Cannot program memory due to received address that is out of range.",
            errNOTDONE => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            errFIRMWARE => "Device's firmware is corrupt. It cannot return to run-time operations.",
            errVENDOR => "iString indicates a vendor-specific error.",
            errUSBR => "Device detected unexpected USB reset signaling.",
            errPOR => "Device detected unexpected power on reset.",
            errUNKNOWN => "Something went wrong, but the device does not know what it was.",
            errSTALLEDPKT => "Device stalled an unexpected request.",
        }
    }
}

/// The five fields returned by GETSTATUS (spec.md §3 "DFU status").
#[derive(Copy, Clone, Debug)]
pub struct DfuStatusResponse {
    pub status: DfuStatus,
    /// Poll timeout in milliseconds, a 24-bit field on the wire.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatusResponse {
    fn from_bytes(buf: &[u8; 6]) -> Result<Self, ProtocolError> {
        let status =
            DfuStatus::try_from(buf[0]).map_err(|_| ProtocolError::UnknownStatus(buf[0]))?;
        let poll_timeout = u32::from(buf[1]) | (u32::from(buf[2]) << 8) | (u32::from(buf[3]) << 16);
        let state = DfuState::try_from(buf[4]).map_err(|_| ProtocolError::UnknownState(buf[4]))?;
        Ok(Self {
            status,
            poll_timeout,
            state,
            string_index: buf[5],
        })
    }

    pub fn ensure_ok(&self) -> Result<(), ProtocolError> {
        if self.status != DfuStatus::OK {
            Err(ProtocolError::ErrorStatus {
                status: self.status,
                detail: self.status.detail(),
            })
        } else {
            Ok(())
        }
    }

    pub fn ensure_state(&self, expected: DfuState) -> Result<(), ProtocolError> {
        if self.state != expected {
            Err(ProtocolError::UnexpectedState {
                expected,
                actual: self.state,
            })
        } else {
            Ok(())
        }
    }
}

/// DFU_DETACH: generates a detach-attach sequence on the bus. No payload.
pub fn detach<T: UsbTransport>(t: &T, interface: u16, timeout_ms: u16) -> Result<(), Error> {
    t.control_write(Request::DETACH as u8, timeout_ms, interface, &[], CONTROL_TIMEOUT)?;
    Ok(())
}

/// DFU_DNLOAD: download (host->device) a single transaction. `transaction`
/// is the transaction number (spec.md Testable Property 1); an empty
/// `data` slice is the zero-length terminator packet.
pub fn dnload<T: UsbTransport>(
    t: &T,
    interface: u16,
    transaction: u16,
    data: &[u8],
) -> Result<usize, Error> {
    t.control_write(Request::DNLOAD as u8, transaction, interface, data, CONTROL_TIMEOUT)
}

/// DFU_UPLOAD: upload (device->host) a single transaction into `data`.
/// Returns the number of bytes actually returned; a short read signals the
/// last chunk per spec.md §4.5.
pub fn upload<T: UsbTransport>(
    t: &T,
    interface: u16,
    transaction: u16,
    data: &mut [u8],
) -> Result<usize, Error> {
    t.control_read(Request::UPLOAD as u8, transaction, interface, data, CONTROL_TIMEOUT)
}

/// DFU_GETSTATUS: fetch and parse the 6-byte status struct.
pub fn get_status<T: UsbTransport>(t: &T, interface: u16) -> Result<DfuStatusResponse, Error> {
    let mut buf = [0u8; 6];
    t.control_read(Request::GETSTATUS as u8, 0, interface, &mut buf, CONTROL_TIMEOUT)?;
    DfuStatusResponse::from_bytes(&buf).map_err(Error::from)
}

/// DFU_CLRSTATUS: clear an error condition.
pub fn clear_status<T: UsbTransport>(t: &T, interface: u16) -> Result<(), Error> {
    t.control_write(Request::CLRSTATUS as u8, 0, interface, &[], CONTROL_TIMEOUT)?;
    Ok(())
}

/// DFU_GETSTATE: fetch the single-byte device state.
pub fn get_state<T: UsbTransport>(t: &T, interface: u16) -> Result<DfuState, Error> {
    let mut buf = [0u8; 1];
    t.control_read(Request::GETSTATE as u8, 0, interface, &mut buf, CONTROL_TIMEOUT)?;
    DfuState::try_from(buf[0]).map_err(|_| Error::from(ProtocolError::UnknownState(buf[0])))
}

/// DFU_ABORT: abort the current operation and return to dfuIDLE.
pub fn abort<T: UsbTransport>(t: &T, interface: u16) -> Result<(), Error> {
    t.control_write(Request::ABORT as u8, 0, interface, &[], CONTROL_TIMEOUT)?;
    Ok(())
}

/// Decodes a DFU functional descriptor (7 or 9 bytes), per spec.md §3.
#[derive(Copy, Clone, Debug)]
pub struct FunctionalDescriptor {
    pub length: u8,
    pub attributes: u8,
    pub detach_timeout_ms: u16,
    /// `None` when the descriptor was only 7 bytes and the transfer size is
    /// therefore unknown; the caller must supply one.
    pub transfer_size: Option<u16>,
    pub dfu_version: u16,
}

pub const ATTR_CAN_DNLOAD: u8 = 1 << 0;
pub const ATTR_CAN_UPLOAD: u8 = 1 << 1;
pub const ATTR_MANIFEST_TOLERANT: u8 = 1 << 2;
pub const ATTR_WILL_DETACH: u8 = 1 << 3;

impl FunctionalDescriptor {
    /// Parses a raw functional descriptor buffer of at least 7 bytes.
    /// `bLength == 7` forces `bcdDFUVersion` to 0x0100 per spec.md §3.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 7 {
            return None;
        }
        let length = buf[0];
        let attributes = buf[2];
        let detach_timeout_ms = LE::read_u16(&buf[3..5]);
        if length == 7 {
            return Some(Self {
                length,
                attributes,
                detach_timeout_ms,
                transfer_size: None,
                dfu_version: 0x0100,
            });
        }
        if buf.len() < 9 {
            return Some(Self {
                length,
                attributes,
                detach_timeout_ms,
                transfer_size: None,
                dfu_version: 0x0100,
            });
        }
        let transfer_size = LE::read_u16(&buf[5..7]);
        let dfu_version = LE::read_u16(&buf[7..9]);
        Some(Self {
            length,
            attributes,
            detach_timeout_ms,
            transfer_size: Some(transfer_size),
            dfu_version,
        })
    }

    /// Synthesizes the "assume 1.0" fallback descriptor used when no
    /// functional descriptor could be located at all (spec.md §4.4 step 1).
    pub fn synthesize_default() -> Self {
        Self {
            length: 7,
            attributes: 0,
            detach_timeout_ms: 0,
            transfer_size: None,
            dfu_version: 0x0100,
        }
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == 0x011a
    }
}
