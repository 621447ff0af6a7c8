//! USB transport adapter (C1).
//!
//! A thin capability over a USB library, grounded in the way
//! `examples/other_examples/*sourcebox-dfu-buddy*` drives `rusb`:
//! `write_control`/`read_control` for class requests, `claim_interface`/
//! `set_alternate_setting` for interface setup, `reset` for the bus reset
//! used after a runtime->DFU detach. It never interprets protocol — that's
//! left to [`crate::request`] and the state machine built on top of it.

use std::time::Duration;

use crate::error::Error;

/// Capability every DFU operation is built on. Implemented for real hardware
/// by [`RusbTransport`] and, in tests, by a scripted mock so the protocol
/// engine (C2-C3, C5, C7-C8) can be exercised without a physical device.
pub trait UsbTransport {
    /// Host-to-device class request with the interface recipient (spec.md
    /// §4.2: `RequestType = CLASS|INTERFACE`). Returns bytes transferred.
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error>;

    /// Device-to-host class request with the interface recipient. Returns
    /// bytes actually returned (a short read is meaningful, see spec.md §4.5).
    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error>;

    fn claim_interface(&self, interface: u8) -> Result<(), Error>;
    fn release_interface(&self, interface: u8) -> Result<(), Error>;
    fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> Result<(), Error>;

    /// Bus reset. `LIBUSB_ERROR_NOT_FOUND` afterwards is tolerated by
    /// callers per spec.md §7 (device is re-enumerating).
    fn reset(&self) -> Result<(), Error>;
}

/// Default control-transfer timeout used throughout the core, per spec.md
/// §5 ("every control transfer blocks for at most a fixed 5s driver
/// timeout").
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// [`UsbTransport`] backed by a real `rusb::DeviceHandle`.
pub struct RusbTransport<'a> {
    handle: &'a rusb::DeviceHandle<rusb::Context>,
}

impl<'a> RusbTransport<'a> {
    pub fn new(handle: &'a rusb::DeviceHandle<rusb::Context>) -> Self {
        Self { handle }
    }
}

/// bmRequestType for host->device, class, interface-recipient requests.
const REQTYPE_CLASS_OUT: u8 =
    rusb::constants::LIBUSB_REQUEST_TYPE_CLASS | rusb::constants::LIBUSB_RECIPIENT_INTERFACE;
/// bmRequestType for device->host, class, interface-recipient requests.
const REQTYPE_CLASS_IN: u8 = rusb::constants::LIBUSB_ENDPOINT_IN
    | rusb::constants::LIBUSB_REQUEST_TYPE_CLASS
    | rusb::constants::LIBUSB_RECIPIENT_INTERFACE;

impl<'a> UsbTransport for RusbTransport<'a> {
    fn control_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.handle
            .write_control(REQTYPE_CLASS_OUT, request, value, index, data, timeout)
            .map_err(|e| Error::usb(e, "issuing DFU class request"))
    }

    fn control_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.handle
            .read_control(REQTYPE_CLASS_IN, request, value, index, data, timeout)
            .map_err(|e| Error::usb(e, "issuing DFU class request"))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), Error> {
        self.handle
            .claim_interface(interface)
            .map_err(|e| Error::usb(e, "claiming interface"))
    }

    fn release_interface(&self, interface: u8) -> Result<(), Error> {
        self.handle
            .release_interface(interface)
            .map_err(|e| Error::usb(e, "releasing interface"))
    }

    fn set_alternate_setting(&self, interface: u8, alt_setting: u8) -> Result<(), Error> {
        self.handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(|e| Error::usb(e, "setting alternate interface"))
    }

    fn reset(&self) -> Result<(), Error> {
        match self.handle.reset() {
            Ok(()) => Ok(()),
            // Re-enumeration after a bus reset commonly makes the handle
            // disappear out from under us; spec.md §7 says to tolerate this.
            Err(rusb::Error::NotFound) => Ok(()),
            Err(e) => Err(Error::usb(e, "resetting bus")),
        }
    }
}
