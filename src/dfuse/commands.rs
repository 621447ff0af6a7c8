//! DfuSe special commands (C7): SET_ADDRESS, ERASE_PAGE, MASS_ERASE and
//! READ_UNPROTECT, encoded as DNLOAD(wValue=0) payloads, with the exact
//! poll loop and stall/quirk workarounds from `dfuse_special_command` in the
//! original tool.

use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, ProtocolError};
use crate::quirks::{self, Quirks};
use crate::request::{self, DfuState, DfuStatus};
use crate::transport::UsbTransport;

/// The four DfuSe special commands, carried in the first byte of a
/// DNLOAD(wValue=0) payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpecialCommand {
    SetAddress,
    ErasePage,
    MassErase,
    ReadUnprotect,
}

impl SpecialCommand {
    fn name(self) -> &'static str {
        match self {
            SpecialCommand::SetAddress => "SET_ADDRESS",
            SpecialCommand::ErasePage => "ERASE_PAGE",
            SpecialCommand::MassErase => "MASS_ERASE",
            SpecialCommand::ReadUnprotect => "READ_UNPROTECT",
        }
    }

    fn encode(self, address: u32) -> Vec<u8> {
        let a = address.to_le_bytes();
        match self {
            SpecialCommand::SetAddress => vec![0x21, a[0], a[1], a[2], a[3]],
            SpecialCommand::ErasePage => vec![0x41, a[0], a[1], a[2], a[3]],
            SpecialCommand::MassErase => vec![0x41],
            SpecialCommand::ReadUnprotect => vec![0x92],
        }
    }
}

const MAX_POLLS_BEFORE_WEDGE_CHECK: u32 = 4;
const MAX_PIPE_STALLS: u32 = 3;
const MAX_ZERO_WAIT_POLLS: u32 = 100;

/// Identity of the device this command runs against, needed to decide
/// whether the STM32H7/STM32F405 quirk workarounds apply.
#[derive(Copy, Clone, Debug)]
pub struct DeviceIdentity<'a> {
    pub vendor: u16,
    pub product: u16,
    pub serial: &'a str,
    pub quirks: Quirks,
}

fn is_stm32h7_erase_wedge_target(id: &DeviceIdentity) -> bool {
    id.quirks.contains(Quirks::STM32H7_ERASE_WEDGE)
        && id.vendor == 0x0483
        && id.product == 0xdf11
        && id.serial.starts_with(quirks::STM32H7_WEDGE_SERIAL_PREFIX)
}

/// Leaves the device in `dfuDNLOAD_IDLE` on success. Mirrors
/// `dfuse_special_command`, including its poll-loop stall/quirk handling.
pub fn special_command<T: UsbTransport>(
    t: &T,
    interface: u16,
    id: &DeviceIdentity,
    address: u32,
    command: SpecialCommand,
) -> Result<(), Error> {
    debug!("{} at {address:#010x}", command.name());
    let payload = command.encode(address);
    request::dnload(t, interface, 0, &payload)?;

    let mut n_polls = 0u32;
    let mut n_stalls = 0u32;
    let mut n_timeouts = 0u32;
    let mut poll_timeout = 0u32;
    let mut state = DfuState::dfuDNBUSY;
    let mut status = DfuStatus::OK;

    loop {
        if n_polls > MAX_POLLS_BEFORE_WEDGE_CHECK
            && command == SpecialCommand::ErasePage
            && is_stm32h7_erase_wedge_target(id)
        {
            warn!("STM32 DFU ERASE_PAGE fix: clearing the dfu FSM status");
            let _ = request::clear_status(t, interface);
        }

        match request::get_status(t, interface) {
            Ok(s) => {
                poll_timeout = s.poll_timeout;
                state = s.state;
                status = s.status;
            }
            Err(Error::Usb {
                source: rusb::Error::Pipe,
                ..
            }) if poll_timeout != 0 && n_stalls < MAX_PIPE_STALLS => {
                n_stalls += 1;
                debug!("device stalled USB pipe, reusing last poll timeout");
                state = DfuState::dfuDNBUSY;
            }
            Err(e) => return Err(e),
        }

        if n_polls == 0 {
            if state != DfuState::dfuDNBUSY {
                return Err(ProtocolError::UnexpectedState {
                    expected: DfuState::dfuDNBUSY,
                    actual: state,
                }
                .into());
            }
            if command == SpecialCommand::MassErase && poll_timeout == 100 {
                info!("STM32F405 mass-erase poll timeout workaround: sleeping 35s instead");
                poll_timeout = 35_000;
            }
        }

        sleep(Duration::from_millis(poll_timeout as u64));

        if command == SpecialCommand::ReadUnprotect {
            return Ok(());
        }

        if poll_timeout == 0 {
            n_timeouts += 1;
            if n_timeouts == MAX_ZERO_WAIT_POLLS {
                return Err(ProtocolError::DeviceStuck(n_timeouts).into());
            }
        } else {
            n_timeouts = 0;
        }

        n_polls += 1;

        if !matches!(state, DfuState::dfuDNBUSY | DfuState::dfuERROR) {
            break;
        }
    }

    if status != DfuStatus::OK {
        if command == SpecialCommand::ErasePage && is_stm32h7_erase_wedge_target(id) {
            warn!("ERASE_PAGE ended with an error, but this can be spurious on STM32H7");
        } else {
            return Err(ProtocolError::ErrorStatus {
                status,
                detail: status.detail(),
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    fn id() -> DeviceIdentity<'static> {
        DeviceIdentity {
            vendor: 0x0483,
            product: 0xdf11,
            serial: "200364500000",
            quirks: quirks::lookup(0x0483, 0xdf11, 0x0200),
        }
    }

    #[test]
    fn set_address_encodes_command_and_little_endian_address() {
        let payload = SpecialCommand::SetAddress.encode(0x0800_1234);
        assert_eq!(payload, vec![0x21, 0x34, 0x12, 0x00, 0x08]);
    }

    #[test]
    fn mass_erase_timeout_lie_is_substituted() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuDNBUSY, 100);
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        special_command(&mock, 0, &id(), 0, SpecialCommand::MassErase).unwrap();
    }

    #[test]
    fn erase_page_succeeds_after_one_busy_poll() {
        let mock = MockTransport::new();
        mock.push_status(DfuState::dfuDNBUSY, 10);
        mock.push_status(DfuState::dfuDNLOAD_IDLE, 0);
        special_command(&mock, 0, &id(), 0x0800_0000, SpecialCommand::ErasePage).unwrap();
    }
}
