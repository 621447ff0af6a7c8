//! Device discovery and interface matching (C4), grounded in
//! `probe_configuration`/`probe_devices`/`get_path` from the original tool's
//! device-detection pass: walk every configuration and alt-setting of every
//! USB device, classify each DFU-subclass interface as runtime or DFU mode,
//! and keep the ones that satisfy the caller's match filter.

use std::time::Duration;

use rusb::UsbContext;

use crate::error::{Error, ProtocolError};
use crate::quirks::{self, Quirks};
use crate::request::FunctionalDescriptor;

const USB_DT_DFU: u8 = 0x21;
const USB_DT_STRING: u8 = 0x03;
const DFU_INTERFACE_CLASS: u8 = 0xfe;
const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
const MAX_DESC_STR_LEN: usize = 253;

const STD_STRING_DESCRIPTOR: u8 = rusb::constants::LIBUSB_ENDPOINT_IN
    | rusb::constants::LIBUSB_REQUEST_TYPE_STANDARD
    | rusb::constants::LIBUSB_RECIPIENT_DEVICE;
const LIBUSB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// A filter field that can require an exact value, accept anything, or
/// (rarely) match nothing at all -- replacing the `-1`/`0x10000` sentinels
/// the original tool packed into plain ints for "don't care"/"impossible".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MatchField<T> {
    #[default]
    Any,
    Exact(T),
    Never,
}

impl<T: PartialEq> MatchField<T> {
    fn accepts(&self, value: &T) -> bool {
        match self {
            MatchField::Any => true,
            MatchField::Exact(want) => want == value,
            MatchField::Never => false,
        }
    }
}

/// The full set of `-d`/`-p`/`-S`/etc. match criteria (spec.md §6), split
/// into runtime-mode and DFU-mode variants exactly as `dfu_util.c` does:
/// `match_vendor`/`match_product`/`match_serial` apply to runtime-mode
/// candidates, `match_vendor_dfu`/`match_product_dfu`/`match_serial_dfu` to
/// DFU-mode ones.
#[derive(Clone, Debug, Default)]
pub struct MatchSpec {
    pub vendor: MatchField<u16>,
    pub product: MatchField<u16>,
    pub vendor_dfu: MatchField<u16>,
    pub product_dfu: MatchField<u16>,
    pub devnum: MatchField<u8>,
    pub config_index: MatchField<u8>,
    pub iface_index: MatchField<u8>,
    pub iface_alt_index: MatchField<u8>,
    pub iface_alt_name: Option<String>,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
    pub path: Option<String>,
}

/// Everything discovered about one DFU-capable alt-setting, the Rust
/// equivalent of `struct dfu_if` -- but collected into an owned, ordered
/// `Vec<InterfaceRecord>` rather than `dfu_util.c`'s intrusive linked list.
#[derive(Clone, Debug)]
pub struct InterfaceRecord {
    pub functional: FunctionalDescriptor,
    pub quirks: Quirks,
    pub vendor: u16,
    pub product: u16,
    pub bcd_device: u16,
    pub configuration: u8,
    pub interface: u8,
    pub alt_setting: u8,
    pub devnum: u8,
    pub bus_number: u8,
    pub path: Option<String>,
    pub alt_name: String,
    pub serial_name: String,
    pub is_dfu_mode: bool,
    pub has_multiple_alt: bool,
    pub max_packet_size0: u8,
}

/// Scans a concatenated descriptor list for the first descriptor of
/// `desc_type`, returning it truncated to at most `max_len` bytes. Mirrors
/// `find_descriptor` in `dfu_util.c`.
fn find_descriptor(desc_list: &[u8], desc_type: u8, max_len: usize) -> Option<Vec<u8>> {
    if desc_list.len() < 2 {
        return None;
    }
    let mut p = 0;
    while p + 1 < desc_list.len() {
        let desclen = desc_list[p] as usize;
        if desclen == 0 {
            return None;
        }
        if desc_list[p + 1] == desc_type {
            let end = (p + desclen).min(desc_list.len()).min(p + max_len);
            return Some(desc_list[p..end].to_vec());
        }
        p += desclen;
    }
    None
}

/// `get_utf8_string_descriptor`: fetches a string descriptor's raw payload
/// bytes without assuming UTF-16LE, for devices (e.g. GD32VF103) that store
/// raw UTF-8/ASCII there instead.
fn read_raw_string_descriptor(
    handle: &rusb::DeviceHandle<rusb::Context>,
    index: u8,
) -> Result<Vec<u8>, Error> {
    let mut tbuf = [0u8; 255];
    let r = handle
        .read_control(
            STD_STRING_DESCRIPTOR,
            LIBUSB_REQUEST_GET_DESCRIPTOR,
            (u16::from(USB_DT_STRING)) << 8,
            0,
            &mut tbuf,
            Duration::from_secs(5),
        )
        .map_err(|e| Error::usb(e, "retrieving language identifiers"))?;
    if r < 4 || tbuf[0] < 4 || tbuf[1] != USB_DT_STRING {
        return Err(Error::Data("broken LANGID string descriptor".into()));
    }
    let langid = u16::from(tbuf[2]) | (u16::from(tbuf[3]) << 8);

    let r = handle
        .read_control(
            STD_STRING_DESCRIPTOR,
            LIBUSB_REQUEST_GET_DESCRIPTOR,
            (u16::from(USB_DT_STRING) << 8) | u16::from(index),
            langid,
            &mut tbuf,
            Duration::from_secs(5),
        )
        .map_err(|e| Error::usb(e, "retrieving string descriptor"))?;
    if r < 2 || tbuf[0] < 2 {
        return Err(Error::Data(format!("string descriptor {index} too short")));
    }
    if tbuf[1] != USB_DT_STRING {
        return Err(Error::Data(format!(
            "malformed string descriptor {index}, type = {:#04x}",
            tbuf[1]
        )));
    }
    let mut len = tbuf[0] as usize;
    if len > r {
        len = r;
    }
    Ok(tbuf[2..len].to_vec())
}

/// `get_string_descriptor_ascii`: UTF-16LE -> best-effort ASCII, tolerating
/// truncated descriptors as seen on some ROM bootloaders.
fn read_ascii_string_descriptor(
    handle: &rusb::DeviceHandle<rusb::Context>,
    index: u8,
) -> Result<String, Error> {
    let raw = read_raw_string_descriptor(handle, index)?;
    let mut out = String::with_capacity(raw.len() / 2);
    let mut si = 0;
    while si + 1 < raw.len() && out.len() < MAX_DESC_STR_LEN {
        if raw[si + 1] != 0 {
            out.push('?');
        } else {
            out.push(raw[si] as char);
        }
        si += 2;
    }
    Ok(out)
}

/// Reconstructs the raw 16-bit BCD `bcdDevice` field from the decoded
/// major/minor/sub-minor triple rusb exposes as a [`rusb::Version`].
fn bcd_device(desc: &rusb::DeviceDescriptor) -> u16 {
    let v = desc.device_version();
    (u16::from(v.major()) << 8) | (u16::from(v.minor()) << 4) | u16::from(v.sub_minor())
}

/// The bus-port path string used by `-p`/`--path`, e.g. `"1-2.3"`.
pub fn device_path(device: &rusb::Device<rusb::Context>) -> Option<String> {
    let ports = device.port_numbers().ok()?;
    if ports.is_empty() {
        return None;
    }
    let mut s = format!("{}-{}", device.bus_number(), ports[0]);
    for p in &ports[1..] {
        s.push('.');
        s.push_str(&p.to_string());
    }
    Some(s)
}

/// Classifies a DFU-subclass interface as runtime or DFU mode, applying the
/// vendor-specific `bInterfaceProtocol` exceptions `dfu_util.c` hard-codes.
fn classify_dfu_mode(
    vendor: u16,
    product: u16,
    protocol: u8,
    is_dfuse: bool,
    num_interfaces: usize,
) -> bool {
    if protocol == 2 {
        return true;
    }
    if is_dfuse && protocol == 0 {
        return true;
    }
    if vendor == 0x1fc9 && product == 0x000c && protocol == 1 {
        return true;
    }
    if vendor == 0x0b0e && protocol == 0 && num_interfaces == 1 {
        return true;
    }
    false
}

/// Walks every configuration/interface/alt-setting of one device, yielding
/// the [`InterfaceRecord`]s that satisfy `spec`. Equivalent to
/// `probe_configuration`, but returns owned records instead of mutating a
/// global linked list.
pub fn probe_device(
    context: &rusb::Context,
    device: &rusb::Device<rusb::Context>,
    spec: &MatchSpec,
) -> Result<Vec<InterfaceRecord>, Error> {
    let _ = context;
    let desc = device
        .device_descriptor()
        .map_err(|e| Error::usb(e, "reading device descriptor"))?;
    let path = device_path(device);
    if let Some(want) = &spec.path {
        if path.as_deref() != Some(want.as_str()) {
            return Ok(Vec::new());
        }
    }

    let mut out = Vec::new();

    for cfg_idx in 0..desc.num_configurations() {
        let cfg = match device.config_descriptor(cfg_idx) {
            Ok(cfg) => cfg,
            // The original tool treats a failed config-descriptor fetch as
            // skip-this-configuration-and-keep-looking, not abort-the-scan.
            Err(_) => continue,
        };
        if !spec.config_index.accepts(&cfg.number()) {
            continue;
        }

        let mut func_dfu = find_descriptor(cfg.extra(), USB_DT_DFU, 9)
            .and_then(|b| FunctionalDescriptor::parse(&b));
        let mut has_dfu_iface = false;

        if func_dfu.is_none() {
            'outer: for intf in cfg.interfaces() {
                for alt in intf.descriptors() {
                    if alt.class_code() != DFU_INTERFACE_CLASS
                        || alt.sub_class_code() != DFU_INTERFACE_SUBCLASS
                    {
                        continue;
                    }
                    if let Some(b) = find_descriptor(alt.extra(), USB_DT_DFU, 9) {
                        func_dfu = FunctionalDescriptor::parse(&b);
                        if func_dfu.is_some() {
                            break 'outer;
                        }
                    }
                    has_dfu_iface = true;
                }
            }
        }

        if func_dfu.is_none() && has_dfu_iface {
            if let Ok(handle) = device.open() {
                let mut buf = [0u8; 9];
                if let Ok(n) = handle.read_control(
                    rusb::constants::LIBUSB_ENDPOINT_IN | rusb::constants::LIBUSB_REQUEST_TYPE_STANDARD,
                    LIBUSB_REQUEST_GET_DESCRIPTOR,
                    (u16::from(USB_DT_DFU)) << 8,
                    0,
                    &mut buf,
                    Duration::from_secs(5),
                ) {
                    func_dfu = FunctionalDescriptor::parse(&buf[..n]);
                }
            }
            if func_dfu.is_none() {
                log::warn!("device has DFU interface, but has no DFU functional descriptor");
                func_dfu = Some(FunctionalDescriptor::synthesize_default());
            }
        }

        let func_dfu = match func_dfu {
            Some(f) => f,
            None => continue,
        };

        for (intf_idx, intf) in cfg.interfaces().enumerate() {
            if !spec.iface_index.accepts(&(intf_idx as u8)) {
                continue;
            }
            let alts: Vec<_> = intf.descriptors().collect();
            let has_multiple_alt = !alts.is_empty();

            for alt in &alts {
                if alt.class_code() != DFU_INTERFACE_CLASS
                    || alt.sub_class_code() != DFU_INTERFACE_SUBCLASS
                {
                    continue;
                }

                let quirks = quirks::lookup(desc.vendor_id(), desc.product_id(), bcd_device(&desc));
                let is_dfu_mode = classify_dfu_mode(
                    desc.vendor_id(),
                    desc.product_id(),
                    alt.protocol_code(),
                    func_dfu.is_dfuse(),
                    cfg.num_interfaces() as usize,
                );

                if is_dfu_mode && !spec.iface_alt_index.accepts(&alt.setting_number()) {
                    continue;
                }

                if is_dfu_mode {
                    if !spec.vendor_dfu.accepts(&desc.vendor_id())
                        || !spec.product_dfu.accepts(&desc.product_id())
                    {
                        continue;
                    }
                } else if !spec.vendor.accepts(&desc.vendor_id()) || !spec.product.accepts(&desc.product_id())
                {
                    continue;
                }

                let devnum = device.address();
                if !spec.devnum.accepts(&devnum) {
                    continue;
                }

                let handle = match device.open() {
                    Ok(h) => h,
                    Err(e) => {
                        log::warn!(
                            "cannot open DFU device {:04x}:{:04x} found on devnum {} ({e})",
                            desc.vendor_id(),
                            desc.product_id(),
                            devnum
                        );
                        continue;
                    }
                };

                let alt_name = match alt.description_string_index() {
                    Some(idx) if idx != 0 => {
                        read_ascii_string_descriptor(&handle, idx).unwrap_or_else(|_| "UNKNOWN".into())
                    }
                    _ => "UNKNOWN".into(),
                };

                let serial_name = match desc.serial_number_string_index() {
                    Some(idx) if idx != 0 => {
                        if quirks.contains(Quirks::UTF8_SERIAL) {
                            read_raw_string_descriptor(&handle, idx)
                                .map(|b| String::from_utf8_lossy(&b).into_owned())
                                .unwrap_or_else(|_| "UNKNOWN".into())
                        } else {
                            read_ascii_string_descriptor(&handle, idx).unwrap_or_else(|_| "UNKNOWN".into())
                        }
                    }
                    _ => "UNKNOWN".into(),
                };

                if is_dfu_mode {
                    if let Some(want) = &spec.iface_alt_name {
                        if &alt_name != want {
                            continue;
                        }
                    }
                }

                let serial_filter = if is_dfu_mode { &spec.serial_dfu } else { &spec.serial };
                if let Some(want) = serial_filter {
                    if &serial_name != want {
                        continue;
                    }
                }

                let mut func_dfu = func_dfu;
                if quirks.contains(Quirks::FORCE_DFU11) {
                    func_dfu.dfu_version = 0x0110;
                }

                out.push(InterfaceRecord {
                    functional: func_dfu,
                    quirks,
                    vendor: desc.vendor_id(),
                    product: desc.product_id(),
                    bcd_device: bcd_device(&desc),
                    configuration: cfg.number(),
                    interface: alt.interface_number(),
                    alt_setting: alt.setting_number(),
                    devnum,
                    bus_number: device.bus_number(),
                    path: path.clone(),
                    alt_name,
                    serial_name,
                    is_dfu_mode,
                    has_multiple_alt,
                    max_packet_size0: desc.max_packet_size(),
                });
            }
        }
    }

    Ok(out)
}

/// Enumerates every USB device visible to `context` and probes each one,
/// equivalent to `probe_devices`.
pub fn probe_devices(context: &rusb::Context, spec: &MatchSpec) -> Result<Vec<InterfaceRecord>, Error> {
    let devices = context
        .devices()
        .map_err(|e| Error::usb(e, "enumerating USB devices"))?;
    let mut out = Vec::new();
    for device in devices.iter() {
        out.extend(probe_device(context, &device, spec)?);
    }
    Ok(out)
}

/// Enforces spec.md §4.4's "exactly one candidate" rule, with the
/// `dfuse_multiple_alt` exception: when every remaining candidate shares the
/// same vendor/product/devnum/path and differs only in alt-setting, and the
/// caller is in DfuSe command mode, multiple matches are accepted (the
/// command applies identically to each memory segment's interface).
pub fn select_single<'a>(
    candidates: &'a [InterfaceRecord],
    allow_multiple_alt: bool,
) -> Result<&'a InterfaceRecord, Error> {
    match candidates.len() {
        0 => Err(ProtocolError::NoDevice.into()),
        1 => Ok(&candidates[0]),
        _ => {
            if allow_multiple_alt
                && candidates.windows(2).all(|w| {
                    w[0].vendor == w[1].vendor
                        && w[0].product == w[1].product
                        && w[0].devnum == w[1].devnum
                        && w[0].path == w[1].path
                })
            {
                Ok(&candidates[0])
            } else {
                Err(ProtocolError::AmbiguousDevice.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_descriptor_locates_type_in_list() {
        let list = [0x03u8, 0x99, 0xaa, 0x09, USB_DT_DFU, 1, 2, 3, 4, 5, 6, 7, 8];
        let found = find_descriptor(&list, USB_DT_DFU, 9).unwrap();
        assert_eq!(found[0], 0x09);
        assert_eq!(found[1], USB_DT_DFU);
    }

    #[test]
    fn find_descriptor_returns_none_when_absent() {
        let list = [0x03u8, 0x99, 0xaa];
        assert!(find_descriptor(&list, USB_DT_DFU, 9).is_none());
    }

    #[test]
    fn classify_dfu_mode_handles_lpc_runtime_protocol_exception() {
        assert!(classify_dfu_mode(0x1fc9, 0x000c, 1, false, 1));
        assert!(!classify_dfu_mode(0x1fc9, 0x000c, 1, false, 2));
    }

    #[test]
    fn classify_dfu_mode_handles_dfuse_protocol_zero() {
        assert!(classify_dfu_mode(0x0483, 0xdf11, 0, true, 1));
        assert!(!classify_dfu_mode(0x0483, 0xdf11, 0, false, 1));
    }

    #[test]
    fn match_field_any_accepts_everything() {
        let f: MatchField<u16> = MatchField::Any;
        assert!(f.accepts(&0x1234));
    }

    #[test]
    fn match_field_exact_rejects_mismatch() {
        let f = MatchField::Exact(0x0483u16);
        assert!(f.accepts(&0x0483));
        assert!(!f.accepts(&0x1234));
    }
}
