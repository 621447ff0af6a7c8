//! Session configuration (C10 data): everything `main.c`'s pile of globals
//! (`match_vendor`, `mode`, `dfuse_options`, `transfer_size`, ...) collapses
//! into, plus the small parsers that turn the CLI's string syntax
//! (`vendor:product`, `*`/`-` sentinels, `addr:opt:opt...`) into typed
//! values `orchestrator::run` consumes directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::{MatchField, MatchSpec};
use crate::error::Error;

/// What a single run of the orchestrator is supposed to do, per spec.md §6.
#[derive(Debug, Clone)]
pub enum SessionMode {
    List,
    /// `-e`/`--detach` with no upload/download file: detach and exit.
    Detach,
    Upload {
        file: PathBuf,
        /// `-Z`/`--upload-size`: explicit byte limit.
        upload_size: Option<usize>,
    },
    Download {
        file: PathBuf,
    },
    /// Bare `-s`/`--dfuse-address` with mass-erase/unprotect/leave and no
    /// `-U`/`-D` file: a DfuSe special-command-only run (restored feature 5).
    DfuseCommand,
}

/// The DfuSe sub-options carried by `-s/--dfuse-address`, per spec.md §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct DfuseOptions {
    pub address: Option<u32>,
    /// Bare-number sub-option: upload length when in upload mode.
    pub length: Option<usize>,
    pub force: bool,
    pub leave: bool,
    pub mass_erase: bool,
    pub unprotect: bool,
    pub will_reset: bool,
}

impl DfuseOptions {
    pub fn is_present(&self) -> bool {
        self.address.is_some()
            || self.length.is_some()
            || self.force
            || self.leave
            || self.mass_erase
            || self.unprotect
            || self.will_reset
    }
}

/// Everything the orchestrator needs for one run, assembled by `main.rs`
/// from parsed CLI arguments.
#[derive(Debug, Clone)]
pub struct Session {
    pub match_spec: MatchSpec,
    pub mode: SessionMode,
    pub transfer_size_override: Option<usize>,
    pub detach: bool,
    pub detach_delay: Duration,
    pub wait_for_device: bool,
    pub final_reset: bool,
    pub dfuse: DfuseOptions,
}

/// Parses one `-d`/`--device` vendor or product token: `*` means "match
/// anything", `-` means "match nothing" (used to disable runtime matching
/// while specifying DFU-mode IDs only), anything else is a hex or decimal
/// 16-bit ID. Mirrors `parse_vendprod` in the original tool.
fn parse_id_token(tok: &str) -> Result<MatchField<u16>, Error> {
    match tok {
        "*" => Ok(MatchField::Any),
        "-" => Ok(MatchField::Never),
        _ => {
            let tok = tok.trim();
            let (radix, digits) = match tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
                Some(hex) => (16, hex),
                None => (10, tok),
            };
            u16::from_str_radix(digits, radix)
                .map(MatchField::Exact)
                .map_err(|_| Error::Usage(format!("invalid vendor/product ID: {tok}")))
        }
    }
}

/// Parses the full `-d` argument: `vendor:product` (applies to both
/// runtime- and DFU-mode matching) or `vendor:product,vendor_dfu:product_dfu`
/// (applies separately), per spec.md §6.
pub fn parse_device_spec(
    s: &str,
) -> Result<(MatchField<u16>, MatchField<u16>, MatchField<u16>, MatchField<u16>), Error> {
    let mut groups = s.splitn(2, ',');
    let first = groups.next().unwrap_or("");
    let (vendor, product) = parse_vendor_product_pair(first)?;

    match groups.next() {
        Some(second) => {
            let (vendor_dfu, product_dfu) = parse_vendor_product_pair(second)?;
            Ok((vendor, product, vendor_dfu, product_dfu))
        }
        None => Ok((vendor, product, vendor, product)),
    }
}

fn parse_vendor_product_pair(s: &str) -> Result<(MatchField<u16>, MatchField<u16>), Error> {
    let mut parts = s.splitn(2, ':');
    let vendor = parts
        .next()
        .map(parse_id_token)
        .transpose()?
        .unwrap_or(MatchField::Any);
    let product = parts
        .next()
        .map(parse_id_token)
        .transpose()?
        .unwrap_or(MatchField::Any);
    Ok((vendor, product))
}

/// Parses `-S/--serial`: `serial` or `serial,serial_dfu`.
pub fn parse_serial_spec(s: &str) -> (Option<String>, Option<String>) {
    let mut groups = s.splitn(2, ',');
    let first = groups.next().filter(|s| !s.is_empty()).map(String::from);
    match groups.next() {
        Some(second) if !second.is_empty() => (first.clone(), Some(second.to_string())),
        _ => (first.clone(), first),
    }
}

/// Parses `-a/--alt`: a bare number is an alt-setting index, anything else
/// is matched against the alt-setting's name string.
pub fn parse_alt_spec(s: &str) -> (MatchField<u8>, Option<String>) {
    match s.parse::<u8>() {
        Ok(n) => (MatchField::Exact(n), None),
        Err(_) => (MatchField::Any, Some(s.to_string())),
    }
}

/// Parses `-s/--dfuse-address <addr[:opt[:opt...]]>`, per spec.md §6: the
/// first colon-separated token is the hex address (or empty, leaving it
/// unset); remaining tokens are `force`, `leave`, `mass-erase`, `unprotect`,
/// `will-reset`, or a bare number (upload length).
pub fn parse_dfuse_spec(s: &str) -> Result<DfuseOptions, Error> {
    let mut opts = DfuseOptions::default();
    let mut parts = s.split(':');

    if let Some(addr_tok) = parts.next() {
        if !addr_tok.is_empty() {
            let digits = addr_tok.trim_start_matches("0x").trim_start_matches("0X");
            let address = u32::from_str_radix(digits, 16)
                .map_err(|_| Error::Usage(format!("invalid DfuSe address: {addr_tok}")))?;
            opts.address = Some(address);
        }
    }

    for opt in parts {
        match opt {
            "force" => opts.force = true,
            "leave" => opts.leave = true,
            "mass-erase" => opts.mass_erase = true,
            "unprotect" => opts.unprotect = true,
            "will-reset" => opts.will_reset = true,
            "" => {}
            n => {
                let len: usize = n
                    .parse()
                    .map_err(|_| Error::Usage(format!("invalid dfuse-address option: {n}")))?;
                opts.length = Some(len);
            }
        }
    }

    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_spec_single_pair_applies_to_both_modes() {
        let (v, p, vd, pd) = parse_device_spec("0483:df11").unwrap();
        assert_eq!(v, MatchField::Exact(0x0483));
        assert_eq!(p, MatchField::Exact(0xdf11));
        assert_eq!(vd, MatchField::Exact(0x0483));
        assert_eq!(pd, MatchField::Exact(0xdf11));
    }

    #[test]
    fn device_spec_two_pairs_applies_separately() {
        let (v, p, vd, pd) = parse_device_spec("1234:5678,0483:df11").unwrap();
        assert_eq!(v, MatchField::Exact(0x1234));
        assert_eq!(p, MatchField::Exact(0x5678));
        assert_eq!(vd, MatchField::Exact(0x0483));
        assert_eq!(pd, MatchField::Exact(0xdf11));
    }

    #[test]
    fn device_spec_star_and_dash_sentinels() {
        let (v, p, vd, pd) = parse_device_spec("*:-,0483:df11").unwrap();
        assert_eq!(v, MatchField::Any);
        assert_eq!(p, MatchField::Never);
        assert_eq!(vd, MatchField::Exact(0x0483));
        assert_eq!(pd, MatchField::Exact(0xdf11));
    }

    #[test]
    fn serial_spec_splits_runtime_and_dfu() {
        let (rt, dfu) = parse_serial_spec("ABC123,DEF456");
        assert_eq!(rt.as_deref(), Some("ABC123"));
        assert_eq!(dfu.as_deref(), Some("DEF456"));
    }

    #[test]
    fn serial_spec_single_value_applies_to_both() {
        let (rt, dfu) = parse_serial_spec("ABC123");
        assert_eq!(rt.as_deref(), Some("ABC123"));
        assert_eq!(dfu.as_deref(), Some("ABC123"));
    }

    #[test]
    fn alt_spec_numeric_vs_name() {
        assert_eq!(parse_alt_spec("2").0, MatchField::Exact(2));
        assert_eq!(parse_alt_spec("Internal Flash").1.as_deref(), Some("Internal Flash"));
    }

    #[test]
    fn dfuse_spec_parses_address_and_options() {
        let opts = parse_dfuse_spec("0x08000000:force:leave").unwrap();
        assert_eq!(opts.address, Some(0x0800_0000));
        assert!(opts.force);
        assert!(opts.leave);
        assert!(!opts.mass_erase);
    }

    #[test]
    fn dfuse_spec_bare_number_is_upload_length() {
        let opts = parse_dfuse_spec(":4096").unwrap();
        assert_eq!(opts.length, Some(4096));
        assert!(opts.address.is_none());
    }
}
