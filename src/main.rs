use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;

use dfu_rs::discovery::{InterfaceRecord, MatchField, MatchSpec};
use dfu_rs::error::Error;
use dfu_rs::orchestrator::{self, RunOutcome};
use dfu_rs::session::{self, Session, SessionMode};
use dfu_rs::transfer::ProgressSink;

/// Host-side USB DFU (1.0/1.1) and ST DfuSe firmware upgrade utility.
#[derive(Parser, Debug)]
#[command(name = "dfu-rs", version, about)]
struct Args {
    /// Print verbose debug statements (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// List currently attached DFU capable devices
    #[arg(short, long)]
    list: bool,

    /// Trigger a DFU reset
    #[arg(short = 'e', long)]
    detach: bool,

    /// Seconds to wait before reopening a device after a detach
    #[arg(short = 'E', long, default_value_t = 5)]
    detach_delay: u64,

    /// Specify Vendor/Product ID(s) of DFU device, "vendor:product[,vendor_dfu:product_dfu]"
    #[arg(short, long)]
    device: Option<String>,

    /// Specify path to DFU device
    #[arg(short, long)]
    path: Option<String>,

    /// Specify the Configuration of DFU device
    #[arg(short, long)]
    cfg: Option<u8>,

    /// Specify the DFU Interface number
    #[arg(short, long)]
    intf: Option<u8>,

    /// Specify the Alternate Setting number or name of the DFU Interface
    #[arg(short, long)]
    alt: Option<String>,

    /// Specify the Serial Number, "serial[,serial_dfu]"
    #[arg(short = 'S', long)]
    serial: Option<String>,

    /// Specify the device number (devnum) of DFU device
    #[arg(short = 'n', long)]
    devnum: Option<u8>,

    /// Specify the number of bytes per USB transfer
    #[arg(short, long)]
    transfer_size: Option<usize>,

    /// Read firmware from device into file
    #[arg(short = 'U', long, value_name = "FILE")]
    upload: Option<PathBuf>,

    /// Specify the number of bytes to upload from the device
    #[arg(short = 'Z', long)]
    upload_size: Option<usize>,

    /// Write firmware from file into device
    #[arg(short = 'D', long, value_name = "FILE")]
    download: Option<PathBuf>,

    /// Issue a USB bus reset once the operation completes
    #[arg(short = 'R', long)]
    reset: bool,

    /// Wait for the device to appear
    #[arg(short, long)]
    wait: bool,

    /// ST DfuSe address and sub-options, "address[:force][:leave][:mass-erase][:unprotect][:will-reset][:length]"
    #[arg(short = 's', long, value_name = "ADDRESS:...")]
    dfuse_address: Option<String>,
}

fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn build_match_spec(args: &Args) -> Result<MatchSpec> {
    let mut spec = MatchSpec::default();

    if let Some(d) = &args.device {
        let (vendor, product, vendor_dfu, product_dfu) = session::parse_device_spec(d)?;
        spec.vendor = vendor;
        spec.product = product;
        spec.vendor_dfu = vendor_dfu;
        spec.product_dfu = product_dfu;
    }
    if let Some(s) = &args.serial {
        let (serial, serial_dfu) = session::parse_serial_spec(s);
        spec.serial = serial;
        spec.serial_dfu = serial_dfu;
    }
    if let Some(a) = &args.alt {
        let (idx, name) = session::parse_alt_spec(a);
        spec.iface_alt_index = idx;
        spec.iface_alt_name = name;
    }
    // "-c 0" means "don't care", per restored feature 2.
    spec.config_index = match args.cfg {
        Some(0) | None => MatchField::Any,
        Some(n) => MatchField::Exact(n),
    };
    spec.iface_index = args.intf.map(MatchField::Exact).unwrap_or_default();
    spec.devnum = args.devnum.map(MatchField::Exact).unwrap_or_default();
    spec.path = args.path.clone();

    Ok(spec)
}

fn build_session(args: &Args) -> Result<Session> {
    let match_spec = build_match_spec(args)?;

    let dfuse = match &args.dfuse_address {
        Some(s) => session::parse_dfuse_spec(s)?,
        None => Default::default(),
    };

    let mode = if args.list {
        SessionMode::List
    } else if let Some(file) = &args.upload {
        SessionMode::Upload {
            file: file.clone(),
            upload_size: args.upload_size,
        }
    } else if let Some(file) = &args.download {
        SessionMode::Download { file: file.clone() }
    } else if args.detach {
        SessionMode::Detach
    } else if dfuse.is_present() {
        SessionMode::DfuseCommand
    } else {
        return Err(Error::Usage("must specify one of -l, -U, -D, -e, or -s".into()).into());
    };

    Ok(Session {
        match_spec,
        mode,
        transfer_size_override: args.transfer_size,
        detach: args.detach,
        detach_delay: std::time::Duration::from_secs(args.detach_delay),
        wait_for_device: args.wait,
        final_reset: args.reset,
        dfuse,
    })
}

/// A progress bar on stderr, the terminal sink named in spec.md's ambient
/// stack note; the core never prints, it only calls back here.
struct TerminalProgress {
    last_percent: Option<u64>,
}

impl ProgressSink for TerminalProgress {
    fn on_progress(&mut self, transferred: usize, total: Option<usize>) {
        match total {
            Some(total) if total > 0 => {
                let percent = (transferred as u64 * 100) / total as u64;
                if self.last_percent != Some(percent) {
                    eprint!("\r{percent:3}%  {transferred}/{total} bytes");
                    self.last_percent = Some(percent);
                }
            }
            _ => eprint!("\r{transferred} bytes"),
        }
    }
}

fn print_device_list(records: &[InterfaceRecord]) {
    for r in records {
        println!(
            "Found {} [{:04x}:{:04x}] devnum={}, cfg={}, intf={}, alt={}, name=\"{}\", serial=\"{}\"",
            if r.is_dfu_mode { "DFU" } else { "Runtime" },
            r.vendor,
            r.product,
            r.devnum,
            r.configuration,
            r.interface,
            r.alt_setting,
            r.alt_name,
            r.serial_name,
        );
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_RS_LOG", level_for(args.verbose).to_string())
            .write_style("DFU_RS_LOG_STYLE"),
    )
    .init();

    let session = build_session(&args).context("invalid arguments")?;
    let mut progress = TerminalProgress { last_percent: None };

    match orchestrator::run(&session, &mut progress)? {
        RunOutcome::DeviceList(records) => print_device_list(&records),
        RunOutcome::Done => {}
    }
    eprintln!();

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dfu-rs: {e:#}");
            let code = e.downcast_ref::<Error>().map(|e| e.exit_code()).unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}
