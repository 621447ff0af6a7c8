//! Crate-wide error taxonomy.
//!
//! Mirrors the split the teacher crate uses between I/O-shaped errors and
//! protocol-shaped errors, but adds the `Usage`/`Data`/`Software` categories
//! named in spec.md §7 since this crate's CLI surface needs to map failures
//! onto `sysexits` exit codes.

use thiserror::Error;

/// Top level error type returned by every core operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("USB transport error while {action}")]
    Usb {
        #[source]
        source: rusb::Error,
        action: &'static str,
    },

    #[error("DFU protocol error")]
    Protocol(#[from] ProtocolError),

    #[error("malformed firmware file: {0}")]
    Data(String),

    #[error("file I/O error")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Software(String),

    #[error("cannot open output file")]
    CantCreate(#[source] std::io::Error),
}

impl Error {
    pub fn usb(source: rusb::Error, action: &'static str) -> Self {
        Error::Usb { source, action }
    }

    /// Maps this error onto a `sysexits`-style process exit code, per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 64,
            Error::Data(_) => 65,
            Error::CantCreate(_) => 73,
            Error::Protocol(_) => 76,
            Error::Software(_) => 70,
            Error::Io(_) => 74,
            Error::Usb { .. } => 69,
        }
    }
}

/// Failures that can happen even when every USB transaction itself succeeds:
/// the device answered, but not the way the protocol requires.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("device reported status ({0}) that is not in the DFU spec")]
    UnknownStatus(u8),

    #[error("device reported state ({0}) that is not in the DFU spec")]
    UnknownState(u8),

    #[error("device reported an error: {status:?} ({detail})")]
    ErrorStatus {
        status: crate::request::DfuStatus,
        detail: &'static str,
    },

    #[error("device entered unexpected state: expected {expected:?}, got {actual:?}")]
    UnexpectedState {
        expected: crate::request::DfuState,
        actual: crate::request::DfuState,
    },

    #[error("no DFU functional descriptor found for interface {0}")]
    NoFunctionalDescriptor(u8),

    #[error("device stuck: {0} consecutive zero-wait polls without progress")]
    DeviceStuck(u32),

    #[error("page at {address:#010x} can not be erased (not in memory layout, or not marked erasable)")]
    PageNotErasable { address: u32 },

    #[error("page at {address:#010x} is not writeable")]
    PageNotWriteable { address: u32 },

    #[error("segment at {address:#010x} is not readable")]
    SegmentNotReadable { address: u32 },

    #[error("transferred {actual} of {expected} bytes for chunk at {address:#010x}")]
    ShortChunk {
        address: u32,
        expected: usize,
        actual: usize,
    },

    #[error("lost device after bus reset")]
    LostAfterReset,

    #[error("device is not in DFU mode")]
    NotInDfuMode,

    #[error("device still in run-time mode")]
    StillInRuntimeMode,

    #[error("more than one DFU capable USB device found; use --list and narrow with serial/path/devnum")]
    AmbiguousDevice,

    #[error("no DFU capable USB device available")]
    NoDevice,

    #[error("file too large: overflowed 16-bit transaction counter while sending")]
    FileTooLarge,
}
