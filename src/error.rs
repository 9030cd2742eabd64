//! Error taxonomy shared across the daemon.

use std::fmt;

/// A result type for fallible daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Sub-reasons for a failed USB bulk transfer, mirroring the canonical
/// libusb transfer status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    Io,
    Timeout,
    Cancelled,
    NoDevice,
    Stall,
    Overflow,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferErrorKind::Io => "I/O error",
            TransferErrorKind::Timeout => "timed out",
            TransferErrorKind::Cancelled => "cancelled",
            TransferErrorKind::NoDevice => "no such device",
            TransferErrorKind::Stall => "endpoint stalled",
            TransferErrorKind::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

/// Errors that can terminate the daemon or a single collaborator (device,
/// client). Fatal variants are the ones the driver loop exits on; the rest
/// are handled by closing the offending device or client and continuing.
#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("usb initialization failed: {0}")]
    UsbInit(String),

    #[error("usb transfer failed: {0}")]
    UsbTransfer(TransferErrorKind),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("client idle for too long")]
    IdleTimeout,

    #[error("daemon signalled, shutting down")]
    Signalled,
}
