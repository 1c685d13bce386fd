//! Error types for stm32-uart-prog.

use std::io;
use thiserror::Error;

/// Result type for stm32-uart-prog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stm32-uart-prog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial transport or a file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport did not deliver the expected bytes in time.
    #[error("transport timeout: {0}")]
    Timeout(String),

    /// The serial port went away (e.g. USB-RS485 dongle replug).
    #[error("serial port closed: {0}")]
    PortClosed(String),

    /// A response byte that is neither ACK nor NACK.
    #[error("protocol garbage: expected ACK or NACK, got {byte:#04x}")]
    Garbage {
        /// The offending byte.
        byte: u8,
    },

    /// The bootloader answered NACK to a command.
    #[error("bootloader rejected {command}")]
    Rejected {
        /// Name of the rejected command.
        command: &'static str,
    },

    /// A protocol-level failure that is not a single garbage byte.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read-back content differs from what was written.
    #[error("verify mismatch at {address:#010x}+{offset}")]
    VerifyMismatch {
        /// Chunk base address.
        address: u32,
        /// First differing offset within the chunk.
        offset: usize,
    },

    /// A sector read back non-blank after an acknowledged erase.
    #[error("sector {sector} not blank after erase")]
    EraseCheckFailed {
        /// Flash sector index.
        sector: usize,
    },

    /// The reported product ID has no descriptor.
    #[error("unsupported device: PID {pid:#05x}")]
    UnsupportedDevice {
        /// Product ID from GET_ID.
        pid: u16,
    },

    /// The bootloader does not advertise a command the session requires.
    #[error("bootloader does not support {command}")]
    MissingCommand {
        /// Name of the missing command.
        command: &'static str,
    },

    /// A sector kept failing through every chunk retry and sector re-erase.
    #[error("sector {sector} unrecoverable after all retries")]
    SectorUnrecoverable {
        /// Flash sector index.
        sector: usize,
    },

    /// A context hook (be_quiet / enter_bootloader / release_all) failed.
    #[error("context hook failed: {0}")]
    Hook(String),

    /// Cancellation was requested.
    #[error("operation cancelled")]
    Cancelled,

    /// The image or descriptor cannot produce a valid programming plan.
    #[error("plan error: {0}")]
    Plan(String),
}

impl Error {
    /// Whether the error is a transport- or protocol-level transient that a
    /// bootloader re-entry (session restart) may clear.
    ///
    /// Rejections, mismatches and everything session-fatal are excluded: the
    /// session engine decides those per operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Serial(_)
                | Self::Timeout(_)
                | Self::PortClosed(_)
                | Self::Garbage { .. }
                | Self::Protocol(_)
        )
    }

    /// Map a raw `io::Error` from a port read/write into the transport error
    /// taxonomy: timeouts and disappeared ports get their own kinds.
    pub(crate) fn from_port_io(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Timeout(format!("{what}: no response"))
            }
            io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::PortClosed(format!("{what}: {err}")),
            _ => Self::Io(err),
        }
    }
}
