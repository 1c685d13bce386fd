//! Serial transport abstraction.
//!
//! The protocol layers never touch `serialport` directly: everything goes
//! through the [`Port`] trait so that the bootloader client, the session
//! engine and the tests are I/O-agnostic. The native implementation lives in
//! [`native`]; the test suite drives the same code against an in-memory
//! simulated bootloader.
//!
//! The transport does not interpret payload. It adds exactly three things on
//! top of raw byte I/O: wall-clock timeouts, drain (discard stale input), and
//! reopen-with-identical-settings after the port disappears mid-run (a common
//! event with USB-RS485 dongles).

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(500),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Configuration for talking to the ST ROM bootloader: 8 data bits, even
    /// parity, 1 stop bit (AN3155).
    pub fn bootloader(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            parity: Parity::Even,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity (the ROM bootloader's framing).
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Unified transport trait for serial communication.
///
/// Object-safe so that context hooks can receive `&mut dyn Port` regardless
/// of the concrete transport the session engine is instantiated with.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Set the parity mode.
    ///
    /// Context hooks use this to switch the shared line between the
    /// bootloader framing (8E1) and the application firmware framing.
    fn set_parity(&mut self, parity: Parity) -> Result<()>;

    /// Discard any unread input.
    ///
    /// Must be called before every command retry so stale bytes cannot be
    /// consumed as the next response.
    fn drain(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Re-establish the port with the same settings after it went away.
    ///
    /// Does not reset the remote bootloader; the caller decides whether the
    /// in-flight operation can be retried.
    fn reopen(&mut self) -> Result<()>;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf).map_err(|e| Error::from_port_io(e, "write"))?;
        Write::flush(self).map_err(|e| Error::from_port_io(e, "flush"))?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes within `timeout`.
    fn read_exact_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let saved = self.timeout();
        self.set_timeout(timeout)?;
        let result = Read::read_exact(self, buf).map_err(|e| Error::from_port_io(e, "read"));
        self.set_timeout(saved)?;
        result
    }

    /// Read a single byte within `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let mut byte = 0u8;
        self.read_exact_bytes(std::slice::from_mut(&mut byte), timeout)?;
        Ok(byte)
    }

    /// Discard input until `wanted` is observed or `timeout` expires.
    ///
    /// Returns the number of bytes discarded before the match. Used to
    /// re-acquire byte alignment on a noisy line.
    fn read_until_byte(&mut self, wanted: u8, timeout: Duration) -> Result<usize> {
        let deadline = std::time::Instant::now() + timeout;
        let mut discarded = 0usize;
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .ok_or_else(|| {
                    Error::Timeout(format!("no {wanted:#04x} seen after {discarded} bytes"))
                })?;
            match self.read_byte(remaining.max(Duration::from_millis(1))) {
                Ok(b) if b == wanted => return Ok(discarded),
                Ok(b) => {
                    log::trace!("discarding 0x{b:02X} while waiting for 0x{wanted:02X}");
                    discarded += 1;
                }
                Err(Error::Timeout(_)) => {
                    return Err(Error::Timeout(format!(
                        "no {wanted:#04x} seen after {discarded} bytes"
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Trait for listing available serial ports.
///
/// Separated from [`Port`] because enumeration is a static operation that
/// does not require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_config_is_8e1() {
        let config = SerialConfig::bootloader("/dev/ttyUSB0", 115_200);
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::One);
    }

    #[test]
    fn config_builder_sets_timeout() {
        let config =
            SerialConfig::bootloader("COM3", 57_600).with_timeout(Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.port_name, "COM3");
    }
}
