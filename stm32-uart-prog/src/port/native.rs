//! Native serial port implementation using the `serialport` crate.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serialport::ClearBuffer;

use crate::error::{Error, Result};
use crate::port::{DataBits, Parity, Port, PortEnumerator, PortInfo, SerialConfig, StopBits};

const REOPEN_ATTEMPTS: usize = 3;
const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// Native serial port implementation.
///
/// Keeps its [`SerialConfig`] so that [`Port::reopen`] can re-establish the
/// port with identical settings after a USB-serial adapter replug.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = Self::open_raw(config)?;
        debug!(
            "opened {} at {} baud, parity {:?}",
            config.port_name, config.baud_rate, config.parity
        );
        Ok(Self {
            port: Some(port),
            config: config.clone(),
        })
    }

    fn open_raw(config: &SerialConfig) -> Result<Box<dyn serialport::SerialPort>> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(port)
    }

    fn inner(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.config.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.config.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_parity(parity.into())?;
        }
        self.config.parity = parity;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::Input)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn reopen(&mut self) -> Result<()> {
        self.port.take();

        let mut last_error = None;
        for attempt in 1..=REOPEN_ATTEMPTS {
            match Self::open_raw(&self.config) {
                Ok(port) => {
                    debug!("reopened {} on attempt {attempt}", self.config.port_name);
                    self.port = Some(port);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "failed to reopen {} (attempt {attempt}/{REOPEN_ATTEMPTS}): {e}",
                        self.config.port_name
                    );
                    last_error = Some(e);
                    if attempt < REOPEN_ATTEMPTS {
                        thread::sleep(REOPEN_DELAY);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::PortClosed(format!("{}: reopen failed", self.config.port_name))))
    }

    fn close(&mut self) -> Result<()> {
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner().and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner().and_then(|p| p.flush())
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer.clone(),
                        info.product.clone(),
                    ),
                    _ => (None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                }
            })
            .collect())
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_ports_does_not_panic() {
        let _ = NativePortEnumerator::list_ports();
    }

    #[test]
    fn parity_conversion() {
        assert_eq!(serialport::Parity::from(Parity::Even), serialport::Parity::Even);
        assert_eq!(serialport::Parity::from(Parity::None), serialport::Parity::None);
    }
}
