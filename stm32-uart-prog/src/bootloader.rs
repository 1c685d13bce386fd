//! Bootloader command layer: one call per AN3155 command.
//!
//! Every operation writes its request frames, awaits the single-byte
//! acknowledge with a per-command timeout, and classifies the outcome:
//! NACK becomes [`Error::Rejected`] (the caller owns the retry policy for
//! rejections), timeouts and garbage are retried here up to the configured
//! command retry budget, with a drain before every retry so stale bytes are
//! never consumed as the next response. A port that disappears mid-command
//! is reopened and the command retried within the same budget.

use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::command::Command;
use crate::protocol::frame;

/// Per-command ACK and stream timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Waiting for the ACK of the initial `0x7F` sync byte.
    pub sync: Duration,
    /// Waiting for an ordinary command/sub-frame ACK.
    pub ack: Duration,
    /// Waiting for an erase ACK (per sector).
    pub erase_ack: Duration,
    /// Waiting for read-back payload bytes.
    pub read_stream: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sync: Duration::from_millis(200),
            ack: Duration::from_millis(500),
            erase_ack: Duration::from_secs(5),
            read_stream: Duration::from_secs(1),
        }
    }
}

/// Result of the GET command.
#[derive(Debug, Clone)]
pub struct GetInfo {
    /// Bootloader protocol version byte (e.g. 0x31 for v3.1).
    pub version: u8,
    /// Raw opcodes the bootloader advertises.
    pub commands: Vec<u8>,
}

impl GetInfo {
    /// Whether the bootloader advertises `cmd`.
    pub fn supports(&self, cmd: Command) -> bool {
        self.commands.contains(&cmd.opcode())
    }
}

/// Blocking client for the ST UART bootloader, generic over the transport.
pub struct BootloaderClient<P: Port> {
    port: P,
    timeouts: Timeouts,
    cmd_retries: u32,
    reopens: u32,
}

impl<P: Port> BootloaderClient<P> {
    /// Wrap a transport with default timeouts and 3 command retries.
    pub fn new(port: P) -> Self {
        Self {
            port,
            timeouts: Timeouts::default(),
            cmd_retries: 3,
            reopens: 0,
        }
    }

    /// Override the timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the per-command retry budget (minimum 1).
    #[must_use]
    pub fn with_cmd_retries(mut self, retries: u32) -> Self {
        self.cmd_retries = retries.max(1);
        self
    }

    /// Access the underlying transport (the context hooks need the bus).
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the client and return the transport.
    pub fn into_port(self) -> P {
        self.port
    }

    /// How many times the transport was reopened after going away.
    pub fn reopens(&self) -> u32 {
        self.reopens
    }

    /// Send the `0x7F` sync byte and await the acknowledge.
    ///
    /// Emitted exactly once per session: the bootloader latches its baud
    /// detection on the first sync byte and answers later ones with NACK. A
    /// NACK here therefore usually means "already synchronized", but it can
    /// also mean a stray byte reached the device first, so it is surfaced as
    /// a warning rather than swallowed.
    pub fn sync(&mut self) -> Result<()> {
        self.port.drain()?;
        self.port.write_all_bytes(&[frame::SYNC])?;
        match self.port.read_byte(self.timeouts.sync) {
            Ok(frame::ACK) => {
                debug!("sync acknowledged");
                Ok(())
            }
            Ok(frame::NACK) => {
                warn!("sync answered NACK: bootloader already synchronized, or a stray byte preceded the sync");
                Ok(())
            }
            Ok(other) => Err(Error::Garbage { byte: other }),
            Err(e) => Err(e),
        }
    }

    /// GET: bootloader version and supported opcodes.
    pub fn get(&mut self) -> Result<GetInfo> {
        self.with_cmd_retry(Command::Get, |client| {
            client.command(Command::Get)?;
            let count = client.port.read_byte(client.timeouts.read_stream)? as usize + 1;
            let mut body = vec![0u8; count];
            client
                .port
                .read_exact_bytes(&mut body, client.timeouts.read_stream)?;
            client.await_ack(Command::Get, client.timeouts.ack)?;
            Ok(GetInfo {
                version: body[0],
                commands: body[1..].to_vec(),
            })
        })
    }

    /// GET_ID: the 12-bit product ID.
    pub fn get_id(&mut self) -> Result<u16> {
        self.with_cmd_retry(Command::GetId, |client| {
            client.command(Command::GetId)?;
            let count = client.port.read_byte(client.timeouts.read_stream)? as usize + 1;
            let mut body = vec![0u8; count];
            client
                .port
                .read_exact_bytes(&mut body, client.timeouts.read_stream)?;
            client.await_ack(Command::GetId, client.timeouts.ack)?;
            if body.len() < 2 {
                return Err(Error::Protocol(format!(
                    "GET_ID returned {} byte(s)",
                    body.len()
                )));
            }
            Ok(u16::from_be_bytes([body[0], body[1]]))
        })
    }

    /// READ_MEMORY: fill `buf` starting at `addr`.
    pub fn read_memory(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let length = frame::length_frame(buf.len())?;
        self.with_cmd_retry(Command::ReadMemory, |client| {
            client.command(Command::ReadMemory)?;
            client.port.write_all_bytes(&frame::address_frame(addr))?;
            client.await_ack(Command::ReadMemory, client.timeouts.ack)?;
            client.port.write_all_bytes(&length)?;
            client.await_ack(Command::ReadMemory, client.timeouts.ack)?;
            client
                .port
                .read_exact_bytes(buf, client.timeouts.read_stream)?;
            trace!("read {} bytes from {addr:#010x}", buf.len());
            Ok(())
        })
    }

    /// WRITE_MEMORY: program `data` starting at word-aligned `addr`.
    ///
    /// The device acknowledges only after the write completed.
    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Protocol(format!(
                "write address {addr:#010x} not word-aligned"
            )));
        }
        if data.len() % 4 != 0 {
            return Err(Error::Protocol(format!(
                "write length {} not a multiple of 4",
                data.len()
            )));
        }
        let payload = frame::payload_frame(data)?;
        self.with_cmd_retry(Command::WriteMemory, |client| {
            client.command(Command::WriteMemory)?;
            client.port.write_all_bytes(&frame::address_frame(addr))?;
            client.await_ack(Command::WriteMemory, client.timeouts.ack)?;
            client.port.write_all_bytes(&payload)?;
            client.await_ack(Command::WriteMemory, client.timeouts.ack)?;
            trace!("wrote {} bytes to {addr:#010x}", data.len());
            Ok(())
        })
    }

    /// ERASE (0x43): erase one sector by its one-byte page number.
    ///
    /// One sector per invocation so a failing sector retries in isolation.
    pub fn erase(&mut self, sector: u8) -> Result<()> {
        let list = frame::erase_page_list(&[sector])?;
        self.with_cmd_retry(Command::Erase, |client| {
            client.command(Command::Erase)?;
            client.port.write_all_bytes(&list)?;
            client.await_ack(Command::Erase, client.timeouts.erase_ack)?;
            debug!("erased sector {sector}");
            Ok(())
        })
    }

    /// EXTENDED_ERASE (0x44): erase one sector by its two-byte page number.
    ///
    /// One sector per invocation so a failing sector retries in isolation.
    pub fn extended_erase(&mut self, sector: u16) -> Result<()> {
        let list = frame::extended_erase_list(&[sector])?;
        self.with_cmd_retry(Command::ExtendedErase, |client| {
            client.command(Command::ExtendedErase)?;
            client.port.write_all_bytes(&list)?;
            client.await_ack(Command::ExtendedErase, client.timeouts.erase_ack)?;
            debug!("erased sector {sector}");
            Ok(())
        })
    }

    /// GO: jump to the application at `addr`.
    ///
    /// The device may leave the bootloader before acknowledging the address
    /// frame, so a missing final ACK counts as success.
    pub fn go(&mut self, addr: u32) -> Result<()> {
        self.with_cmd_retry(Command::Go, |client| {
            client.command(Command::Go)?;
            client.port.write_all_bytes(&frame::address_frame(addr))?;
            match client.await_ack(Command::Go, client.timeouts.ack) {
                Ok(()) => Ok(()),
                Err(Error::Timeout(_)) => {
                    debug!("no ACK after GO address: device already jumped");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Send a command frame and await its acknowledge.
    ///
    /// The opcode ACK is always quick; the erase timeout applies to the
    /// page-list ACK inside the erase operations, not here.
    fn command(&mut self, cmd: Command) -> Result<()> {
        trace!("sending {}", cmd.name());
        self.port
            .write_all_bytes(&frame::command_frame(cmd.opcode()))?;
        self.await_ack(cmd, self.timeouts.ack)
    }

    /// Read one response byte and classify it.
    fn await_ack(&mut self, cmd: Command, timeout: Duration) -> Result<()> {
        let byte = self.port.read_byte(timeout)?;
        match frame::decode_ack(byte)? {
            frame::Ack::Ack => Ok(()),
            frame::Ack::Nack => Err(Error::Rejected { command: cmd.name() }),
        }
    }

    /// Run one request-response pair with the command retry budget.
    ///
    /// Retries drain the input first; a vanished port is reopened. NACKs and
    /// other non-transient errors pass straight through to the caller.
    fn with_cmd_retry<T>(
        &mut self,
        cmd: Command,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut last = None;
        for attempt in 1..=self.cmd_retries {
            if attempt > 1 {
                self.port.drain()?;
            }
            match op(self) {
                Ok(value) => return Ok(value),
                Err(Error::PortClosed(msg)) => {
                    warn!(
                        "{}: port closed ({msg}), reopening (attempt {attempt}/{})",
                        cmd.name(),
                        self.cmd_retries
                    );
                    self.port.reopen()?;
                    self.reopens += 1;
                    last = Some(Error::PortClosed(msg));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "{}: attempt {attempt}/{} failed: {e}",
                        cmd.name(),
                        self.cmd_retries
                    );
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Protocol(format!("{}: retries exhausted", cmd.name()))))
    }
}
