//! Bus-control hooks: the boundary between the generic core and the user's
//! bus topology.
//!
//! The core never knows how application firmware is silenced or how a target
//! is forced into the ROM bootloader; it only calls [`ContextHooks`]. Users
//! supply an implementation for their bus. [`Rs485Hooks`] is a working sample
//! for a simple RS-485 application-frame protocol and doubles as a template.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::port::{Parity, Port};

/// Application-level target identifier (e.g. a bus address).
///
/// The core treats it as an opaque value; only the hooks interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub u16);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID{}", self.0)
    }
}

/// User-supplied bus control.
///
/// All three hooks receive the shared transport: on a half-duplex bus the
/// control frames travel over the same line as the bootloader protocol, just
/// with the application firmware's framing. Implementations must leave the
/// port in bootloader framing (baud and parity) when they return.
pub trait ContextHooks {
    /// Silence the application firmware on every listed target.
    ///
    /// Called exactly once at the start of each programming session. After a
    /// successful return no silenced device may transmit until released.
    fn be_quiet(&mut self, port: &mut dyn Port, targets: &[TargetId]) -> Result<()>;

    /// Force exactly one target into its ROM bootloader.
    ///
    /// The implementation is responsible for ensuring only this target
    /// responds on the bus afterwards.
    fn enter_bootloader(&mut self, port: &mut dyn Port, target: TargetId) -> Result<()>;

    /// Undo [`ContextHooks::be_quiet`] for all targets (best effort).
    fn release_all(&mut self, port: &mut dyn Port) -> Result<()>;
}

/// CRC-8 with polynomial 0x1D (CRC-8/GSM-A), as the sample application
/// firmware computes it.
fn crc8(buffer: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in buffer {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x1D
            } else {
                crc << 1
            };
        }
    }
    crc
}

const PREAMBLE: u8 = 0xAA;
const CMD_CLASS_CONTROL: u8 = 0x03;
const CMD_MUTE: u8 = 0xDA;
const CMD_ENTER_BOOTLOADER: u8 = 0xDF;
const CMD_RELEASE: u8 = 0xD5;
const BROADCAST: TargetId = TargetId(0xFFFF);

/// Sample [`ContextHooks`] implementation for RS-485 buses whose application
/// firmware understands a small control-frame protocol.
///
/// Control frame (10 bytes, little-endian multi-byte fields):
///
/// ```text
/// [0xAA, len/10, id_lo, id_hi, 0x03, command, 0, 0, 0, crc8]
/// ```
///
/// Commands: `0xDA` mute, `0xDF` enter bootloader, `0xD5` release (the
/// release command is this sample protocol's own symmetric counterpart to
/// mute). The application firmware listens at 115200 8N1, so the hooks
/// temporarily switch the shared line away from the bootloader's even parity
/// and restore it before returning.
#[derive(Debug, Clone)]
pub struct Rs485Hooks {
    /// Baud rate the application firmware listens at.
    pub app_baud: u32,
    /// How many times each control frame is repeated.
    pub repeats: usize,
    /// Delay between repeated frames.
    pub repeat_delay: Duration,
    /// Wait before muting, so a previously released target has restarted
    /// its application and is listening for control frames again.
    pub settle_delay: Duration,
    /// Wait after the enter-bootloader frame for the ROM bootloader to boot.
    pub boot_delay: Duration,
}

impl Default for Rs485Hooks {
    fn default() -> Self {
        Self {
            app_baud: 115_200,
            repeats: 5,
            repeat_delay: Duration::from_millis(200),
            settle_delay: Duration::from_secs(7),
            boot_delay: Duration::from_secs(7),
        }
    }
}

impl Rs485Hooks {
    fn control_frame(target: TargetId, command: u8) -> [u8; 10] {
        let id = target.0.to_le_bytes();
        let mut frame = [
            PREAMBLE,
            1, // frame length / 10
            id[0],
            id[1],
            CMD_CLASS_CONTROL,
            command,
            0,
            0,
            0,
            0,
        ];
        frame[9] = crc8(&frame[..9]);
        frame
    }

    /// Send one control frame `repeats` times with the application framing,
    /// then restore the bootloader framing.
    fn broadcast_frame(&self, port: &mut dyn Port, target: TargetId, command: u8) -> Result<()> {
        let frame = Self::control_frame(target, command);
        let orig_baud = port.baud_rate();

        let result = (|| -> Result<()> {
            port.set_baud_rate(self.app_baud)?;
            port.set_parity(Parity::None)?;
            for _ in 0..self.repeats {
                port.write_all_bytes(&frame)?;
                thread::sleep(self.repeat_delay);
            }
            Ok(())
        })();

        // Restore bootloader framing even if the sends failed.
        port.set_parity(Parity::Even)?;
        port.set_baud_rate(orig_baud)?;
        port.drain()?;

        result.map_err(|e| Error::Hook(format!("control frame {command:#04x}: {e}")))
    }
}

impl ContextHooks for Rs485Hooks {
    fn be_quiet(&mut self, port: &mut dyn Port, targets: &[TargetId]) -> Result<()> {
        debug!("settling {:?} before muting the bus", self.settle_delay);
        thread::sleep(self.settle_delay);
        info!("muting application firmware on {} target(s)", targets.len());
        self.broadcast_frame(port, BROADCAST, CMD_MUTE)
    }

    fn enter_bootloader(&mut self, port: &mut dyn Port, target: TargetId) -> Result<()> {
        info!("{target}: requesting bootloader entry");
        self.broadcast_frame(port, target, CMD_ENTER_BOOTLOADER)?;
        debug!("{target}: waiting {:?} for bootloader", self.boot_delay);
        thread::sleep(self.boot_delay);
        Ok(())
    }

    fn release_all(&mut self, port: &mut dyn Port) -> Result<()> {
        info!("releasing all targets");
        self.broadcast_frame(port, BROADCAST, CMD_RELEASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_matches_reference_values() {
        // Independently computed with the 0x1D polynomial.
        assert_eq!(crc8(&[]), 0x00);
        assert_eq!(crc8(&[0x00]), 0x00);
        assert_eq!(crc8(&[0x01]), 0x1D);
        assert_eq!(crc8(&[0xAA]), 0x73);
    }

    #[test]
    fn control_frame_layout() {
        let frame = Rs485Hooks::control_frame(TargetId(0x1234), CMD_MUTE);
        assert_eq!(frame[0], PREAMBLE);
        assert_eq!(frame[1], 1);
        assert_eq!(frame[2], 0x34); // little-endian id
        assert_eq!(frame[3], 0x12);
        assert_eq!(frame[4], CMD_CLASS_CONTROL);
        assert_eq!(frame[5], CMD_MUTE);
        assert_eq!(&frame[6..9], &[0, 0, 0]);
        assert_eq!(frame[9], crc8(&frame[..9]));
    }

    #[test]
    fn broadcast_uses_all_ones_id() {
        let frame = Rs485Hooks::control_frame(BROADCAST, CMD_ENTER_BOOTLOADER);
        assert_eq!(frame[2], 0xFF);
        assert_eq!(frame[3], 0xFF);
    }
}
