//! Per-family MCU descriptors: flash layout and bootloader capabilities.

use std::fmt;

use crate::error::{Error, Result};

/// One flash erase unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Sector index as used by the erase command.
    pub index: usize,
    /// First address of the sector.
    pub start: u32,
    /// Sector size in bytes.
    pub size: u32,
}

impl Sector {
    /// One past the last address of the sector.
    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    /// Whether `addr` falls inside this sector.
    pub fn contains(&self, addr: u32) -> bool {
        (self.start..self.end()).contains(&addr)
    }
}

/// Immutable description of one MCU family's flash and bootloader.
#[derive(Debug, Clone, Copy)]
pub struct McuDescriptor {
    /// Family name for logs and reports.
    pub family: &'static str,
    /// Product ID reported by GET_ID (12-bit).
    pub pid: u16,
    /// Flash sectors in ascending address order.
    pub sectors: &'static [Sector],
    /// Write/read chunk granularity; divides every sector size.
    pub page_size: usize,
    /// Maximum payload per read/write command.
    pub max_payload: usize,
    /// Whether the bootloader speaks the two-byte extended erase (0x44).
    pub extended_erase: bool,
}

/// STM32F405/407/415/417: 4 x 16 KiB + 1 x 64 KiB + 7 x 128 KiB from
/// 0x0800_0000, extended erase, PID 0x413.
const STM32F405_417_SECTORS: [Sector; 12] = [
    Sector { index: 0, start: 0x0800_0000, size: 16 * 1024 },
    Sector { index: 1, start: 0x0800_4000, size: 16 * 1024 },
    Sector { index: 2, start: 0x0800_8000, size: 16 * 1024 },
    Sector { index: 3, start: 0x0800_C000, size: 16 * 1024 },
    Sector { index: 4, start: 0x0801_0000, size: 64 * 1024 },
    Sector { index: 5, start: 0x0802_0000, size: 128 * 1024 },
    Sector { index: 6, start: 0x0804_0000, size: 128 * 1024 },
    Sector { index: 7, start: 0x0806_0000, size: 128 * 1024 },
    Sector { index: 8, start: 0x0808_0000, size: 128 * 1024 },
    Sector { index: 9, start: 0x080A_0000, size: 128 * 1024 },
    Sector { index: 10, start: 0x080C_0000, size: 128 * 1024 },
    Sector { index: 11, start: 0x080E_0000, size: 128 * 1024 },
];

const STM32F405_417: McuDescriptor = McuDescriptor {
    family: "STM32F405/407/415/417",
    pid: 0x413,
    sectors: &STM32F405_417_SECTORS,
    page_size: 256,
    max_payload: 256,
    extended_erase: true,
};

/// All known families, keyed by PID.
const KNOWN: &[McuDescriptor] = &[STM32F405_417];

impl McuDescriptor {
    /// The STM32F405/407/415/417 descriptor.
    pub fn stm32f405_417() -> &'static Self {
        &STM32F405_417
    }

    /// Select a descriptor by the product ID reported by GET_ID.
    pub fn for_pid(pid: u16) -> Result<&'static Self> {
        KNOWN
            .iter()
            .find(|d| d.pid == pid)
            .ok_or(Error::UnsupportedDevice { pid })
    }

    /// First flash address.
    pub fn flash_start(&self) -> u32 {
        self.sectors[0].start
    }

    /// One past the last flash address.
    pub fn flash_end(&self) -> u32 {
        self.sectors[self.sectors.len() - 1].end()
    }

    /// Sector owning `addr`, if any.
    pub fn sector_for(&self, addr: u32) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.contains(addr))
    }

    /// Check the internal consistency the planner relies on: sectors are
    /// contiguous and ascending, and the page size divides every sector.
    pub fn validate(&self) -> Result<()> {
        if self.sectors.is_empty() {
            return Err(Error::Plan(format!("{}: no flash sectors", self.family)));
        }
        if self.page_size == 0 || self.max_payload == 0 || self.page_size > self.max_payload {
            return Err(Error::Plan(format!(
                "{}: page size {} incompatible with max payload {}",
                self.family, self.page_size, self.max_payload
            )));
        }
        let mut expected = self.sectors[0].start;
        for (i, sector) in self.sectors.iter().enumerate() {
            if sector.index != i {
                return Err(Error::Plan(format!(
                    "{}: sector index {} at position {i}",
                    self.family, sector.index
                )));
            }
            if sector.start != expected {
                return Err(Error::Plan(format!(
                    "{}: sector {} starts at {:#010x}, expected {:#010x}",
                    self.family, sector.index, sector.start, expected
                )));
            }
            if sector.size as usize % self.page_size != 0 {
                return Err(Error::Plan(format!(
                    "{}: page size {} does not divide sector {} size {}",
                    self.family, self.page_size, sector.index, sector.size
                )));
            }
            expected = sector.end();
        }
        Ok(())
    }
}

impl fmt::Display for McuDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID {:#05x})", self.family, self.pid)
    }
}
