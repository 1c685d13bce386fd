//! Bootloader command opcodes and their static descriptors.
//!
//! Each command is described once in a table (opcode, name, timeout class)
//! and every command goes out through the same encode path in the client.

/// AN3155 bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and the supported command set (0x00).
    Get = 0x00,

    /// Fetch bootloader version and read-protection status (0x01).
    GetVersion = 0x01,

    /// Fetch the product ID (0x02).
    GetId = 0x02,

    /// Read up to 256 bytes starting at a given address (0x11).
    ReadMemory = 0x11,

    /// Jump to application code at a given address (0x21).
    Go = 0x21,

    /// Write up to 256 bytes starting at a given address (0x31).
    WriteMemory = 0x31,

    /// Erase flash pages, one-byte page numbers (0x43).
    Erase = 0x43,

    /// Erase flash pages, two-byte page numbers (0x44, bootloader v3.0+).
    ExtendedErase = 0x44,
}

/// Which configured timeout applies while waiting for a command's ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Ordinary command acknowledge.
    Command,
    /// Erase acknowledge (flash erase takes seconds per sector).
    Erase,
}

/// Static description of one bootloader command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Wire opcode.
    pub opcode: u8,
    /// Human-readable name for logs and errors.
    pub name: &'static str,
    /// Timeout class for the acknowledge that follows the command frame.
    pub timeout: TimeoutClass,
}

const SPECS: &[(Command, CommandSpec)] = &[
    (
        Command::Get,
        CommandSpec { opcode: 0x00, name: "GET", timeout: TimeoutClass::Command },
    ),
    (
        Command::GetVersion,
        CommandSpec { opcode: 0x01, name: "GET_VERSION", timeout: TimeoutClass::Command },
    ),
    (
        Command::GetId,
        CommandSpec { opcode: 0x02, name: "GET_ID", timeout: TimeoutClass::Command },
    ),
    (
        Command::ReadMemory,
        CommandSpec { opcode: 0x11, name: "READ_MEMORY", timeout: TimeoutClass::Command },
    ),
    (
        Command::Go,
        CommandSpec { opcode: 0x21, name: "GO", timeout: TimeoutClass::Command },
    ),
    (
        Command::WriteMemory,
        CommandSpec { opcode: 0x31, name: "WRITE_MEMORY", timeout: TimeoutClass::Command },
    ),
    (
        Command::Erase,
        CommandSpec { opcode: 0x43, name: "ERASE", timeout: TimeoutClass::Erase },
    ),
    (
        Command::ExtendedErase,
        CommandSpec { opcode: 0x44, name: "EXTENDED_ERASE", timeout: TimeoutClass::Erase },
    ),
];

impl Command {
    /// Look up the static descriptor for this command.
    pub fn spec(self) -> &'static CommandSpec {
        // The table covers every variant.
        &SPECS
            .iter()
            .find(|(cmd, _)| *cmd == self)
            .expect("command in table")
            .1
    }

    /// Wire opcode.
    pub fn opcode(self) -> u8 {
        self.spec().opcode
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_an3155() {
        assert_eq!(Command::Get.opcode(), 0x00);
        assert_eq!(Command::GetId.opcode(), 0x02);
        assert_eq!(Command::ReadMemory.opcode(), 0x11);
        assert_eq!(Command::Go.opcode(), 0x21);
        assert_eq!(Command::WriteMemory.opcode(), 0x31);
        assert_eq!(Command::Erase.opcode(), 0x43);
        assert_eq!(Command::ExtendedErase.opcode(), 0x44);
    }

    #[test]
    fn every_variant_has_a_spec() {
        for cmd in [
            Command::Get,
            Command::GetVersion,
            Command::GetId,
            Command::ReadMemory,
            Command::Go,
            Command::WriteMemory,
            Command::Erase,
            Command::ExtendedErase,
        ] {
            let spec = cmd.spec();
            assert_eq!(spec.opcode, cmd as u8);
            assert!(!spec.name.is_empty());
        }
    }

    #[test]
    fn erase_commands_use_erase_timeout() {
        assert_eq!(Command::Erase.spec().timeout, TimeoutClass::Erase);
        assert_eq!(Command::ExtendedErase.spec().timeout, TimeoutClass::Erase);
        assert_eq!(Command::WriteMemory.spec().timeout, TimeoutClass::Command);
    }
}
