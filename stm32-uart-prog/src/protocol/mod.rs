//! ST AN3155 UART bootloader wire protocol.

pub mod command;
pub mod frame;

pub use command::{Command, CommandSpec, TimeoutClass};
pub use frame::{Ack, ACK, MAX_PAYLOAD, NACK, SYNC};
