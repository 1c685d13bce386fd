//! # stm32-uart-prog
//!
//! A library for mass-programming STM32 microcontrollers over a shared UART
//! bus (typically RS-485 half-duplex) through the factory ROM bootloader
//! described in ST application note AN3155.
//!
//! The crate provides:
//!
//! - A noise-tolerant serial transport behind the [`port::Port`] trait
//! - The AN3155 XOR-checksum frame codec and command layer
//! - Per-family flash descriptors (STM32F405/407/415/417 to start)
//! - A chunk planner that turns a sparse firmware image into page-sized
//!   write/verify units keyed by their owning flash sector
//! - A per-target session engine with erase/write/verify retry and recovery
//! - A fleet driver that programs a list of targets one at a time
//!
//! ## Bus control hooks
//!
//! Only one device at a time may talk on the shared bus. How the application
//! firmware on each target is silenced and how a single target is forced into
//! the ROM bootloader depends entirely on the user's bus topology, so both are
//! behind the [`hooks::ContextHooks`] trait. A sample implementation for a
//! simple RS-485 application-frame protocol ships as [`hooks::Rs485Hooks`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use stm32_uart_prog::{
//!     fleet::{Fleet, FleetConfig},
//!     hooks::{Rs485Hooks, TargetId},
//!     image::HexImage,
//!     port::{NativePort, SerialConfig},
//!     target::McuDescriptor,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_pairs([(0x0800_0000u32, 0xAAu8)])?;
//!     let mcu = McuDescriptor::stm32f405_417();
//!     let port = NativePort::open(&SerialConfig::bootloader("/dev/ttyUSB0", 115_200))?;
//!
//!     let mut fleet = Fleet::new(port, Rs485Hooks::default(), mcu, &image, FleetConfig::default())?;
//!     let report = fleet.run(&[TargetId(1), TargetId(2)], &mut |_event| {})?;
//!
//!     for (target, outcome) in &report.outcomes {
//!         println!("{target}: {outcome}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootloader;
pub mod error;
pub mod fleet;
pub mod hooks;
pub mod image;
pub mod plan;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

static CANCEL_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global cancellation checker polled by long-running loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). The session
/// engine polls it between bootloader commands and between chunks.
pub fn set_cancel_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = CANCEL_CHECKER.set(Arc::new(checker));
}

/// Returns whether cancellation was requested by the embedding application.
#[must_use]
pub fn cancel_requested() -> bool {
    CANCEL_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
pub use {
    bootloader::{BootloaderClient, Timeouts},
    error::{Error, Result},
    fleet::{Fleet, FleetConfig, FleetReport, ProgressEvent, TargetOutcome},
    hooks::{ContextHooks, Rs485Hooks, TargetId},
    image::HexImage,
    plan::{Chunk, Plan},
    port::{Port, SerialConfig},
    session::{RetryPolicy, Session, SessionState},
    target::{McuDescriptor, Sector},
};
