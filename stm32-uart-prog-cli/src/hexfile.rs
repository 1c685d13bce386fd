//! Intel HEX loading.
//!
//! Parses the records with the `ihex` crate and enforces the reader
//! contract before anything touches the bus: duplicate addresses are an
//! error, and every byte must fall inside the descriptor's flash window.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ihex::Record;
use log::debug;
use stm32_uart_prog::{HexImage, McuDescriptor};

/// Load `path` into a sparse image, validated against `mcu`'s flash window.
pub fn load_hex(path: &Path, mcu: &McuDescriptor) -> Result<HexImage> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let image = parse_hex(&text, mcu)
        .with_context(|| format!("parsing {}", path.display()))?;

    let (lo, hi) = image.extent().expect("parse rejects empty images");
    debug!(
        "{}: {} bytes, {lo:#010x}..={hi:#010x}",
        path.display(),
        image.len()
    );
    Ok(image)
}

fn parse_hex(text: &str, mcu: &McuDescriptor) -> Result<HexImage> {
    let mut base_address: u32 = 0;
    let mut pairs: Vec<(u32, u8)> = Vec::new();

    for record in ihex::Reader::new(text) {
        let record = record.context("malformed HEX record")?;
        match record {
            Record::Data { offset, value } => {
                let start = base_address + u32::from(offset);
                for (i, byte) in value.iter().enumerate() {
                    let addr = start
                        .checked_add(i as u32)
                        .context("HEX record wraps the 32-bit address space")?;
                    if addr < mcu.flash_start() || addr >= mcu.flash_end() {
                        bail!(
                            "data at {addr:#010x} outside flash {:#010x}..{:#010x} of {mcu}",
                            mcu.flash_start(),
                            mcu.flash_end()
                        );
                    }
                    pairs.push((addr, *byte));
                }
            }
            Record::ExtendedSegmentAddress(segment) => {
                base_address = u32::from(segment) * 16;
            }
            Record::ExtendedLinearAddress(upper) => {
                base_address = u32::from(upper) << 16;
            }
            Record::EndOfFile | Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }

    if pairs.is_empty() {
        bail!("HEX file contains no data records");
    }

    HexImage::from_pairs(pairs).map_err(|e| anyhow::anyhow!("{e}"))
}
