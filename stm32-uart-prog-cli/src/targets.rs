//! Target list parsing: comma-separated singles and inclusive ranges.

use anyhow::{bail, Result};
use stm32_uart_prog::TargetId;

/// Parse a target spec like `1,3-5,8` into sorted, deduplicated ids.
pub fn parse_targets(spec: &str) -> Result<Vec<TargetId>> {
    let mut ids: Vec<u16> = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("empty element in target list '{spec}'");
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid target range start '{part}'"))?;
                let end: u16 = end
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid target range end '{part}'"))?;
                if start > end {
                    bail!("reversed target range '{part}'");
                }
                ids.extend(start..=end);
            }
            None => {
                let id: u16 = part
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid target id '{part}'"))?;
                ids.push(id);
            }
        }
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids.into_iter().map(TargetId).collect())
}
