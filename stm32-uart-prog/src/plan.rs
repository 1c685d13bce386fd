//! Chunk planner: turns a sparse image into page-sized programming units.
//!
//! The plan covers exactly the pages the image touches, minus pages whose
//! padded content is entirely `0xFF` (erase already produces those). Within a
//! sector chunks ascend by address; sectors ascend by index. The set of
//! sectors that own at least one chunk is the set that gets erased.

use std::fmt;

use crate::error::{Error, Result};
use crate::image::{HexImage, PAD_BYTE};
use crate::target::McuDescriptor;

/// One page-sized write/verify unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Index of the owning flash sector.
    pub sector: usize,
    /// Page index within the owning sector.
    pub page: usize,
    /// Page-aligned start address.
    pub address: u32,
    /// Exactly one page of data, holes padded with `0xFF`.
    pub bytes: Vec<u8>,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sector {} page {} @ {:#010x}",
            self.sector, self.page, self.address
        )
    }
}

/// Ordered list of chunks plus the dirty-sector view over them.
#[derive(Debug, Clone)]
pub struct Plan {
    chunks: Vec<Chunk>,
    page_size: usize,
}

impl Plan {
    /// Derive the plan for `image` on `mcu`.
    ///
    /// Fails before any bus activity if the descriptor is inconsistent, the
    /// image is empty, or any byte falls outside the flash window.
    pub fn build(image: &HexImage, mcu: &McuDescriptor) -> Result<Self> {
        mcu.validate()?;

        let (lo, hi) = image
            .extent()
            .ok_or_else(|| Error::Plan("image contains no data".into()))?;
        if lo < mcu.flash_start() || hi >= mcu.flash_end() {
            return Err(Error::Plan(format!(
                "image {lo:#010x}..={hi:#010x} outside flash {:#010x}..{:#010x}",
                mcu.flash_start(),
                mcu.flash_end()
            )));
        }

        let page_size = mcu.page_size;
        let mut chunks = Vec::new();
        for address in image.touched_pages(page_size) {
            let bytes = image.page_bytes(address, page_size);
            if bytes.iter().all(|&b| b == PAD_BYTE) {
                continue;
            }

            let sector = mcu
                .sector_for(address)
                .ok_or_else(|| Error::Plan(format!("page at {address:#010x} outside flash")))?;
            // Page size divides the sector size, so a page-aligned page that
            // starts in a sector ends in it. Check anyway: a descriptor bug
            // here would brick the wrong sector.
            if !sector.contains(address + page_size as u32 - 1) {
                return Err(Error::Plan(format!(
                    "page at {address:#010x} straddles sector {} boundary",
                    sector.index
                )));
            }

            chunks.push(Chunk {
                sector: sector.index,
                page: ((address - sector.start) as usize) / page_size,
                address,
                bytes,
            });
        }

        if chunks.is_empty() {
            return Err(Error::Plan("image contains only 0xFF bytes".into()));
        }

        Ok(Self { chunks, page_size })
    }

    /// All chunks, ascending by address.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the plan is empty (never true for a built plan).
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Page size every chunk uses.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Indices of sectors owning at least one chunk, ascending.
    pub fn dirty_sectors(&self) -> Vec<usize> {
        let mut sectors: Vec<usize> = self.chunks.iter().map(|c| c.sector).collect();
        sectors.dedup();
        sectors
    }

    /// Chunks belonging to `sector`, in write order.
    pub fn chunks_in_sector(&self, sector: usize) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(move |c| c.sector == sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::McuDescriptor;

    fn mcu() -> &'static McuDescriptor {
        McuDescriptor::stm32f405_417()
    }

    fn fill(start: u32, data: &[u8]) -> Vec<(u32, u8)> {
        data.iter()
            .enumerate()
            .map(|(i, &b)| (start + i as u32, b))
            .collect()
    }

    #[test]
    fn covers_every_image_byte_exactly_once() {
        let mut pairs = fill(0x0800_0000, &[0xAA; 512]);
        pairs.extend(fill(0x0800_4010, &[0x55; 40]));
        let image = HexImage::from_pairs(pairs).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();

        for (addr, byte) in [(0x0800_0000u32, 0xAAu8), (0x0800_01FF, 0xAA), (0x0800_4010, 0x55)] {
            let owners: Vec<_> = plan
                .chunks()
                .iter()
                .filter(|c| (c.address..c.address + plan.page_size() as u32).contains(&addr))
                .collect();
            assert_eq!(owners.len(), 1, "address {addr:#010x} must be in one chunk");
            assert_eq!(owners[0].bytes[(addr - owners[0].address) as usize], byte);
        }
    }

    #[test]
    fn pads_holes_with_ff() {
        let image = HexImage::from_pairs([(0x0800_0000, 0x01), (0x0800_0005, 0x02)]).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();
        let chunk = &plan.chunks()[0];
        assert_eq!(chunk.bytes.len(), 256);
        assert_eq!(chunk.bytes[0], 0x01);
        assert_eq!(chunk.bytes[5], 0x02);
        assert!(chunk.bytes[1..5].iter().all(|&b| b == 0xFF));
        assert!(chunk.bytes[6..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn chunks_stay_inside_their_sector() {
        // Last page of sector 0 plus first page of sector 1.
        let mut pairs = fill(0x0800_3F00, &[0x11; 256]);
        pairs.extend(fill(0x0800_4000, &[0x22; 256]));
        let image = HexImage::from_pairs(pairs).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();

        assert_eq!(plan.len(), 2);
        for chunk in plan.chunks() {
            let sector = &mcu().sectors[chunk.sector];
            assert!(sector.contains(chunk.address));
            assert!(sector.contains(chunk.address + 255));
        }
        assert_eq!(plan.dirty_sectors(), vec![0, 1]);
    }

    #[test]
    fn page_indices_count_from_sector_start() {
        let image =
            HexImage::from_pairs(fill(0x0800_4000 + 512, &[0x99; 256])).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();
        let chunk = &plan.chunks()[0];
        assert_eq!(chunk.sector, 1);
        assert_eq!(chunk.page, 2);
    }

    #[test]
    fn all_ff_pages_are_skipped() {
        let mut pairs = fill(0x0800_0000, &[0xFF; 256]);
        pairs.extend(fill(0x0800_0100, &[0xAB; 256]));
        let image = HexImage::from_pairs(pairs).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0].address, 0x0800_0100);
    }

    #[test]
    fn rejects_out_of_window_images() {
        let image = HexImage::from_pairs([(0x2000_0000, 0x00)]).unwrap();
        assert!(matches!(Plan::build(&image, mcu()), Err(Error::Plan(_))));

        let image = HexImage::from_pairs([(0x0810_0000, 0x00)]).unwrap();
        assert!(matches!(Plan::build(&image, mcu()), Err(Error::Plan(_))));
    }

    #[test]
    fn rejects_empty_and_blank_images() {
        assert!(matches!(
            Plan::build(&HexImage::default(), mcu()),
            Err(Error::Plan(_))
        ));
        let blank = HexImage::from_pairs(fill(0x0800_0000, &[0xFF; 256])).unwrap();
        assert!(matches!(Plan::build(&blank, mcu()), Err(Error::Plan(_))));
    }

    #[test]
    fn order_is_sector_then_address() {
        let mut pairs = fill(0x0802_0000, &[0x01; 256]); // sector 5
        pairs.extend(fill(0x0800_0000, &[0x02; 256])); // sector 0
        pairs.extend(fill(0x0800_0200, &[0x03; 256])); // sector 0, later page
        let image = HexImage::from_pairs(pairs).unwrap();
        let plan = Plan::build(&image, mcu()).unwrap();

        let addresses: Vec<u32> = plan.chunks().iter().map(|c| c.address).collect();
        assert_eq!(addresses, vec![0x0800_0000, 0x0800_0200, 0x0802_0000]);
        assert_eq!(plan.dirty_sectors(), vec![0, 5]);
        assert_eq!(plan.chunks_in_sector(0).count(), 2);
        assert_eq!(plan.chunks_in_sector(5).count(), 1);
    }
}
