use crate::{Error, Result};

/// Maximum number of erase regions a device may describe.
pub const MAX_REGIONS: usize = 10;

/// Address in command (block) address space.
///
/// Commands are always issued at block addresses; convert to a byte
/// address with `to_byte()` before any data transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr(pub u32);

/// Address in data (byte) address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteAddr(pub u32);

impl BlockAddr {
    pub fn to_byte(self, shift: u32) -> ByteAddr {
        ByteAddr(self.0 << shift)
    }
}

impl ByteAddr {
    pub fn to_block(self, shift: u32) -> BlockAddr {
        BlockAddr(self.0 >> shift)
    }
}

/// A contiguous run of equally-sized erase blocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Region {
    /// Byte offset of the first block in this region.
    pub offset: u32,
    /// Number of blocks in this region.
    pub num_blocks: u32,
    /// Size of each block in bytes.
    pub block_size: u32,
}

impl Region {
    pub const fn new(offset: u32, num_blocks: u32, block_size: u32) -> Self {
        Region { offset, num_blocks, block_size }
    }

    /// Total size of this region in bytes.
    pub fn size(&self) -> u64 {
        self.num_blocks as u64 * self.block_size as u64
    }

    /// One past the last byte offset covered by this region.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size()
    }
}

/// Device erase geometry: an ordered list of regions.
///
/// Regions are stored inline so no allocation is required.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    regions: [Region; MAX_REGIONS],
    count: usize,
}

impl Geometry {
    /// Build a geometry from `regions`, which must be given in address order.
    ///
    /// Returns `Error::InvalidParams` if there are no regions, too many regions,
    /// any region is empty, or regions overlap.
    pub fn new(regions: &[Region]) -> Result<Self> {
        if regions.is_empty() || regions.len() > MAX_REGIONS {
            log::error!("Invalid number of erase regions: {}", regions.len());
            return Err(Error::InvalidParams);
        }
        let mut end = 0u64;
        for (idx, region) in regions.iter().enumerate() {
            if region.num_blocks == 0 || region.block_size == 0 {
                log::error!("Erase region {} is empty: {:?}", idx, region);
                return Err(Error::InvalidParams);
            }
            if (region.offset as u64) < end {
                log::error!("Erase region {} overlaps previous region: {:?}", idx, region);
                return Err(Error::InvalidParams);
            }
            if region.end() > 1 << 32 {
                log::error!("Erase region {} exceeds 32-bit address space: {:?}", idx, region);
                return Err(Error::InvalidParams);
            }
            end = region.end();
        }
        let mut geometry = Geometry { regions: [Region::default(); MAX_REGIONS], count: 0 };
        geometry.regions[..regions.len()].copy_from_slice(regions);
        geometry.count = regions.len();
        log::debug!("Geometry: {:X?}", geometry.regions());
        Ok(geometry)
    }

    /// Single region of `num_blocks` blocks of `block_size` bytes starting at 0.
    pub fn uniform(num_blocks: u32, block_size: u32) -> Result<Self> {
        Self::new(&[Region::new(0, num_blocks, block_size)])
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions[..self.count]
    }

    /// Total number of blocks across all regions.
    pub fn num_blocks(&self) -> u32 {
        self.regions().iter().map(|r| r.num_blocks).sum()
    }

    /// One past the highest byte offset covered by any region.
    pub fn total_size(&self) -> u64 {
        self.regions().last().map(|r| r.end()).unwrap_or(0)
    }

    /// Find the block containing byte `offset`, if any.
    ///
    /// `shift` converts the block's byte offset to its command address.
    pub fn block_at(&self, offset: u32, shift: u32) -> Option<Block> {
        let offset = offset as u64;
        let region = self.regions().iter().find(|r| offset >= r.offset as u64 && offset < r.end())?;
        let index = (offset - region.offset as u64) / region.block_size as u64;
        let start = region.offset + (index as u32) * region.block_size;
        Some(Block::new(start, region.block_size, shift))
    }
}

/// A single erase block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Command address of the block.
    pub addr: BlockAddr,
    /// Byte offset of the start of the block.
    pub offset: ByteAddr,
    /// Block size in bytes.
    pub size: u32,
}

impl Block {
    fn new(offset: u32, size: u32, shift: u32) -> Self {
        let offset = ByteAddr(offset);
        Block { addr: offset.to_block(shift), offset, size }
    }

    /// True if this block overlaps bytes `start..end`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        let blk_start = self.offset.0 as u64;
        let blk_end = blk_start + self.size as u64;
        blk_start < end && start < blk_end
    }
}

/// Iterator over every block of a geometry, in region order.
///
/// Created by `DeviceParams::blocks()`. Cloning the iterator restarts
/// from the same position.
#[derive(Clone, Debug)]
pub struct Blocks<'a> {
    regions: &'a [Region],
    shift: u32,
    region: usize,
    block: u32,
    offset: u32,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(geometry: &'a Geometry, shift: u32) -> Self {
        let regions = geometry.regions();
        let offset = regions.first().map(|r| r.offset).unwrap_or(0);
        Blocks { regions, shift, region: 0, block: 0, offset }
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        loop {
            let region = self.regions.get(self.region)?;
            if self.block < region.num_blocks {
                let block = Block::new(self.offset, region.block_size, self.shift);
                self.block += 1;
                self.offset = self.offset.wrapping_add(region.block_size);
                return Some(block);
            }
            self.region += 1;
            self.block = 0;
            if let Some(next) = self.regions.get(self.region) {
                self.offset = next.offset;
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.regions.iter()
            .skip(self.region)
            .map(|r| r.num_blocks as usize)
            .sum::<usize>()
            .saturating_sub(self.block as usize);
        (remaining, Some(remaining))
    }
}

#[test]
fn test_blocks_follow_regions() {
    let geometry = Geometry::new(&[
        Region::new(0, 2, 0x2000),
        Region::new(0x4000, 3, 0x10000),
    ]).unwrap();
    let offsets: std::vec::Vec<u32> = Blocks::new(&geometry, 1).map(|b| b.offset.0).collect();
    assert_eq!(offsets, std::vec![0, 0x2000, 0x4000, 0x14000, 0x24000]);
    let addrs: std::vec::Vec<u32> = Blocks::new(&geometry, 1).map(|b| b.addr.0).collect();
    assert_eq!(addrs, std::vec![0, 0x1000, 0x2000, 0xA000, 0x12000]);
    assert_eq!(Blocks::new(&geometry, 1).size_hint(), (5, Some(5)));
    assert_eq!(geometry.num_blocks(), 5);
    assert_eq!(geometry.total_size(), 0x34000);
}

#[test]
fn test_blocks_restartable() {
    let geometry = Geometry::uniform(4, 0x10000).unwrap();
    let mut blocks = Blocks::new(&geometry, 1);
    blocks.next();
    let rest = blocks.clone();
    assert_eq!(blocks.count(), 3);
    assert_eq!(rest.count(), 3);
}

#[test]
fn test_address_round_trip() {
    let geometry = Geometry::new(&[
        Region::new(0, 8, 0x2000),
        Region::new(0x10000, 63, 0x10000),
    ]).unwrap();
    for shift in 0..3 {
        for block in Blocks::new(&geometry, shift) {
            assert_eq!(block.addr.to_byte(shift).to_block(shift), block.addr);
            assert_eq!(block.addr.to_byte(shift), block.offset);
        }
    }
}

#[test]
fn test_block_at() {
    let geometry = Geometry::new(&[
        Region::new(0, 4, 0x2000),
        Region::new(0x8000, 2, 0x8000),
    ]).unwrap();
    let block = geometry.block_at(0x2001, 1).unwrap();
    assert_eq!(block.offset, ByteAddr(0x2000));
    assert_eq!(block.addr, BlockAddr(0x1000));
    let block = geometry.block_at(0xFFFF, 0).unwrap();
    assert_eq!(block.offset, ByteAddr(0x8000));
    assert_eq!(block.size, 0x8000);
    assert!(geometry.block_at(0x18000, 0).is_none());
}

#[test]
fn test_invalid_geometry() {
    assert!(Geometry::new(&[]).is_err());
    assert!(Geometry::new(&[Region::new(0, 0, 0x1000)]).is_err());
    assert!(Geometry::new(&[Region::new(0, 4, 0x1000), Region::new(0x2000, 1, 0x1000)]).is_err());
    assert!(Geometry::new(&[Region::new(0xFFFF_0000, 2, 0x10000)]).is_err());
    assert!(Geometry::new(&[Region::default(); MAX_REGIONS + 1]).is_err());
}
