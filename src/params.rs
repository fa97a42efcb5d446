use core::time::Duration;

use crate::geometry::{Block, BlockAddr, Blocks, ByteAddr, Geometry};
use crate::status::StatusMasks;
use crate::{Error, Result};

/// Default delay between issuing a command and the status register becoming valid.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_micros(1);

/// Data bus width of a single flash part.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum PartWidth {
    X8 = 1,
    X16 = 2,
    X32 = 4,
}

/// How flash parts are arranged on the data bus.
///
/// `parts` devices of `width` each are ganged side by side to form one
/// bus word; commands and status bits are replicated across every part.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusLayout {
    pub width: PartWidth,
    pub parts: u8,
}

impl BusLayout {
    pub const fn new(width: PartWidth, parts: u8) -> Self {
        BusLayout { width, parts }
    }

    /// Total bus width in bytes.
    pub fn bus_bytes(&self) -> u32 {
        u8::from(self.width) as u32 * self.parts as u32
    }

    /// Replicate a single command or status byte into every part's lane of the bus.
    ///
    /// Each part sees the byte in the low byte of its lane.
    pub fn form_mask(&self, bit: u8) -> u32 {
        let lane_bits = u8::from(self.width) as u32 * 8;
        (0..self.parts as u32)
            .filter(|part| part * lane_bits < 32)
            .fold(0, |mask, part| mask | ((bit as u32) << (part * lane_bits)))
    }
}

/// Bound on the number of status reads made while waiting for the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollLimit {
    /// Poll forever.
    Unbounded,
    /// Give up with `Error::Timeout` after this many reads.
    Max(u32),
}

impl Default for PollLimit {
    fn default() -> Self {
        PollLimit::Unbounded
    }
}

/// Device parameters used by every flash operation.
///
/// Built once per device attach and then only read. Rebuild it if the
/// geometry or bus layout changes, since block addresses and status
/// masks are derived from them.
#[derive(Copy, Clone, Debug)]
pub struct DeviceParams {
    geometry: Geometry,
    layout: BusLayout,
    addr_step: u32,
    addr_shift: u32,
    masks: StatusMasks,
    settle_delay: Duration,
    poll_limit: PollLimit,
    unlock_before_erase: bool,
}

impl DeviceParams {
    /// Create parameters with explicit addressing.
    ///
    /// `addr_step` is the number of bytes written per program operation
    /// and must be 1, 2 or 4 and no wider than the bus; `addr_shift`
    /// converts a byte address to a command address.
    pub fn new(geometry: Geometry, layout: BusLayout, addr_step: u32, addr_shift: u32)
        -> Result<Self>
    {
        if layout.parts == 0 || layout.bus_bytes() > 4 || !layout.bus_bytes().is_power_of_two() {
            log::error!("Unsupported bus layout: {:?}", layout);
            return Err(Error::InvalidParams);
        }
        if !matches!(addr_step, 1 | 2 | 4) || addr_step > layout.bus_bytes() {
            log::error!("Unsupported address step: {}", addr_step);
            return Err(Error::InvalidParams);
        }
        if addr_shift >= 32 {
            log::error!("Unsupported address shift: {}", addr_shift);
            return Err(Error::InvalidParams);
        }
        let masks = StatusMasks::new(&layout);
        log::debug!("Device parameters: layout={:?} step={} shift={} blocks={}",
                    layout, addr_step, addr_shift, geometry.num_blocks());
        Ok(DeviceParams {
            geometry,
            layout,
            addr_step,
            addr_shift,
            masks,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_limit: PollLimit::Unbounded,
            unlock_before_erase: true,
        })
    }

    /// Create parameters with addressing derived from the bus layout:
    /// one bus word per program operation, addressed in bus words.
    pub fn for_layout(geometry: Geometry, layout: BusLayout) -> Result<Self> {
        let step = layout.bus_bytes();
        Self::new(geometry, layout, step, step.trailing_zeros())
    }

    /// Set the delay between a command and its status becoming valid.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Bound status polling; by default polling never gives up.
    pub fn with_poll_limit(mut self, limit: PollLimit) -> Self {
        self.poll_limit = limit;
        self
    }

    /// Set whether blocks are unlocked before they are erased. Enabled by default.
    pub fn with_unlock_before_erase(mut self, unlock: bool) -> Self {
        self.unlock_before_erase = unlock;
        self
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn layout(&self) -> BusLayout {
        self.layout
    }

    pub fn addr_step(&self) -> u32 {
        self.addr_step
    }

    pub fn addr_shift(&self) -> u32 {
        self.addr_shift
    }

    pub fn masks(&self) -> &StatusMasks {
        &self.masks
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn poll_limit(&self) -> PollLimit {
        self.poll_limit
    }

    pub fn unlock_before_erase(&self) -> bool {
        self.unlock_before_erase
    }

    /// Command address for byte address `addr`.
    pub fn to_block(&self, addr: ByteAddr) -> BlockAddr {
        addr.to_block(self.addr_shift)
    }

    /// Byte address for command address `addr`.
    pub fn to_byte(&self, addr: BlockAddr) -> ByteAddr {
        addr.to_byte(self.addr_shift)
    }

    /// Iterate over every block in the device.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(&self.geometry, self.addr_shift)
    }

    /// Iterate over the command address of every block in the device.
    pub fn block_addrs(&self) -> impl Iterator<Item = BlockAddr> + Clone + '_ {
        self.blocks().map(|block| block.addr)
    }

    /// Find the block containing byte `offset`.
    pub fn block_at(&self, offset: u32) -> Option<Block> {
        self.geometry.block_at(offset, self.addr_shift)
    }

    /// Iterate over every block overlapping `length` bytes from `offset`.
    ///
    /// Returns `Error::InvalidAddress` if any byte of the range is outside
    /// the device, including any gap between regions.
    pub fn blocks_in_range(&self, offset: u32, length: usize)
        -> Result<impl Iterator<Item = Block> + Clone + '_>
    {
        self.check_range(offset, length)?;
        let start = offset as u64;
        let end = start + length as u64;
        Ok(self.blocks().filter(move |block| block.overlaps(start, end)))
    }

    /// Checks that `length` bytes from `offset` lie within the device.
    pub(crate) fn check_range(&self, offset: u32, length: usize) -> Result<()> {
        log::trace!("Checking offset={:08X} length={}", offset, length);
        if length == 0 {
            return Ok(());
        }
        let end = offset as u64 + length as u64 - 1;
        if end > u32::MAX as u64 {
            log::error!("Operation would exceed largest address");
            return Err(Error::InvalidAddress { address: offset });
        }
        // Walk block by block so gaps between regions are caught.
        let mut pos = offset as u64;
        while pos <= end {
            match self.block_at(pos as u32) {
                Some(block) => pos = block.offset.0 as u64 + block.size as u64,
                None => {
                    log::error!("Address 0x{:08X} is outside the device", pos);
                    return Err(Error::InvalidAddress { address: pos as u32 });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
use crate::geometry::Region;

#[test]
fn test_form_mask() {
    assert_eq!(BusLayout::new(PartWidth::X8, 1).form_mask(0x80), 0x80);
    assert_eq!(BusLayout::new(PartWidth::X8, 2).form_mask(0x80), 0x8080);
    assert_eq!(BusLayout::new(PartWidth::X8, 4).form_mask(0x70), 0x7070_7070);
    assert_eq!(BusLayout::new(PartWidth::X16, 1).form_mask(0x80), 0x0080);
    assert_eq!(BusLayout::new(PartWidth::X16, 2).form_mask(0x20), 0x0020_0020);
    assert_eq!(BusLayout::new(PartWidth::X32, 1).form_mask(0xFF), 0x0000_00FF);
}

#[test]
fn test_for_layout_addressing() {
    let geometry = Geometry::uniform(4, 0x10000).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X16, 1)).unwrap();
    assert_eq!((params.addr_step(), params.addr_shift()), (2, 1));
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X16, 2)).unwrap();
    assert_eq!((params.addr_step(), params.addr_shift()), (4, 2));
    assert_eq!(params.masks().ready, 0x0080_0080);
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X8, 1)).unwrap();
    assert_eq!((params.addr_step(), params.addr_shift()), (1, 0));
}

#[test]
fn test_invalid_params() {
    let geometry = Geometry::uniform(4, 0x10000).unwrap();
    let x16 = BusLayout::new(PartWidth::X16, 1);
    assert!(DeviceParams::new(geometry, x16, 3, 1).is_err());
    assert!(DeviceParams::new(geometry, x16, 0, 1).is_err());
    assert!(DeviceParams::new(geometry, x16, 2, 32).is_err());
    assert!(DeviceParams::new(geometry, x16, 4, 2).is_err());
    assert!(DeviceParams::new(geometry, BusLayout::new(PartWidth::X32, 2), 4, 2).is_err());
    assert!(DeviceParams::new(geometry, BusLayout::new(PartWidth::X8, 0), 1, 0).is_err());
    let x8x3 = BusLayout::new(PartWidth::X8, 3);
    assert!(matches!(DeviceParams::new(geometry, x8x3, 1, 0), Err(Error::InvalidParams)));
    assert!(DeviceParams::for_layout(geometry, x8x3).is_err());
}

#[test]
fn test_defaults_and_builders() {
    let geometry = Geometry::uniform(4, 0x10000).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X16, 1)).unwrap();
    assert_eq!(params.poll_limit(), PollLimit::Unbounded);
    assert_eq!(params.settle_delay(), DEFAULT_SETTLE_DELAY);
    assert!(params.unlock_before_erase());
    let params = params
        .with_poll_limit(PollLimit::Max(10))
        .with_settle_delay(Duration::from_micros(5))
        .with_unlock_before_erase(false);
    assert_eq!(params.poll_limit(), PollLimit::Max(10));
    assert_eq!(params.settle_delay(), Duration::from_micros(5));
    assert!(!params.unlock_before_erase());
}

#[test]
fn test_blocks_in_range() {
    let geometry = Geometry::new(&[
        Region::new(0, 4, 0x2000),
        Region::new(0x8000, 2, 0x8000),
    ]).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X8, 1)).unwrap();
    let offsets = |offset, length| -> std::vec::Vec<u32> {
        params.blocks_in_range(offset, length).unwrap().map(|b| b.offset.0).collect()
    };
    assert_eq!(offsets(0, 1), std::vec![0]);
    assert_eq!(offsets(0x1FFF, 2), std::vec![0, 0x2000]);
    assert_eq!(offsets(0x7000, 0x2000), std::vec![0x6000, 0x8000]);
    assert_eq!(offsets(0, 0x18000).len(), 6);
    assert!(params.blocks_in_range(0x17FFF, 2).is_err());
}

#[test]
fn test_check_range_catches_gaps() {
    let geometry = Geometry::new(&[
        Region::new(0, 2, 0x1000),
        Region::new(0x4000, 2, 0x1000),
    ]).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X8, 1)).unwrap();
    assert!(params.check_range(0, 0x2000).is_ok());
    assert!(params.check_range(0x4000, 0x2000).is_ok());
    assert!(matches!(params.check_range(0x1000, 0x3001),
                     Err(Error::InvalidAddress { address: 0x2000 })));
    assert!(params.check_range(0x3000, 0).is_ok());
}
