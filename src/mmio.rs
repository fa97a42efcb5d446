use core::time::Duration;

use crate::params::{BusLayout, DeviceParams};
use crate::{AnyhowResult, FlashAccess};

/// Flash access through memory-mapped device registers.
///
/// Command addresses are converted to byte addresses using the device
/// address shift, and command bytes are replicated to every part on
/// the bus. Delays are busy-waits calibrated by `loops_per_us`, so they
/// are only a lower bound on elapsed time.
#[derive(Debug)]
pub struct MmioAccess {
    base: usize,
    layout: BusLayout,
    addr_shift: u32,
    loops_per_us: u32,
}

impl MmioAccess {
    /// Create a new MmioAccess for a device mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to the device's memory-mapped window, valid for
    /// volatile reads and writes of the bus width across the whole device,
    /// and nothing else may access that window while this value exists.
    pub unsafe fn new(base: usize, params: &DeviceParams, loops_per_us: u32) -> Self {
        log::debug!("MMIO flash at 0x{:08X}, {:?}", base, params.layout());
        MmioAccess {
            base,
            layout: params.layout(),
            addr_shift: params.addr_shift(),
            loops_per_us,
        }
    }

    /// Address of byte `addr`, rounded down to a whole bus word.
    fn ptr(&self, addr: u32) -> usize {
        let align = self.layout.bus_bytes() as usize;
        self.base + (addr as usize & !(align - 1))
    }
}

impl FlashAccess for MmioAccess {
    fn write_command(&mut self, addr: u32, cmd: u8) -> AnyhowResult<()> {
        let data = self.layout.form_mask(cmd);
        self.write(addr << self.addr_shift, data)
    }

    fn write(&mut self, addr: u32, data: u32) -> AnyhowResult<()> {
        let ptr = self.ptr(addr);
        // Safety: `new()` requires the whole device window to be valid
        // for bus-width volatile access, and `ptr()` keeps alignment.
        unsafe {
            match self.layout.bus_bytes() {
                1 => core::ptr::write_volatile(ptr as *mut u8, data as u8),
                2 => core::ptr::write_volatile(ptr as *mut u16, data as u16),
                _ => core::ptr::write_volatile(ptr as *mut u32, data),
            }
        }
        Ok(())
    }

    fn read(&mut self, addr: u32) -> AnyhowResult<u32> {
        let ptr = self.ptr(addr);
        // Safety: as for `write()`.
        let data = unsafe {
            match self.layout.bus_bytes() {
                1 => core::ptr::read_volatile(ptr as *const u8) as u32,
                2 => core::ptr::read_volatile(ptr as *const u16) as u32,
                _ => core::ptr::read_volatile(ptr as *const u32),
            }
        };
        Ok(data)
    }

    fn sleep(&mut self, dur: Duration) {
        let loops = dur.as_micros().max(1) * self.loops_per_us as u128;
        for _ in 0..loops {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
use crate::geometry::Geometry;
#[cfg(test)]
use crate::params::PartWidth;

#[test]
fn test_mmio_x16_transactions() {
    let geometry = Geometry::uniform(2, 0x20).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X16, 1)).unwrap();
    let mut window = [0u16; 0x20];
    let base = window.as_mut_ptr() as usize;
    let mut mmio = unsafe { MmioAccess::new(base, &params, 1) };

    mmio.write_command(3, 0x70).unwrap();
    mmio.write(8, 0x1234).unwrap();
    assert_eq!(mmio.read(8).unwrap(), 0x1234);
    assert_eq!(mmio.read(6).unwrap(), 0x0070);
    // Unaligned addresses are rounded down to the bus word.
    assert_eq!(mmio.read(9).unwrap(), 0x1234);
    mmio.sleep(Duration::from_micros(2));
    assert_eq!(window[3], 0x0070);
    assert_eq!(window[4], 0x1234);
}

#[test]
fn test_mmio_interleaved_command() {
    let geometry = Geometry::uniform(2, 0x20).unwrap();
    let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X8, 4)).unwrap();
    let mut window = [0u32; 0x10];
    let base = window.as_mut_ptr() as usize;
    let mut mmio = unsafe { MmioAccess::new(base, &params, 1) };
    mmio.write_command(2, 0xFF).unwrap();
    assert_eq!(mmio.read(8).unwrap(), 0xFFFF_FFFF);
    assert_eq!(window[2], 0xFFFF_FFFF);
}
