// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! intel-flash
//!
//! This crate drives parallel NOR flash memories implementing the Intel
//! command set, including block erase, word programming, and block locking.
//!
//! The device geometry and bus layout must be known in advance and are
//! described by a `DeviceParams`. Bus transactions are performed through
//! an implementation of `FlashAccess`, such as `MmioAccess`.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
extern crate std;

use core::time::Duration;
#[cfg(feature = "std")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod code;
pub mod geometry;
pub mod mmio;
pub mod params;
pub mod status;

pub use code::ResultCode;
pub use geometry::{Block, BlockAddr, Blocks, ByteAddr, Geometry, Region, MAX_REGIONS};
pub use mmio::MmioAccess;
pub use params::{BusLayout, DeviceParams, PartWidth, PollLimit, DEFAULT_SETTLE_DELAY};
pub use status::{DeviceStatus, StatusBit, StatusMasks, StatusWord};

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The flash command sequence was incorrect.")]
    SequenceError,
    #[error("The flash erase operation failed.")]
    EraseError,
    #[error("The flash programming operation failed.")]
    ProgramError,
    #[error("The flash part ran into a voltage error.")]
    VoltageError,
    #[error("The flash operation ran into a lock error.")]
    LockError,
    #[error("Timed out waiting for flash at 0x{address:08X} to become ready.")]
    Timeout { address: u32 },
    #[error("Address out of range for memory: 0x{address:08X}.")]
    InvalidAddress { address: u32 },
    #[error("Invalid device parameters.")]
    InvalidParams,
    #[error("Mismatch during flash readback verification.")]
    ReadbackError { address: u32, wrote: u8, read: u8 },

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error {
    SequenceError,
    EraseError,
    ProgramError,
    VoltageError,
    LockError,
    Timeout { address: u32 },
    InvalidAddress { address: u32 },
    InvalidParams,
    ReadbackError { address: u32, wrote: u8, read: u8 },

    Access,
}

impl Error {
    /// Numeric code for reporting this error to a host.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::SequenceError => ResultCode::SequenceError,
            Error::EraseError => ResultCode::EraseError,
            Error::ProgramError => ResultCode::ProgramError,
            Error::VoltageError => ResultCode::VoltageError,
            Error::LockError => ResultCode::LockError,
            Error::Timeout { .. } => ResultCode::Timeout,
            Error::InvalidAddress { .. } => ResultCode::InvalidAddress,
            Error::InvalidParams => ResultCode::InvalidParams,
            Error::ReadbackError { .. } => ResultCode::Readback,
            #[cfg(feature = "std")]
            Error::Access(_) => ResultCode::Access,
            #[cfg(not(feature = "std"))]
            Error::Access => ResultCode::Access,
        }
    }
}

#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, Error>;
#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Trait for objects which provide bus access to a parallel flash device.
///
/// All transactions are at the full bus width; narrower buses only use
/// the low bits of each word.
pub trait FlashAccess {
    /// Write command byte `cmd` at command address `addr`.
    ///
    /// The command must be replicated to every part on the bus,
    /// see `BusLayout::form_mask()`.
    fn write_command(&mut self, addr: u32, cmd: u8) -> AnyhowResult<()>;

    /// Write one bus word `data` at byte address `addr`.
    fn write(&mut self, addr: u32, data: u32) -> AnyhowResult<()>;

    /// Read one bus word from byte address `addr`.
    fn read(&mut self, addr: u32) -> AnyhowResult<u32>;

    /// Wait for at least `dur`.
    fn sleep(&mut self, dur: Duration);
}

/// Intel command set flash.
///
/// Every operation leaves the affected block in read-array mode,
/// whether or not it succeeded.
pub struct Flash<'a, A: FlashAccess> {
    access: &'a mut A,
    params: &'a DeviceParams,
}

impl<'a, A: FlashAccess> Flash<'a, A> {
    #[cfg(feature = "std")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "std")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new Flash instance using the given FlashAccess provider and device parameters.
    pub fn new(access: &'a mut A, params: &'a DeviceParams) -> Self {
        Flash { access, params }
    }

    pub fn params(&self) -> &'a DeviceParams {
        self.params
    }

    /// Return one block to read-array mode.
    ///
    /// Clears the status register and issues Read Array at `block`.
    /// Only bus access errors are reported.
    pub fn reset_block(&mut self, block: BlockAddr) -> Result<()> {
        log::trace!("Resetting block 0x{:08X}", block.0);
        self.clear_status()?;
        self.command(block, Command::ReadArray)?;
        self.settle_delay();
        Ok(())
    }

    /// Return every block in the device to read-array mode.
    pub fn reset_device(&mut self) -> Result<()> {
        log::debug!("Resetting all blocks");
        let params = self.params;
        for block in params.block_addrs() {
            self.reset_block(block)?;
        }
        Ok(())
    }

    /// Erase the block at `block`.
    ///
    /// If enabled in the device parameters the block is unlocked first,
    /// and an unlock failure is returned without attempting the erase.
    #[cfg(feature = "erase")]
    pub fn erase_block(&mut self, block: BlockAddr) -> Result<()> {
        log::debug!("Erasing block 0x{:08X}", block.0);
        if self.params.unlock_before_erase() {
            self.unlock_block(block)?;
        }
        let result = self.run_erase(block);
        self.finish(block, result)
    }

    /// Erase the entire device, one block at a time.
    ///
    /// The command set has no chip erase, so this issues one block erase
    /// per block and stops at the first failure.
    #[cfg(feature = "erase")]
    pub fn erase_device(&mut self) -> Result<()> {
        self.erase_device_cb(|_| {})
    }

    /// Erase the entire device, one block at a time.
    ///
    /// Calls `cb` with the number of bytes erased so far after each block.
    #[cfg(feature = "erase")]
    pub fn erase_device_cb<F: Fn(usize)>(&mut self, cb: F) -> Result<()> {
        let params = self.params;
        log::debug!("Erasing device, {} blocks", params.geometry().num_blocks());
        let mut total_erased = 0;
        cb(total_erased);
        for block in params.blocks() {
            self.erase_block(block.addr)?;
            total_erased += block.size as usize;
            cb(total_erased);
        }
        Ok(())
    }

    /// Erase the entire device, drawing a progress bar to the terminal.
    #[cfg(all(feature = "erase", feature = "std"))]
    pub fn erase_device_progress(&mut self) -> Result<()> {
        let size = self.params.geometry().total_size();
        let pb = ProgressBar::new(size).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Erasing");
        self.erase_device_cb(|n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Erase every block which contains any of the `length` bytes from `offset`.
    ///
    /// Data in those blocks outside the range is erased too.
    #[cfg(feature = "erase")]
    pub fn erase_range(&mut self, offset: u32, length: usize) -> Result<()> {
        log::debug!("Erasing range offset=0x{:08X} length={}", offset, length);
        let params = self.params;
        for block in params.blocks_in_range(offset, length)? {
            self.erase_block(block.addr)?;
        }
        Ok(())
    }

    /// Program `data` to the flash starting at byte `offset`.
    ///
    /// Data is written one bus word at a time. If `data` is not a whole
    /// number of words, the final word is padded with 0xFF, which leaves
    /// the corresponding bytes unchanged.
    ///
    /// Note that this does *not* erase the flash beforehand.
    #[cfg(feature = "program")]
    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.program_cb(offset, data, |_| {})
    }

    /// Program `data` to the flash starting at byte `offset`.
    ///
    /// Calls `cb` with the number of bytes programmed so far after each word.
    #[cfg(feature = "program")]
    pub fn program_cb<F: Fn(usize)>(&mut self, offset: u32, data: &[u8], cb: F) -> Result<()> {
        let step = self.params.addr_step() as usize;
        if offset as usize % step != 0 {
            log::error!("Program offset 0x{:08X} is not aligned to {} bytes", offset, step);
            return Err(Error::InvalidAddress { address: offset });
        }
        let length = (data.len() + step - 1) / step * step;
        self.params.check_range(offset, length)?;
        log::debug!("Programming {} bytes ({} padded) at 0x{:08X}", data.len(), length, offset);

        cb(0);
        let mut cmd_addr = self.params.to_block(ByteAddr(offset));
        self.reset_block(cmd_addr)?;
        if data.is_empty() {
            return Ok(());
        }

        let bus_bytes = self.params.layout().bus_bytes() as usize;
        let mut addr = offset;
        for (idx, unit) in data.chunks(step).enumerate() {
            cmd_addr = self.params.to_block(ByteAddr(addr));
            let word = pack_word(unit, bus_bytes);
            if let Err(e) = self.program_word(addr, cmd_addr, word) {
                log::error!("Programming failed at 0x{:08X}", addr);
                return self.finish(cmd_addr, Err(e));
            }
            addr = addr.wrapping_add(step as u32);
            cb(usize::min((idx + 1) * step, data.len()));
        }

        self.finish(cmd_addr, Ok(()))
    }

    /// Program `data` to the flash starting at byte `offset`,
    /// drawing a progress bar to the terminal.
    #[cfg(all(feature = "program", feature = "std"))]
    pub fn program_progress(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        self.program_cb(offset, data, |n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Set the lock bit for `block`, preventing erase and program.
    pub fn lock_block(&mut self, block: BlockAddr) -> Result<()> {
        log::debug!("Locking block 0x{:08X}", block.0);
        self.change_lock(block, Command::SetLockBit)
    }

    /// Clear the lock bit for `block`.
    ///
    /// Some devices clear the lock bits of every block with this command.
    pub fn unlock_block(&mut self, block: BlockAddr) -> Result<()> {
        log::debug!("Unlocking block 0x{:08X}", block.0);
        self.change_lock(block, Command::Confirm)
    }

    /// Lock every block which contains any of the `length` bytes from `offset`.
    pub fn lock_range(&mut self, offset: u32, length: usize) -> Result<()> {
        let params = self.params;
        for block in params.blocks_in_range(offset, length)? {
            self.lock_block(block.addr)?;
        }
        Ok(())
    }

    /// Unlock every block which contains any of the `length` bytes from `offset`.
    pub fn unlock_range(&mut self, offset: u32, length: usize) -> Result<()> {
        let params = self.params;
        for block in params.blocks_in_range(offset, length)? {
            self.unlock_block(block.addr)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of data starting at byte `offset`.
    ///
    /// The device must be in read-array mode, which is the case after
    /// any operation of this driver completes.
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.params.check_range(offset, buf.len())?;
        let step = self.params.addr_step();
        let mut addr = offset - offset % step;
        let mut skip = (offset - addr) as usize;
        let mut pos = 0;
        while pos < buf.len() {
            let word = self.access.read(addr)?.to_le_bytes();
            let n = usize::min(step as usize - skip, buf.len() - pos);
            buf[pos..pos + n].copy_from_slice(&word[skip..skip + n]);
            pos += n;
            skip = 0;
            addr = addr.wrapping_add(step);
        }
        Ok(())
    }

    /// Read back the flash contents from `offset` and compare against `data`.
    ///
    /// Returns `Error::ReadbackError` at the first mismatching byte.
    pub fn verify(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        const CHUNK: usize = 64;
        self.params.check_range(offset, data.len())?;
        let mut buf = [0u8; CHUNK];
        for (idx, chunk) in data.chunks(CHUNK).enumerate() {
            let base = offset + (idx * CHUNK) as u32;
            let buf = &mut buf[..chunk.len()];
            self.read(base, buf)?;
            let mismatch = chunk.iter().zip(buf.iter()).enumerate().find(|(_, (a, b))| a != b);
            if let Some((i, (wrote, read))) = mismatch {
                let address = base + i as u32;
                log::error!("Readback mismatch at 0x{:08X}: Wrote 0x{:02X}, read 0x{:02X}",
                            address, wrote, read);
                return Err(Error::ReadbackError { address, wrote: *wrote, read: *read });
            }
        }
        Ok(())
    }

    /// Read the status register for `block`.
    ///
    /// This leaves the device in read-status mode.
    pub fn read_status(&mut self, block: BlockAddr) -> Result<StatusWord> {
        self.command(block, Command::ReadStatus)?;
        let status = StatusWord(self.access.read(self.params.to_byte(block).0)?);
        log::trace!("Status at 0x{:08X}: 0x{:08X}", block.0, status.0);
        Ok(status)
    }

    /// Read and decode the status register for `block`.
    pub fn status(&mut self, block: BlockAddr) -> Result<DeviceStatus> {
        let status = self.read_status(block)?;
        Ok(self.params.masks().decode(status))
    }

    /// Clear the error bits of the status register.
    pub fn clear_status(&mut self) -> Result<()> {
        self.command(BlockAddr(0), Command::ClearStatus)
    }

    /// Wait for the minimum time between a command and valid status.
    pub fn settle_delay(&mut self) {
        self.access.sleep(self.params.settle_delay());
    }

    #[cfg(feature = "erase")]
    fn run_erase(&mut self, block: BlockAddr) -> Result<()> {
        self.command(block, Command::BlockErase)?;
        self.command(block, Command::Confirm)?;
        self.settle_delay();
        self.wait_ready(self.params.to_byte(block))?;
        self.check_status(block)
    }

    #[cfg(feature = "program")]
    fn program_word(&mut self, addr: u32, cmd_addr: BlockAddr, word: u32) -> Result<()> {
        log::trace!("Programming 0x{:08X} at 0x{:08X}", word, addr);
        self.command(cmd_addr, Command::ProgramWord)?;
        self.access.write(addr, word)?;
        self.settle_delay();
        self.wait_ready(ByteAddr(addr))?;
        self.check_status(cmd_addr)
    }

    fn change_lock(&mut self, block: BlockAddr, confirm: Command) -> Result<()> {
        let result = self.run_change_lock(block, confirm);
        self.finish(block, result)
    }

    fn run_change_lock(&mut self, block: BlockAddr, confirm: Command) -> Result<()> {
        self.command(block, Command::ChangeLock)?;
        self.command(block, confirm)?;
        self.settle_delay();
        self.wait_ready(self.params.to_byte(block))?;
        // Lock bit changes need the delay again once ready.
        self.settle_delay();
        self.check_status(block)
    }

    /// Reset `block`, then return `result`.
    ///
    /// An error in `result` takes precedence over an error from the reset.
    fn finish(&mut self, block: BlockAddr, result: Result<()>) -> Result<()> {
        let reset = self.reset_block(block);
        result.and(reset)
    }

    /// Read the status decoded as a `Result`, logging any failure.
    fn check_status(&mut self, block: BlockAddr) -> Result<()> {
        let status = self.status(block)?;
        if status != DeviceStatus::Ready {
            log::error!("Block 0x{:08X} reported {:?}", block.0, status);
        }
        status.into_result()
    }

    /// Poll `addr` until every part reports ready.
    ///
    /// The device must already be in read-status mode. With a poll limit
    /// set, at least one read is always made.
    fn wait_ready(&mut self, addr: ByteAddr) -> Result<()> {
        let masks = *self.params.masks();
        let mut polls: u32 = 0;
        loop {
            let status = StatusWord(self.access.read(addr.0)?);
            polls = polls.saturating_add(1);
            if status.is_ready(&masks) {
                log::trace!("Ready at 0x{:08X} after {} polls", addr.0, polls);
                return Ok(());
            }
            if let PollLimit::Max(max) = self.params.poll_limit() {
                if polls >= max {
                    log::error!("Device at 0x{:08X} not ready after {} polls", addr.0, polls);
                    return Err(Error::Timeout { address: addr.0 });
                }
            }
        }
    }

    /// Write a single command at `block`.
    fn command(&mut self, block: BlockAddr, command: Command) -> Result<()> {
        let opcode: u8 = command.into();
        log::trace!("Command 0x{:02X} at 0x{:08X}", opcode, block.0);
        self.access.write_command(block.0, opcode)?;
        Ok(())
    }
}

/// Pack `unit` into a little-endian bus word of `bus_bytes` bytes,
/// padding missing bytes with 0xFF.
#[cfg(feature = "program")]
fn pack_word(unit: &[u8], bus_bytes: usize) -> u32 {
    let mut bytes = [0u8; 4];
    for (idx, byte) in bytes.iter_mut().take(bus_bytes).enumerate() {
        *byte = unit.get(idx).copied().unwrap_or(0xFF);
    }
    u32::from_le_bytes(bytes)
}

/// Intel command set opcodes.
///
/// The erase confirm, clear lock bits, and resume opcodes are all 0xD0,
/// so they share the `Confirm` variant.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
enum Command {
    SetLockBit = 0x01,
    BlockErase = 0x20,
    // Listed for completeness; the Intel command set has no chip erase.
    FullErase = 0x30,
    ProgramWord = 0x40,
    ClearStatus = 0x50,
    ChangeLock = 0x60,
    ReadStatus = 0x70,
    ReadIDCodes = 0x90,
    ReadQuery = 0x98,
    Suspend = 0xB0,
    Confirm = 0xD0,
    ReadArray = 0xFF,
}


#[cfg(all(test, feature = "std", feature = "erase", feature = "program"))]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Op {
        Cmd(u32, u8),
        Write(u32, u32),
        Read(u32),
        Sleep,
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Mode {
        ReadArray,
        ReadStatus,
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Pending {
        Nothing,
        Erase,
        Program,
        Lock,
    }

    /// Simulated single-part Intel flash.
    ///
    /// Records every bus transaction. Error bits accumulate in the status
    /// register until Clear Status, as on real parts.
    struct SimFlash {
        bus_bytes: u32,
        shift: u32,
        block_size: u32,
        memory: Vec<u8>,
        locked: Vec<bool>,
        mode: Mode,
        pending: Pending,
        status: u8,
        busy_polls: u32,
        busy: u32,
        stuck: bool,
        /// Status bits to raise after skipping this many completed operations.
        inject: Option<(u32, u8)>,
        ops: Vec<Op>,
    }

    impl SimFlash {
        fn new(num_blocks: u32, block_size: u32, bus_bytes: u32) -> Self {
            SimFlash {
                bus_bytes,
                shift: bus_bytes.trailing_zeros(),
                block_size,
                memory: vec![0xFF; (num_blocks * block_size) as usize],
                locked: vec![false; num_blocks as usize],
                mode: Mode::ReadArray,
                pending: Pending::Nothing,
                status: 0,
                busy_polls: 1,
                busy: 0,
                stuck: false,
                inject: None,
                ops: Vec::new(),
            }
        }

        fn block_index(&self, byte_addr: u32) -> usize {
            (byte_addr / self.block_size) as usize
        }

        fn complete(&mut self, bits: u8) {
            self.status |= bits;
            self.inject = match self.inject {
                Some((0, inject)) => {
                    self.status |= inject;
                    None
                }
                Some((n, inject)) => Some((n - 1, inject)),
                None => None,
            };
            self.busy = self.busy_polls;
            self.mode = Mode::ReadStatus;
            self.pending = Pending::Nothing;
        }

        fn block_cmds(&self, cmd: u8) -> Vec<u32> {
            self.ops.iter().filter_map(|op| match op {
                Op::Cmd(addr, c) if *c == cmd => Some(*addr),
                _ => None,
            }).collect()
        }

        fn writes(&self) -> Vec<(u32, u32)> {
            self.ops.iter().filter_map(|op| match op {
                Op::Write(addr, data) => Some((*addr, *data)),
                _ => None,
            }).collect()
        }
    }

    impl FlashAccess for SimFlash {
        fn write_command(&mut self, addr: u32, cmd: u8) -> AnyhowResult<()> {
            self.ops.push(Op::Cmd(addr, cmd));
            let index = self.block_index(addr << self.shift);
            match (self.pending, cmd) {
                (Pending::Erase, 0xD0) => {
                    if self.locked[index] {
                        self.complete(0x22);
                    } else {
                        let start = index * self.block_size as usize;
                        let end = start + self.block_size as usize;
                        self.memory[start..end].iter_mut().for_each(|b| *b = 0xFF);
                        self.complete(0);
                    }
                }
                (Pending::Lock, 0x01) => {
                    self.locked[index] = true;
                    self.complete(0);
                }
                (Pending::Lock, 0xD0) => {
                    self.locked[index] = false;
                    self.complete(0);
                }
                (Pending::Erase, _) | (Pending::Lock, _) | (Pending::Program, _) => {
                    self.complete(0x30);
                }
                (Pending::Nothing, 0x20) => {
                    self.pending = Pending::Erase;
                    self.mode = Mode::ReadStatus;
                }
                (Pending::Nothing, 0x40) => {
                    self.pending = Pending::Program;
                    self.mode = Mode::ReadStatus;
                }
                (Pending::Nothing, 0x60) => {
                    self.pending = Pending::Lock;
                    self.mode = Mode::ReadStatus;
                }
                (Pending::Nothing, 0x50) => self.status = 0,
                (Pending::Nothing, 0x70) => self.mode = Mode::ReadStatus,
                (Pending::Nothing, 0xFF) => self.mode = Mode::ReadArray,
                (Pending::Nothing, _) => self.complete(0x30),
            }
            Ok(())
        }

        fn write(&mut self, addr: u32, data: u32) -> AnyhowResult<()> {
            self.ops.push(Op::Write(addr, data));
            if self.pending != Pending::Program {
                self.complete(0x30);
                return Ok(());
            }
            let index = self.block_index(addr);
            if self.locked[index] {
                self.complete(0x12);
            } else {
                let bytes = data.to_le_bytes();
                for i in 0..self.bus_bytes as usize {
                    self.memory[addr as usize + i] &= bytes[i];
                }
                self.complete(0);
            }
            Ok(())
        }

        fn read(&mut self, addr: u32) -> AnyhowResult<u32> {
            self.ops.push(Op::Read(addr));
            match self.mode {
                Mode::ReadStatus if self.stuck => Ok(self.status as u32),
                Mode::ReadStatus if self.busy > 0 => {
                    self.busy -= 1;
                    Ok(self.status as u32)
                }
                Mode::ReadStatus => Ok((self.status | 0x80) as u32),
                Mode::ReadArray => {
                    let mut bytes = [0u8; 4];
                    let start = addr as usize;
                    let n = self.bus_bytes as usize;
                    bytes[..n].copy_from_slice(&self.memory[start..start + n]);
                    Ok(u32::from_le_bytes(bytes))
                }
            }
        }

        fn sleep(&mut self, _dur: Duration) {
            self.ops.push(Op::Sleep);
        }
    }

    /// One region of four 64kB blocks on a 16-bit bus: step 2, shift 1.
    fn x16_params() -> DeviceParams {
        let geometry = Geometry::uniform(4, 0x10000).unwrap();
        DeviceParams::new(geometry, BusLayout::new(PartWidth::X16, 1), 2, 1).unwrap()
    }

    fn x16_sim() -> SimFlash {
        SimFlash::new(4, 0x10000, 2)
    }

    #[test]
    fn test_erase_block_sequence() {
        let params = x16_params().with_unlock_before_erase(false);
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        flash.erase_block(BlockAddr(2)).unwrap();
        assert_eq!(sim.ops, vec![
            Op::Cmd(2, 0x20),
            Op::Cmd(2, 0xD0),
            Op::Sleep,
            Op::Read(4),
            Op::Read(4),
            Op::Cmd(2, 0x70),
            Op::Read(4),
            Op::Cmd(0, 0x50),
            Op::Cmd(2, 0xFF),
            Op::Sleep,
        ]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_erase_block_unlocks_first() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.locked[1] = true;
        sim.memory[0x10000] = 0x00;
        let mut flash = Flash::new(&mut sim, &params);
        flash.erase_block(BlockAddr(0x8000)).unwrap();
        assert_eq!(&sim.ops[..2], &[Op::Cmd(0x8000, 0x60), Op::Cmd(0x8000, 0xD0)]);
        assert_eq!(sim.block_cmds(0x20), vec![0x8000]);
        assert!(!sim.locked[1]);
        assert_eq!(sim.memory[0x10000], 0xFF);
    }

    #[test]
    fn test_erase_locked_block() {
        let params = x16_params().with_unlock_before_erase(false);
        let mut sim = x16_sim();
        sim.locked[0] = true;
        sim.memory[0] = 0x00;
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.erase_block(BlockAddr(0));
        assert!(matches!(result, Err(Error::EraseError)));
        assert_eq!(flash.status(BlockAddr(0)).unwrap(), DeviceStatus::Ready);
        assert_eq!(sim.memory[0], 0x00);
        assert_eq!(sim.ops.last(), Some(&Op::Read(0)));
    }

    #[test]
    fn test_erase_unlock_failure_aborts() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((0, 0x20));
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.erase_block(BlockAddr(0));
        assert!(matches!(result, Err(Error::EraseError)));
        assert!(sim.block_cmds(0x20).is_empty());
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_erase_device() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.memory.iter_mut().for_each(|b| *b = 0);
        let mut flash = Flash::new(&mut sim, &params);
        let progress = std::cell::RefCell::new(Vec::new());
        flash.erase_device_cb(|n| progress.borrow_mut().push(n)).unwrap();
        assert_eq!(progress.into_inner(), vec![0, 0x10000, 0x20000, 0x30000, 0x40000]);
        assert!(sim.memory.iter().all(|b| *b == 0xFF));
        assert_eq!(sim.block_cmds(0x20), params.block_addrs().map(|b| b.0).collect::<Vec<_>>());
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_erase_device_stops_at_first_failure() {
        let params = x16_params().with_unlock_before_erase(false);
        let mut sim = x16_sim();
        sim.locked[2] = true;
        let mut flash = Flash::new(&mut sim, &params);
        assert!(matches!(flash.erase_device(), Err(Error::EraseError)));
        assert_eq!(sim.block_cmds(0x20), vec![0, 0x8000, 0x10000]);
        assert_eq!(sim.block_cmds(0xFF), vec![0, 0x8000, 0x10000]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_erase_range() {
        let params = x16_params().with_unlock_before_erase(false);
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        flash.erase_range(0x1FFFF, 2).unwrap();
        assert_eq!(sim.block_cmds(0x20), vec![0x8000, 0x10000]);
        let mut flash = Flash::new(&mut sim, &params);
        assert!(matches!(flash.erase_range(0x3FFFF, 2),
                         Err(Error::InvalidAddress { address: 0x40000 })));
    }

    #[test]
    fn test_program_pads_final_word() {
        let params = x16_params();
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        let progress = std::cell::RefCell::new(Vec::new());
        flash.program_cb(0x100, &[1, 2, 3, 4, 5], |n| progress.borrow_mut().push(n)).unwrap();
        assert_eq!(progress.into_inner(), vec![0, 2, 4, 5]);
        assert_eq!(sim.writes(), vec![(0x100, 0x0201), (0x102, 0x0403), (0x104, 0xFF05)]);
        assert_eq!(sim.block_cmds(0x40), vec![0x80, 0x81, 0x82]);
        assert_eq!(&sim.memory[0x100..0x106], &[1, 2, 3, 4, 5, 0xFF]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_program_word_sequence() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.busy_polls = 0;
        let mut flash = Flash::new(&mut sim, &params);
        flash.program(0x20, &[0xAA, 0x55]).unwrap();
        assert_eq!(sim.ops, vec![
            Op::Cmd(0, 0x50),
            Op::Cmd(0x10, 0xFF),
            Op::Sleep,
            Op::Cmd(0x10, 0x40),
            Op::Write(0x20, 0x55AA),
            Op::Sleep,
            Op::Read(0x20),
            Op::Cmd(0x10, 0x70),
            Op::Read(0x20),
            Op::Cmd(0, 0x50),
            Op::Cmd(0x10, 0xFF),
            Op::Sleep,
        ]);
    }

    #[test]
    fn test_program_and_read_back() {
        let params = x16_params();
        let mut sim = x16_sim();
        let data: Vec<u8> = (0..100u8).collect();
        let mut flash = Flash::new(&mut sim, &params);
        flash.program(0x1000, &data).unwrap();
        flash.verify(0x1000, &data).unwrap();
        let mut buf = [0u8; 5];
        flash.read(0x1003, &mut buf).unwrap();
        assert_eq!(buf, [3, 4, 5, 6, 7]);
        let mut other = data.clone();
        other[70] = 0;
        let result = flash.verify(0x1000, &other);
        assert!(matches!(result, Err(Error::ReadbackError { address: 0x1046, wrote: 0, read: 70 })));
    }

    #[test]
    fn test_program_error_stops() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((1, 0x10));
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.program(0, &[0; 8]);
        assert!(matches!(result, Err(Error::ProgramError)));
        assert_eq!(sim.writes().len(), 2);
        assert_eq!(sim.block_cmds(0xFF), vec![0, 1]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_program_voltage_error_is_program_error() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((0, 0x08));
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.program(0, &[0; 2]);
        assert!(matches!(result, Err(Error::ProgramError)));
        assert_eq!(result.unwrap_err().code(), ResultCode::ProgramError);
    }

    #[test]
    fn test_program_locked_block() {
        let params = x16_params();
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        flash.lock_block(BlockAddr(0)).unwrap();
        assert!(matches!(flash.program(0x10, &[0; 4]), Err(Error::ProgramError)));
        assert_eq!(sim.memory[0x10], 0xFF);
    }

    #[test]
    fn test_program_checks_range() {
        let params = x16_params();
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        assert!(matches!(flash.program(1, &[0; 2]), Err(Error::InvalidAddress { address: 1 })));
        assert!(matches!(flash.program(0x3FFFE, &[0; 3]),
                         Err(Error::InvalidAddress { address: 0x40000 })));
        assert!(sim.ops.is_empty());
    }

    #[test]
    fn test_program_empty_resets_block() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.mode = Mode::ReadStatus;
        let mut flash = Flash::new(&mut sim, &params);
        flash.program(0x3FFFE, &[]).unwrap();
        assert_eq!(sim.ops, vec![Op::Cmd(0, 0x50), Op::Cmd(0x1FFFF, 0xFF), Op::Sleep]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_verify_past_end_of_address_space() {
        let geometry = Geometry::new(&[Region::new(0xFFFF_0000, 1, 0x10000)]).unwrap();
        let params = DeviceParams::for_layout(geometry, BusLayout::new(PartWidth::X8, 1)).unwrap();
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        assert!(matches!(flash.verify(0xFFFF_FFC0, &[0xFF; 128]),
                         Err(Error::InvalidAddress { address: 0xFFFF_FFC0 })));
        assert!(sim.ops.is_empty());
    }

    #[test]
    fn test_program_suspend_is_voltage_error() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((0, 0x06));
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.program(0, &[0; 2]);
        assert!(matches!(result, Err(Error::VoltageError)));
        assert_eq!(result.unwrap_err().code(), ResultCode::VoltageError);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_lock_sequence() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.busy_polls = 0;
        let mut flash = Flash::new(&mut sim, &params);
        flash.lock_block(BlockAddr(0x18000)).unwrap();
        assert_eq!(sim.ops, vec![
            Op::Cmd(0x18000, 0x60),
            Op::Cmd(0x18000, 0x01),
            Op::Sleep,
            Op::Read(0x30000),
            Op::Sleep,
            Op::Cmd(0x18000, 0x70),
            Op::Read(0x30000),
            Op::Cmd(0, 0x50),
            Op::Cmd(0x18000, 0xFF),
            Op::Sleep,
        ]);
        assert!(sim.locked[3]);
        let mut flash = Flash::new(&mut sim, &params);
        flash.unlock_block(BlockAddr(0x18000)).unwrap();
        assert!(!sim.locked[3]);
        assert_eq!(sim.block_cmds(0xD0), vec![0x18000]);
    }

    #[test]
    fn test_lock_range() {
        let params = x16_params();
        let mut sim = x16_sim();
        let mut flash = Flash::new(&mut sim, &params);
        flash.lock_range(0x10000, 0x20000).unwrap();
        assert_eq!(sim.locked, vec![false, true, true, false]);
        let mut flash = Flash::new(&mut sim, &params);
        flash.unlock_range(0, 0x40000).unwrap();
        assert_eq!(sim.locked, vec![false; 4]);
    }

    #[test]
    fn test_lock_error() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((0, 0x02));
        let mut flash = Flash::new(&mut sim, &params);
        assert!(matches!(flash.lock_block(BlockAddr(0)), Err(Error::LockError)));
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_sequence_error() {
        let params = x16_params().with_unlock_before_erase(false);
        let mut sim = x16_sim();
        sim.inject = Some((0, 0x30));
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.erase_block(BlockAddr(0));
        assert!(matches!(result, Err(Error::SequenceError)));
        assert_eq!(result.unwrap_err().code(), ResultCode::SequenceError);
    }

    #[test]
    fn test_poll_limit_timeout() {
        let params = x16_params()
            .with_unlock_before_erase(false)
            .with_poll_limit(PollLimit::Max(5));
        let mut sim = x16_sim();
        sim.stuck = true;
        let mut flash = Flash::new(&mut sim, &params);
        let result = flash.erase_block(BlockAddr(0x8000));
        assert!(matches!(result, Err(Error::Timeout { address: 0x10000 })));
        let reads = sim.ops.iter().filter(|op| **op == Op::Read(0x10000)).count();
        assert_eq!(reads, 5);
        assert_eq!(&sim.ops[sim.ops.len() - 3..],
                   &[Op::Cmd(0, 0x50), Op::Cmd(0x8000, 0xFF), Op::Sleep]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_reset_device() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.mode = Mode::ReadStatus;
        let mut flash = Flash::new(&mut sim, &params);
        flash.reset_device().unwrap();
        assert_eq!(sim.block_cmds(0xFF), vec![0, 0x8000, 0x10000, 0x18000]);
        assert_eq!(sim.block_cmds(0x50), vec![0; 4]);
        assert_eq!(sim.mode, Mode::ReadArray);
    }

    #[test]
    fn test_ready_after_every_operation() {
        let params = x16_params();
        let mut sim = x16_sim();
        sim.inject = Some((3, 0x20));
        let mut flash = Flash::new(&mut sim, &params);
        let results = [
            flash.lock_block(BlockAddr(0)),
            flash.unlock_block(BlockAddr(0)),
            flash.program(0, &[0x12, 0x34]),
            flash.erase_block(BlockAddr(0)),
        ];
        assert!(results[..3].iter().all(|r| r.is_ok()));
        assert!(matches!(results[3], Err(Error::EraseError)));
        assert_eq!(flash.status(BlockAddr(0)).unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::EraseError.code(), ResultCode::EraseError);
        assert_eq!(Error::LockError.code(), ResultCode::LockError);
        assert_eq!(u8::from(Error::VoltageError.code()), 12);
        assert_eq!(Error::Timeout { address: 0 }.code(), ResultCode::Timeout);
        assert_eq!(Error::Access(anyhow::anyhow!("bus fault")).code(), ResultCode::Access);
        assert_eq!(u8::from(Error::ProgramError.code()), 10);
    }

    #[test]
    fn test_pack_word() {
        assert_eq!(pack_word(&[0x12], 1), 0x12);
        assert_eq!(pack_word(&[0x12], 2), 0xFF12);
        assert_eq!(pack_word(&[0x12, 0x34, 0x56], 4), 0xFF56_3412);
        assert_eq!(pack_word(&[], 4), 0xFFFF_FFFF);
    }
}
