//! RAM-backed simulated NAND device for driver tests.
//!
//! Programming uses AND semantics (bits can only be cleared), erase fills
//! the block with 0xFF. Faults can be injected per block: program or erase
//! failures, timebombs that trip after a number of operations, factory
//! bad-block marks and single-bit corruption. A power-cut mode tears the
//! N-th state-changing operation and fails everything after it, so mount
//! recovery can be exercised at every call boundary.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    BadBlockMarking, DeviceInfo, EccInfo, ErrorType, NandPhy, PageIndex, PhyError, PhyErrorKind,
};

/// Geometry of the simulated device.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub bytes_per_page_log2: u8,
    pub bytes_per_spare_area: u16,
    pub pages_per_block_log2: u8,
    pub num_blocks: u32,
    pub bad_block_marking: BadBlockMarking,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            bytes_per_page_log2: 11, // 2048 byte pages
            bytes_per_spare_area: 64,
            pages_per_block_log2: 6, // 64 pages per block
            num_blocks: 256,
            bad_block_marking: BadBlockMarking::FirstPage,
        }
    }
}

/// Operation counters, for assertions on driver behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub reads: u32,
    pub writes: u32,
    pub erases: u32,
    pub write_fails: u32,
    pub erase_fails: u32,
    pub copies: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockFlags {
    fail_write: bool,
    fail_erase: bool,
    fail_read: bool,
    // Number of operations until the block fails permanently. 0 = no bomb.
    timebomb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimError {
    #[error("simulated read failure")]
    ReadFailed,
    #[error("simulated program failure")]
    WriteFailed,
    #[error("simulated erase failure")]
    EraseFailed,
    #[error("request out of bounds")]
    OutOfBounds,
    #[error("simulated power loss")]
    PowerDown,
}

impl PhyError for SimError {
    fn kind(&self) -> PhyErrorKind {
        match self {
            SimError::ReadFailed => PhyErrorKind::Read,
            SimError::WriteFailed | SimError::PowerDown => PhyErrorKind::Write,
            SimError::EraseFailed => PhyErrorKind::Erase,
            SimError::OutOfBounds => PhyErrorKind::OutOfBounds,
        }
    }
}

pub struct SimNand {
    cfg: SimConfig,
    main: Vec<u8>,
    spare: Vec<u8>,
    flags: Vec<BlockFlags>,
    erase_counts: Vec<u32>,
    stats: SimStats,
    // Remaining state-changing operations before the power is cut.
    // None = no cut armed.
    powercut: Option<u32>,
    power_is_down: bool,
}

impl SimNand {
    pub fn new(cfg: SimConfig) -> Self {
        let num_pages = (cfg.num_blocks << cfg.pages_per_block_log2) as usize;
        let page_size = 1usize << cfg.bytes_per_page_log2;
        SimNand {
            cfg,
            main: vec![0xFF; num_pages * page_size],
            spare: vec![0xFF; num_pages * cfg.bytes_per_spare_area as usize],
            flags: vec![BlockFlags::default(); cfg.num_blocks as usize],
            erase_counts: vec![0; cfg.num_blocks as usize],
            stats: SimStats::default(),
            powercut: None,
            power_is_down: false,
        }
    }

    fn page_size(&self) -> usize {
        1 << self.cfg.bytes_per_page_log2
    }

    fn spare_size(&self) -> usize {
        self.cfg.bytes_per_spare_area as usize
    }

    fn num_pages(&self) -> u32 {
        self.cfg.num_blocks << self.cfg.pages_per_block_log2
    }

    fn main_range(&self, page: PageIndex, offset: u32, len: usize) -> Result<usize, SimError> {
        if page.as_u32() >= self.num_pages() || offset as usize + len > self.page_size() {
            return Err(SimError::OutOfBounds);
        }
        Ok(page.as_u32() as usize * self.page_size() + offset as usize)
    }

    fn spare_range(&self, page: PageIndex, offset: u32, len: usize) -> Result<usize, SimError> {
        if page.as_u32() >= self.num_pages() || offset as usize + len > self.spare_size() {
            return Err(SimError::OutOfBounds);
        }
        Ok(page.as_u32() as usize * self.spare_size() + offset as usize)
    }

    fn block_of(&self, page: PageIndex) -> usize {
        (page.as_u32() >> self.cfg.pages_per_block_log2) as usize
    }

    fn timebomb_tick(&mut self, block: usize) {
        if self.flags[block].timebomb > 0 {
            self.flags[block].timebomb -= 1;
            if self.flags[block].timebomb == 0 {
                self.flags[block].fail_write = true;
                self.flags[block].fail_erase = true;
            }
        }
    }

    /// Returns Ok(true) if the operation must tear (apply partially and
    /// report failure), Err if the power is already down.
    fn powercut_tick(&mut self) -> Result<bool, SimError> {
        if self.power_is_down {
            return Err(SimError::PowerDown);
        }
        if let Some(remaining) = self.powercut.as_mut() {
            if *remaining == 0 {
                self.power_is_down = true;
                return Ok(true);
            }
            *remaining -= 1;
        }
        Ok(false)
    }

    fn program(&mut self, base: usize, data: &[u8], into_spare: bool, torn: bool) {
        let n = if torn { data.len() / 2 } else { data.len() };
        let dst = if into_spare {
            &mut self.spare[base..base + n]
        } else {
            &mut self.main[base..base + n]
        };
        for (d, s) in dst.iter_mut().zip(data[..n].iter()) {
            *d &= *s;
        }
    }

    // ---- fault injection and inspection, used by tests ----

    /// Tear all state-changing operations after the next `n`.
    pub fn powercut_after(&mut self, n: u32) {
        self.powercut = Some(n);
        self.power_is_down = false;
    }

    /// Power the device back up, disarming a pending cut.
    pub fn power_restore(&mut self) {
        self.powercut = None;
        self.power_is_down = false;
    }

    /// Whether an armed power cut has fired.
    pub fn power_was_cut(&self) -> bool {
        self.power_is_down
    }

    pub fn set_fail_write(&mut self, block: u32, on: bool) {
        self.flags[block as usize].fail_write = on;
    }

    pub fn set_fail_erase(&mut self, block: u32, on: bool) {
        self.flags[block as usize].fail_erase = on;
    }

    pub fn set_fail_read(&mut self, block: u32, on: bool) {
        self.flags[block as usize].fail_read = on;
    }

    /// Fail the block permanently after `ttl` more program/erase operations.
    pub fn set_timebomb(&mut self, block: u32, ttl: u32) {
        self.flags[block as usize].timebomb = ttl;
    }

    /// Write the factory bad-block marker of `block`, per the configured
    /// marking convention.
    pub fn mark_factory_bad(&mut self, block: u32) {
        let ppb = 1u32 << self.cfg.pages_per_block_log2;
        let first = block << self.cfg.pages_per_block_log2;
        let (f, s, l) = self.cfg.bad_block_marking.marker_pages();
        let mut pages: Vec<u32> = Vec::new();
        if f {
            pages.push(first);
        }
        if s {
            pages.push(first + 1);
        }
        if l {
            pages.push(first + ppb - 1);
        }
        for p in pages {
            let base = p as usize * self.spare_size();
            self.spare[base] = 0x00;
            if self.cfg.bad_block_marking.has_duplicate_marker() {
                self.spare[base + 1] = 0x00;
            }
        }
    }

    /// Flip one bit in the main area of `page`.
    pub fn flip_main_bit(&mut self, page: u32, byte: usize, bit: u8) {
        let base = page as usize * self.page_size();
        self.main[base + byte] ^= 1 << bit;
    }

    /// Flip one bit in the spare area of `page`.
    pub fn flip_spare_bit(&mut self, page: u32, byte: usize, bit: u8) {
        let base = page as usize * self.spare_size();
        self.spare[base + byte] ^= 1 << bit;
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SimStats::default();
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.erase_counts[block as usize]
    }

    pub fn raw_spare(&self, page: u32) -> &[u8] {
        let base = page as usize * self.spare_size();
        &self.spare[base..base + self.spare_size()]
    }
}

impl ErrorType for SimNand {
    type Error = SimError;
}

impl NandPhy for SimNand {
    fn init(&mut self) -> Result<DeviceInfo, Self::Error> {
        Ok(DeviceInfo {
            bytes_per_page_log2: self.cfg.bytes_per_page_log2,
            bytes_per_spare_area: self.cfg.bytes_per_spare_area,
            pages_per_block_log2: self.cfg.pages_per_block_log2,
            num_blocks: self.cfg.num_blocks,
            data_bus_width: 8,
            bad_block_marking: self.cfg.bad_block_marking,
            ecc: EccInfo {
                bits_correctable: 0,
                bytes_per_block_log2: 9,
                has_hw_ecc: false,
            },
            planes_log2: 0,
        })
    }

    fn read(&mut self, page: PageIndex, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.read_ex(page, Some(buf), offset, None, 0)
    }

    fn read_ex(
        &mut self,
        page: PageIndex,
        main: Option<&mut [u8]>,
        main_offset: u32,
        spare: Option<&mut [u8]>,
        spare_offset: u32,
    ) -> Result<(), Self::Error> {
        if self.power_is_down {
            return Err(SimError::PowerDown);
        }
        let block = self.block_of(page);
        if self.flags[block].fail_read {
            return Err(SimError::ReadFailed);
        }
        self.stats.reads += 1;
        if let Some(buf) = main {
            let base = self.main_range(page, main_offset, buf.len())?;
            buf.copy_from_slice(&self.main[base..base + buf.len()]);
        }
        if let Some(buf) = spare {
            let base = self.spare_range(page, spare_offset, buf.len())?;
            buf.copy_from_slice(&self.spare[base..base + buf.len()]);
        }
        Ok(())
    }

    fn write(&mut self, page: PageIndex, offset: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.write_ex(page, Some(buf), offset, None, 0)
    }

    fn write_ex(
        &mut self,
        page: PageIndex,
        main: Option<&[u8]>,
        main_offset: u32,
        spare: Option<&[u8]>,
        spare_offset: u32,
    ) -> Result<(), Self::Error> {
        // Validate before mutating anything.
        let main_base = match main {
            Some(buf) => Some(self.main_range(page, main_offset, buf.len())?),
            None => None,
        };
        let spare_base = match spare {
            Some(buf) => Some(self.spare_range(page, spare_offset, buf.len())?),
            None => None,
        };
        let torn = self.powercut_tick()?;
        let block = self.block_of(page);
        self.timebomb_tick(block);
        self.stats.writes += 1;
        if !torn && self.flags[block].fail_write {
            self.stats.write_fails += 1;
            // A failed program leaves the page in an undefined state.
            if let (Some(base), Some(buf)) = (main_base, main) {
                self.program(base, buf, false, true);
            }
            return Err(SimError::WriteFailed);
        }
        if let (Some(base), Some(buf)) = (main_base, main) {
            self.program(base, buf, false, torn);
        }
        if let (Some(base), Some(buf)) = (spare_base, spare) {
            self.program(base, buf, true, torn);
        }
        if torn {
            return Err(SimError::PowerDown);
        }
        Ok(())
    }

    fn erase_block(&mut self, first_page: PageIndex) -> Result<(), Self::Error> {
        if first_page.as_u32() >= self.num_pages() {
            return Err(SimError::OutOfBounds);
        }
        let torn = self.powercut_tick()?;
        let block = self.block_of(first_page);
        self.timebomb_tick(block);
        self.stats.erases += 1;
        let ppb = 1usize << self.cfg.pages_per_block_log2;
        let fail = !torn && self.flags[block].fail_erase;
        // A torn or failed erase clears only part of the block.
        let pages_done = if torn || fail { ppb / 2 } else { ppb };
        let first = first_page.as_u32() as usize & !(ppb - 1);
        let page_size = self.page_size();
        let spare_size = self.spare_size();
        for p in first..first + pages_done {
            let mb = p * page_size;
            self.main[mb..mb + page_size].fill(0xFF);
            let sb = p * spare_size;
            self.spare[sb..sb + spare_size].fill(0xFF);
        }
        if fail {
            self.stats.erase_fails += 1;
            return Err(SimError::EraseFailed);
        }
        if torn {
            return Err(SimError::PowerDown);
        }
        self.erase_counts[block] += 1;
        Ok(())
    }

    fn copy_page(&mut self, src: PageIndex, dst: PageIndex) -> Result<bool, Self::Error> {
        let ps = self.page_size();
        let ss = self.spare_size();
        let src_main = self.main_range(src, 0, ps)?;
        let dst_main = self.main_range(dst, 0, ps)?;
        let torn = self.powercut_tick()?;
        let block = self.block_of(dst);
        if torn || self.flags[block].fail_write {
            if !torn {
                self.stats.write_fails += 1;
                return Err(SimError::WriteFailed);
            }
            return Err(SimError::PowerDown);
        }
        self.stats.copies += 1;
        self.main.copy_within(src_main..src_main + ps, dst_main);
        let src_spare = src.as_u32() as usize * ss;
        let dst_spare = dst.as_u32() as usize * ss;
        self.spare.copy_within(src_spare..src_spare + ss, dst_spare);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimNand {
        SimNand::new(SimConfig {
            bytes_per_page_log2: 9,
            bytes_per_spare_area: 16,
            pages_per_block_log2: 2,
            num_blocks: 8,
            bad_block_marking: BadBlockMarking::FirstPage,
        })
    }

    #[test]
    fn program_uses_and_semantics() {
        let mut nand = small();
        nand.write(PageIndex::new(0), 0, &[0xF0, 0x0F]).unwrap();
        nand.write(PageIndex::new(0), 0, &[0xCC, 0xCC]).unwrap();
        let mut buf = [0u8; 2];
        nand.read(PageIndex::new(0), 0, &mut buf).unwrap();
        assert_eq!(buf, [0xC0, 0x0C]);
    }

    #[test]
    fn erase_restores_ff() {
        let mut nand = small();
        nand.write(PageIndex::new(5), 0, &[0x00; 16]).unwrap();
        nand.erase_block(PageIndex::new(4)).unwrap();
        let mut buf = [0u8; 16];
        nand.read(PageIndex::new(5), 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
        assert_eq!(nand.erase_count(1), 1);
    }

    #[test]
    fn powercut_tears_then_fails() {
        let mut nand = small();
        nand.powercut_after(1);
        nand.write(PageIndex::new(0), 0, &[0x00; 8]).unwrap();
        // Second mutating call tears: only half the bytes land.
        assert_eq!(
            nand.write(PageIndex::new(1), 0, &[0x00; 8]),
            Err(SimError::PowerDown)
        );
        assert_eq!(
            nand.write(PageIndex::new(2), 0, &[0x00; 8]),
            Err(SimError::PowerDown)
        );
        nand.power_restore();
        let mut buf = [0u8; 8];
        nand.read(PageIndex::new(1), 0, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x00; 4]);
        assert_eq!(&buf[4..], &[0xFF; 4]);
    }

    #[test]
    fn factory_mark_lands_in_spare() {
        let mut nand = small();
        nand.mark_factory_bad(3);
        assert_eq!(nand.raw_spare(12)[0], 0x00);
        assert_eq!(nand.raw_spare(13)[0], 0xFF);
    }
}
