//! Log-structured NAND translation layer.
//!
//! Turns a raw NAND device (erase-before-write, page-granular programming,
//! factory defects, bit rot) into a flat array of fixed-size logical
//! sectors with wear leveling, bad-block management, ECC protection and
//! power-fail-safe updates.
//!
//! Writes are staged in append-only *work blocks*, one per logical block,
//! and merged into committed *data blocks* when a work block fills up or
//! its descriptor is recycled. All metadata lives in the spare areas of the
//! medium itself; mounting rebuilds the logical-to-physical map, the free
//! bitmap and the work-block state by scanning the block-info pages.
//!
//! The caller serializes access; no entry point is reentrant.

#![no_std]
// Must be first to share macros across crate
pub(crate) mod fmt;

extern crate alloc;

mod alloc_blocks;
mod bitfield;
mod config;
mod convert;
mod ecc;
mod error;
mod mount;
mod phy;
mod pool;
mod readonly;
mod spare;
mod stats;
mod work;

pub use config::Config;
pub use ecc::{EccEngine, EccOutcome, Hamming};
pub use error::Error;
pub use readonly::ReadOnlySectorMap;
pub use spare::SectorStat;
pub use stats::Stats;

use alloc::boxed::Box;
use alloc::vec::Vec;

use nand_phy::NandPhy;

use bitfield::{BitMap, PackedArray};
use phy::PhyIo;

/// Sentinel for "no physical block assigned"; virtual block 0 is reserved
/// for the format-info and error-info pages and never maps a logical block.
pub(crate) const PBI_NONE: u32 = 0;

/// State of one logical sector as reported by
/// [SectorMap::get_sector_usage].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SectorUsage {
    /// The sector holds data.
    Written,
    /// The sector was never written or has been trimmed.
    Empty,
    /// The state could not be determined.
    Unknown,
}

/// Device counts and health telemetry.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiskInfo {
    pub num_sectors: u32,
    pub bytes_per_sector: u32,
    pub num_bad_blocks: u32,
    pub num_free_blocks: u32,
    pub num_work_blocks: u32,
    pub erase_cnt_min: u32,
    pub erase_cnt_max: u32,
    pub is_write_protected: bool,
    pub has_fatal_error: bool,
}

/// RAID-style recovery hook for sectors whose page can no longer be read.
///
/// `recover` fills `buf` with the reconstructed sector contents and returns
/// whether it succeeded. On success the driver relocates the damaged block
/// and the read completes normally.
pub trait ReadErrorCallback {
    fn recover(&mut self, sector_index: u32, buf: &mut [u8]) -> bool;
}

/// Append-only staging block for updates to one logical block.
pub(crate) struct WorkBlock {
    pub pbi: u32,
    pub lbi: u32,
    pub erase_cnt: u32,
    /// Next free page position, 1..=pages_per_block.
    pub brsi_free: u32,
    /// Block count the merged data block will carry.
    pub block_cnt: u8,
    /// Merge count of the source data block at allocation time.
    pub merge_cnt: u8,
    /// Maps logical BRSI -> page position inside this block; 0 = none.
    pub assign: PackedArray,
}

/// Cached "last written sector" of recently produced data blocks, keyed by
/// physical block. Lets merges and reads skip the blank tail of a block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataCacheEntry {
    pub pbi: u32,
    pub brsi_last: u32,
}

pub struct SectorMap<P: NandPhy> {
    pub(crate) io: PhyIo<P>,
    pub(crate) cfg: Config,
    /// Effective count: max(configured, value recorded at format time).
    pub(crate) num_work_blocks: u32,
    pub(crate) num_logical_blocks: u32,
    pub(crate) l2p: PackedArray,
    /// 1 = free. Bad and allocated blocks are 0.
    pub(crate) free_map: BitMap,
    pub(crate) bad_map: BitMap,
    /// First usable virtual block; carries the format-info and error-info
    /// pages. Leading factory-bad blocks push it up.
    pub(crate) pbi0: u32,
    pub(crate) work: Vec<WorkBlock>,
    /// Indices into `work`, most recently used first.
    pub(crate) work_in_use: Vec<u16>,
    pub(crate) work_free: Vec<u16>,
    pub(crate) data_cache: Vec<DataCacheEntry>,
    pub(crate) mru_free_block: u32,
    pub(crate) erase_cnt_min: u32,
    pub(crate) erase_cnt_max: u32,
    pub(crate) num_blocks_erase_cnt_min: u32,
    pub(crate) num_bad_blocks: u32,
    pub(crate) wl_suspended: bool,
    pub(crate) mounted: bool,
    pub(crate) write_protected: bool,
    pub(crate) fatal: Option<(Error, u32)>,
    pub(crate) read_error_cb: Option<Box<dyn ReadErrorCallback>>,
    /// Page buffer for merge and relocation copies, separate from the
    /// adapter's scratch page.
    pub(crate) copy_buf: Vec<u8>,
}

impl<P: NandPhy> SectorMap<P> {
    /// Initialize the physical layer and build an unmounted device.
    ///
    /// Call [Self::low_level_mount] (or [Self::low_level_format] first on a
    /// blank medium) before any sector access.
    pub fn new(mut phy: P, cfg: Config) -> Result<Self, Error> {
        let cfg = cfg.normalized();
        let info = phy
            .init()
            .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
        let io = PhyIo::new(phy, info, &cfg)?;
        info!(
            "device: {} blocks of {} pages, {} byte pages",
            io.geo.num_vblocks, io.geo.vppb, io.geo.bytes_per_page
        );
        Ok(SectorMap {
            io,
            cfg,
            num_work_blocks: 0,
            num_logical_blocks: 0,
            l2p: PackedArray::new(1, 0),
            free_map: BitMap::new(0),
            bad_map: BitMap::new(0),
            pbi0: 0,
            work: Vec::new(),
            work_in_use: Vec::new(),
            work_free: Vec::new(),
            data_cache: Vec::new(),
            mru_free_block: 0,
            erase_cnt_min: 0,
            erase_cnt_max: 0,
            num_blocks_erase_cnt_min: 0,
            num_bad_blocks: 0,
            wl_suspended: false,
            mounted: false,
            write_protected: false,
            fatal: None,
            read_error_cb: None,
            copy_buf: Vec::new(),
        })
    }

    /// Release the device and hand the physical layer back.
    pub fn into_phy(self) -> P {
        self.io.into_phy()
    }

    /// Direct access to the physical layer, for diagnostics and tests.
    pub fn phy_mut(&mut self) -> &mut P {
        self.io.phy_mut()
    }

    // ---- geometry helpers ----

    pub(crate) fn sectors_per_block(&self) -> u32 {
        self.io.geo.vppb - 1
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.io.geo.bytes_per_page as u32
    }

    pub fn sector_count(&self) -> u32 {
        self.num_logical_blocks * self.sectors_per_block()
    }

    /// Fill pattern of sectors that were never written or were trimmed.
    pub(crate) fn fill_byte(&self) -> u8 {
        if self.cfg.allow_blank_unused_sectors {
            0xFF
        } else {
            0x00
        }
    }

    fn split_sector(&self, sector: u32) -> (u32, u32) {
        let spb = self.sectors_per_block();
        (sector / spb, sector % spb + 1)
    }

    pub(crate) fn sector_index(&self, lbi: u32, brsi: u32) -> u32 {
        lbi * self.sectors_per_block() + brsi - 1
    }

    // ---- status ----

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn stats(&self) -> Stats {
        self.io.stats
    }

    pub fn stats_reset(&mut self) {
        self.io.stats = Stats::default();
    }

    pub fn disk_info(&self) -> DiskInfo {
        DiskInfo {
            num_sectors: self.sector_count(),
            bytes_per_sector: self.bytes_per_sector(),
            num_bad_blocks: self.num_bad_blocks,
            num_free_blocks: self.free_map.count(),
            num_work_blocks: self.num_work_blocks,
            erase_cnt_min: self.erase_cnt_min,
            erase_cnt_max: self.erase_cnt_max,
            is_write_protected: self.write_protected,
            has_fatal_error: self.fatal.is_some(),
        }
    }

    // ---- runtime tunables ----

    pub fn set_max_erase_cnt_diff(&mut self, diff: u32) {
        self.cfg.max_erase_cnt_diff = diff;
    }

    pub fn set_max_bit_error_cnt(&mut self, cnt: u8) {
        self.cfg.max_bit_error_cnt = cnt;
    }

    pub fn set_read_error_callback(&mut self, cb: Box<dyn ReadErrorCallback>) {
        self.read_error_cb = Some(cb);
    }

    // ---- sector interface ----

    /// Read `count` sectors starting at `first_sector` into `buf`.
    pub fn read_sectors(
        &mut self,
        first_sector: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.check_mounted()?;
        self.check_range(first_sector, count)?;
        let bps = self.bytes_per_sector() as usize;
        if buf.len() != count as usize * bps {
            return Err(Error::InvalidParameter);
        }
        for (i, chunk) in buf.chunks_exact_mut(bps).enumerate() {
            let (lbi, brsi) = self.split_sector(first_sector + i as u32);
            self.read_one_sector(lbi, brsi, chunk)?;
        }
        Ok(())
    }

    /// Write `count` sectors starting at `first_sector`.
    ///
    /// With `repeat_same`, `buf` holds a single sector that is written
    /// `count` times; otherwise it holds `count` sectors.
    pub fn write_sectors(
        &mut self,
        first_sector: u32,
        count: u32,
        buf: &[u8],
        repeat_same: bool,
    ) -> Result<(), Error> {
        self.check_writable()?;
        self.check_range(first_sector, count)?;
        let bps = self.bytes_per_sector() as usize;
        let expected = if repeat_same {
            bps
        } else {
            count as usize * bps
        };
        if buf.len() != expected {
            return Err(Error::InvalidParameter);
        }
        for i in 0..count {
            let data = if repeat_same {
                buf
            } else {
                &buf[i as usize * bps..(i as usize + 1) * bps]
            };
            let (lbi, brsi) = self.split_sector(first_sector + i);
            self.write_log_sector(lbi, brsi, Some(data))?;
        }
        Ok(())
    }

    /// Invalidate (trim) `count` sectors starting at `first_sector`. The
    /// sectors read back as the fill pattern afterwards.
    pub fn free_sectors(&mut self, first_sector: u32, count: u32) -> Result<(), Error> {
        self.check_writable()?;
        self.check_range(first_sector, count)?;
        for i in 0..count {
            let (lbi, brsi) = self.split_sector(first_sector + i);
            if self.sector_usage(lbi, brsi) == SectorUsage::Written {
                self.write_log_sector(lbi, brsi, None)?;
            }
        }
        Ok(())
    }

    /// State of one logical sector.
    pub fn get_sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        self.check_mounted()?;
        self.check_range(sector, 1)?;
        let (lbi, brsi) = self.split_sector(sector);
        Ok(self.sector_usage(lbi, brsi))
    }

    /// Invalidate the in-RAM state. Work blocks stay on the medium and are
    /// recovered by the next mount.
    pub fn unmount(&mut self) {
        self.mounted = false;
    }

    pub(crate) fn check_mounted(&self) -> Result<(), Error> {
        if !self.mounted {
            return Err(Error::NotFormatted);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<(), Error> {
        self.check_mounted()?;
        if self.fatal.is_some() {
            return Err(Error::FatalError);
        }
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        Ok(())
    }

    fn check_range(&self, first: u32, count: u32) -> Result<(), Error> {
        if first.checked_add(count).map_or(true, |end| end > self.sector_count()) {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    // ---- read path ----

    /// Read one logical sector. Work-block entries take precedence over the
    /// committed data block; sectors with no backing page return the fill
    /// pattern.
    pub(crate) fn read_one_sector(
        &mut self,
        lbi: u32,
        brsi: u32,
        out: &mut [u8],
    ) -> Result<(), Error> {
        self.io.stats.read_sector_cnt += 1;

        if let Some(wbi) = self.find_work_block(lbi) {
            let pos = self.work[wbi].assign.get(brsi as usize);
            if pos != 0 {
                let pbi = self.work[wbi].pbi;
                return self.read_backed_sector(pbi, pos, lbi, brsi, true, out);
            }
        }

        let pbi = self.l2p.get(lbi as usize);
        if pbi == PBI_NONE {
            out.fill(self.fill_byte());
            return Ok(());
        }
        if let Some(brsi_last) = self.cache_lookup(pbi) {
            if brsi > brsi_last {
                out.fill(self.fill_byte());
                return Ok(());
            }
        }
        self.read_backed_sector(pbi, brsi, lbi, brsi, false, out)
    }

    /// Read the page backing a sector, with the graduated error response:
    /// corrected-over-threshold schedules a relocation, uncorrectable goes
    /// through the read-error callback, and an unrecovered page latches the
    /// fatal handler.
    fn read_backed_sector(
        &mut self,
        pbi: u32,
        pos: u32,
        lbi: u32,
        brsi: u32,
        in_work_block: bool,
        out: &mut [u8],
    ) -> Result<(), Error> {
        match self.io.read_page(pbi, pos, Some(out)) {
            Ok(meta) => {
                if meta.blank || meta.stat == SectorStat::Empty {
                    out.fill(self.fill_byte());
                } else if meta.corrected_bits > 0
                    && self.cfg.max_bit_error_cnt != 0
                    && meta.corrected_bits >= self.cfg.max_bit_error_cnt
                {
                    // Data is fine but the block is degrading; move it.
                    self.relocate_block(pbi, in_work_block);
                }
                Ok(())
            }
            Err(e @ (Error::UncorrectableBitErrors | Error::ReadError)) => {
                let sector = self.sector_index(lbi, brsi);
                if let Some(mut cb) = self.read_error_cb.take() {
                    let recovered = cb.recover(sector, out);
                    self.read_error_cb = Some(cb);
                    if recovered {
                        debug!("sector {} recovered via callback", sector);
                        self.relocate_with_patch(pbi, in_work_block, pos, brsi, out);
                        return Ok(());
                    }
                }
                self.enter_fatal(e, sector);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn sector_usage(&mut self, lbi: u32, brsi: u32) -> SectorUsage {
        if let Some(wbi) = self.find_work_block(lbi) {
            let pos = self.work[wbi].assign.get(brsi as usize);
            if pos != 0 {
                let pbi = self.work[wbi].pbi;
                return match self.io.read_page(pbi, pos, None) {
                    Ok(meta) if meta.stat == SectorStat::Written => SectorUsage::Written,
                    Ok(_) => SectorUsage::Empty,
                    Err(_) => SectorUsage::Unknown,
                };
            }
        }
        let pbi = self.l2p.get(lbi as usize);
        if pbi == PBI_NONE {
            return SectorUsage::Empty;
        }
        if let Some(brsi_last) = self.cache_lookup(pbi) {
            if brsi > brsi_last {
                return SectorUsage::Empty;
            }
        }
        match self.io.read_page(pbi, brsi, None) {
            Ok(meta) if meta.blank || meta.stat == SectorStat::Empty => SectorUsage::Empty,
            Ok(_) => SectorUsage::Written,
            Err(Error::UncorrectableBitErrors) => SectorUsage::Unknown,
            Err(_) => SectorUsage::Unknown,
        }
    }

    // ---- data-block cache ----

    pub(crate) fn cache_lookup(&self, pbi: u32) -> Option<u32> {
        self.data_cache
            .iter()
            .find(|e| e.pbi == pbi)
            .map(|e| e.brsi_last)
    }

    pub(crate) fn cache_insert(&mut self, pbi: u32, brsi_last: u32) {
        self.cache_remove(pbi);
        if self.data_cache.len() == self.data_cache.capacity() && !self.data_cache.is_empty() {
            self.data_cache.remove(0);
        }
        if self.data_cache.capacity() > 0 {
            self.data_cache.push(DataCacheEntry { pbi, brsi_last });
        }
    }

    pub(crate) fn cache_remove(&mut self, pbi: u32) {
        self.data_cache.retain(|e| e.pbi != pbi);
    }

    // ---- fatal-error handler ----

    /// Latch the fatal state, persist it to the error-info page and switch
    /// the device to read-only. Reads keep working as far as the medium
    /// allows; every write returns an error until the next format.
    pub(crate) fn enter_fatal(&mut self, error: Error, sector: u32) {
        if self.fatal.is_some() {
            return;
        }
        error!("fatal error {:?} at sector {}, going read-only", error, sector);
        self.fatal = Some((error, sector));
        self.write_protected = true;
        // The page can only be written once per format; the blank check
        // below keeps this idempotent. A pre-existing write-protected state
        // (hardware pin, read-only wrapper) does not imply the page exists,
        // so the attempt is made regardless; at worst the program is
        // refused and the in-RAM latch still protects this session.
        let pbi0 = self.pbi0;
        if let Ok(None) = self.io.read_error_info(pbi0) {
            let _ = self.io.write_error_info(
                pbi0,
                &phy::ErrorInfo {
                    write_protected: true,
                    has_fatal_error: true,
                    error_code: error.code(),
                    error_sector: sector,
                },
            );
        }
    }
}
