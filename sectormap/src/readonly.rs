//! Read-only device variant.
//!
//! A read-only driver is just a wrapper that exposes the non-mutating
//! subset; every mutating entry point answers [Error::WriteProtected]
//! without touching the medium. Background maintenance that would program
//! or erase (relocation of degrading blocks) is switched off as well.

use nand_phy::NandPhy;

use crate::{DiskInfo, Error, SectorMap, SectorUsage, Stats};

pub struct ReadOnlySectorMap<P: NandPhy> {
    inner: SectorMap<P>,
}

impl<P: NandPhy> ReadOnlySectorMap<P> {
    /// Wrap a device. The inner device is pinned write-protected; reads
    /// that would normally schedule a relocation no longer do.
    pub fn new(mut inner: SectorMap<P>) -> Self {
        inner.write_protected = true;
        inner.cfg.max_bit_error_cnt = 0;
        ReadOnlySectorMap { inner }
    }

    pub fn into_inner(self) -> SectorMap<P> {
        self.inner
    }

    pub fn read_sectors(
        &mut self,
        first_sector: u32,
        count: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.inner.read_sectors(first_sector, count, buf)
    }

    pub fn get_sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        self.inner.get_sector_usage(sector)
    }

    pub fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.inner.bytes_per_sector()
    }

    pub fn disk_info(&self) -> DiskInfo {
        self.inner.disk_info()
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    pub fn clean_cnt(&self) -> u32 {
        self.inner.clean_cnt()
    }

    pub fn unmount(&mut self) {
        self.inner.unmount()
    }

    pub fn write_sectors(
        &mut self,
        _first_sector: u32,
        _count: u32,
        _buf: &[u8],
        _repeat_same: bool,
    ) -> Result<(), Error> {
        Err(Error::WriteProtected)
    }

    pub fn free_sectors(&mut self, _first_sector: u32, _count: u32) -> Result<(), Error> {
        Err(Error::WriteProtected)
    }

    pub fn clean_one(&mut self) -> Result<bool, Error> {
        Err(Error::WriteProtected)
    }

    pub fn clean(&mut self) -> Result<(), Error> {
        Err(Error::WriteProtected)
    }

    pub fn set_clean_threshold(&mut self, _blocks: u32, _sectors: u32) -> Result<(), Error> {
        Err(Error::WriteProtected)
    }

    pub fn low_level_format(&mut self) -> Result<(), Error> {
        Err(Error::WriteProtected)
    }
}
