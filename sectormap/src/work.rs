//! Work-block management.
//!
//! A work block stages updates for exactly one logical block, append-only.
//! Descriptors live in a fixed arena; the in-use list is kept in MRU order
//! so recycling always evicts the least recently written logical block.
//! The first page written to a work block doubles as its block-info page.

use nand_phy::NandPhy;

use crate::error::Error;
use crate::phy::{BlockInfoMeta, MainSrc, WriteMeta};
use crate::spare::{BlockKind, SectorStat};
use crate::{SectorMap, PBI_NONE};

impl<P: NandPhy> SectorMap<P> {
    pub(crate) fn find_work_block(&self, lbi: u32) -> Option<usize> {
        self.work_in_use
            .iter()
            .map(|&i| i as usize)
            .find(|&i| self.work[i].lbi == lbi)
    }

    /// Move a work block to the head of the MRU list.
    fn touch_work_block(&mut self, wbi: usize) {
        if let Some(pos) = self.work_in_use.iter().position(|&i| i as usize == wbi) {
            let v = self.work_in_use.remove(pos);
            self.work_in_use.insert(0, v);
        }
    }

    /// Unlink a descriptor and put it back on the free list. The physical
    /// block is dealt with by the caller.
    pub(crate) fn release_work_desc(&mut self, wbi: usize) {
        self.work_in_use.retain(|&i| i as usize != wbi);
        let wb = &mut self.work[wbi];
        wb.pbi = PBI_NONE;
        wb.lbi = 0;
        wb.brsi_free = 1;
        wb.block_cnt = 0;
        wb.merge_cnt = 0;
        wb.assign.clear();
        self.work_free.push(wbi as u16);
    }

    /// Take a descriptor (cleaning the LRU work block if none is free),
    /// allocate an erased block for it and link it at the MRU position.
    fn alloc_work_block(&mut self, lbi: u32) -> Result<usize, Error> {
        if self.work_free.is_empty() {
            let lru = *self
                .work_in_use
                .last()
                .expect("work-block arena is never empty");
            self.convert_work_block(lru as usize, 0, None, false)?;
        }
        let wbi = self.work_free.pop().expect("freed by conversion") as usize;
        let (pbi, erase_cnt) = match self.alloc_erased_block() {
            Ok(v) => v,
            Err(e) => {
                self.work_free.push(wbi as u16);
                return Err(e);
            }
        };
        // Counters the merged data block will carry, pulled from the
        // current data block of this logical block.
        let src = self.l2p.get(lbi as usize);
        let (block_cnt, merge_cnt) = if src != PBI_NONE {
            match self.io.read_page(src, 1, None) {
                Ok(m) if !m.blank => ((m.block_cnt + 1) & 0xF, m.merge_cnt),
                _ => (0, 0),
            }
        } else {
            (0, 0)
        };
        let vppb_log2 = self.io.geo.vppb_log2;
        let wb = &mut self.work[wbi];
        wb.pbi = pbi;
        wb.lbi = lbi;
        wb.erase_cnt = erase_cnt;
        wb.brsi_free = 1;
        wb.block_cnt = block_cnt;
        wb.merge_cnt = merge_cnt;
        wb.assign.clear();
        debug_assert_eq!(wb.assign.len(), 1usize << vppb_log2);
        self.work_in_use.insert(0, wbi as u16);
        trace!("work block for lbi {} on pbi {}", lbi, pbi);
        Ok(wbi)
    }

    /// Stage one logical sector in the work block of its logical block.
    /// `None` data appends an invalidation entry (trim).
    pub(crate) fn write_log_sector(
        &mut self,
        lbi: u32,
        brsi: u32,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let wbi = match self.find_work_block(lbi) {
            Some(i) => i,
            None => self.alloc_work_block(lbi)?,
        };
        let vppb = self.io.geo.vppb;
        let brsi_free = self.work[wbi].brsi_free;
        // Full, or eating into the fast-write reserve: merge now, folding
        // the new sector into the fresh data block on the fly.
        let must_convert = brsi_free >= vppb
            || (self.cfg.num_sectors_free != 0 && vppb - brsi_free < self.cfg.num_sectors_free);
        if must_convert {
            self.convert_work_block(wbi, 0, Some((brsi, data)), false)?;
            self.io.stats.write_sector_cnt += 1;
            return Ok(());
        }

        let brsi_dest = brsi_free;
        let wb = &self.work[wbi];
        let meta = WriteMeta {
            erase_cnt: (brsi_dest == 1).then_some(wb.erase_cnt),
            info: (brsi_dest == 1).then_some(BlockInfoMeta {
                lbi: lbi as u16,
                kind: BlockKind::Work,
                block_cnt: wb.block_cnt,
                merge_cnt: wb.merge_cnt,
            }),
            stat: Some(if data.is_some() {
                SectorStat::Written
            } else {
                SectorStat::Empty
            }),
            brsi: Some(brsi as u16),
            num_sectors: (brsi_dest == 1).then_some(self.sectors_per_block() as u16),
        };
        let pbi = wb.pbi;
        let main = match data {
            Some(d) => MainSrc::Borrowed(d),
            None => MainSrc::Blank,
        };
        match self.io.write_page(pbi, brsi_dest, main, &meta) {
            Ok(()) => {
                let wb = &mut self.work[wbi];
                wb.brsi_free += 1;
                wb.assign.set(brsi as usize, brsi_dest);
                self.touch_work_block(wbi);
                self.io.stats.write_sector_cnt += 1;
                if self.cfg.handle_write_disturb && brsi_dest >= 2 {
                    self.check_write_disturb(wbi, brsi_dest - 1);
                }
                Ok(())
            }
            Err(Error::WriteError) | Err(Error::VerifyError) => {
                // The block took a failed program; merge everything valid
                // plus the new sector into a fresh data block and retire it.
                self.io.stats.retry_cnt += 1;
                self.convert_work_block(wbi, brsi_dest, Some((brsi, data)), true)?;
                self.io.stats.write_sector_cnt += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-read the page written before the current one; programming a page
    /// can disturb its neighbors.
    fn check_write_disturb(&mut self, wbi: usize, pos: u32) {
        if self.cfg.max_bit_error_cnt == 0 {
            return;
        }
        let pbi = self.work[wbi].pbi;
        if let Ok(meta) = self.io.read_page(pbi, pos, None) {
            if meta.corrected_bits >= self.cfg.max_bit_error_cnt && meta.corrected_bits > 0 {
                self.relocate_block(pbi, true);
            }
        }
    }

    // ---- cleaning / fast-write reservation ----

    /// Merge the least recently used work block. Returns whether more work
    /// blocks remain to clean.
    pub fn clean_one(&mut self) -> Result<bool, Error> {
        self.check_writable()?;
        if let Some(&lru) = self.work_in_use.last() {
            self.convert_work_block(lru as usize, 0, None, false)?;
        }
        Ok(!self.work_in_use.is_empty())
    }

    /// Merge every work block; afterwards all logical blocks resolve
    /// through the logical-to-physical map alone.
    pub fn clean(&mut self) -> Result<(), Error> {
        self.check_writable()?;
        while let Some(&lru) = self.work_in_use.last() {
            self.convert_work_block(lru as usize, 0, None, false)?;
        }
        Ok(())
    }

    /// Number of clean steps needed to fully flush the staging state.
    pub fn clean_cnt(&self) -> u32 {
        self.work_in_use.len() as u32
    }

    /// Pre-convert work blocks so a subsequent write burst lands in
    /// reserved slots without triggering a merge.
    pub fn set_clean_threshold(
        &mut self,
        num_blocks_free: u32,
        num_sectors_free: u32,
    ) -> Result<(), Error> {
        self.cfg.num_blocks_free = num_blocks_free;
        self.cfg.num_sectors_free = num_sectors_free;
        if self.mounted && !self.write_protected && self.fatal.is_none() {
            self.apply_clean_threshold()?;
        }
        Ok(())
    }

    pub(crate) fn apply_clean_threshold(&mut self) -> Result<(), Error> {
        loop {
            let enough_blocks = self.free_map.count() >= self.cfg.num_blocks_free;
            let enough_sectors = self.free_work_slots() >= self.cfg.num_sectors_free;
            if (enough_blocks && enough_sectors) || self.work_in_use.is_empty() {
                return Ok(());
            }
            let lru = *self.work_in_use.last().expect("checked above");
            self.convert_work_block(lru as usize, 0, None, false)?;
        }
    }

    /// Staging capacity available without a merge: the unwritten tails of
    /// in-use work blocks plus whole blocks behind free descriptors.
    fn free_work_slots(&self) -> u32 {
        let spb = self.sectors_per_block();
        let tails: u32 = self
            .work_in_use
            .iter()
            .map(|&i| self.io.geo.vppb - self.work[i as usize].brsi_free)
            .sum();
        tails + self.work_free.len() as u32 * spb
    }
}
