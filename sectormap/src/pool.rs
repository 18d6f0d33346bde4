//! Block pool: erase, recycle and retire physical blocks.
//!
//! Every transition back to the free pool goes through [SectorMap::clear_block]
//! so the erase count in page 0 stays monotonic and the wear counters stay
//! current. Blocks that fail an erase or program leave the pool for good via
//! [SectorMap::declare_bad].

use nand_phy::NandPhy;

use crate::error::Error;
use crate::phy::{MainSrc, WriteMeta};
use crate::spare::ERASE_CNT_INVALID;
use crate::SectorMap;

impl<P: NandPhy> SectorMap<P> {
    /// Erase `pbi` and write the incremented erase count to its first page.
    /// On success the block is marked free. An erase or program failure
    /// retires the block.
    pub(crate) fn clear_block(&mut self, pbi: u32, erase_cnt: u32) -> Result<u32, Error> {
        let base = if erase_cnt == ERASE_CNT_INVALID {
            self.erase_cnt_max
        } else {
            erase_cnt
        };
        if let Err(e) = self.io.erase_vblock(pbi) {
            self.declare_bad(pbi, Error::EraseError, 0);
            return Err(e);
        }
        let new_cnt = base + 1;
        let meta = WriteMeta {
            erase_cnt: Some(new_cnt),
            ..Default::default()
        };
        if let Err(e) = self.io.write_page(pbi, 0, MainSrc::Blank, &meta) {
            self.declare_bad(pbi, Error::WriteError, 0);
            return Err(e);
        }
        self.free_map.set(pbi as usize, true);
        self.note_erase(base, new_cnt);
        Ok(new_cnt)
    }

    /// Return a no longer needed block to the free pool, preserving its
    /// erase count. Best effort: a block that fails the erase is retired
    /// instead.
    pub(crate) fn free_block(&mut self, pbi: u32) {
        self.cache_remove(pbi);
        let erase_cnt = match self.io.read_page(pbi, 0, None) {
            Ok(meta) if !meta.blank => meta.erase_cnt,
            _ => ERASE_CNT_INVALID,
        };
        if let Err(e) = self.clear_block(pbi, erase_cnt) {
            warn!("recycling block {} failed: {:?}", pbi, e);
        }
    }

    /// Retire a block: write the bad-block record and drop it from every
    /// RAM structure.
    pub(crate) fn declare_bad(&mut self, pbi: u32, error: Error, brsi: u16) {
        self.io.mark_bad(pbi, error, brsi);
        self.free_map.set(pbi as usize, false);
        self.bad_map.set(pbi as usize, true);
        self.num_bad_blocks += 1;
        self.cache_remove(pbi);
    }

    /// Track the erase-count spread after a block moved from `old_cnt` to
    /// `new_cnt`. When the last block at the minimum leaves it, the true
    /// minimum is recovered by scanning the erase-count pages.
    pub(crate) fn note_erase(&mut self, old_cnt: u32, new_cnt: u32) {
        if new_cnt > self.erase_cnt_max {
            self.erase_cnt_max = new_cnt;
        }
        if old_cnt <= self.erase_cnt_min && new_cnt > self.erase_cnt_min {
            if self.num_blocks_erase_cnt_min > 1 {
                self.num_blocks_erase_cnt_min -= 1;
            } else {
                self.rescan_erase_cnt_min();
            }
        }
    }

    fn rescan_erase_cnt_min(&mut self) {
        let mut min = u32::MAX;
        let mut num = 0u32;
        for vb in (self.pbi0 + 1)..self.io.geo.num_vblocks {
            if self.bad_map.get(vb as usize) {
                continue;
            }
            let cnt = match self.io.read_page(vb, 0, None) {
                Ok(meta) if !meta.blank && meta.erase_cnt != ERASE_CNT_INVALID => meta.erase_cnt,
                _ => continue,
            };
            if cnt < min {
                min = cnt;
                num = 1;
            } else if cnt == min {
                num += 1;
            }
        }
        if num == 0 {
            min = self.erase_cnt_max;
        }
        self.erase_cnt_min = min;
        self.num_blocks_erase_cnt_min = num;
    }

    /// Fold the erase count of a scanned block into the wear counters.
    pub(crate) fn note_mount_cnt(&mut self, cnt: u32) {
        if cnt == ERASE_CNT_INVALID {
            return;
        }
        if cnt > self.erase_cnt_max {
            self.erase_cnt_max = cnt;
        }
        if self.num_blocks_erase_cnt_min == 0 || cnt < self.erase_cnt_min {
            self.erase_cnt_min = cnt;
            self.num_blocks_erase_cnt_min = 1;
        } else if cnt == self.erase_cnt_min {
            self.num_blocks_erase_cnt_min += 1;
        }
    }
}
