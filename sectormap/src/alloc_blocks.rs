//! Block allocation.
//!
//! Passive wear leveling: the free-bitmap scan starts one past the most
//! recently allocated block and wraps, so free blocks are consumed
//! round-robin instead of hammering the lowest index. Active wear leveling:
//! when the freshly erased block's count runs ahead of the coldest block by
//! the configured spread, the cold block's contents move into the fresh
//! block and the cold block rejoins the free pool with its low count.

use nand_phy::NandPhy;

use crate::error::Error;
use crate::phy::{MainSrc, WriteMeta};
use crate::spare::ERASE_CNT_INVALID;
use crate::SectorMap;

impl<P: NandPhy> SectorMap<P> {
    /// Produce an erased block with a fresh erase count.
    ///
    /// Running out of candidates is fatal: the device goes read-only.
    pub(crate) fn alloc_erased_block(&mut self) -> Result<(u32, u32), Error> {
        let mut wl_done = self.wl_suspended;
        loop {
            let Some(pbi) = self
                .free_map
                .next_set_wrapping(self.mru_free_block as usize + 1)
            else {
                self.enter_fatal(Error::OutOfFreeBlocks, 0);
                return Err(Error::OutOfFreeBlocks);
            };
            let pbi = pbi as u32;
            self.mru_free_block = pbi;

            // A fully blank block is brand new (or left over from a torn
            // clear) and may skip the erase; anything else is erased before
            // use. A blank first page alone is not enough, a torn erase can
            // leave garbage in the tail.
            let mut brand_new = false;
            let erase_cnt = match self.io.read_page(pbi, 0, None) {
                Ok(meta) if !meta.blank => meta.erase_cnt,
                _ => {
                    brand_new = self.io.page_is_blank(pbi, 0).unwrap_or(false)
                        && self.block_is_blank(pbi)?;
                    ERASE_CNT_INVALID
                }
            };
            let cnt = if brand_new {
                let cnt = self.erase_cnt_max;
                let meta = WriteMeta {
                    erase_cnt: Some(cnt),
                    ..Default::default()
                };
                match self.io.write_page(pbi, 0, MainSrc::Blank, &meta) {
                    Ok(()) => cnt,
                    Err(_) => {
                        self.declare_bad(pbi, Error::WriteError, 0);
                        continue;
                    }
                }
            } else {
                match self.clear_block(pbi, erase_cnt) {
                    Ok(cnt) => cnt,
                    // Marked bad inside; try the next candidate.
                    Err(_) => continue,
                }
            };
            self.free_map.set(pbi as usize, false);

            if !wl_done
                && self.cfg.max_erase_cnt_diff != 0
                && cnt >= self.erase_cnt_min.saturating_add(self.cfg.max_erase_cnt_diff)
            {
                wl_done = true;
                if self.wear_level_swap(pbi, cnt)? {
                    // The fresh block took over a cold block's data and the
                    // cold block is free again; allocate once more.
                    continue;
                }
            }
            return Ok((pbi, cnt));
        }
    }

    fn block_is_blank(&mut self, pbi: u32) -> Result<bool, Error> {
        for off in 0..self.io.geo.vppb {
            if !self.io.page_is_blank(pbi, off).unwrap_or(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Move the coldest block's contents into the freshly erased `fresh`
    /// block. Returns whether a swap happened; the caller then allocates
    /// again and typically receives the cold block.
    fn wear_level_swap(&mut self, fresh: u32, fresh_cnt: u32) -> Result<bool, Error> {
        let Some(cold) = self.find_cold_block(fresh, fresh_cnt) else {
            return Ok(false);
        };
        debug!("wear leveling: moving block {} into {}", cold, fresh);

        if let Some(wbi) = self.work_in_use.iter().position(|&i| self.work[i as usize].pbi == cold)
        {
            let wbi = self.work_in_use[wbi] as usize;
            match self.copy_work_block_into(wbi, fresh, fresh_cnt) {
                Ok(()) => {
                    self.work[wbi].pbi = fresh;
                    self.work[wbi].erase_cnt = fresh_cnt;
                    self.free_block(cold);
                    self.io.stats.reloc_cnt += 1;
                    Ok(true)
                }
                Err(Error::WriteError) | Err(Error::VerifyError) => {
                    self.declare_bad(fresh, Error::WriteError, 0);
                    Ok(true)
                }
                // Source trouble: keep the cold block where it is and put
                // the partially written destination back through an erase.
                Err(_) => {
                    let _ = self.clear_block(fresh, fresh_cnt);
                    Ok(true)
                }
            }
        } else {
            let lbi = match self.io.read_page(cold, 1, None) {
                Ok(meta) if !meta.blank => meta.lbi as u32,
                _ => return Ok(false),
            };
            if lbi >= self.num_logical_blocks || self.l2p.get(lbi as usize) != cold {
                return Ok(false);
            }
            match self.copy_data_block_into(cold, fresh, fresh_cnt, None) {
                Ok(brsi_last) => {
                    self.l2p.set(lbi as usize, fresh);
                    self.cache_insert(fresh, brsi_last);
                    self.free_block(cold);
                    self.io.stats.reloc_cnt += 1;
                    Ok(true)
                }
                Err(Error::WriteError) | Err(Error::VerifyError) => {
                    self.declare_bad(fresh, Error::WriteError, 0);
                    Ok(true)
                }
                Err(_) => {
                    let _ = self.clear_block(fresh, fresh_cnt);
                    Ok(true)
                }
            }
        }
    }

    /// First allocated block whose erase count trails `fresh_cnt` by the
    /// configured spread.
    fn find_cold_block(&mut self, fresh: u32, fresh_cnt: u32) -> Option<u32> {
        let diff = self.cfg.max_erase_cnt_diff;
        for pbi in 1..self.io.geo.num_vblocks {
            if pbi == fresh
                || pbi <= self.pbi0
                || self.free_map.get(pbi as usize)
                || self.bad_map.get(pbi as usize)
            {
                continue;
            }
            let cnt = match self.io.read_page(pbi, 0, None) {
                Ok(meta) if !meta.blank && meta.erase_cnt != ERASE_CNT_INVALID => meta.erase_cnt,
                _ => continue,
            };
            if cnt.saturating_add(diff) <= fresh_cnt {
                return Some(pbi);
            }
        }
        None
    }
}
