//! Low-level format and mount.
//!
//! Nothing the driver needs at run time is stored anywhere but the spare
//! areas, so a mount is a full scan: read every block-info page, rebuild
//! the logical-to-physical map and the free bitmap, resolve blocks
//! duplicated by an interrupted merge or relocation, and reload the
//! work-block assignment tables. Every destructive step taken here
//! (clearing a duplicate loser, dropping a stale work block) is one the
//! scan would redo identically, so a mount interrupted by power loss is
//! harmless.

use alloc::vec;
use alloc::vec::Vec;

use nand_phy::NandPhy;

use crate::bitfield::{BitMap, PackedArray};
use crate::error::Error;
use crate::phy::{BadState, FormatInfo, MainSrc, WriteMeta, FORMAT_VERSION};
use crate::spare::{cnt_is_newer, BlockKind, BRSI_INVALID, ERASE_CNT_INVALID};
use crate::stats::Stats;
use crate::{SectorMap, WorkBlock, PBI_NONE};

struct WorkCandidate {
    vb: u32,
    lbi: u32,
    erase_cnt: u32,
    block_cnt: u8,
    merge_cnt: u8,
}

impl<P: NandPhy> SectorMap<P> {
    /// Whether the medium carries a compatible low-level format.
    pub fn is_low_level_formatted(&mut self) -> Result<bool, Error> {
        let Some(pbi0) = self.find_first_usable(false)? else {
            return Ok(false);
        };
        match self.io.read_format_info(pbi0) {
            Ok(Some(info)) => Ok(self.format_matches(&info)),
            Ok(None) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    fn format_matches(&self, info: &FormatInfo) -> bool {
        info.version == FORMAT_VERSION
            && info.num_phy_blocks == self.io.geo.num_phy_blocks
            && info.pages_per_block == 1u32 << self.io.geo.ppb_log2
            && info.group_log2 == self.io.geo.group_log2
    }

    /// First block not marked bad, optionally tallying the skipped ones.
    fn find_first_usable(&mut self, tally: bool) -> Result<Option<u32>, Error> {
        for vb in 0..self.io.geo.num_vblocks {
            match self.io.bad_state(vb)? {
                BadState::Good => return Ok(Some(vb)),
                _ => {
                    if tally {
                        self.bad_map.set(vb as usize, true);
                        self.num_bad_blocks += 1;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Erase every usable block, preserving erase counts, and write a fresh
    /// format-info page. All sectors read as the fill pattern afterwards.
    pub fn low_level_format(&mut self) -> Result<(), Error> {
        if self.io.phy_write_protected() {
            return Err(Error::WriteProtected);
        }
        info!("low-level format: {} blocks", self.io.geo.num_vblocks);
        self.mounted = false;
        self.fatal = None;
        self.write_protected = false;
        self.num_bad_blocks = 0;
        self.erase_cnt_min = 0;
        self.erase_cnt_max = 0;
        self.num_blocks_erase_cnt_min = 0;

        let num_work_blocks = self.cfg.num_work_blocks as u16;
        let mut pbi0: Option<u32> = None;
        for vb in 0..self.io.geo.num_vblocks {
            match self.io.bad_state(vb)? {
                BadState::Factory => {
                    self.num_bad_blocks += 1;
                    continue;
                }
                BadState::Driver if !self.cfg.reclaim_driver_bad_blocks => {
                    self.num_bad_blocks += 1;
                    continue;
                }
                _ => {}
            }
            let cnt = match self.io.read_page(vb, 0, None) {
                Ok(m) if !m.blank && m.erase_cnt != ERASE_CNT_INVALID => m.erase_cnt,
                _ => 0,
            };
            if self.io.erase_vblock(vb).is_err() {
                self.io.mark_bad(vb, Error::EraseError, 0);
                self.num_bad_blocks += 1;
                continue;
            }
            let write_result = if pbi0.is_none() {
                self.io.write_format_info(vb, cnt + 1, num_work_blocks)
            } else {
                let meta = WriteMeta {
                    erase_cnt: Some(cnt + 1),
                    ..Default::default()
                };
                self.io.write_page(vb, 0, MainSrc::Blank, &meta)
            };
            if write_result.is_err() {
                self.io.mark_bad(vb, Error::WriteError, 0);
                self.num_bad_blocks += 1;
                continue;
            }
            if pbi0.is_none() {
                pbi0 = Some(vb);
            }
        }
        if pbi0.is_none() {
            return Err(Error::OutOfFreeBlocks);
        }
        Ok(())
    }

    /// Scan the medium and rebuild the complete RAM state.
    pub fn low_level_mount(&mut self) -> Result<(), Error> {
        self.mounted = false;
        self.write_protected = self.io.phy_write_protected();
        self.fatal = None;
        self.num_bad_blocks = 0;
        self.erase_cnt_min = 0;
        self.erase_cnt_max = 0;
        self.num_blocks_erase_cnt_min = 0;
        let n = self.io.geo.num_vblocks;
        self.bad_map = BitMap::new(n as usize);
        self.free_map = BitMap::new(n as usize);

        let Some(pbi0) = self.find_first_usable(true)? else {
            return Err(Error::NotFormatted);
        };
        self.pbi0 = pbi0;
        let Some(fmt) = self.io.read_format_info(pbi0)? else {
            return Err(Error::NotFormatted);
        };
        if !self.format_matches(&fmt) {
            warn!("on-medium format does not match the device");
            return Err(Error::FormatIncompatible);
        }
        self.num_work_blocks = self.cfg.num_work_blocks.max(fmt.num_work_blocks as u32);

        let usable = n - 1 - pbi0;
        let reserved = ((usable * self.cfg.pct_of_blocks_reserved as u32) / 100).max(2);
        if usable <= reserved + self.num_work_blocks {
            return Err(Error::InvalidParameter);
        }
        self.num_logical_blocks = usable - reserved - self.num_work_blocks;

        let bits_pbi = (32 - (n - 1).leading_zeros()) as u8;
        let vppb = self.io.geo.vppb;
        self.l2p = PackedArray::new(bits_pbi, self.num_logical_blocks as usize);
        self.work = (0..self.num_work_blocks)
            .map(|_| WorkBlock {
                pbi: PBI_NONE,
                lbi: 0,
                erase_cnt: 0,
                brsi_free: 1,
                block_cnt: 0,
                merge_cnt: 0,
                assign: PackedArray::new(self.io.geo.vppb_log2, vppb as usize),
            })
            .collect();
        self.work_in_use = Vec::new();
        self.work_free = (0..self.num_work_blocks as u16).collect();
        self.data_cache = Vec::with_capacity(2 * self.num_work_blocks as usize);
        self.copy_buf = vec![0xFF; self.io.geo.bytes_per_page];
        self.mru_free_block = pbi0;

        // Restore a latched fatal state from a previous session.
        if let Ok(Some(e)) = self.io.read_error_info(pbi0) {
            if e.has_fatal_error {
                warn!("medium carries a fatal-error record, mounting read-only");
                self.fatal = Some((Error::from_code(e.error_code), e.error_sector));
            }
            if e.write_protected {
                self.write_protected = true;
            }
        }

        let mut work_cands: Vec<WorkCandidate> = Vec::new();
        for vb in (pbi0 + 1)..n {
            match self.io.bad_state(vb)? {
                BadState::Good => {}
                _ => {
                    self.bad_map.set(vb as usize, true);
                    self.num_bad_blocks += 1;
                    continue;
                }
            }
            let meta = match self.io.read_page(vb, 1, None) {
                Ok(m) => m,
                Err(_) => {
                    // Unreadable block info: the block carries nothing the
                    // driver can use; it gets erased when allocated.
                    self.free_map.set(vb as usize, true);
                    continue;
                }
            };
            let cnt = if !meta.blank && meta.erase_cnt != ERASE_CNT_INVALID {
                meta.erase_cnt
            } else {
                match self.io.read_page(vb, 0, None) {
                    Ok(m0) if !m0.blank => m0.erase_cnt,
                    _ => ERASE_CNT_INVALID,
                }
            };
            self.note_mount_cnt(cnt);

            if meta.blank {
                self.free_map.set(vb as usize, true);
                continue;
            }
            match meta.kind {
                BlockKind::Empty | BlockKind::Unknown => {
                    self.free_map.set(vb as usize, true);
                }
                BlockKind::Work => {
                    let lbi = meta.lbi as u32;
                    let spb = (self.io.geo.vppb - 1) as u16;
                    if lbi >= self.num_logical_blocks || meta.num_sectors != spb {
                        self.mount_discard(vb);
                        continue;
                    }
                    if let Some(i) = work_cands.iter().position(|c| c.lbi == lbi) {
                        // Duplicate from an interrupted relocation. The
                        // older copy is the complete one; relocation only
                        // erases it once the new copy is finished, and a
                        // finished relocation leaves no duplicate.
                        if cnt_is_newer(meta.block_cnt, work_cands[i].block_cnt) {
                            self.mount_discard(vb);
                        } else {
                            let old = work_cands[i].vb;
                            self.mount_discard(old);
                            work_cands[i] = WorkCandidate {
                                vb,
                                lbi,
                                erase_cnt: meta.erase_cnt,
                                block_cnt: meta.block_cnt,
                                merge_cnt: meta.merge_cnt,
                            };
                        }
                    } else {
                        work_cands.push(WorkCandidate {
                            vb,
                            lbi,
                            erase_cnt: meta.erase_cnt,
                            block_cnt: meta.block_cnt,
                            merge_cnt: meta.merge_cnt,
                        });
                    }
                }
                BlockKind::Data => {
                    let lbi = meta.lbi as u32;
                    if lbi >= self.num_logical_blocks {
                        self.mount_discard(vb);
                        continue;
                    }
                    let cur = self.l2p.get(lbi as usize);
                    if cur == PBI_NONE {
                        self.l2p.set(lbi as usize, vb);
                    } else {
                        self.resolve_data_duplicate(lbi, cur, vb, meta.block_cnt);
                    }
                }
            }
        }

        // Attach the surviving work blocks. A work block whose merge count
        // disagrees with its data block is left over from an interrupted
        // post-merge erase; its entries are already merged.
        for cand in work_cands {
            let data_pbi = self.l2p.get(cand.lbi as usize);
            let stale = if data_pbi != PBI_NONE {
                match self.io.read_page(data_pbi, 1, None) {
                    Ok(m) if !m.blank => m.merge_cnt != cand.merge_cnt,
                    _ => false,
                }
            } else {
                cand.merge_cnt != 0
            };
            if stale {
                debug!("dropping stale work block {} of lbi {}", cand.vb, cand.lbi);
                self.mount_discard(cand.vb);
                continue;
            }
            if self.work_free.is_empty() {
                if self.write_protected || self.fatal.is_some() {
                    continue;
                }
                // More staged blocks on the medium than descriptors; merge
                // the least recently attached one to make room.
                let lru = *self.work_in_use.last().expect("arena not empty");
                self.convert_work_block(lru as usize, 0, None, false)?;
            }
            let wbi = self.work_free.pop().expect("descriptor available") as usize;
            {
                let wb = &mut self.work[wbi];
                wb.pbi = cand.vb;
                wb.lbi = cand.lbi;
                wb.erase_cnt = if cand.erase_cnt == ERASE_CNT_INVALID {
                    0
                } else {
                    cand.erase_cnt
                };
                wb.brsi_free = 1;
                wb.block_cnt = cand.block_cnt;
                wb.merge_cnt = cand.merge_cnt;
                wb.assign.clear();
            }
            self.work_in_use.insert(0, wbi as u16);
            self.load_work_block(wbi);
        }

        if self.num_blocks_erase_cnt_min == 0 {
            self.erase_cnt_min = self.erase_cnt_max;
        }
        self.io.stats = Stats::default();
        self.mounted = true;
        info!(
            "mounted: {} logical blocks, {} free, {} bad, erase counts {}..{}",
            self.num_logical_blocks,
            self.free_map.count(),
            self.num_bad_blocks,
            self.erase_cnt_min,
            self.erase_cnt_max
        );

        if (self.cfg.num_blocks_free != 0 || self.cfg.num_sectors_free != 0)
            && !self.write_protected
            && self.fatal.is_none()
        {
            self.apply_clean_threshold()?;
        }
        Ok(())
    }

    /// Two data blocks claim one logical block after a crash mid-merge or
    /// mid-relocation. The complete one wins: a block whose last page
    /// carries the merge-completed sentinel was fully written. Two complete
    /// candidates (crash after completion, before the old block's erase)
    /// resolve by the wrapping block count.
    fn resolve_data_duplicate(&mut self, lbi: u32, cur: u32, new: u32, new_cnt: u8) {
        let new_complete = self.has_merge_sentinel(new);
        let cur_complete = self.has_merge_sentinel(cur);
        let keep_new = match (new_complete, cur_complete) {
            (true, false) => true,
            (false, true) => false,
            _ => {
                let cur_cnt = match self.io.read_page(cur, 1, None) {
                    Ok(m) if !m.blank => m.block_cnt,
                    _ => 0,
                };
                cnt_is_newer(new_cnt, cur_cnt)
            }
        };
        debug!(
            "duplicate data blocks for lbi {}: {} vs {}, keeping {}",
            lbi,
            cur,
            new,
            if keep_new { new } else { cur }
        );
        if keep_new {
            self.mount_discard(cur);
            self.l2p.set(lbi as usize, new);
        } else {
            self.mount_discard(new);
        }
    }

    /// Clear a block the scan decided against. On a read-only mount the
    /// block is merely left unmapped; the next writable mount clears it.
    fn mount_discard(&mut self, vb: u32) {
        if self.write_protected || self.fatal.is_some() {
            return;
        }
        self.free_block(vb);
    }

    fn has_merge_sentinel(&mut self, vb: u32) -> bool {
        let last = self.io.geo.vppb - 1;
        match self.io.read_page(vb, last, None) {
            Ok(m) => !m.blank && m.brsi as u32 == last,
            Err(_) => false,
        }
    }

    /// Rebuild the assignment table of a freshly attached work block by
    /// scanning its page spares. Entries whose spare cannot be read are
    /// dropped; their sectors resolve through the data block, which for a
    /// torn final append is exactly the pre-write state.
    fn load_work_block(&mut self, wbi: usize) {
        let pbi = self.work[wbi].pbi;
        let vppb = self.io.geo.vppb;
        let threshold = self.cfg.max_bit_error_cnt;
        let mut brsi_free = 1u32;
        let mut degraded = false;
        for pos in 1..vppb {
            match self.io.read_page(pbi, pos, None) {
                Ok(m) if m.blank => continue,
                Ok(m) => {
                    brsi_free = pos + 1;
                    let brsi = m.brsi as u32;
                    if m.brsi != BRSI_INVALID && brsi >= 1 && brsi < vppb {
                        self.work[wbi].assign.set(brsi as usize, pos);
                    }
                    if threshold != 0 && m.corrected_bits >= threshold && m.corrected_bits > 0 {
                        degraded = true;
                    }
                }
                Err(_) => {
                    brsi_free = pos + 1;
                    degraded = true;
                }
            }
        }
        self.work[wbi].brsi_free = brsi_free;
        if degraded && !self.write_protected && self.fatal.is_none() {
            let _ = self.relocate_work_block(wbi, None);
        }
    }
}
