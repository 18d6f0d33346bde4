//! Converter: merge a work block with its source data block into a fresh
//! data block, and relocation of degrading blocks.
//!
//! Crash ordering is what makes updates power-fail safe: the destination
//! block is fully written first (block count and merge count bumped, and a
//! merge-completed sentinel on its last page), then the map entry flips in
//! RAM, then the old data block and the work block are erased. A mount
//! after a power loss inside this window picks the complete, newer block
//! and clears the rest.

use nand_phy::NandPhy;

use crate::error::Error;
use crate::phy::{BlockInfoMeta, MainSrc, WriteMeta};
use crate::spare::{BlockKind, SectorStat, BRSI_INVALID};
use crate::{SectorMap, PBI_NONE};

/// Where the bytes of one destination page come from.
enum Sel {
    /// The sector whose write triggered this merge.
    Inject,
    /// A staged page of the work block.
    Work(u32),
    /// The source data block.
    Data,
    Unwritten,
}

impl<P: NandPhy> SectorMap<P> {
    /// Merge work block `wbi` into a fresh data block.
    ///
    /// `skip_pos` names a work-block page to ignore (a page whose program
    /// just failed). `inject` folds one more sector write (`None` data =
    /// trim) into the destination on the fly. With `wb_suspect` the work
    /// block is retired instead of recycled afterwards.
    pub(crate) fn convert_work_block(
        &mut self,
        wbi: usize,
        skip_pos: u32,
        inject: Option<(u32, Option<&[u8]>)>,
        wb_suspect: bool,
    ) -> Result<(), Error> {
        let lbi = self.work[wbi].lbi;
        let wb_pbi = self.work[wbi].pbi;
        let vppb = self.io.geo.vppb;
        let spb = self.sectors_per_block();
        let src_pbi = self.l2p.get(lbi as usize);

        // Counters of the new block. The merge count steps from the work
        // block's snapshot; the block count steps from the live data block
        // (relocation may have bumped it since).
        let merge_cnt = (self.work[wbi].merge_cnt + 1) & 0xF;
        let block_cnt = if src_pbi != PBI_NONE {
            match self.io.read_page(src_pbi, 1, None) {
                Ok(m) if !m.blank => (m.block_cnt + 1) & 0xF,
                _ => self.work[wbi].block_cnt,
            }
        } else {
            0
        };
        let src_last = if src_pbi != PBI_NONE {
            self.cache_lookup(src_pbi).unwrap_or(vppb - 1)
        } else {
            0
        };

        trace!("converting work block of lbi {} (pbi {})", lbi, wb_pbi);
        let wl_was = self.wl_suspended;
        self.wl_suspended = true;

        let mut remembered: Option<Error> = None;
        let mut retries = 0u8;
        let result = 'retry: loop {
            let (dest, dest_ec) = match self.alloc_erased_block() {
                Ok(v) => v,
                Err(e) => break 'retry Err(e),
            };
            let mut brsi_last = 0u32;
            for brsi in 1..vppb {
                let sel = match inject {
                    Some((ib, _)) if ib == brsi => Sel::Inject,
                    _ => {
                        let pos = self.work[wbi].assign.get(brsi as usize);
                        if pos != 0 && pos != skip_pos {
                            Sel::Work(pos)
                        } else if src_pbi != PBI_NONE && brsi <= src_last {
                            Sel::Data
                        } else {
                            Sel::Unwritten
                        }
                    }
                };
                let is_first = brsi == 1;
                let is_last = brsi == vppb - 1;
                let mut write_failed = false;

                // Plain data pages can use the in-device copy; their bytes
                // and spare fields are identical in the destination.
                if let (Sel::Data, false, false) = (&sel, is_first, is_last) {
                    match self.io.copy_page(src_pbi, brsi, dest, brsi) {
                        Ok(true) => {
                            self.io.stats.copy_sector_cnt += 1;
                            brsi_last = brsi;
                            continue;
                        }
                        Ok(false) => {}
                        Err(_) => write_failed = true,
                    }
                }

                if !write_failed {
                    let mut have_data = false;
                    let mut injected: Option<&[u8]> = None;
                    match sel {
                        Sel::Inject => {
                            if let Some((_, Some(d))) = inject {
                                injected = Some(d);
                                have_data = true;
                            }
                        }
                        Sel::Work(pos) => match self.io.read_page(wb_pbi, pos, Some(&mut self.copy_buf)) {
                            Ok(m) => {
                                if !m.blank && m.stat == SectorStat::Written {
                                    have_data = true;
                                }
                            }
                            Err(e @ Error::UncorrectableBitErrors) => {
                                // Keep the raw bytes; most of them survive.
                                remembered.get_or_insert(e);
                                have_data = true;
                            }
                            Err(e) => {
                                remembered.get_or_insert(e);
                            }
                        },
                        Sel::Data => match self.io.read_page(src_pbi, brsi, Some(&mut self.copy_buf)) {
                            Ok(m) => {
                                if !m.blank && m.stat == SectorStat::Written {
                                    have_data = true;
                                }
                            }
                            Err(e @ Error::UncorrectableBitErrors) => {
                                let sector = self.sector_index(lbi, brsi);
                                let mut recovered = false;
                                if let Some(mut cb) = self.read_error_cb.take() {
                                    recovered = cb.recover(sector, &mut self.copy_buf);
                                    self.read_error_cb = Some(cb);
                                }
                                if !recovered {
                                    remembered.get_or_insert(e);
                                }
                                have_data = true;
                            }
                            Err(e) => {
                                remembered.get_or_insert(e);
                            }
                        },
                        Sel::Unwritten => {}
                    }

                    let zero_fill = !self.cfg.allow_blank_unused_sectors;
                    if have_data || is_first || is_last || zero_fill {
                        let meta = WriteMeta {
                            erase_cnt: is_first.then_some(dest_ec),
                            info: is_first.then_some(BlockInfoMeta {
                                lbi: lbi as u16,
                                kind: BlockKind::Data,
                                block_cnt,
                                merge_cnt,
                            }),
                            stat: Some(if have_data {
                                SectorStat::Written
                            } else {
                                SectorStat::Empty
                            }),
                            // Merge-completed sentinel on the last page.
                            brsi: is_last.then_some((vppb - 1) as u16),
                            num_sectors: (is_first || is_last).then_some(spb as u16),
                        };
                        let main = if have_data {
                            match injected {
                                Some(d) => MainSrc::Borrowed(d),
                                None => MainSrc::Borrowed(&self.copy_buf),
                            }
                        } else if zero_fill {
                            self.copy_buf.fill(0x00);
                            MainSrc::Borrowed(&self.copy_buf)
                        } else {
                            MainSrc::Blank
                        };
                        match self.io.write_page(dest, brsi, main, &meta) {
                            Ok(()) => {
                                if have_data {
                                    brsi_last = brsi;
                                    self.io.stats.copy_sector_cnt += 1;
                                }
                            }
                            Err(Error::WriteError) | Err(Error::VerifyError) => {
                                write_failed = true
                            }
                            Err(e) => {
                                self.free_block(dest);
                                break 'retry Err(e);
                            }
                        }
                    }
                }

                if write_failed {
                    self.declare_bad(dest, Error::WriteError, brsi as u16);
                    self.io.stats.retry_cnt += 1;
                    retries += 1;
                    if retries > self.cfg.max_write_retries {
                        self.enter_fatal(Error::WriteError, self.sector_index(lbi, brsi));
                        break 'retry Err(Error::WriteError);
                    }
                    continue 'retry;
                }
            }

            // Commit: flip the map first, then clear the old blocks. On a
            // crash in between, mount picks the complete newer block.
            self.l2p.set(lbi as usize, dest);
            self.cache_insert(dest, brsi_last);
            if src_pbi != PBI_NONE {
                self.free_block(src_pbi);
            }
            self.release_work_desc(wbi);
            if wb_suspect {
                self.declare_bad(wb_pbi, Error::WriteError, skip_pos as u16);
            } else {
                self.free_block(wb_pbi);
            }
            self.io.stats.convert_cnt += 1;
            break 'retry Ok(());
        };

        self.wl_suspended = wl_was;
        if result.is_ok() {
            if let Some(e @ (Error::UncorrectableBitErrors | Error::ReadError)) = remembered {
                // Part of the old contents could not be carried over. The
                // merge stands, but the device goes read-only.
                self.enter_fatal(e, self.sector_index(lbi, 1));
            }
        }
        result
    }

    /// Copy a data block onto an erased destination, bumping the block
    /// count. `patch` substitutes recovered bytes for one sector. Returns
    /// the highest sector position that carries data.
    pub(crate) fn copy_data_block_into(
        &mut self,
        src: u32,
        dest: u32,
        dest_ec: u32,
        patch: Option<(u32, &[u8])>,
    ) -> Result<u32, Error> {
        let vppb = self.io.geo.vppb;
        let spb = self.sectors_per_block();
        let (lbi, block_cnt, merge_cnt) = match self.io.read_page(src, 1, None) {
            Ok(m) if !m.blank => (m.lbi, (m.block_cnt + 1) & 0xF, m.merge_cnt),
            // Info page unreadable; recover what the map still knows.
            _ => match self.lbi_of_pbi(src) {
                Some(lbi) => (lbi as u16, 1, 0),
                None => return Err(Error::ReadError),
            },
        };
        let src_last = self.cache_lookup(src).unwrap_or(vppb - 1);
        let zero_fill = !self.cfg.allow_blank_unused_sectors;
        let mut brsi_last = 0u32;

        for brsi in 1..vppb {
            let is_first = brsi == 1;
            let is_last = brsi == vppb - 1;
            let patched = patch.filter(|&(p, _)| p == brsi);

            if patched.is_none() && !is_first && !is_last {
                if brsi > src_last && !zero_fill {
                    continue;
                }
                if brsi <= src_last {
                    match self.io.copy_page(src, brsi, dest, brsi) {
                        Ok(true) => {
                            self.io.stats.copy_sector_cnt += 1;
                            brsi_last = brsi;
                            continue;
                        }
                        Ok(false) => {}
                        Err(_) => return Err(Error::WriteError),
                    }
                }
            }

            let mut have_data = false;
            if let Some((_, d)) = patched {
                self.copy_buf.copy_from_slice(d);
                have_data = true;
            } else if brsi <= src_last {
                match self.io.read_page(src, brsi, Some(&mut self.copy_buf)) {
                    Ok(m) => {
                        if !m.blank && m.stat == SectorStat::Written {
                            have_data = true;
                        }
                    }
                    // Carry the raw bytes rather than dropping the sector.
                    Err(Error::UncorrectableBitErrors) => have_data = true,
                    Err(_) => {}
                }
            }

            if have_data || is_first || is_last || zero_fill {
                let meta = WriteMeta {
                    erase_cnt: is_first.then_some(dest_ec),
                    info: is_first.then_some(BlockInfoMeta {
                        lbi,
                        kind: BlockKind::Data,
                        block_cnt,
                        merge_cnt,
                    }),
                    stat: Some(if have_data {
                        SectorStat::Written
                    } else {
                        SectorStat::Empty
                    }),
                    brsi: is_last.then_some((vppb - 1) as u16),
                    num_sectors: (is_first || is_last).then_some(spb as u16),
                };
                let main = if have_data {
                    MainSrc::Borrowed(&self.copy_buf)
                } else if zero_fill {
                    self.copy_buf.fill(0x00);
                    MainSrc::Borrowed(&self.copy_buf)
                } else {
                    MainSrc::Blank
                };
                self.io.write_page(dest, brsi, main, &meta)?;
                if have_data {
                    brsi_last = brsi;
                    self.io.stats.copy_sector_cnt += 1;
                }
            }
        }
        Ok(brsi_last)
    }

    /// Copy a work block page-for-page onto an erased destination,
    /// preserving the staged layout. `patch` substitutes recovered bytes
    /// for the page at one position.
    pub(crate) fn copy_work_block_into(
        &mut self,
        wbi: usize,
        dest: u32,
        dest_ec: u32,
    ) -> Result<(), Error> {
        self.copy_work_block_into_patched(wbi, dest, dest_ec, None)
    }

    pub(crate) fn copy_work_block_into_patched(
        &mut self,
        wbi: usize,
        dest: u32,
        dest_ec: u32,
        patch: Option<(u32, u16, &[u8])>,
    ) -> Result<(), Error> {
        let wb_pbi = self.work[wbi].pbi;
        let lbi = self.work[wbi].lbi;
        let brsi_free = self.work[wbi].brsi_free;
        let merge_cnt = self.work[wbi].merge_cnt;
        let new_block_cnt = (self.work[wbi].block_cnt + 1) & 0xF;
        let spb = self.sectors_per_block();

        for pos in 1..brsi_free {
            let patched = patch.filter(|&(p, _, _)| p == pos);
            let (stat, brsi) = if let Some((_, brsi, d)) = patched {
                self.copy_buf.copy_from_slice(d);
                (SectorStat::Written, brsi)
            } else {
                match self.io.read_page(wb_pbi, pos, Some(&mut self.copy_buf)) {
                    Ok(m) if !m.blank => (m.stat, m.brsi),
                    // A page this block cannot give back is dropped; its
                    // sector still resolves through the data block.
                    _ => continue,
                }
            };
            if brsi == BRSI_INVALID {
                continue;
            }
            let meta = WriteMeta {
                erase_cnt: (pos == 1).then_some(dest_ec),
                info: (pos == 1).then_some(BlockInfoMeta {
                    lbi: lbi as u16,
                    kind: BlockKind::Work,
                    block_cnt: new_block_cnt,
                    merge_cnt,
                }),
                stat: Some(stat),
                brsi: Some(brsi),
                num_sectors: (pos == 1).then_some(spb as u16),
            };
            let main = if stat == SectorStat::Written {
                MainSrc::Borrowed(&self.copy_buf)
            } else {
                MainSrc::Blank
            };
            self.io.write_page(dest, pos, main, &meta)?;
        }
        self.work[wbi].block_cnt = new_block_cnt;
        Ok(())
    }

    /// Logical block currently mapped to `pbi`, if any.
    pub(crate) fn lbi_of_pbi(&self, pbi: u32) -> Option<u32> {
        (0..self.num_logical_blocks as usize)
            .find(|&lbi| self.l2p.get(lbi) == pbi)
            .map(|lbi| lbi as u32)
    }

    /// Move a data block to a fresh physical block, preserving its logical
    /// identity. Bounded retries on program failures.
    pub(crate) fn relocate_data_block(
        &mut self,
        pbi: u32,
        patch: Option<(u32, &[u8])>,
    ) -> Result<(), Error> {
        let Some(lbi) = self.lbi_of_pbi(pbi) else {
            return Err(Error::InvalidParameter);
        };
        let wl_was = self.wl_suspended;
        self.wl_suspended = true;
        let mut retries = 0u8;
        let result = loop {
            let (dest, dest_ec) = match self.alloc_erased_block() {
                Ok(v) => v,
                Err(e) => break Err(e),
            };
            match self.copy_data_block_into(pbi, dest, dest_ec, patch) {
                Ok(brsi_last) => {
                    self.l2p.set(lbi as usize, dest);
                    self.cache_insert(dest, brsi_last);
                    self.free_block(pbi);
                    self.io.stats.reloc_cnt += 1;
                    break Ok(());
                }
                Err(Error::WriteError) | Err(Error::VerifyError) => {
                    self.declare_bad(dest, Error::WriteError, 0);
                    self.io.stats.retry_cnt += 1;
                    retries += 1;
                    if retries > self.cfg.max_write_retries {
                        break Err(Error::WriteError);
                    }
                }
                Err(e) => {
                    self.free_block(dest);
                    break Err(e);
                }
            }
        };
        self.wl_suspended = wl_was;
        result
    }

    /// Move a work block to a fresh physical block.
    pub(crate) fn relocate_work_block(
        &mut self,
        wbi: usize,
        patch: Option<(u32, u16, &[u8])>,
    ) -> Result<(), Error> {
        let old_pbi = self.work[wbi].pbi;
        let wl_was = self.wl_suspended;
        self.wl_suspended = true;
        let mut retries = 0u8;
        let result = loop {
            let (dest, dest_ec) = match self.alloc_erased_block() {
                Ok(v) => v,
                Err(e) => break Err(e),
            };
            match self.copy_work_block_into_patched(wbi, dest, dest_ec, patch) {
                Ok(()) => {
                    self.work[wbi].pbi = dest;
                    self.work[wbi].erase_cnt = dest_ec;
                    self.free_block(old_pbi);
                    self.io.stats.reloc_cnt += 1;
                    break Ok(());
                }
                Err(Error::WriteError) | Err(Error::VerifyError) => {
                    self.declare_bad(dest, Error::WriteError, 0);
                    self.io.stats.retry_cnt += 1;
                    retries += 1;
                    if retries > self.cfg.max_write_retries {
                        break Err(Error::WriteError);
                    }
                }
                Err(e) => {
                    self.free_block(dest);
                    break Err(e);
                }
            }
        };
        self.wl_suspended = wl_was;
        result
    }

    /// Best-effort relocation after a read corrected too many bits.
    pub(crate) fn relocate_block(&mut self, pbi: u32, in_work_block: bool) {
        debug!("relocating degrading block {}", pbi);
        let result = if in_work_block {
            match self
                .work_in_use
                .iter()
                .map(|&i| i as usize)
                .find(|&i| self.work[i].pbi == pbi)
            {
                Some(wbi) => self.relocate_work_block(wbi, None),
                None => return,
            }
        } else {
            self.relocate_data_block(pbi, None)
        };
        if let Err(e) = result {
            warn!("relocation of block {} failed: {:?}", pbi, e);
        }
    }

    /// Relocate a block after the read-error callback reconstructed the
    /// sector at `pos`; the recovered bytes replace the unreadable page.
    pub(crate) fn relocate_with_patch(
        &mut self,
        pbi: u32,
        in_work_block: bool,
        pos: u32,
        brsi: u32,
        data: &[u8],
    ) {
        let result = if in_work_block {
            match self
                .work_in_use
                .iter()
                .map(|&i| i as usize)
                .find(|&i| self.work[i].pbi == pbi)
            {
                Some(wbi) => self.relocate_work_block(wbi, Some((pos, brsi as u16, data))),
                None => return,
            }
        } else {
            self.relocate_data_block(pbi, Some((pos, data)))
        };
        if let Err(e) = result {
            warn!("post-recovery relocation of block {} failed: {:?}", pbi, e);
        }
    }
}
