//! Physical-layer adapter.
//!
//! Everything above this module works on *virtual* blocks: a virtual block
//! is a group of 2^blocks_per_group_log2 physical blocks treated as one
//! erase unit, with their pages concatenated. The adapter also owns the
//! page and spare scratch buffers, applies or computes ECC per stripe, and
//! brackets raw accesses (bad-block markers, blank checks) with
//! ECC-off/raw-mode so the device does not report spurious bit errors on
//! signature bytes.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use nand_phy::{BadBlockMarking, DeviceInfo, EccStatus, NandPhy, PageIndex};

use crate::config::Config;
use crate::ecc::{EccEngine, EccOutcome, Hamming};
use crate::error::Error;
use crate::spare::{
    BlockKind, SectorStat, SpareCodec, BAD_BLOCK_SIG, BAD_BRSI_OFF, BAD_KIND_OFF, BAD_SIG_OFF,
};
use crate::stats::Stats;

pub(crate) const FORMAT_MAGIC: [u8; 4] = *b"SMAP";
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Virtual-block geometry derived from [DeviceInfo] and [Config].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub bytes_per_page: usize,
    pub bytes_per_spare: usize,
    /// log2 pages per physical block
    pub ppb_log2: u8,
    pub group_log2: u8,
    /// log2 pages per virtual block
    pub vppb_log2: u8,
    /// pages per virtual block
    pub vppb: u32,
    /// first physical block of the partition window
    pub first_block: u32,
    /// physical blocks inside the window
    pub num_phy_blocks: u32,
    /// virtual blocks inside the window
    pub num_vblocks: u32,
    pub num_stripes: usize,
    pub marking: BadBlockMarking,
}

/// Fields to place in the spare area of a page about to be programmed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteMeta {
    pub erase_cnt: Option<u32>,
    pub info: Option<BlockInfoMeta>,
    pub stat: Option<SectorStat>,
    pub brsi: Option<u16>,
    pub num_sectors: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockInfoMeta {
    pub lbi: u16,
    pub kind: BlockKind,
    pub block_cnt: u8,
    pub merge_cnt: u8,
}

/// Spare-area fields of a page, decoded after ECC.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageMeta {
    pub blank: bool,
    pub erase_cnt: u32,
    pub lbi: u16,
    pub kind: BlockKind,
    pub block_cnt: u8,
    pub merge_cnt: u8,
    pub stat: SectorStat,
    pub brsi: u16,
    pub num_sectors: u16,
    pub corrected_bits: u8,
}

/// Source of the main-area bytes for a page program.
pub(crate) enum MainSrc<'a> {
    /// Caller-provided full page.
    Borrowed(&'a [u8]),
    /// The adapter's scratch buffer, prepared by the caller.
    Scratch,
    /// No main data; the main area stays erased. ECC still covers the
    /// blank content so later reads verify.
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BadState {
    Good,
    Factory,
    Driver,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FormatInfo {
    pub version: u16,
    pub num_phy_blocks: u32,
    pub pages_per_block: u32,
    pub num_work_blocks: u16,
    pub group_log2: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorInfo {
    pub write_protected: bool,
    pub has_fatal_error: bool,
    pub error_code: u16,
    pub error_sector: u32,
}

pub(crate) struct PhyIo<P: NandPhy> {
    phy: P,
    pub geo: Geometry,
    pub codec: SpareCodec,
    ecc: Option<Box<dyn EccEngine>>,
    ecc_len: usize,
    ld_block: u8,
    /// Corrected-bit count substituted when the device reports
    /// "corrected, count unknown".
    unknown_count_value: u8,
    verify_write: bool,
    verify_erase: bool,
    buf_main: Vec<u8>,
    buf_spare: Vec<u8>,
    pub stats: Stats,
}

impl<P: NandPhy> PhyIo<P> {
    pub fn new(mut phy: P, info: DeviceInfo, cfg: &Config) -> Result<Self, Error> {
        let bytes_per_page = info.bytes_per_page();
        let bytes_per_spare = info.bytes_per_spare_area as usize;
        if cfg.first_block >= info.num_blocks {
            return Err(Error::InvalidParameter);
        }
        let mut num_phy_blocks = info.num_blocks - cfg.first_block;
        if cfg.max_num_blocks != 0 {
            num_phy_blocks = num_phy_blocks.min(cfg.max_num_blocks);
        }
        let group_log2 = cfg.blocks_per_group_log2;
        let num_vblocks = num_phy_blocks >> group_log2;
        let vppb_log2 = info.pages_per_block_log2 + group_log2;

        let hw = info.ecc.has_hw_ecc;
        let (ecc, ecc_len, ld_block): (Option<Box<dyn EccEngine>>, usize, u8) = if hw {
            (None, 0, info.ecc.bytes_per_block_log2)
        } else {
            let engine = Hamming::new(9);
            let len = engine.ecc_len();
            (Some(Box::new(engine)), len, 9)
        };
        let num_stripes = bytes_per_page >> ld_block;
        if num_stripes < 4 || bytes_per_spare % num_stripes != 0 {
            return Err(Error::InvalidParameter);
        }
        let stripe_len = bytes_per_spare / num_stripes;
        if stripe_len < 8 + ecc_len {
            return Err(Error::InvalidParameter);
        }
        if num_vblocks < 8 {
            return Err(Error::InvalidParameter);
        }
        if hw {
            phy.enable_ecc().map_err(|e| Error::from_phy(&e, Error::ReadError))?;
        }

        Ok(PhyIo {
            phy,
            geo: Geometry {
                bytes_per_page,
                bytes_per_spare,
                ppb_log2: info.pages_per_block_log2,
                group_log2,
                vppb_log2,
                vppb: 1 << vppb_log2,
                first_block: cfg.first_block,
                num_phy_blocks,
                num_vblocks,
                num_stripes,
                marking: info.bad_block_marking,
            },
            codec: SpareCodec::new(bytes_per_spare, num_stripes),
            ecc,
            ecc_len,
            ld_block,
            unknown_count_value: if cfg.max_bit_error_cnt != 0 {
                cfg.max_bit_error_cnt
            } else {
                info.ecc.bits_correctable
            },
            verify_write: cfg.verify_write,
            verify_erase: cfg.verify_erase,
            buf_main: vec![0xFF; bytes_per_page],
            buf_spare: vec![0xFF; bytes_per_spare],
            stats: Stats::default(),
        })
    }

    pub fn into_phy(mut self) -> P {
        self.phy.deinit();
        self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn phy_write_protected(&mut self) -> bool {
        self.phy.is_write_protected().unwrap_or(false)
    }

    /// Physical page index of page `off` within virtual block `vb`.
    fn vpage(&self, vb: u32, off: u32) -> PageIndex {
        let member = off >> self.geo.ppb_log2;
        let page_in_block = off & ((1 << self.geo.ppb_log2) - 1);
        let phy_block = self.geo.first_block + (vb << self.geo.group_log2) + member;
        PageIndex::new((phy_block << self.geo.ppb_log2) + page_in_block)
    }

    fn decode_meta(&self, blank: bool, corrected: u8) -> PageMeta {
        let s = &self.buf_spare;
        PageMeta {
            blank,
            erase_cnt: self.codec.erase_cnt(s),
            lbi: self.codec.lbi(s),
            kind: self.codec.block_kind(s),
            block_cnt: self.codec.block_cnt(s),
            merge_cnt: self.codec.merge_cnt(s),
            stat: self.codec.sector_stat(s),
            brsi: self.codec.brsi(s),
            num_sectors: self.codec.num_sectors(s),
            corrected_bits: corrected,
        }
    }

    /// Read one page with ECC, decoding the spare-area fields.
    ///
    /// The main area lands in `main_out`, or in the internal scratch buffer
    /// when no buffer is given. On [Error::UncorrectableBitErrors] the
    /// buffer holds the raw, uncorrected bytes.
    pub fn read_page(
        &mut self,
        vb: u32,
        off: u32,
        mut main_out: Option<&mut [u8]>,
    ) -> Result<PageMeta, Error> {
        let page = self.vpage(vb, off);
        let main: &mut [u8] = match main_out.as_deref_mut() {
            Some(m) => m,
            None => &mut self.buf_main,
        };
        self.phy
            .read_ex(page, Some(&mut main[..]), 0, Some(&mut self.buf_spare), 0)
            .map_err(|e| {
                self.stats.read_error_cnt += 1;
                Error::from_phy(&e, Error::ReadError)
            })?;

        if self.codec.is_blank(&self.buf_spare) {
            return Ok(self.decode_meta(true, 0));
        }

        let mut corrected = 0u8;
        if let Some(engine) = self.ecc.as_deref() {
            let blk = 1usize << self.ld_block;
            for s in 0..self.geo.num_stripes {
                let mut meta = self.codec.meta(&self.buf_spare, s);
                let stored = self.codec.ecc_bytes(&self.buf_spare, s, self.ecc_len);
                let mut ecc = [0u8; 8];
                ecc[..self.ecc_len].copy_from_slice(stored);
                let outcome = engine.apply(&mut main[s * blk..(s + 1) * blk], &mut meta, &ecc[..self.ecc_len]);
                match outcome {
                    EccOutcome::NoError => {}
                    EccOutcome::Corrected(n) => {
                        corrected = corrected.max(n);
                        self.codec.set_meta(&mut self.buf_spare, s, meta);
                    }
                    EccOutcome::ErrorInEcc => corrected = corrected.max(1),
                    EccOutcome::Uncorrectable => {
                        self.stats.read_error_cnt += 1;
                        return Err(Error::UncorrectableBitErrors);
                    }
                }
            }
        } else {
            let result = self
                .phy
                .ecc_result()
                .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
            corrected = match result.status {
                EccStatus::NotApplied | EccStatus::Ok => 0,
                EccStatus::Corrected => result.max_bits_corrected,
                EccStatus::CorrectedUnknownCount => self.unknown_count_value,
                EccStatus::Uncorrectable => {
                    self.stats.read_error_cnt += 1;
                    return Err(Error::UncorrectableBitErrors);
                }
            };
        }
        if corrected > 0 {
            self.stats.read_ecc_corrected_cnt += 1;
        }
        Ok(self.decode_meta(false, corrected))
    }

    /// Program one page: spare-area fields, per-stripe ECC and main data.
    pub fn write_page(
        &mut self,
        vb: u32,
        off: u32,
        main: MainSrc<'_>,
        meta: &WriteMeta,
    ) -> Result<(), Error> {
        let page = self.vpage(vb, off);
        if let MainSrc::Blank = main {
            self.buf_main.fill(0xFF);
        }
        let (src, write_main): (&[u8], bool) = match main {
            MainSrc::Borrowed(m) => (m, true),
            MainSrc::Scratch => (&self.buf_main, true),
            MainSrc::Blank => (&self.buf_main, false),
        };

        self.buf_spare.fill(0xFF);
        if let Some(ec) = meta.erase_cnt {
            self.codec.set_erase_cnt(&mut self.buf_spare, ec);
        }
        if let Some(info) = meta.info {
            self.codec.set_lbi(&mut self.buf_spare, info.lbi);
            self.codec
                .set_block_kind_cnt(&mut self.buf_spare, info.kind, info.block_cnt);
            self.codec.set_merge_cnt(&mut self.buf_spare, info.merge_cnt);
        }
        if let Some(stat) = meta.stat {
            self.codec.set_sector_stat(&mut self.buf_spare, stat);
        }
        if let Some(brsi) = meta.brsi {
            self.codec.set_brsi(&mut self.buf_spare, brsi);
        }
        if let Some(n) = meta.num_sectors {
            self.codec.set_num_sectors(&mut self.buf_spare, n);
        }

        if let Some(engine) = self.ecc.as_deref() {
            let blk = 1usize << self.ld_block;
            for s in 0..self.geo.num_stripes {
                let meta_bytes = self.codec.meta(&self.buf_spare, s);
                let ecc = self.codec.ecc_bytes_mut(&mut self.buf_spare, s, self.ecc_len);
                engine.calc(&src[s * blk..(s + 1) * blk], &meta_bytes, ecc);
            }
        }

        let main_arg = if write_main { Some(src) } else { None };
        self.phy
            .write_ex(page, main_arg, 0, Some(&self.buf_spare), 0)
            .map_err(|e| Error::from_phy(&e, Error::WriteError))?;

        // Readback verification, chunked to avoid a second page buffer.
        if self.verify_write {
            let mut chunk = [0u8; 64];
            if write_main {
                let mut off = 0usize;
                while off < self.geo.bytes_per_page {
                    let n = chunk.len().min(self.geo.bytes_per_page - off);
                    self.phy
                        .read(page, off as u32, &mut chunk[..n])
                        .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
                    if chunk[..n] != src[off..off + n] {
                        return Err(Error::VerifyError);
                    }
                    off += n;
                }
            }
            let mut off = 0usize;
            while off < self.geo.bytes_per_spare {
                let n = chunk.len().min(self.geo.bytes_per_spare - off);
                self.phy
                    .read_ex(page, None, 0, Some(&mut chunk[..n]), off as u32)
                    .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
                if chunk[..n] != self.buf_spare[off..off + n] {
                    return Err(Error::VerifyError);
                }
                off += n;
            }
        }
        Ok(())
    }

    /// Erase every physical block of virtual block `vb`.
    pub fn erase_vblock(&mut self, vb: u32) -> Result<(), Error> {
        for member in 0..1u32 << self.geo.group_log2 {
            let first_page = self.vpage(vb, member << self.geo.ppb_log2);
            self.phy
                .erase_block(first_page)
                .map_err(|e| Error::from_phy(&e, Error::EraseError))?;
        }
        self.stats.erase_cnt += 1;
        if self.verify_erase {
            for off in 0..self.geo.vppb {
                if !self.page_is_blank(vb, off)? {
                    return Err(Error::VerifyError);
                }
            }
        }
        Ok(())
    }

    /// Raw blank check of one page (main and spare), ECC off.
    pub fn page_is_blank(&mut self, vb: u32, off: u32) -> Result<bool, Error> {
        let page = self.vpage(vb, off);
        let _ = self.phy.disable_ecc();
        let _ = self.phy.set_raw_mode(true);
        let result = self.blank_check_raw(page);
        let _ = self.phy.set_raw_mode(false);
        let _ = self.phy.enable_ecc();
        result
    }

    fn blank_check_raw(&mut self, page: PageIndex) -> Result<bool, Error> {
        let mut chunk = [0u8; 64];
        let mut off = 0usize;
        while off < self.geo.bytes_per_page {
            let n = chunk.len().min(self.geo.bytes_per_page - off);
            self.phy
                .read(page, off as u32, &mut chunk[..n])
                .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
            if chunk[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            off += n;
        }
        let mut off = 0usize;
        while off < self.geo.bytes_per_spare {
            let n = chunk.len().min(self.geo.bytes_per_spare - off);
            self.phy
                .read_ex(page, None, 0, Some(&mut chunk[..n]), off as u32)
                .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
            if chunk[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            off += n;
        }
        Ok(true)
    }

    /// In-device page copy. `Ok(false)` means the device cannot and the
    /// caller must fall back to read + write.
    pub fn copy_page(
        &mut self,
        src_vb: u32,
        src_off: u32,
        dst_vb: u32,
        dst_off: u32,
    ) -> Result<bool, Error> {
        let src = self.vpage(src_vb, src_off);
        let dst = self.vpage(dst_vb, dst_off);
        self.phy
            .copy_page(src, dst)
            .map_err(|e| Error::from_phy(&e, Error::WriteError))
    }

    // ---- bad-block handling ----

    /// A marker byte counts as bad with two or more zero bits, so a single
    /// flipped bit in the marker of a good block does not condemn it.
    fn marker_is_bad(byte: u8) -> bool {
        byte.count_zeros() >= 2
    }

    /// Inspect the factory/driver bad-block state of a virtual block,
    /// ECC off and raw.
    pub fn bad_state(&mut self, vb: u32) -> Result<BadState, Error> {
        let _ = self.phy.disable_ecc();
        let _ = self.phy.set_raw_mode(true);
        let result = self.bad_state_raw(vb);
        let _ = self.phy.set_raw_mode(false);
        let _ = self.phy.enable_ecc();
        result
    }

    fn bad_state_raw(&mut self, vb: u32) -> Result<BadState, Error> {
        let ppb = 1u32 << self.geo.ppb_log2;
        let (first, second, last) = self.geo.marking.marker_pages();
        let dup = self.geo.marking.has_duplicate_marker();
        let mut bad = false;
        for member in 0..1u32 << self.geo.group_log2 {
            let base = member << self.geo.ppb_log2;
            let mut pages = [0u32; 3];
            let mut n = 0;
            if first {
                pages[n] = base;
                n += 1;
            }
            if second {
                pages[n] = base + 1;
                n += 1;
            }
            if last {
                pages[n] = base + ppb - 1;
                n += 1;
            }
            for &p in &pages[..n] {
                let mut marker = [0u8; 2];
                let len = if dup { 2 } else { 1 };
                self.phy
                    .read_ex(self.vpage(vb, p), None, 0, Some(&mut marker[..len]), 0)
                    .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
                if marker[..len].iter().any(|&b| Self::marker_is_bad(b)) {
                    bad = true;
                }
            }
        }
        if !bad {
            return Ok(BadState::Good);
        }
        // The driver signature tells its own marks from factory defects.
        let mut sig = [0u8; 4];
        self.phy
            .read_ex(
                self.vpage(vb, 0),
                None,
                0,
                Some(&mut sig),
                BAD_SIG_OFF as u32,
            )
            .map_err(|e| Error::from_phy(&e, Error::ReadError))?;
        if sig == BAD_BLOCK_SIG {
            Ok(BadState::Driver)
        } else {
            Ok(BadState::Factory)
        }
    }

    /// Mark a virtual block bad: zero the status byte and write the driver
    /// signature plus error kind and BRSI into every physical page.
    /// Best effort; a block failing even this stays unusable either way.
    pub fn mark_bad(&mut self, vb: u32, error: Error, brsi: u16) {
        self.stats.mark_bad_cnt += 1;
        warn!(
            "marking block {} bad (code {}, brsi {})",
            vb,
            error.code(),
            brsi
        );
        let mut img = [0xFFu8; BAD_BRSI_OFF + 2];
        img[0] = 0x00;
        img[1] = 0x00;
        img[BAD_SIG_OFF..BAD_SIG_OFF + 4].copy_from_slice(&BAD_BLOCK_SIG);
        img[BAD_KIND_OFF..BAD_KIND_OFF + 2].copy_from_slice(&error.code().to_be_bytes());
        img[BAD_BRSI_OFF..BAD_BRSI_OFF + 2].copy_from_slice(&brsi.to_be_bytes());
        let _ = self.phy.disable_ecc();
        let _ = self.phy.set_raw_mode(true);
        for off in 0..self.geo.vppb {
            let page = self.vpage(vb, off);
            let _ = self.phy.write_ex(page, None, 0, Some(&img), 0);
        }
        let _ = self.phy.set_raw_mode(false);
        let _ = self.phy.enable_ecc();
    }

    // ---- format-info and error-info pages ----
    //
    // Both live in the partition's first usable block: the format info in
    // its first page, the error info at BRSI 1.

    pub fn write_format_info(
        &mut self,
        vb: u32,
        erase_cnt: u32,
        num_work_blocks: u16,
    ) -> Result<(), Error> {
        self.buf_main.fill(0xFF);
        let ppb = 1u32 << self.geo.ppb_log2;
        self.buf_main[0..4].copy_from_slice(&FORMAT_MAGIC);
        self.buf_main[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        self.buf_main[6..10].copy_from_slice(&self.geo.num_phy_blocks.to_be_bytes());
        self.buf_main[10..14].copy_from_slice(&ppb.to_be_bytes());
        self.buf_main[14..16].copy_from_slice(&num_work_blocks.to_be_bytes());
        self.buf_main[16] = self.geo.group_log2;
        let meta = WriteMeta {
            erase_cnt: Some(erase_cnt),
            ..Default::default()
        };
        self.write_page(vb, 0, MainSrc::Scratch, &meta)
    }

    pub fn read_format_info(&mut self, vb: u32) -> Result<Option<FormatInfo>, Error> {
        let meta = self.read_page(vb, 0, None)?;
        if meta.blank {
            return Ok(None);
        }
        let m = &self.buf_main;
        if m[0..4] != FORMAT_MAGIC {
            return Ok(None);
        }
        Ok(Some(FormatInfo {
            version: u16::from_be_bytes([m[4], m[5]]),
            num_phy_blocks: u32::from_be_bytes([m[6], m[7], m[8], m[9]]),
            pages_per_block: u32::from_be_bytes([m[10], m[11], m[12], m[13]]),
            num_work_blocks: u16::from_be_bytes([m[14], m[15]]),
            group_log2: m[16],
        }))
    }

    pub fn write_error_info(&mut self, vb: u32, info: &ErrorInfo) -> Result<(), Error> {
        self.buf_main.fill(0xFF);
        self.buf_main[0] = info.write_protected as u8;
        self.buf_main[1] = info.has_fatal_error as u8;
        self.buf_main[2..4].copy_from_slice(&info.error_code.to_be_bytes());
        self.buf_main[4..8].copy_from_slice(&info.error_sector.to_be_bytes());
        self.write_page(vb, 1, MainSrc::Scratch, &WriteMeta::default())
    }

    pub fn read_error_info(&mut self, vb: u32) -> Result<Option<ErrorInfo>, Error> {
        let meta = self.read_page(vb, 1, None)?;
        if meta.blank {
            return Ok(None);
        }
        let m = &self.buf_main;
        Ok(Some(ErrorInfo {
            write_protected: m[0] == 1,
            has_fatal_error: m[1] == 1,
            error_code: u16::from_be_bytes([m[2], m[3]]),
            error_sector: u32::from_be_bytes([m[4], m[5], m[6], m[7]]),
        }))
    }
}
