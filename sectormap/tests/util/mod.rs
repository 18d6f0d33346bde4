//! Shared helpers for the integration tests: simulated devices and
//! reproducible sector patterns.

#![allow(dead_code)]

use nand_phy::sim::{SimConfig, SimNand};
use nand_phy::BadBlockMarking;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sectormap::{Config, SectorMap};

pub const PAGE: usize = 2048;

/// 256 blocks of 64 pages, 2048-byte pages: the standard test device.
pub fn standard() -> SimConfig {
    SimConfig::default()
}

/// A smaller device for tests that iterate over many mounts.
pub fn small(num_blocks: u32, pages_per_block_log2: u8) -> SimConfig {
    SimConfig {
        bytes_per_page_log2: 11,
        bytes_per_spare_area: 64,
        pages_per_block_log2,
        num_blocks,
        bad_block_marking: BadBlockMarking::FirstPage,
    }
}

pub fn device(sim: SimNand, cfg: Config) -> SectorMap<SimNand> {
    SectorMap::new(sim, cfg).expect("device init")
}

/// Format a fresh simulated device and mount it.
pub fn formatted(sim_cfg: SimConfig, cfg: Config) -> SectorMap<SimNand> {
    let mut dev = device(SimNand::new(sim_cfg), cfg);
    dev.low_level_format().expect("low-level format");
    dev.low_level_mount().expect("mount");
    dev
}

/// Remount a device in place, keeping the simulated medium.
pub fn remount(dev: SectorMap<SimNand>, cfg: Config) -> SectorMap<SimNand> {
    let mut sim = dev.into_phy();
    sim.power_restore();
    let mut dev = device(sim, cfg);
    dev.low_level_mount().expect("remount");
    dev
}

/// Reproducible pseudo-random sector contents.
pub fn pattern(seed: u64) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE];
    SmallRng::seed_from_u64(seed).fill_bytes(&mut buf);
    buf
}

pub fn assert_sector(dev: &mut SectorMap<SimNand>, sector: u32, expected: &[u8]) {
    let mut buf = vec![0u8; PAGE];
    dev.read_sectors(sector, 1, &mut buf).expect("read");
    assert_eq!(buf, expected, "sector {sector} mismatch");
}

pub fn write_sector(dev: &mut SectorMap<SimNand>, sector: u32, data: &[u8]) {
    dev.write_sectors(sector, 1, data, false).expect("write");
}

/// Find the physical page whose main area starts with the first 16 bytes of
/// `expected` and flip the given main-area bits in it. Test patterns are
/// unique per sector, so the prefix identifies the backing page.
pub fn corrupt_page_matching(
    dev: &mut SectorMap<SimNand>,
    expected: &[u8],
    flips: &[(usize, u8)],
) {
    use nand_phy::{NandPhy, PageIndex};
    let sim = dev.phy_mut();
    let mut page = 0u32;
    loop {
        let mut probe = [0u8; 16];
        if sim.read(PageIndex::new(page), 0, &mut probe).is_err() {
            break;
        }
        if probe == expected[..16] {
            for &(byte, bit) in flips {
                sim.flip_main_bit(page, byte, bit);
            }
            return;
        }
        page += 1;
    }
    panic!("page contents not found on the medium");
}
