//! Bad-block handling, ECC damage and the fatal-error latch.

mod util;

use sectormap::{Config, Error, ReadErrorCallback, SectorMap, SectorUsage};
use test_log::test;
use util::*;

#[test]
fn factory_bad_blocks_are_skipped() {
    let mut sim = nand_phy::sim::SimNand::new(standard());
    for b in [10u32, 50, 200] {
        sim.mark_factory_bad(b);
    }
    let mut dev = device(sim, Config::default());
    dev.low_level_format().expect("format");
    dev.low_level_mount().expect("mount");
    assert_eq!(dev.disk_info().num_bad_blocks, 3);
    // Normal traffic never touches them.
    for s in 0..50u32 {
        write_sector(&mut dev, s * 63, &pattern(u64::from(s)));
    }
    for s in 0..50u32 {
        assert_sector(&mut dev, s * 63, &pattern(u64::from(s)));
    }
}

#[test]
fn write_failure_retires_the_block() {
    let mut dev = formatted(standard(), Config::default());
    let bad_before = dev.disk_info().num_bad_blocks;

    // Every program to block 17 fails from now on.
    dev.phy_mut().set_fail_write(17, true);
    let mut hit_it = false;
    for s in 0..400u32 {
        let data = pattern(u64::from(s));
        dev.write_sectors(s * 63 % dev.sector_count(), 1, &data, false)
            .expect("write must succeed on a replacement block");
        if dev.disk_info().num_bad_blocks > bad_before {
            hit_it = true;
            break;
        }
    }
    assert!(hit_it, "allocator never picked the failing block");
    assert_eq!(dev.disk_info().num_bad_blocks, bad_before + 1);

    // The mark is on the medium: a remount sees the same count.
    dev.unmount();
    let dev = remount(dev, Config::default());
    assert_eq!(dev.disk_info().num_bad_blocks, bad_before + 1);
}

#[test]
fn erase_failure_retires_the_block() {
    let mut dev = formatted(standard(), Config::default());
    dev.phy_mut().set_fail_erase(30, true);
    let bad_before = dev.disk_info().num_bad_blocks;
    for s in 0..400u32 {
        let data = pattern(u64::from(s));
        dev.write_sectors((s * 63) % dev.sector_count(), 1, &data, false)
            .expect("write");
        if dev.disk_info().num_bad_blocks > bad_before {
            return;
        }
    }
    panic!("allocator never tried the failing block");
}

struct Recover {
    data: Vec<u8>,
    calls: u32,
}

impl ReadErrorCallback for Recover {
    fn recover(&mut self, _sector: u32, buf: &mut [u8]) -> bool {
        self.calls += 1;
        buf.copy_from_slice(&self.data);
        true
    }
}

struct NoRecover;

impl ReadErrorCallback for NoRecover {
    fn recover(&mut self, _sector: u32, _buf: &mut [u8]) -> bool {
        false
    }
}

/// Find the physical page currently backing a sector by scanning the
/// simulated spare areas for its staged or committed copy, then flip two
/// main-area bits so the ECC cannot correct the page.
fn corrupt_sector_page(dev: &mut SectorMap<nand_phy::sim::SimNand>, sector: u32) {
    // Committed data lives at page (pbi << ppb_log2) + brsi; easiest is to
    // clean first so the sector is in a data block, then find it by
    // content. The test patterns are unique per sector.
    dev.clean().expect("clean");
    let expected = pattern(u64::from(sector) + 40_000);
    let sim = dev.phy_mut();
    let total_pages = 256 * 64u32;
    for page in 0..total_pages {
        let mut probe = [0u8; 16];
        use nand_phy::{NandPhy, PageIndex};
        sim.read(PageIndex::new(page), 0, &mut probe).unwrap();
        if probe == expected[..16] {
            sim.flip_main_bit(page, 0, 0);
            sim.flip_main_bit(page, 1, 3);
            return;
        }
    }
    panic!("sector contents not found on the medium");
}

#[test]
fn uncorrectable_error_recovers_via_callback() {
    let mut dev = formatted(standard(), Config::default());
    let sector = 130u32;
    let data = pattern(u64::from(sector) + 40_000);
    write_sector(&mut dev, sector, &data);
    corrupt_sector_page(&mut dev, sector);

    dev.set_read_error_callback(Box::new(Recover {
        data: data.clone(),
        calls: 0,
    }));
    // The read succeeds with the recovered bytes and the block is moved.
    assert_sector(&mut dev, sector, &data);
    assert!(dev.stats().reloc_cnt > 0);
    assert!(!dev.has_fatal_error());

    // Subsequent reads hit the relocated copy; no callback needed.
    dev.set_read_error_callback(Box::new(NoRecover));
    assert_sector(&mut dev, sector, &data);
}

#[test]
fn unrecovered_error_latches_read_only() {
    let mut dev = formatted(standard(), Config::default());
    let sector = 130u32;
    let data = pattern(u64::from(sector) + 40_000);
    write_sector(&mut dev, sector, &data);
    write_sector(&mut dev, 7, &pattern(7));
    corrupt_sector_page(&mut dev, sector);

    let mut buf = vec![0u8; PAGE];
    assert_eq!(
        dev.read_sectors(sector, 1, &mut buf),
        Err(Error::UncorrectableBitErrors)
    );
    assert!(dev.has_fatal_error());

    // Writes are refused, other sectors still read.
    assert_eq!(
        dev.write_sectors(0, 1, &data, false),
        Err(Error::FatalError)
    );
    assert_sector(&mut dev, 7, &pattern(7));

    // The latch is persistent: a remount is still read-only.
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    assert!(dev.has_fatal_error());
    assert_eq!(
        dev.write_sectors(0, 1, &data, false),
        Err(Error::FatalError)
    );
    assert_sector(&mut dev, 7, &pattern(7));
}

#[test]
fn single_bit_error_is_corrected_and_block_moved() {
    let cfg = Config {
        max_bit_error_cnt: 1,
        ..Config::default()
    };
    let mut dev = formatted(standard(), cfg);
    let sector = 64u32;
    let data = pattern(u64::from(sector) + 40_000);
    write_sector(&mut dev, sector, &data);
    dev.clean().expect("clean");

    // Flip exactly one bit in the page that holds the sector.
    let expected = data.clone();
    {
        use nand_phy::{NandPhy, PageIndex};
        let sim = dev.phy_mut();
        let mut found = false;
        for page in 0..(256 * 64u32) {
            let mut probe = [0u8; 16];
            sim.read(PageIndex::new(page), 0, &mut probe).unwrap();
            if probe == expected[..16] {
                sim.flip_main_bit(page, 100, 5);
                found = true;
                break;
            }
        }
        assert!(found);
    }
    let relocs = dev.stats().reloc_cnt;
    assert_sector(&mut dev, sector, &expected);
    assert!(dev.stats().read_ecc_corrected_cnt > 0);
    assert!(dev.stats().reloc_cnt > relocs, "degrading block not moved");
    // After relocation the data is clean again.
    assert_sector(&mut dev, sector, &expected);
}

#[test]
fn trimmed_then_usage_unknown_never_panics() {
    let mut dev = formatted(standard(), Config::default());
    write_sector(&mut dev, 9, &pattern(9));
    dev.free_sectors(9, 1).expect("trim");
    assert_eq!(dev.get_sector_usage(9).unwrap(), SectorUsage::Empty);
}
