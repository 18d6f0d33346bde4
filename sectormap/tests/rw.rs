//! Sector read/write semantics: persistence, overwrite, trim, cleaning and
//! the fast-write reservation.

mod util;

use sectormap::{Config, SectorUsage};
use test_log::test;
use util::*;

#[test]
fn single_sector_survives_remount() {
    // Write one sector of 0xA5 to LBI 0, BRSI 3 and power cycle.
    let mut dev = formatted(standard(), Config::default());
    let spb = PAGE as u32; // bytes per sector
    assert_eq!(dev.bytes_per_sector(), spb);
    let data = vec![0xA5; PAGE];
    let sector = 2; // BRSI 3 of LBI 0
    write_sector(&mut dev, sector, &data);
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    assert_sector(&mut dev, sector, &data);
    // Every other sector still reads the fill pattern.
    let fill = vec![0xFF; PAGE];
    for other in [0u32, 1, 3, 100, dev.sector_count() - 1] {
        assert_sector(&mut dev, other, &fill);
    }
}

#[test]
fn last_write_wins() {
    let mut dev = formatted(standard(), Config::default());
    for round in 0..5u64 {
        let data = pattern(round);
        write_sector(&mut dev, 17, &data);
    }
    assert_sector(&mut dev, 17, &pattern(4));
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    assert_sector(&mut dev, 17, &pattern(4));
}

#[test]
fn multi_sector_and_repeat_same() {
    let mut dev = formatted(standard(), Config::default());
    let mut bulk = Vec::new();
    for s in 0..8u64 {
        bulk.extend_from_slice(&pattern(100 + s));
    }
    dev.write_sectors(10, 8, &bulk, false).expect("bulk write");
    for s in 0..8u32 {
        assert_sector(&mut dev, 10 + s, &pattern(100 + s as u64));
    }

    let same = pattern(55);
    dev.write_sectors(200, 16, &same, true).expect("repeat write");
    for s in 0..16u32 {
        assert_sector(&mut dev, 200 + s, &same);
    }
}

#[test]
fn writes_crossing_block_boundary() {
    let mut dev = formatted(standard(), Config::default());
    // 63 sectors per logical block on this geometry; span the seam.
    let first = 60;
    let mut bulk = Vec::new();
    for s in 0..8u64 {
        bulk.extend_from_slice(&pattern(700 + s));
    }
    dev.write_sectors(first, 8, &bulk, false).expect("write");
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    for s in 0..8u32 {
        assert_sector(&mut dev, first + s, &pattern(700 + s as u64));
    }
}

#[test]
fn trim_restores_fill_pattern() {
    let mut dev = formatted(standard(), Config::default());
    let data = pattern(9);
    write_sector(&mut dev, 33, &data);
    assert_eq!(dev.get_sector_usage(33).unwrap(), SectorUsage::Written);

    dev.free_sectors(33, 1).expect("trim");
    assert_eq!(dev.get_sector_usage(33).unwrap(), SectorUsage::Empty);
    assert_sector(&mut dev, 33, &vec![0xFF; PAGE]);

    // The invalidation itself is persistent.
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    assert_eq!(dev.get_sector_usage(33).unwrap(), SectorUsage::Empty);
    assert_sector(&mut dev, 33, &vec![0xFF; PAGE]);
}

#[test]
fn trim_survives_a_merge() {
    let mut dev = formatted(standard(), Config::default());
    let data = pattern(10);
    write_sector(&mut dev, 5, &data);
    write_sector(&mut dev, 6, &data);
    dev.clean().expect("clean");
    dev.free_sectors(5, 1).expect("trim");
    dev.clean().expect("clean");
    assert_sector(&mut dev, 5, &vec![0xFF; PAGE]);
    assert_sector(&mut dev, 6, &data);
}

#[test]
fn clean_is_idempotent() {
    let mut dev = formatted(standard(), Config::default());
    for s in 0..10 {
        write_sector(&mut dev, s * 70, &pattern(s as u64));
    }
    assert!(dev.clean_cnt() > 0);
    dev.clean().expect("clean");
    assert_eq!(dev.clean_cnt(), 0);
    // The second pass has nothing to do and says so.
    let more = dev.clean_one().expect("clean_one");
    assert!(!more);
    for s in 0..10 {
        assert_sector(&mut dev, s * 70, &pattern(s as u64));
    }
}

#[test]
fn lru_work_block_is_merged_on_pressure() {
    // Three work blocks; a fourth logical block forces the LRU (LBI 0)
    // to be converted to a data block.
    let cfg = Config {
        num_work_blocks: 3,
        ..Config::default()
    };
    let mut dev = formatted(standard(), cfg);
    let spb = 63u32;
    for lbi in 0..3u32 {
        for brsi in 1..=spb {
            let sector = lbi * spb + brsi - 1;
            write_sector(&mut dev, sector, &pattern(u64::from(sector)));
        }
    }
    let converts_before = dev.stats().convert_cnt;
    write_sector(&mut dev, 3 * spb, &pattern(9999));
    assert!(dev.stats().convert_cnt > converts_before);
    // LBI 0 reads back intact after its merge.
    for brsi in 1..=spb {
        let sector = brsi - 1;
        assert_sector(&mut dev, sector, &pattern(u64::from(sector)));
    }
    assert_sector(&mut dev, 3 * spb, &pattern(9999));
}

#[test]
fn fast_write_reservation_avoids_merges() {
    let mut dev = formatted(standard(), Config::default());
    // Dirty a few logical blocks first so there is something to clean.
    for lbi in 0..3u32 {
        write_sector(&mut dev, lbi * 63, &pattern(u64::from(lbi)));
    }
    dev.set_clean_threshold(1, 16).expect("threshold");
    let converts_before = dev.stats().convert_cnt;
    // A burst of 16 writes to one logical block must not trigger a merge.
    for brsi in 1..=16u32 {
        write_sector(&mut dev, 100 * 63 + brsi - 1, &pattern(u64::from(brsi)));
    }
    assert_eq!(dev.stats().convert_cnt, converts_before);
}

#[test]
fn block_grouping_round_trips() {
    // Two physical blocks per virtual block: 32 phy blocks become 16
    // virtual blocks of 32 pages.
    let cfg = Config {
        blocks_per_group_log2: 1,
        num_work_blocks: 3,
        ..Config::default()
    };
    let mut dev = formatted(small(32, 4), cfg);
    let spb = 31u32;
    // Fill one whole virtual block, forcing pages into both members, and
    // push it through a merge.
    for brsi in 1..=spb {
        write_sector(&mut dev, brsi - 1, &pattern(u64::from(brsi)));
    }
    dev.clean().expect("clean");
    dev.unmount();
    let mut dev = remount(dev, cfg);
    for brsi in 1..=spb {
        assert_sector(&mut dev, brsi - 1, &pattern(u64::from(brsi)));
    }
}

#[test]
fn stats_count_sector_traffic() {
    let mut dev = formatted(standard(), Config::default());
    let data = pattern(1);
    write_sector(&mut dev, 0, &data);
    let mut buf = vec![0u8; PAGE];
    dev.read_sectors(0, 1, &mut buf).unwrap();
    dev.read_sectors(1, 1, &mut buf).unwrap();
    let stats = dev.stats();
    assert_eq!(stats.write_sector_cnt, 1);
    assert_eq!(stats.read_sector_cnt, 2);
    dev.stats_reset();
    assert_eq!(dev.stats().read_sector_cnt, 0);
}
