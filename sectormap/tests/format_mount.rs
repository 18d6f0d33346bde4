//! Format and mount behavior.

mod util;

use nand_phy::sim::SimNand;
use sectormap::{Config, Error, SectorUsage};
use test_log::test;
use util::*;

#[test]
fn mount_without_format_fails() {
    let mut dev = device(SimNand::new(standard()), Config::default());
    assert!(!dev.is_low_level_formatted().unwrap());
    assert_eq!(dev.low_level_mount(), Err(Error::NotFormatted));
}

#[test]
fn format_then_mount_is_empty() {
    let mut dev = formatted(standard(), Config::default());
    assert!(dev.is_mounted());
    let info = dev.disk_info();
    assert!(info.num_sectors > 0);
    assert_eq!(info.bytes_per_sector, PAGE as u32);
    assert_eq!(info.num_bad_blocks, 0);
    // Every sector of a fresh format reads as empty fill.
    let fill = vec![0xFF; PAGE];
    for sector in [0, 1, 1000, info.num_sectors - 1] {
        assert_eq!(dev.get_sector_usage(sector).unwrap(), SectorUsage::Empty);
        assert_sector(&mut dev, sector, &fill);
    }
}

#[test]
fn sector_count_is_stable_across_mounts() {
    let mut dev = formatted(standard(), Config::default());
    let n = dev.sector_count();
    for _ in 0..3 {
        dev.unmount();
        dev = remount(dev, Config::default());
        assert_eq!(dev.sector_count(), n);
    }
}

#[test]
fn reads_fail_after_unmount() {
    let mut dev = formatted(standard(), Config::default());
    dev.unmount();
    let mut buf = vec![0u8; PAGE];
    assert_eq!(dev.read_sectors(0, 1, &mut buf), Err(Error::NotFormatted));
    assert_eq!(dev.write_sectors(0, 1, &buf, false), Err(Error::NotFormatted));
}

#[test]
fn out_of_range_is_rejected() {
    let mut dev = formatted(standard(), Config::default());
    let n = dev.sector_count();
    let mut buf = vec![0u8; PAGE];
    assert_eq!(dev.read_sectors(n, 1, &mut buf), Err(Error::OutOfRange));
    assert_eq!(
        dev.write_sectors(n - 1, 2, &buf, true),
        Err(Error::OutOfRange)
    );
    // Mis-sized buffer
    assert_eq!(
        dev.read_sectors(0, 2, &mut buf),
        Err(Error::InvalidParameter)
    );
}

#[test]
fn leading_factory_bad_blocks_shift_the_format_block() {
    let mut sim = SimNand::new(standard());
    sim.mark_factory_bad(0);
    sim.mark_factory_bad(1);
    let mut dev = device(sim, Config::default());
    dev.low_level_format().expect("format");
    dev.low_level_mount().expect("mount");
    assert_eq!(dev.disk_info().num_bad_blocks, 2);

    // Data written to such a device still round-trips over a remount.
    let data = pattern(7);
    write_sector(&mut dev, 5, &data);
    dev.unmount();
    let mut dev = remount(dev, Config::default());
    assert_sector(&mut dev, 5, &data);
}

#[test]
fn format_wipes_existing_data() {
    let mut dev = formatted(standard(), Config::default());
    let data = pattern(99);
    write_sector(&mut dev, 42, &data);
    dev.low_level_format().expect("reformat");
    dev.low_level_mount().expect("mount");
    assert_eq!(dev.get_sector_usage(42).unwrap(), SectorUsage::Empty);
    assert_sector(&mut dev, 42, &vec![0xFF; PAGE]);
}

#[test]
fn zero_fill_configuration_reads_zeros() {
    let cfg = Config {
        allow_blank_unused_sectors: false,
        ..Config::default()
    };
    let mut dev = formatted(standard(), cfg);
    assert_sector(&mut dev, 3, &vec![0x00; PAGE]);
}

#[test]
fn readback_verification_passes_on_a_healthy_device() {
    let cfg = Config {
        verify_write: true,
        verify_erase: true,
        ..Config::default()
    };
    let mut dev = formatted(small(32, 4), cfg);
    for s in 0..40u32 {
        write_sector(&mut dev, s, &pattern(u64::from(s)));
    }
    dev.clean().expect("clean");
    for s in 0..40u32 {
        assert_sector(&mut dev, s, &pattern(u64::from(s)));
    }
}

#[test]
fn format_preserves_erase_counts() {
    let mut dev = formatted(small(32, 4), Config::default());
    // Generate wear, then reformat.
    let data = pattern(1);
    for i in 0..200 {
        write_sector(&mut dev, i % 50, &data);
    }
    let before = dev.disk_info().erase_cnt_max;
    assert!(before > 0);
    dev.low_level_format().expect("reformat");
    dev.low_level_mount().expect("mount");
    assert!(dev.disk_info().erase_cnt_max >= before);
}
