//! Read-only device variant.

mod util;

use sectormap::{Config, Error, ReadOnlySectorMap};
use test_log::test;
use util::*;

/// An unreadable page reached through the wrapper still runs the fatal
/// handler: the error-info page lands on the medium and the next mount of
/// the inner device comes up read-only.
#[test]
fn fatal_error_through_readonly_wrapper_persists() {
    let mut dev = formatted(standard(), Config::default());
    let sector = 40u32;
    let data = pattern(u64::from(sector) + 50_000);
    write_sector(&mut dev, sector, &data);
    dev.clean().expect("clean");
    // Two flipped bits in one ECC block make the page uncorrectable.
    corrupt_page_matching(&mut dev, &data, &[(0, 0), (1, 3)]);

    let mut ro = ReadOnlySectorMap::new(dev);
    let mut buf = vec![0u8; PAGE];
    assert_eq!(
        ro.read_sectors(sector, 1, &mut buf),
        Err(Error::UncorrectableBitErrors)
    );
    assert!(ro.disk_info().has_fatal_error);

    let mut inner = ro.into_inner();
    inner.unmount();
    let mut dev = remount(inner, Config::default());
    let info = dev.disk_info();
    assert!(info.has_fatal_error, "fatal latch did not survive the remount");
    assert!(info.is_write_protected);
    assert_eq!(dev.write_sectors(0, 1, &data, false), Err(Error::FatalError));
}

#[test]
fn readonly_wrapper_reads_but_never_writes() {
    let mut dev = formatted(standard(), Config::default());
    let data = pattern(3);
    write_sector(&mut dev, 12, &data);
    dev.clean().expect("clean");

    let mut ro = ReadOnlySectorMap::new(dev);
    let mut buf = vec![0u8; PAGE];
    ro.read_sectors(12, 1, &mut buf).expect("ro read");
    assert_eq!(buf, data);

    assert_eq!(ro.write_sectors(0, 1, &data, false), Err(Error::WriteProtected));
    assert_eq!(ro.free_sectors(12, 1), Err(Error::WriteProtected));
    assert_eq!(ro.clean(), Err(Error::WriteProtected));
    assert_eq!(ro.low_level_format(), Err(Error::WriteProtected));

    // Nothing was disturbed on the medium.
    let sim = ro.into_inner().into_phy();
    let writes_after = sim.stats().writes;
    let mut dev = device(sim, Config::default());
    dev.low_level_mount().expect("mount");
    assert_eq!(dev.phy_mut().stats().writes, writes_after);
    assert_sector(&mut dev, 12, &data);
}
