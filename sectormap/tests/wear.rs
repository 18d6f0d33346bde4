//! Wear leveling and a randomized consistency workload.

mod util;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sectormap::Config;
use test_log::test;
use util::*;

/// A long workload hammering a few hot sectors must not let the erase-count
/// spread run away: active wear leveling drags cold blocks forward.
#[test]
fn erase_count_spread_stays_bounded() {
    let cfg = Config {
        max_erase_cnt_diff: 8,
        ..Config::default()
    };
    let mut dev = formatted(small(32, 4), cfg);
    let spb = 15u32;

    // Cold data that would otherwise never move again.
    for lbi in 0..8u32 {
        for brsi in 1..=spb {
            write_sector(&mut dev, lbi * spb + brsi - 1, &pattern(u64::from(lbi)));
        }
    }
    dev.clean().expect("clean");

    // Hot traffic on one logical block.
    let hot = 20 * spb;
    for round in 0..600u64 {
        write_sector(&mut dev, hot, &pattern(round));
    }

    let info = dev.disk_info();
    assert!(
        info.erase_cnt_max - info.erase_cnt_min <= 8 + 1,
        "spread {}..{} exceeds the configured bound",
        info.erase_cnt_min,
        info.erase_cnt_max
    );
    // The cold data survived being dragged around.
    for lbi in 0..8u32 {
        for brsi in 1..=spb {
            assert_sector(&mut dev, lbi * spb + brsi - 1, &pattern(u64::from(lbi)));
        }
    }
    assert_sector(&mut dev, hot, &pattern(599));
}

/// Random writes, trims, cleans and remounts against a RAM model: the
/// device must always read back what the model says.
#[test]
fn randomized_workload_matches_model() {
    let mut cfg = Config {
        max_erase_cnt_diff: 16,
        ..Config::default()
    };
    cfg.num_work_blocks = 3;
    let mut dev = formatted(small(48, 4), cfg);
    let sectors = dev.sector_count();
    let mut model: Vec<Option<u64>> = vec![None; sectors as usize];
    let mut rng = SmallRng::seed_from_u64(0x5EC7);

    for step in 0..4000u64 {
        match rng.gen_range(0..100) {
            0..=69 => {
                // Hot/cold skew: most writes in the first quarter.
                let sector = if rng.gen_bool(0.7) {
                    rng.gen_range(0..sectors / 4)
                } else {
                    rng.gen_range(0..sectors)
                };
                write_sector(&mut dev, sector, &pattern(step));
                model[sector as usize] = Some(step);
            }
            70..=79 => {
                let sector = rng.gen_range(0..sectors);
                dev.free_sectors(sector, 1).expect("trim");
                model[sector as usize] = None;
            }
            80..=89 => {
                let sector = rng.gen_range(0..sectors);
                let expected = match model[sector as usize] {
                    Some(seed) => pattern(seed),
                    None => vec![0xFF; PAGE],
                };
                assert_sector(&mut dev, sector, &expected);
            }
            90..=95 => {
                dev.clean_one().expect("clean_one");
            }
            _ => {
                dev.unmount();
                dev = remount(dev, cfg);
            }
        }
    }

    // Full sweep at the end, after one more power cycle.
    dev.unmount();
    let mut dev = remount(dev, cfg);
    for sector in 0..sectors {
        let expected = match model[sector as usize] {
            Some(seed) => pattern(seed),
            None => vec![0xFF; PAGE],
        };
        assert_sector(&mut dev, sector, &expected);
    }
}
