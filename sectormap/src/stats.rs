/// Operation counters, reset at mount or via [crate::SectorMap::stats_reset].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    /// Logical sectors read
    pub read_sector_cnt: u32,
    /// Logical sectors written
    pub write_sector_cnt: u32,
    /// Pages whose read needed ECC correction
    pub read_ecc_corrected_cnt: u32,
    /// Reads that failed (device error or uncorrectable)
    pub read_error_cnt: u32,
    /// Work-block merges performed
    pub convert_cnt: u32,
    /// Sectors copied during merges and relocations
    pub copy_sector_cnt: u32,
    /// Block erases issued
    pub erase_cnt: u32,
    /// Blocks relocated (bit-error threshold or wear leveling)
    pub reloc_cnt: u32,
    /// Blocks marked bad by the driver
    pub mark_bad_cnt: u32,
    /// Operations retried on a fresh block after a program failure
    pub retry_cnt: u32,
}
