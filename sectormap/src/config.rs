/// Driver configuration, fixed at mount time.
///
/// Runtime-adjustable knobs (`max_erase_cnt_diff`, `max_bit_error_cnt`,
/// clean thresholds) have setters on the device as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// First physical block of the partition window.
    pub first_block: u32,
    /// Maximum number of physical blocks to use, 0 = whole device.
    pub max_num_blocks: u32,
    /// Configured number of work blocks. The effective count is
    /// `max(configured, value stored at format time)`, clamped to 3..=10.
    pub num_work_blocks: u32,
    /// Percentage of blocks kept back as bad-block replacement headroom,
    /// capped at 25.
    pub pct_of_blocks_reserved: u8,
    /// Active wear leveling kicks in when the erase-count spread reaches
    /// this value.
    pub max_erase_cnt_diff: u32,
    /// Relocate a block once a read corrects at least this many bits in
    /// one ECC block. 0 disables relocation.
    pub max_bit_error_cnt: u8,
    /// Fast-write reservation: number of free blocks to maintain.
    pub num_blocks_free: u32,
    /// Fast-write reservation: number of free work-block sectors to
    /// maintain.
    pub num_sectors_free: u32,
    /// Leave unused sectors erased during a merge instead of programming
    /// them with zeros. Determines the fill pattern of never-written
    /// sectors (0xFF vs 0x00).
    pub allow_blank_unused_sectors: bool,
    /// Mark a block bad when a read fails or is uncorrectable.
    pub allow_read_error_bad_blocks: bool,
    /// Let the low-level format reuse driver-marked bad blocks.
    /// Factory-marked blocks are never reclaimed.
    pub reclaim_driver_bad_blocks: bool,
    /// Read back every programmed page and compare.
    pub verify_write: bool,
    /// Blank-check every erased block.
    pub verify_erase: bool,
    /// Check the previously written page of a work block after each
    /// append and relocate on excessive corrected bits.
    pub handle_write_disturb: bool,
    /// log2 of the number of physical blocks per virtual block.
    pub blocks_per_group_log2: u8,
    /// How many fresh destination blocks a failed program or merge may
    /// consume before the error is fatal.
    pub max_write_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            first_block: 0,
            max_num_blocks: 0,
            num_work_blocks: 4,
            pct_of_blocks_reserved: 5,
            max_erase_cnt_diff: 500,
            max_bit_error_cnt: 1,
            num_blocks_free: 0,
            num_sectors_free: 0,
            allow_blank_unused_sectors: true,
            allow_read_error_bad_blocks: true,
            reclaim_driver_bad_blocks: false,
            verify_write: false,
            verify_erase: false,
            handle_write_disturb: false,
            blocks_per_group_log2: 0,
            max_write_retries: 3,
        }
    }
}

impl Config {
    pub(crate) fn normalized(mut self) -> Self {
        self.num_work_blocks = self.num_work_blocks.clamp(3, 10);
        self.pct_of_blocks_reserved = self.pct_of_blocks_reserved.min(25);
        self
    }
}
