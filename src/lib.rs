#![no_std]
// Must be first to share macros across crate
pub(crate) mod fmt;

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod address;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use address::{BlockIndex, ColumnAddress, PageIndex};

/// A trait that physical-layer implementations use to classify their errors.
pub trait PhyError {
    /// Convert a device specific error into a generic error kind
    fn kind(&self) -> PhyErrorKind;
}

/// A trait that [NandPhy] implementations can use to share an error type.
pub trait ErrorType {
    /// Errors returned by this physical layer.
    type Error: PhyError;
}

/// Physical-layer error kinds.
///
/// Implementations must map their error to one of these generic kinds
/// through the [`PhyError`] trait so the translation layer above can pick
/// the right recovery path.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum PhyErrorKind {
    /// The device could not complete a read operation.
    Read,

    /// The device reported a program failure. The target block is presumed
    /// damaged.
    Write,

    /// The device reported an erase failure. The target block is presumed
    /// damaged.
    Erase,

    /// The arguments are out of bounds.
    OutOfBounds,

    /// Error specific to the implementation.
    Other,
}

/// How the manufacturer marks factory-bad blocks on this device.
///
/// The marker is the block-status byte (first byte of the spare area) of the
/// listed pages; a value other than 0xFF flags the block.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BadBlockMarking {
    /// ONFI style: first page of the block
    #[default]
    FirstPage,
    /// ONFI style: first and last page
    FirstAndLastPage,
    /// First and second page
    FirstAndSecondPage,
    /// First, second and last page
    FirstSecondAndLastPage,
    /// First and last page, with the marker duplicated at the second
    /// byte of the spare area
    FirstAndLastPageDup,
}

impl BadBlockMarking {
    /// Page positions within a block that carry the marker.
    ///
    /// Returns (first, second, last) flags.
    pub fn marker_pages(&self) -> (bool, bool, bool) {
        match self {
            BadBlockMarking::FirstPage => (true, false, false),
            BadBlockMarking::FirstAndLastPage => (true, false, true),
            BadBlockMarking::FirstAndSecondPage => (true, true, false),
            BadBlockMarking::FirstSecondAndLastPage => (true, true, true),
            BadBlockMarking::FirstAndLastPageDup => (true, false, true),
        }
    }

    /// Whether the marker byte is duplicated at spare offset 1.
    pub fn has_duplicate_marker(&self) -> bool {
        matches!(self, BadBlockMarking::FirstAndLastPageDup)
    }
}

/// On-chip ECC capabilities of the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EccInfo {
    /// Number of bit errors the ECC can correct per ECC block, 0 if the
    /// device has no usable ECC and the layer above must bring its own.
    pub bits_correctable: u8,
    /// log2 of the number of main-area bytes covered by one ECC block
    pub bytes_per_block_log2: u8,
    /// The device computes and applies ECC in hardware
    pub has_hw_ecc: bool,
}

/// Geometry and capability description returned by [NandPhy::init].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// log2 of the main-area size of a page in bytes (page size >= 2048)
    pub bytes_per_page_log2: u8,
    /// Size of the spare area of a page in bytes
    pub bytes_per_spare_area: u16,
    /// log2 of the number of pages per block
    pub pages_per_block_log2: u8,
    /// Number of blocks in the device
    pub num_blocks: u32,
    /// Width of the data bus in bits (8 or 16)
    pub data_bus_width: u8,
    /// Factory bad-block marking convention
    pub bad_block_marking: BadBlockMarking,
    /// On-chip ECC capabilities
    pub ecc: EccInfo,
    /// log2 of the number of planes that can be operated in parallel
    pub planes_log2: u8,
}

impl DeviceInfo {
    pub fn bytes_per_page(&self) -> usize {
        1 << self.bytes_per_page_log2
    }

    pub fn pages_per_block(&self) -> u32 {
        1 << self.pages_per_block_log2
    }
}

/// Result of a hardware ECC operation, queried after a read.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EccResult {
    pub status: EccStatus,
    /// Maximum number of bits corrected in any ECC block of the page.
    /// Only meaningful for [EccStatus::Corrected].
    pub max_bits_corrected: u8,
}

/// Hardware ECC status values after a read operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EccStatus {
    /// ECC was not applied (disabled or unsupported)
    NotApplied,
    /// No errors detected
    Ok,
    /// Errors detected and corrected
    Corrected,
    /// Errors corrected but the device cannot report how many bits
    CorrectedUnknownCount,
    /// Errors detected but not correctable
    Uncorrectable,
}

/// Blocking physical-layer interface to a raw NAND device.
///
/// The translation layer above serializes all calls; implementations do not
/// need to be reentrant. All blocking (busy polling, timeouts) happens
/// inside these calls.
///
/// Pages within a block must be programmed in ascending order and a page
/// must not be reprogrammed without erasing the whole block first.
pub trait NandPhy: ErrorType {
    /// Initialize the device and report its geometry and capabilities.
    fn init(&mut self) -> Result<DeviceInfo, Self::Error>;

    /// Read `buf.len()` bytes of the main area of `page`, starting at byte
    /// offset `offset`.
    fn read(&mut self, page: PageIndex, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Read main-area and spare-area ranges of `page` in one operation.
    /// Either part may be absent.
    fn read_ex(
        &mut self,
        page: PageIndex,
        main: Option<&mut [u8]>,
        main_offset: u32,
        spare: Option<&mut [u8]>,
        spare_offset: u32,
    ) -> Result<(), Self::Error>;

    /// Program `buf.len()` bytes of the main area of `page`, starting at
    /// byte offset `offset`.
    fn write(&mut self, page: PageIndex, offset: u32, buf: &[u8]) -> Result<(), Self::Error>;

    /// Program main-area and spare-area ranges of `page` in one operation.
    fn write_ex(
        &mut self,
        page: PageIndex,
        main: Option<&[u8]>,
        main_offset: u32,
        spare: Option<&[u8]>,
        spare_offset: u32,
    ) -> Result<(), Self::Error>;

    /// Erase the block that starts at `first_page`.
    fn erase_block(&mut self, first_page: PageIndex) -> Result<(), Self::Error>;

    /// Copy a page inside the device without transferring it to the host.
    ///
    /// Returns `Ok(false)` if the device cannot copy this pair of pages
    /// (unsupported, or source and destination in different planes); the
    /// caller then falls back to read + write.
    fn copy_page(&mut self, _src: PageIndex, _dst: PageIndex) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Enable the on-chip ECC. No-op for devices without hardware ECC.
    fn enable_ecc(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Disable the on-chip ECC so raw byte patterns (bad-block markers,
    /// blank checks) can be read without spurious error reports.
    fn disable_ecc(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Result of the hardware ECC for the most recent read.
    fn ecc_result(&mut self) -> Result<EccResult, Self::Error> {
        Ok(EccResult {
            status: EccStatus::NotApplied,
            max_bits_corrected: 0,
        })
    }

    /// Request the bit-exact page layout, bypassing any data scrambling or
    /// layout canonicalization the driver performs.
    fn set_raw_mode(&mut self, _on: bool) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Whether the device is hardware write protected.
    fn is_write_protected(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Release the device.
    fn deinit(&mut self) {}
}
