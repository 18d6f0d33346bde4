use nand_phy::{PhyError, PhyErrorKind};

/// Error type of the translation layer.
///
/// Correctable ECC outcomes never surface here; they are absorbed into the
/// statistics counters and may schedule a block relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum Error {
    /// The data of a page is lost: more bit errors than the ECC can correct.
    #[error("uncorrectable bit errors")]
    UncorrectableBitErrors,
    /// The device could not complete a read operation.
    #[error("read failure reported by the device")]
    ReadError,
    /// The device reported a program failure.
    #[error("program failure reported by the device")]
    WriteError,
    /// The device reported an erase failure.
    #[error("erase failure reported by the device")]
    EraseError,
    /// Every block is bad or allocated.
    #[error("out of free blocks")]
    OutOfFreeBlocks,
    /// Post-operation readback did not match the written data.
    #[error("readback does not match written data")]
    VerifyError,
    /// The device is write protected.
    #[error("device is write protected")]
    WriteProtected,
    /// A fatal error was latched earlier; the device is read-only until it
    /// is low-level formatted again.
    #[error("fatal error latched, device is read-only")]
    FatalError,
    /// The medium carries no low-level format.
    #[error("medium is not low-level formatted")]
    NotFormatted,
    /// The on-medium format does not match the device geometry or the
    /// configuration.
    #[error("on-medium format is incompatible")]
    FormatIncompatible,
    /// Sector index or count out of range.
    #[error("sector index out of range")]
    OutOfRange,
    /// Invalid parameter.
    #[error("invalid parameter")]
    InvalidParameter,
}

impl Error {
    /// Map a physical-layer error, defaulting unclassified kinds to the
    /// error of the operation that was in progress.
    pub(crate) fn from_phy<E: PhyError>(e: &E, default: Error) -> Error {
        match e.kind() {
            PhyErrorKind::Read => Error::ReadError,
            PhyErrorKind::Write => Error::WriteError,
            PhyErrorKind::Erase => Error::EraseError,
            PhyErrorKind::OutOfBounds => Error::OutOfRange,
            _ => default,
        }
    }

    /// Numeric code persisted in the error-info page.
    pub(crate) fn code(&self) -> u16 {
        match self {
            Error::UncorrectableBitErrors => 1,
            Error::ReadError => 2,
            Error::WriteError => 3,
            Error::EraseError => 4,
            Error::OutOfFreeBlocks => 5,
            Error::VerifyError => 6,
            Error::WriteProtected => 7,
            Error::FatalError => 8,
            Error::NotFormatted => 9,
            Error::FormatIncompatible => 10,
            Error::OutOfRange => 11,
            Error::InvalidParameter => 12,
        }
    }

    pub(crate) fn from_code(code: u16) -> Error {
        match code {
            1 => Error::UncorrectableBitErrors,
            2 => Error::ReadError,
            3 => Error::WriteError,
            4 => Error::EraseError,
            5 => Error::OutOfFreeBlocks,
            6 => Error::VerifyError,
            7 => Error::WriteProtected,
            9 => Error::NotFormatted,
            10 => Error::FormatIncompatible,
            11 => Error::OutOfRange,
            12 => Error::InvalidParameter,
            _ => Error::FatalError,
        }
    }
}
