use std::fmt;
use std::io;

use crate::address::Pbn;

/// Errors raised by the translation layer, the flash model and the scheduler.
#[derive(Debug)]
pub enum FtlError {
    /// No empty block could be obtained, even at the widest allowed scope.
    ///
    /// Persistent occurrence means the modeled device is full.
    NoFreeSpace,

    /// An operation referenced a flash, plane, block or page out of range.
    InvalidAddress { what: &'static str, value: u64 },

    /// Pages were left valid in a victim after migration.
    ///
    /// The pass is aborted and the victim is returned to the victim list untouched.
    MergeInconsistency { victim: Pbn, expected: u32, remaining: u32 },

    /// An unrecognized operation kind reached the scheduler.
    QueueProtocolError(u8),

    /// The geometry or tunables cannot describe a working drive.
    InvalidConfig(String),

    /// Metadata could not be read or written.
    Io(io::Error),

    /// Metadata could not be encoded or decoded.
    Codec(bincode::Error),
}

pub type Result<T> = std::result::Result<T, FtlError>;

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlError::NoFreeSpace => write!(f, "no free block available"),
            FtlError::InvalidAddress { what, value } => write!(f, "invalid {} address {}", what, value),
            FtlError::MergeInconsistency { victim, expected, remaining } => write!(
                f,
                "victim {} still holds {} of {} valid pages after migration",
                victim, remaining, expected
            ),
            FtlError::QueueProtocolError(op) => write!(f, "unknown operation kind {:#04x}", op),
            FtlError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            FtlError::Io(err) => write!(f, "metadata i/o: {}", err),
            FtlError::Codec(err) => write!(f, "metadata encoding: {}", err),
        }
    }
}

impl std::error::Error for FtlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FtlError::Io(err) => Some(err),
            FtlError::Codec(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for FtlError {
    fn from(err: io::Error) -> Self {
        FtlError::Io(err)
    }
}

impl From<bincode::Error> for FtlError {
    fn from(err: bincode::Error) -> Self {
        FtlError::Codec(err)
    }
}
