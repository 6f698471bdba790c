use thiserror::Error;

use crate::types::PhysAddr;

/// Failure to turn the script template into an executable image
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BindError {
    #[error("zero opcode at script word {0}, template not filled in?")]
    ZeroOpcode(usize),
    #[error("bad relocation {word:#010X} at script word {offset}")]
    BadRelocation { offset: usize, word: u32 },
    #[error("kernel variable {index} out of range at script word {offset}")]
    KvarOutOfRange { offset: usize, index: u32 },
    #[error("instruction at script word {0} runs past the end of the template")]
    Truncated(usize),
    #[error("destination holds {have} words, {need} needed")]
    DestinationTooSmall { have: usize, need: usize },
}

/// Rejection of a command at submission time
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("target {0} is the adapter's own id")]
    OwnId(u8),
    #[error("target {0} out of range")]
    BadTarget(u8),
    #[error("lun {0} out of range")]
    BadLun(u8),
    #[error("CDB of {0} bytes not supported")]
    BadCdb(usize),
    #[error("target {0} is excluded from scanning")]
    NoScan(u8),
    #[error("{count} data segments exceed the maximum of {max}")]
    TooManySegments { count: usize, max: usize },
    #[error("data segment of {0} bytes exceeds the 24-bit transfer count")]
    SegmentTooLarge(u32),
    #[error("data segment at {0:#010X} is not DMA-reachable")]
    SegmentOutOfRange(PhysAddr),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Invalid adapter configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("own id {0} out of range")]
    OwnId(u8),
    #[error("{field} = {value} outside {min}..={max}")]
    Range {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("target {0} out of range")]
    BadTarget(u8),
    #[error("target {0} configured twice")]
    DuplicateTarget(u8),
    #[error("{0:#010X} is not 16-byte aligned")]
    Misaligned(PhysAddr),
}
