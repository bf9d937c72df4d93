use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, VmError>;

/// Errors surfaced by the paging core.
///
/// Running out of frames is not in here: `allocate_frame` waits instead.
#[derive(Debug, Error)]
pub enum VmError {
    /// The swap file could not be created. Swapping cannot proceed without it.
    #[error("swap file {name:?} could not be created: {source}")]
    SwapUnavailable { name: String, source: io::Error },
    /// Underlying file store failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A swap transfer moved fewer bytes than a full page.
    #[error("short transfer on swap slot {slot}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        slot: usize,
        expected: usize,
        actual: usize,
    },
    /// Fault on an address that has no translation entry.
    #[error("no translation entry for virtual address {0:#x}")]
    InvalidAddress(usize),
    /// Image sections are not contiguous from page 0.
    #[error("fragmented executable: section at vpn {found:#x}, expected {expected:#x}")]
    FragmentedImage { expected: usize, found: usize },
    /// A tunable is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Program arguments do not fit in the argument page.
    #[error("arguments need {size} bytes, argument page holds {page_size}")]
    ArgumentsTooLong { size: usize, page_size: usize },
}
