//! Demand paging for a teaching kernel: frame allocation with an inverted
//! table, clock eviction, swap space over a file store, and the page fault
//! path that ties them to per-process translation tables.

pub mod config;
pub mod error;
pub mod frame_allocator;
pub mod fs;
pub mod memory;
pub mod mmu;
pub mod page_loader;
pub mod page_replacer;
pub mod page_table;
pub mod process;
pub mod swap;

pub use config::{ShortTransferPolicy, VmConfig};
pub use error::{Result, VmError};
pub use mmu::VmKernel;
pub use process::Process;
