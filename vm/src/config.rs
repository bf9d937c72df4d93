//! Tunables for a [`VmKernel`](crate::mmu::VmKernel).

use crate::error::{Result, VmError};

/// What to do when a swap read or write moves less than a full page.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ShortTransferPolicy {
    /// Log a warning and carry on with whatever landed in the frame.
    #[default]
    Log,
    /// Fail the operation with [`VmError::ShortTransfer`](crate::VmError::ShortTransfer).
    Fail,
}

#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Bytes per page. Frames and swap slots are the same width.
    pub page_size: usize,
    pub num_frames: usize,
    /// Stack pages placed after the last image section.
    pub stack_pages: usize,
    pub swap_file_name: String,
    /// Slots added each time the swap free list runs dry.
    pub swap_batch: usize,
    pub short_transfer: ShortTransferPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            page_size: 1024,
            num_frames: 16,
            stack_pages: 8,
            swap_file_name: "swapfile".to_string(),
            swap_batch: 8,
            short_transfer: ShortTransferPolicy::Log,
        }
    }
}

impl VmConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = num_frames;
        self
    }

    pub fn with_stack_pages(mut self, stack_pages: usize) -> Self {
        self.stack_pages = stack_pages;
        self
    }

    pub fn with_swap_file_name(mut self, name: impl Into<String>) -> Self {
        self.swap_file_name = name.into();
        self
    }

    pub fn with_swap_batch(mut self, swap_batch: usize) -> Self {
        self.swap_batch = swap_batch;
        self
    }

    pub fn with_short_transfer(mut self, policy: ShortTransferPolicy) -> Self {
        self.short_transfer = policy;
        self
    }

    /// Checks the sizes [`VmKernel::new`](crate::mmu::VmKernel::new) asserts on.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(VmError::InvalidConfig("page size must be non-zero"));
        }
        if self.num_frames == 0 {
            return Err(VmError::InvalidConfig("at least one frame is needed"));
        }
        if self.swap_batch == 0 {
            return Err(VmError::InvalidConfig("swap batch must be at least one slot"));
        }
        if self.swap_file_name.is_empty() {
            return Err(VmError::InvalidConfig("swap file name is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_kernel_layout() {
        let config = VmConfig::default();
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.stack_pages, 8);
        assert_eq!(config.swap_batch, 8);
        assert_eq!(config.short_transfer, ShortTransferPolicy::Log);
    }

    #[test]
    fn setters_chain() {
        let config = VmConfig::default()
            .with_frames(4)
            .with_page_size(64)
            .with_swap_file_name("pagefile")
            .with_short_transfer(ShortTransferPolicy::Fail);
        assert_eq!(config.num_frames, 4);
        assert_eq!(config.page_size, 64);
        assert_eq!(config.swap_file_name, "pagefile");
        assert_eq!(config.short_transfer, ShortTransferPolicy::Fail);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(VmConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for config in [
            VmConfig::default().with_frames(0),
            VmConfig::default().with_page_size(0),
            VmConfig::default().with_swap_batch(0),
            VmConfig::default().with_swap_file_name(""),
        ] {
            assert!(matches!(config.validate(), Err(VmError::InvalidConfig(_))), "{:?}", config);
        }
    }
}
