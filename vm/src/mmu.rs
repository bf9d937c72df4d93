//! The kernel-wide paging state and the page fault path.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    config::VmConfig,
    error::{Result, VmError},
    frame_allocator::FrameAllocator,
    fs::FileSystem,
    memory::PhysicalMemory,
    page_replacer::PageOwner,
    process::Process,
    swap::SwapSpace,
};

/// Physical memory, the frame allocator and swap space, built once at boot
/// and shared by every process.
pub struct VmKernel {
    config: VmConfig,
    memory: Arc<PhysicalMemory>,
    swap: Arc<SwapSpace>,
    frames: FrameAllocator,
    /// Only one fault is resolved at a time, system-wide.
    fault_lock: Mutex<()>,
    next_pid: AtomicU32,
}

impl VmKernel {
    /// Panics on a config that [`VmConfig::validate`] rejects.
    pub fn new(config: VmConfig, fs: Arc<dyn FileSystem>) -> Arc<Self> {
        if let Err(e) = config.validate() {
            panic!("mmu: {}", e);
        }

        let memory = Arc::new(PhysicalMemory::new(config.page_size, config.num_frames));
        let swap = Arc::new(SwapSpace::new(
            fs,
            config.swap_file_name.clone(),
            memory.clone(),
            config.swap_batch,
            config.short_transfer,
        ));
        let frames = FrameAllocator::new(config.num_frames, swap.clone());

        info!(
            "mmu: {} frames of {} bytes, swap file {:?}",
            config.num_frames, config.page_size, config.swap_file_name
        );

        Arc::new(VmKernel {
            config,
            memory,
            swap,
            frames,
            fault_lock: Mutex::new(()),
            next_pid: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub(crate) fn next_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn serialize_faults(&self) -> MutexGuard<'_, ()> {
        self.fault_lock.lock()
    }

    /// Blocks while every frame is pinned.
    pub fn allocate_frame(&self, owner: &Arc<dyn PageOwner>, vpn: usize) -> Result<usize> {
        self.frames.allocate(owner, vpn)
    }

    pub fn deallocate_frame(&self, ppn: usize) {
        self.frames.deallocate(ppn)
    }

    pub fn deallocate_swap_slot(&self, slot: usize) {
        self.swap.deallocate_slot(slot)
    }

    pub fn pin_frame(&self, ppn: usize) {
        self.frames.pin(ppn)
    }

    pub fn unpin_frame(&self, ppn: usize) {
        self.frames.unpin(ppn)
    }

    /// Makes the page holding `vaddr` resident in `process`.
    ///
    /// The page is filled from swap if it was evicted dirty, otherwise from
    /// its image section, otherwise with zeros. A page that is already
    /// resident by the time the fault lock is taken is left alone.
    pub fn resolve_fault(&self, process: &Arc<Process>, vaddr: usize) -> Result<()> {
        let _serial = self.fault_lock.lock();

        let vpn = vaddr / self.config.page_size;

        debug!(
            "fault: pid {} vaddr {:#x} vpn {:#x}",
            process.pid(),
            vaddr,
            vpn
        );

        let entry = process.entry(vpn).ok_or(VmError::InvalidAddress(vaddr))?;
        if entry.valid {
            debug!("fault: pid {} vpn {:#x} already resident", process.pid(), vpn);
            return Ok(());
        }

        let owner: Arc<dyn PageOwner> = process.clone();
        let ppn = self.frames.allocate(&owner, vpn)?;

        match entry.swap_slot() {
            None => match process.image().section_for(vpn) {
                Some((section, index)) => {
                    debug!("fault: load vpn {:#x} from image page {}", vpn, index);
                    self.memory
                        .with_frame(ppn, |frame| section.load_page_into(index, frame));
                }
                None => {
                    debug!("fault: zero-fill vpn {:#x}", vpn);
                    self.memory.zero_frame(ppn);
                }
            },
            Some(slot) => {
                debug!("fault: load vpn {:#x} from spn {:#x}", vpn, slot);
                if let Err(e) = self.swap.read_slot(ppn, slot) {
                    self.frames.deallocate(ppn);
                    return Err(e);
                }
                self.swap.deallocate_slot(slot);
            }
        }

        process.map_page(vpn, ppn);

        Ok(())
    }

    /// See [`FrameAllocator::audit`].
    pub fn audit(&self) {
        self.frames.audit();
    }

    /// Closes and removes the swap file. Runs again harmlessly on drop.
    pub fn terminate(&self) {
        info!("mmu: terminating");
        self.swap.shutdown();
    }
}

impl Drop for VmKernel {
    fn drop(&mut self) {
        self.swap.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::AtomicBool};

    use super::*;
    use crate::{
        config::ShortTransferPolicy,
        fs::{HostFileSystem, OpenFile},
        page_loader::{ExecutableImage, ImageSection},
    };

    const PAGE: usize = 64;

    fn kernel(dir: &tempfile::TempDir, frames: usize) -> Arc<VmKernel> {
        let config = VmConfig::default()
            .with_page_size(PAGE)
            .with_frames(frames)
            .with_stack_pages(2);
        VmKernel::new(config, Arc::new(HostFileSystem::new(dir.path())))
    }

    fn image() -> ExecutableImage {
        ExecutableImage::new()
            .with_section(ImageSection::from_bytes(".text", 0, true, PAGE, vec![0xC3; PAGE]))
            .with_section(ImageSection::from_bytes(".data", 1, false, PAGE, vec![0x11; PAGE]))
    }

    #[test]
    fn image_page_is_loaded_on_fault() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel(&dir, 4);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        assert!(!process.entry(0).unwrap().valid);
        kernel.resolve_fault(&process, 5).unwrap();

        let entry = process.entry(0).unwrap();
        assert!(entry.valid && entry.used && !entry.dirty);
        let ppn = entry.frame().unwrap();
        kernel
            .memory()
            .with_frame(ppn, |frame| assert!(frame.iter().all(|&b| b == 0xC3)));
        kernel.audit();
    }

    #[test]
    fn stack_page_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel(&dir, 4);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        // dirty a frame, free it, and make sure the next stack fault scrubs it
        kernel.resolve_fault(&process, 0).unwrap();
        let ppn = process.entry(0).unwrap().frame().unwrap();
        kernel.memory().with_frame(ppn, |frame| frame.fill(0xEE));
        process.exit();

        let process = Process::load(&kernel, image(), &[]).unwrap();
        for vpn in 0..4 {
            kernel.resolve_fault(&process, vpn * PAGE).unwrap();
        }
        let ppn = process.entry(3).unwrap().frame().unwrap();
        kernel
            .memory()
            .with_frame(ppn, |frame| assert!(frame.iter().all(|&b| b == 0)));
    }

    #[test]
    fn second_fault_on_resident_page_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel(&dir, 4);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        kernel.resolve_fault(&process, PAGE).unwrap();
        let free = kernel.frames().free_frames();
        kernel.resolve_fault(&process, PAGE + 1).unwrap();

        assert_eq!(kernel.frames().free_frames(), free);
    }

    #[test]
    fn fault_outside_address_space_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel(&dir, 4);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        let vaddr = process.num_pages() * PAGE;
        assert!(matches!(
            kernel.resolve_fault(&process, vaddr),
            Err(VmError::InvalidAddress(a)) if a == vaddr
        ));
    }

    #[test]
    fn terminate_removes_swap_file() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel(&dir, 1);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        // two dirty pages through one frame forces a swap-out
        process.write_virtual_memory(PAGE, &[1]).unwrap();
        process.write_virtual_memory(2 * PAGE, &[2]).unwrap();
        assert!(dir.path().join("swapfile").exists());

        kernel.terminate();
        assert!(!dir.path().join("swapfile").exists());
    }

    /// In-memory swap store that can be told to move only half of each transfer.
    #[derive(Clone, Default)]
    struct FlakyFs {
        bytes: Arc<Mutex<Vec<u8>>>,
        short_reads: Arc<AtomicBool>,
        short_writes: Arc<AtomicBool>,
    }

    impl OpenFile for FlakyFs {
        fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let n = if self.short_reads.load(Ordering::SeqCst) { buf.len() / 2 } else { buf.len() };
            let bytes = self.bytes.lock();
            let start = offset as usize;
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            Ok(n)
        }

        fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
            let n = if self.short_writes.load(Ordering::SeqCst) { buf.len() / 2 } else { buf.len() };
            let mut bytes = self.bytes.lock();
            let start = offset as usize;
            if bytes.len() < start + buf.len() {
                bytes.resize(start + buf.len(), 0);
            }
            bytes[start..start + n].copy_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    impl FileSystem for FlakyFs {
        fn open(&self, _name: &str, _create: bool) -> io::Result<Box<dyn OpenFile>> {
            Ok(Box::new(self.clone()))
        }

        fn remove(&self, _name: &str) -> bool {
            true
        }
    }

    fn strict_kernel(fs: &FlakyFs) -> Arc<VmKernel> {
        let config = VmConfig::default()
            .with_page_size(PAGE)
            .with_frames(1)
            .with_stack_pages(2)
            .with_short_transfer(ShortTransferPolicy::Fail);
        VmKernel::new(config, Arc::new(fs.clone()))
    }

    #[test]
    fn failed_swap_out_keeps_victim_resident() {
        let fs = FlakyFs::default();
        let kernel = strict_kernel(&fs);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        process.write_virtual_memory(PAGE, &[1, 2]).unwrap();
        fs.short_writes.store(true, Ordering::SeqCst);

        // the stack page needs the only frame, whose dirty page cannot be written out
        assert!(matches!(
            process.write_virtual_memory(2 * PAGE, &[3]),
            Err(VmError::ShortTransfer { expected: PAGE, actual, .. }) if actual == PAGE / 2
        ));

        kernel.audit();
        let entry = process.entry(1).unwrap();
        assert!(entry.valid && entry.dirty);
        assert!(!process.entry(2).unwrap().valid);
        assert_eq!(kernel.swap().total_slots(), 8);
        assert_eq!(kernel.swap().free_slots(), 8);

        let mut buf = [0u8; 2];
        process.read_virtual_memory(PAGE, &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn failed_swap_in_keeps_the_slot() {
        let fs = FlakyFs::default();
        let kernel = strict_kernel(&fs);
        let process = Process::load(&kernel, image(), &[]).unwrap();

        process.write_virtual_memory(PAGE, &[7]).unwrap();
        process.write_virtual_memory(2 * PAGE, &[8]).unwrap();
        let slot = process.entry(1).unwrap().swap_slot().unwrap();

        fs.short_reads.store(true, Ordering::SeqCst);
        let mut buf = [0u8; 1];
        assert!(matches!(
            process.read_virtual_memory(PAGE, &mut buf),
            Err(VmError::ShortTransfer { .. })
        ));

        kernel.audit();
        assert_eq!(kernel.frames().free_frames(), 1);
        assert_eq!(process.entry(1).unwrap().swap_slot(), Some(slot));

        fs.short_reads.store(false, Ordering::SeqCst);
        process.read_virtual_memory(PAGE, &mut buf).unwrap();
        assert_eq!(buf, [7]);
        assert_eq!(process.entry(1).unwrap().frame(), Some(0));
    }
}
