//! A user process's demand-paged address space.
//!
//! Layout: image sections from page 0, then the stack, then one page for
//! program arguments. Nothing is resident at load time; every page comes in
//! through the fault path on first touch.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::{
    error::{Result, VmError},
    mmu::VmKernel,
    page_loader::ExecutableImage,
    page_replacer::PageOwner,
    page_table::{PageTable, TranslationEntry},
};

pub struct Process {
    pid: u32,
    kernel: Arc<VmKernel>,
    image: ExecutableImage,
    page_table: Mutex<PageTable>,
    num_pages: usize,
    argc: usize,
    argv: usize,
}

impl Process {
    /// Sizes the address space for `image`, then writes `args` into the argument page.
    pub fn load(kernel: &Arc<VmKernel>, image: ExecutableImage, args: &[&str]) -> Result<Arc<Self>> {
        let config = kernel.config();
        let page_size = config.page_size;
        let pid = kernel.next_pid();

        let mut entries = Vec::new();
        for section in image.sections() {
            if section.first_vpn() != entries.len() {
                debug!("pid {}: fragmented executable", pid);
                return Err(VmError::FragmentedImage {
                    expected: entries.len(),
                    found: section.first_vpn(),
                });
            }

            for i in 0..section.page_count() {
                let vpn = section.first_vpn() + i;
                entries.push(TranslationEntry::new(vpn, section.is_read_only()));
            }
        }

        // each argument costs a 4-byte pointer plus its bytes and a NUL
        let args_size: usize = args.iter().map(|arg| 4 + arg.len() + 1).sum();
        if args_size > page_size {
            debug!("pid {}: arguments too long", pid);
            return Err(VmError::ArgumentsTooLong {
                size: args_size,
                page_size,
            });
        }

        let first_free = entries.len();
        for vpn in first_free..first_free + config.stack_pages + 1 {
            entries.push(TranslationEntry::new(vpn, false));
        }

        let num_pages = entries.len();
        let argv = (num_pages - 1) * page_size;

        debug!("pid {}: address space of {} pages", pid, num_pages);

        let process = Arc::new(Process {
            pid,
            kernel: kernel.clone(),
            image,
            page_table: Mutex::new(PageTable::new(entries)),
            num_pages,
            argc: args.len(),
            argv,
        });

        if let Err(e) = process.write_args(args) {
            process.exit();
            return Err(e);
        }

        Ok(process)
    }

    /// Pointer table of 4-byte little-endian offsets, then the NUL-terminated strings.
    fn write_args(self: &Arc<Self>, args: &[&str]) -> Result<()> {
        let mut pointer = self.argv;
        let mut string = self.argv + args.len() * 4;

        for arg in args {
            self.write_virtual_memory(pointer, &(string as u32).to_le_bytes())?;
            pointer += 4;
            self.write_virtual_memory(string, arg.as_bytes())?;
            string += arg.len();
            self.write_virtual_memory(string, &[0])?;
            string += 1;
        }

        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    /// Virtual address of the argument pointer table.
    pub fn argv(&self) -> usize {
        self.argv
    }

    /// Initial stack pointer: the top of the stack, just below the argument page.
    pub fn initial_sp(&self) -> usize {
        self.argv
    }

    /// Snapshot of the translation entry for `vpn`.
    pub fn entry(&self, vpn: usize) -> Option<TranslationEntry> {
        self.page_table.lock().get(vpn).copied()
    }

    /// Every (vpn, ppn) pair currently resident.
    pub fn resident_pages(&self) -> Vec<(usize, usize)> {
        self.page_table
            .lock()
            .iter()
            .filter_map(|e| e.frame().map(|ppn| (e.vpn, ppn)))
            .collect()
    }

    pub(crate) fn map_page(&self, vpn: usize, ppn: usize) {
        let mut table = self.page_table.lock();
        if let Some(entry) = table.get_mut(vpn) {
            entry.map_frame(ppn);
        }

        debug!("pid {}: vpn {:#x} now in ppn {:#x}", self.pid, vpn, ppn);
    }

    fn touch(&self, vpn: usize, write: bool) {
        let mut table = self.page_table.lock();
        if let Some(entry) = table.get_mut(vpn) {
            entry.used = true;
            entry.dirty |= write;
        }
    }

    /// Pins the frame backing `vaddr`'s page, faulting it in first if needed.
    fn pin_page(self: &Arc<Self>, vaddr: usize) -> Result<usize> {
        let vpn = vaddr / self.kernel.config().page_size;

        loop {
            if let Some(ppn) = self.kernel.frames().pin_resident(&**self, vpn) {
                return Ok(ppn);
            }

            debug!("pid {}: page fault on vpn {:#x}", self.pid, vpn);
            self.kernel.resolve_fault(self, vaddr)?;
        }
    }

    /// Copies from virtual memory at `vaddr` into `buf`. Returns the bytes copied,
    /// which is short if the range runs off the end of the address space.
    pub fn read_virtual_memory(self: &Arc<Self>, vaddr: usize, buf: &mut [u8]) -> Result<usize> {
        let page_size = self.kernel.config().page_size;
        let limit = self.num_pages * page_size;
        if vaddr >= limit {
            return Ok(0);
        }

        let amount = buf.len().min(limit - vaddr);
        let mut done = 0;

        while done < amount {
            let va = vaddr + done;
            let offset = va % page_size;
            let n = (page_size - offset).min(amount - done);

            let ppn = self.pin_page(va)?;
            self.touch(va / page_size, false);
            self.kernel
                .memory()
                .read(ppn * page_size + offset, &mut buf[done..done + n]);
            self.kernel.unpin_frame(ppn);

            done += n;
        }

        Ok(done)
    }

    /// Copies `buf` into virtual memory at `vaddr`. Stops at the first read-only
    /// page; returns the bytes copied.
    pub fn write_virtual_memory(self: &Arc<Self>, vaddr: usize, buf: &[u8]) -> Result<usize> {
        let page_size = self.kernel.config().page_size;
        let limit = self.num_pages * page_size;
        if vaddr >= limit {
            return Ok(0);
        }

        let amount = buf.len().min(limit - vaddr);
        let mut done = 0;

        while done < amount {
            let va = vaddr + done;
            let vpn = va / page_size;
            let offset = va % page_size;
            let n = (page_size - offset).min(amount - done);

            if self.entry(vpn).is_some_and(|e| e.read_only) {
                debug!("pid {}: write to read-only vpn {:#x}", self.pid, vpn);
                break;
            }

            let ppn = self.pin_page(va)?;
            self.touch(vpn, true);
            self.kernel
                .memory()
                .write(ppn * page_size + offset, &buf[done..done + n]);
            self.kernel.unpin_frame(ppn);

            done += n;
        }

        Ok(done)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (NUL excluded).
    /// `None` if no terminator turns up in range.
    pub fn read_virtual_memory_string(self: &Arc<Self>, vaddr: usize, max_len: usize) -> Result<Option<String>> {
        let mut bytes = vec![0u8; max_len + 1];
        let read = self.read_virtual_memory(vaddr, &mut bytes)?;

        Ok(bytes[..read]
            .iter()
            .position(|&b| b == 0)
            .map(|end| String::from_utf8_lossy(&bytes[..end]).into_owned()))
    }

    /// Releases every frame and swap slot this process holds. Safe to call twice.
    pub fn exit(&self) {
        // no fault (and so no eviction) may run while the table is torn down
        let _serial = self.kernel.serialize_faults();

        let entries = self.page_table.lock().take();
        for entry in entries {
            if let Some(ppn) = entry.frame() {
                self.kernel.deallocate_frame(ppn);
            } else if let Some(slot) = entry.swap_slot() {
                self.kernel.deallocate_swap_slot(slot);
            }
        }

        debug!("pid {}: exited", self.pid);
    }
}

impl PageOwner for Process {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_used(&self, vpn: usize) -> bool {
        self.page_table.lock().get(vpn).is_some_and(|e| e.used)
    }

    fn is_dirty(&self, vpn: usize) -> bool {
        self.page_table.lock().get(vpn).is_some_and(|e| e.dirty)
    }

    fn unset_used(&self, vpn: usize) {
        if let Some(entry) = self.page_table.lock().get_mut(vpn) {
            entry.used = false;
        }
    }

    fn unset_valid(&self, vpn: usize) {
        if let Some(entry) = self.page_table.lock().get_mut(vpn) {
            entry.valid = false;
        }
    }

    fn set_swap_slot(&self, vpn: usize, slot: Option<usize>) {
        if let Some(entry) = self.page_table.lock().get_mut(vpn) {
            entry.set_swap_slot(slot);
        }
    }

    fn resident_frame(&self, vpn: usize) -> Option<usize> {
        self.page_table.lock().get(vpn).and_then(|e| e.frame())
    }

    fn resident_pages(&self) -> Vec<(usize, usize)> {
        Process::resident_pages(self)
    }
}
