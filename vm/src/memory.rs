//! The flat physical memory shared by every process.

use std::ops::Range;

use parking_lot::Mutex;

pub struct PhysicalMemory {
    bytes: Mutex<Box<[u8]>>,
    page_size: usize,
    num_frames: usize,
}

impl PhysicalMemory {
    pub fn new(page_size: usize, num_frames: usize) -> Self {
        PhysicalMemory {
            bytes: Mutex::new(vec![0u8; page_size * num_frames].into_boxed_slice()),
            page_size,
            num_frames,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn frame_range(&self, ppn: usize) -> Range<usize> {
        assert!(ppn < self.num_frames, "frame {:#x} out of range", ppn);

        Range {
            start: ppn * self.page_size,
            end: (ppn + 1) * self.page_size,
        }
    }

    /// Copies `buf.len()` bytes starting at physical address `paddr` into `buf`.
    pub fn read(&self, paddr: usize, buf: &mut [u8]) {
        let memory = self.bytes.lock();
        buf.copy_from_slice(&memory[paddr..paddr + buf.len()]);
    }

    /// Copies `buf` into memory starting at physical address `paddr`.
    pub fn write(&self, paddr: usize, buf: &[u8]) {
        let mut memory = self.bytes.lock();
        memory[paddr..paddr + buf.len()].copy_from_slice(buf);
    }

    /// Runs `f` over the bytes of one frame while holding the memory lock.
    pub fn with_frame<T>(&self, ppn: usize, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let range = self.frame_range(ppn);
        let mut memory = self.bytes.lock();
        f(&mut memory[range])
    }

    pub fn zero_frame(&self, ppn: usize) {
        self.with_frame(ppn, |frame| frame.fill(0));
    }
}
