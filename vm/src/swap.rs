//! Swap space: a lazily created file cut into page-sized slots.
//!
//! Slot `i` lives at byte offset `i * page_size`. The file is opened on the
//! first slot allocation and the free list grows a batch of slots at a time.
//! A slot goes back on the free list as soon as its page has been read back
//! in, so no two live translation entries ever name the same slot.

use std::{collections::VecDeque, io, sync::Arc};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    config::ShortTransferPolicy,
    error::{Result, VmError},
    fs::{FileSystem, OpenFile},
    memory::PhysicalMemory,
};

pub struct SwapSpace {
    fs: Arc<dyn FileSystem>,
    name: String,
    memory: Arc<PhysicalMemory>,
    batch: usize,
    policy: ShortTransferPolicy,
    /// Free list and slot bookkeeping. Never held across file I/O.
    state: Mutex<SwapState>,
    /// Taken after `state` when both are needed.
    file: Mutex<Option<Box<dyn OpenFile>>>,
}

#[derive(Default)]
struct SwapState {
    /// Set once the file has been opened; `file` is only locked for creation and I/O.
    created: bool,
    free: VecDeque<usize>,
    /// Indexed by slot; true while the slot is handed out.
    allocated: Vec<bool>,
}

impl SwapSpace {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        name: impl Into<String>,
        memory: Arc<PhysicalMemory>,
        batch: usize,
        policy: ShortTransferPolicy,
    ) -> Self {
        assert!(batch > 0, "swap batch must be at least one slot");

        SwapSpace {
            fs,
            name: name.into(),
            memory,
            batch,
            policy,
            state: Mutex::new(SwapState::default()),
            file: Mutex::new(None),
        }
    }

    /// Hands out a free slot, creating the swap file or growing the free list as needed.
    pub fn allocate_slot(&self) -> Result<usize> {
        let mut state = self.state.lock();

        if !state.created {
            let file = self
                .fs
                .open(&self.name, true)
                .map_err(|source| VmError::SwapUnavailable {
                    name: self.name.clone(),
                    source,
                })?;
            info!("swap: created swap file {:?}", self.name);
            *self.file.lock() = Some(file);
            state.created = true;
        }

        let slot = loop {
            if let Some(slot) = state.free.pop_front() {
                break slot;
            }
            self.grow(&mut state);
        };

        state.allocated[slot] = true;
        debug!("swap: allocate spn {:#x}", slot);

        Ok(slot)
    }

    pub fn deallocate_slot(&self, slot: usize) {
        let mut state = self.state.lock();

        assert!(
            state.allocated.get(slot).copied().unwrap_or(false),
            "swap: spn {:#x} freed while not allocated",
            slot
        );
        state.allocated[slot] = false;
        state.free.push_back(slot);

        debug!("swap: deallocate spn {:#x}", slot);
    }

    fn grow(&self, state: &mut SwapState) {
        let first = state.allocated.len();

        debug!("swap: growing by {} slots from spn {:#x}", self.batch, first);

        state.free.extend(first..first + self.batch);
        state.allocated.resize(first + self.batch, false);
    }

    /// Copies frame `ppn` out to `slot`.
    pub fn write_slot(&self, ppn: usize, slot: usize) -> Result<()> {
        self.check_allocated(slot);

        let page_size = self.memory.page_size();
        let mut page = vec![0u8; page_size];
        self.memory.with_frame(ppn, |frame| page.copy_from_slice(frame));

        debug!("swap: write ppn {:#x} to spn {:#x}", ppn, slot);

        let written = self.with_file(|file| file.write((slot * page_size) as u64, &page))?;

        self.check_transfer(slot, written)
    }

    /// Copies `slot` into frame `ppn`. Does not free the slot.
    pub fn read_slot(&self, ppn: usize, slot: usize) -> Result<()> {
        self.check_allocated(slot);

        let page_size = self.memory.page_size();
        let mut page = vec![0u8; page_size];

        debug!("swap: read spn {:#x} into ppn {:#x}", slot, ppn);

        let read = self.with_file(|file| file.read((slot * page_size) as u64, &mut page))?;

        self.check_transfer(slot, read)?;
        self.memory.with_frame(ppn, |frame| frame.copy_from_slice(&page));

        Ok(())
    }

    fn check_allocated(&self, slot: usize) {
        let state = self.state.lock();
        assert!(
            state.allocated.get(slot).copied().unwrap_or(false),
            "swap: transfer on unallocated spn {:#x}",
            slot
        );
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut dyn OpenFile) -> io::Result<T>) -> Result<T> {
        let mut file = self.file.lock();
        match file.as_mut() {
            Some(file) => Ok(f(file.as_mut())?),
            None => unreachable!("allocated swap slot without a swap file"),
        }
    }

    fn check_transfer(&self, slot: usize, actual: usize) -> Result<()> {
        let expected = self.memory.page_size();
        if actual == expected {
            return Ok(());
        }

        match self.policy {
            ShortTransferPolicy::Log => {
                warn!(
                    "swap: spn {:#x} transferred {} of {} bytes",
                    slot, actual, expected
                );
                Ok(())
            }
            ShortTransferPolicy::Fail => Err(VmError::ShortTransfer {
                slot,
                expected,
                actual,
            }),
        }
    }

    /// Slots ever created.
    pub fn total_slots(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub fn free_slots(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn is_created(&self) -> bool {
        self.state.lock().created
    }

    /// Closes and removes the swap file, if it was ever created.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();

        if let Some(mut file) = self.file.lock().take() {
            if let Err(e) = file.close() {
                warn!("swap: closing {:?} failed: {}", self.name, e);
            }
            drop(file);

            if self.fs.remove(&self.name) {
                info!("swap: removed swap file {:?}", self.name);
            }
        }

        state.created = false;
        state.free.clear();
        state.allocated.clear();
    }
}
