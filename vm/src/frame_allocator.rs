//! Physical frame allocation and the inverted (frame to owner) table.
//!
//! Two locks, always taken in this order: the allocator state (free list and
//! clock hand), then the inverted table. The inverted table lock doubles as
//! the pin lock; a condition variable on it wakes an allocation that is
//! waiting because every frame was pinned. Owners' translation tables are
//! only locked after both.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::Result,
    page_replacer::{ClockReplacer, PageOwner, Victim},
    swap::SwapSpace,
};

/// Who holds a frame. The owner reference is weak: it never keeps a process alive.
pub struct InvertedEntry {
    owner: Weak<dyn PageOwner>,
    pid: u32,
    vpn: usize,
    pins: u32,
}

impl InvertedEntry {
    pub fn owner(&self) -> Option<Arc<dyn PageOwner>> {
        self.owner.upgrade()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn vpn(&self) -> usize {
        self.vpn
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

pub struct InvertedTable {
    entries: Vec<Option<InvertedEntry>>,
    /// Frames with at least one pin.
    pinned: usize,
}

impl InvertedTable {
    pub fn new(num_frames: usize) -> Self {
        InvertedTable {
            entries: (0..num_frames).map(|_| None).collect(),
            pinned: 0,
        }
    }

    pub fn entry(&self, ppn: usize) -> Option<&InvertedEntry> {
        self.entries[ppn].as_ref()
    }

    pub fn pinned_frames(&self) -> usize {
        self.pinned
    }

    pub fn install(&mut self, ppn: usize, owner: &Arc<dyn PageOwner>, vpn: usize) {
        assert!(self.entries[ppn].is_none(), "frames: ppn {:#x} already owned", ppn);

        self.entries[ppn] = Some(InvertedEntry {
            owner: Arc::downgrade(owner),
            pid: owner.pid(),
            vpn,
            pins: 0,
        });
    }

    pub fn clear(&mut self, ppn: usize) -> InvertedEntry {
        match self.entries[ppn].take() {
            Some(entry) => {
                assert!(!entry.is_pinned(), "frames: ppn {:#x} released while pinned", ppn);
                entry
            }
            None => panic!("frames: ppn {:#x} released while free", ppn),
        }
    }

    pub fn pin(&mut self, ppn: usize) {
        let entry = match self.entries[ppn].as_mut() {
            Some(entry) => entry,
            None => panic!("frames: pin on free ppn {:#x}", ppn),
        };

        if entry.pins == 0 {
            self.pinned += 1;
        }
        entry.pins += 1;
    }

    /// Returns true if this released the frame's last pin.
    pub fn unpin(&mut self, ppn: usize) -> bool {
        let entry = match self.entries[ppn].as_mut() {
            Some(entry) if entry.pins > 0 => entry,
            _ => panic!("frames: unpin on unpinned ppn {:#x}", ppn),
        };

        entry.pins -= 1;
        if entry.pins == 0 {
            self.pinned -= 1;
            return true;
        }
        false
    }
}

struct FrameState {
    free: VecDeque<usize>,
    clock: ClockReplacer,
}

pub struct FrameAllocator {
    num_frames: usize,
    state: Mutex<FrameState>,
    table: Mutex<InvertedTable>,
    unpinned: Condvar,
    swap: Arc<SwapSpace>,
}

impl FrameAllocator {
    pub fn new(num_frames: usize, swap: Arc<SwapSpace>) -> Self {
        FrameAllocator {
            num_frames,
            state: Mutex::new(FrameState {
                free: (0..num_frames).collect(),
                clock: ClockReplacer::new(num_frames),
            }),
            table: Mutex::new(InvertedTable::new(num_frames)),
            unpinned: Condvar::new(),
            swap,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Hands `vpn` of `owner` a frame, evicting one if none are free.
    ///
    /// Blocks while every frame is pinned. Errors only come from writing a
    /// dirty victim out to swap; the victim then stays resident.
    pub fn allocate(&self, owner: &Arc<dyn PageOwner>, vpn: usize) -> Result<usize> {
        let mut state = self.state.lock();
        let mut table = self.table.lock();

        let ppn = match state.free.pop_front() {
            Some(ppn) => ppn,
            None => self.evict(&mut state, &mut table)?,
        };

        table.install(ppn, owner, vpn);

        debug!(
            "frames: assign ppn {:#x} to pid {} vpn {:#x}",
            ppn,
            owner.pid(),
            vpn
        );

        Ok(ppn)
    }

    fn evict(&self, state: &mut FrameState, table: &mut MutexGuard<'_, InvertedTable>) -> Result<usize> {
        debug!("frames: out of free frames, evicting");

        while table.pinned_frames() == self.num_frames {
            debug!("frames: all {} frames pinned, waiting", self.num_frames);
            self.unpinned.wait(table);
        }

        let Victim { ppn, vpn, owner } = state.clock.pick_victim(&**table);

        if let Some(owner) = owner {
            let slot = if owner.is_dirty(vpn) {
                let slot = self.swap.allocate_slot()?;
                if let Err(e) = self.swap.write_slot(ppn, slot) {
                    self.swap.deallocate_slot(slot);
                    return Err(e);
                }
                debug!("frames: evict ppn {:#x} to spn {:#x}", ppn, slot);
                Some(slot)
            } else {
                debug!("frames: evict ppn {:#x}, clean", ppn);
                None
            };

            owner.unset_valid(vpn);
            owner.set_swap_slot(vpn, slot);
        }

        table.clear(ppn);

        Ok(ppn)
    }

    /// Returns a frame to the free list. The frame must be owned and unpinned.
    pub fn deallocate(&self, ppn: usize) {
        let mut state = self.state.lock();
        let mut table = self.table.lock();

        let entry = table.clear(ppn);
        state.free.push_back(ppn);

        debug!("frames: deallocate ppn {:#x} (pid {} vpn {:#x})", ppn, entry.pid(), entry.vpn());
    }

    pub fn pin(&self, ppn: usize) {
        let mut table = self.table.lock();
        table.pin(ppn);

        debug!("frames: pin ppn {:#x}, {} pinned", ppn, table.pinned_frames());
    }

    pub fn unpin(&self, ppn: usize) {
        let mut table = self.table.lock();
        if table.unpin(ppn) {
            self.unpinned.notify_one();
        }

        debug!("frames: unpin ppn {:#x}, {} pinned", ppn, table.pinned_frames());
    }

    /// Pins the frame `vpn` is resident in, checking residency under the pin lock.
    ///
    /// Returns `None` if the page is not resident; the caller faults it in and
    /// tries again.
    pub fn pin_resident(&self, owner: &dyn PageOwner, vpn: usize) -> Option<usize> {
        let mut table = self.table.lock();

        let ppn = owner.resident_frame(vpn)?;

        match table.entry(ppn) {
            Some(entry) if entry.pid() == owner.pid() && entry.vpn() == vpn => {}
            _ => panic!(
                "frames: pid {} vpn {:#x} maps ppn {:#x}, which the inverted table disagrees with",
                owner.pid(),
                vpn,
                ppn
            ),
        }

        table.pin(ppn);
        Some(ppn)
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn pinned_frames(&self) -> usize {
        self.table.lock().pinned_frames()
    }

    pub fn clock_hand(&self) -> usize {
        self.state.lock().clock.hand()
    }

    /// Owner pid and vpn of a frame, or `None` if it is free.
    pub fn owner_of(&self, ppn: usize) -> Option<(u32, usize)> {
        self.table.lock().entry(ppn).map(|e| (e.pid(), e.vpn()))
    }

    /// Panics unless every frame is either free or owned, never both, and
    /// every owned frame agrees with its owner's translation entry.
    ///
    /// Owners are checked the other way round as well: each valid entry of a
    /// live owner must name a frame the inverted table gives to that entry.
    /// Owners holding no frame at all are not reachable from here.
    pub fn audit(&self) {
        let state = self.state.lock();
        let table = self.table.lock();

        let mut on_free_list = vec![false; self.num_frames];
        for &ppn in &state.free {
            assert!(!on_free_list[ppn], "frames: ppn {:#x} on the free list twice", ppn);
            on_free_list[ppn] = true;
        }

        let mut pinned = 0;
        let mut owners: Vec<Arc<dyn PageOwner>> = Vec::new();
        for (ppn, free) in on_free_list.into_iter().enumerate() {
            match (table.entry(ppn), free) {
                (Some(_), true) => panic!("frames: ppn {:#x} both free and owned", ppn),
                (None, false) => panic!("frames: ppn {:#x} neither free nor owned", ppn),
                (None, true) => {}
                (Some(entry), false) => {
                    if entry.is_pinned() {
                        pinned += 1;
                    }
                    let Some(owner) = entry.owner() else {
                        continue;
                    };
                    if let Some(frame) = owner.resident_frame(entry.vpn()) {
                        assert_eq!(
                            frame, ppn,
                            "frames: pid {} vpn {:#x} maps ppn {:#x}, inverted table says ppn {:#x}",
                            entry.pid(), entry.vpn(), frame, ppn
                        );
                    }
                    if !owners.iter().any(|o| o.pid() == owner.pid()) {
                        owners.push(owner);
                    }
                }
            }
        }

        for owner in &owners {
            for (vpn, ppn) in owner.resident_pages() {
                match table.entry(ppn) {
                    Some(entry) if entry.pid() == owner.pid() && entry.vpn() == vpn => {}
                    Some(entry) => panic!(
                        "frames: pid {} vpn {:#x} claims ppn {:#x}, held by pid {} vpn {:#x}",
                        owner.pid(), vpn, ppn, entry.pid(), entry.vpn()
                    ),
                    None => panic!("frames: pid {} vpn {:#x} claims free ppn {:#x}", owner.pid(), vpn, ppn),
                }
            }
        }

        assert_eq!(pinned, table.pinned_frames(), "frames: pinned count drifted");
    }
}
