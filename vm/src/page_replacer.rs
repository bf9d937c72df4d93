//! Clock (second-chance) victim selection.

use std::sync::Arc;

use log::{debug, warn};

use crate::frame_allocator::InvertedTable;

/// What eviction may ask of the process owning a frame, without owning the process.
pub trait PageOwner: Send + Sync {
    fn pid(&self) -> u32;

    fn is_used(&self, vpn: usize) -> bool;

    fn is_dirty(&self, vpn: usize) -> bool;

    fn unset_used(&self, vpn: usize);

    fn unset_valid(&self, vpn: usize);

    /// Where the page lives once evicted. `None` means it reloads from its source.
    fn set_swap_slot(&self, vpn: usize, slot: Option<usize>);

    /// The frame `vpn` is resident in, if any.
    fn resident_frame(&self, vpn: usize) -> Option<usize>;

    /// Every `(vpn, ppn)` pair whose entry is valid.
    fn resident_pages(&self) -> Vec<(usize, usize)>;
}

/// The frame chosen for eviction and who it belonged to.
pub struct Victim {
    pub ppn: usize,
    pub vpn: usize,
    /// `None` when the owner went away without releasing its frames.
    pub owner: Option<Arc<dyn PageOwner>>,
}

/// A hand sweeping the frames in a circle. The position survives between evictions.
#[derive(Debug)]
pub struct ClockReplacer {
    hand: usize,
    num_frames: usize,
}

impl ClockReplacer {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0);

        ClockReplacer { hand: 0, num_frames }
    }

    /// Where the next sweep starts.
    pub fn hand(&self) -> usize {
        self.hand
    }

    fn advance(&mut self) {
        self.hand = (self.hand + 1) % self.num_frames;
    }

    /// Sweeps from the hand until it finds an unused, unpinned frame.
    ///
    /// Every frame passed over loses its used bit, pinned or not. The caller
    /// must hold the table and guarantee at least one frame is unpinned.
    pub fn pick_victim(&mut self, table: &InvertedTable) -> Victim {
        debug_assert!(table.pinned_frames() < self.num_frames);

        loop {
            let ppn = self.hand;
            let entry = match table.entry(ppn) {
                Some(entry) => entry,
                None => panic!("clock: ppn {:#x} is unowned with no free frames", ppn),
            };

            self.advance();

            let owner = entry.owner();
            let pinned = entry.is_pinned();

            match owner {
                None if !pinned => {
                    warn!("clock: ppn {:#x} belongs to an exited process", ppn);
                    return Victim {
                        ppn,
                        vpn: entry.vpn(),
                        owner: None,
                    };
                }
                None => {}
                Some(owner) => {
                    if !owner.is_used(entry.vpn()) && !pinned {
                        debug!("clock: victim ppn {:#x} (pid {} vpn {:#x})", ppn, owner.pid(), entry.vpn());
                        return Victim {
                            ppn,
                            vpn: entry.vpn(),
                            owner: Some(owner),
                        };
                    }

                    owner.unset_used(entry.vpn());
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::PageOwner;
    use crate::page_table::TranslationEntry;

    /// Owner backed by a bare map of translation entries.
    pub struct FakeOwner {
        pid: u32,
        pages: Mutex<HashMap<usize, TranslationEntry>>,
    }

    impl FakeOwner {
        pub fn new(pid: u32) -> Self {
            FakeOwner {
                pid,
                pages: Mutex::new(HashMap::new()),
            }
        }

        pub fn map(&self, vpn: usize, ppn: usize, used: bool, dirty: bool) {
            let mut entry = TranslationEntry::new(vpn, false);
            entry.map_frame(ppn);
            entry.used = used;
            entry.dirty = dirty;
            self.pages.lock().insert(vpn, entry);
        }

        pub fn entry(&self, vpn: usize) -> TranslationEntry {
            self.pages.lock()[&vpn]
        }
    }

    impl PageOwner for FakeOwner {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_used(&self, vpn: usize) -> bool {
            self.pages.lock().get(&vpn).is_some_and(|e| e.used)
        }

        fn is_dirty(&self, vpn: usize) -> bool {
            self.pages.lock().get(&vpn).is_some_and(|e| e.dirty)
        }

        fn unset_used(&self, vpn: usize) {
            if let Some(e) = self.pages.lock().get_mut(&vpn) {
                e.used = false;
            }
        }

        fn unset_valid(&self, vpn: usize) {
            if let Some(e) = self.pages.lock().get_mut(&vpn) {
                e.valid = false;
            }
        }

        fn set_swap_slot(&self, vpn: usize, slot: Option<usize>) {
            if let Some(e) = self.pages.lock().get_mut(&vpn) {
                e.set_swap_slot(slot);
            }
        }

        fn resident_frame(&self, vpn: usize) -> Option<usize> {
            self.pages.lock().get(&vpn).and_then(|e| e.frame())
        }

        fn resident_pages(&self) -> Vec<(usize, usize)> {
            self.pages
                .lock()
                .values()
                .filter_map(|e| e.frame().map(|ppn| (e.vpn, ppn)))
                .collect()
        }
    }
}
