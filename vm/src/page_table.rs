/// Residency record for one virtual page.
///
/// While `valid` is set the stored location is a physical frame number;
/// otherwise it is a swap slot, or nothing if the page has never been
/// swapped out and has to come from the image or zero fill.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
    pub vpn: usize,
    frame_or_slot: Option<usize>,
    pub valid: bool,
    pub read_only: bool,
    pub used: bool,
    pub dirty: bool,
}

impl TranslationEntry {
    pub fn new(vpn: usize, read_only: bool) -> Self {
        TranslationEntry {
            vpn,
            frame_or_slot: None,
            valid: false,
            read_only,
            used: false,
            dirty: false,
        }
    }

    pub fn frame(&self) -> Option<usize> {
        self.frame_or_slot.filter(|_| self.valid)
    }

    pub fn swap_slot(&self) -> Option<usize> {
        self.frame_or_slot.filter(|_| !self.valid)
    }

    /// Makes the page resident in `ppn` and marks it recently used.
    pub fn map_frame(&mut self, ppn: usize) {
        self.frame_or_slot = Some(ppn);
        self.valid = true;
        self.used = true;
    }

    /// Records where an invalid page now lives. `None` means "reload from source".
    pub fn set_swap_slot(&mut self, slot: Option<usize>) {
        assert!(!self.valid, "vpn {:#x}: swap slot set on a resident page", self.vpn);
        self.frame_or_slot = slot;
    }
}

/// Per-process translation table, indexed by virtual page number.
#[derive(Debug, Default)]
pub struct PageTable {
    table: Vec<TranslationEntry>,
}

impl PageTable {
    pub fn new(entries: Vec<TranslationEntry>) -> Self {
        debug_assert!(entries.iter().enumerate().all(|(vpn, e)| e.vpn == vpn));

        PageTable { table: entries }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, vpn: usize) -> Option<&TranslationEntry> {
        self.table.get(vpn)
    }

    pub fn get_mut(&mut self, vpn: usize) -> Option<&mut TranslationEntry> {
        self.table.get_mut(vpn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.table.iter()
    }

    /// Empties the table, handing back every entry for teardown.
    pub fn take(&mut self) -> Vec<TranslationEntry> {
        std::mem::take(&mut self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_has_no_location() {
        let entry = TranslationEntry::new(3, true);
        assert!(!entry.valid);
        assert!(entry.read_only);
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.swap_slot(), None);
    }

    #[test]
    fn valid_bit_picks_meaning_of_location() {
        let mut entry = TranslationEntry::new(0, false);
        entry.map_frame(7);
        assert_eq!(entry.frame(), Some(7));
        assert_eq!(entry.swap_slot(), None);
        assert!(entry.used);

        entry.valid = false;
        entry.set_swap_slot(Some(2));
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.swap_slot(), Some(2));
    }

    #[test]
    #[should_panic]
    fn swap_slot_on_resident_page_panics() {
        let mut entry = TranslationEntry::new(0, false);
        entry.map_frame(1);
        entry.set_swap_slot(Some(0));
    }

    #[test]
    fn take_empties_table() {
        let mut table = PageTable::new((0..4).map(|vpn| TranslationEntry::new(vpn, false)).collect());
        assert_eq!(table.len(), 4);
        assert_eq!(table.take().len(), 4);
        assert!(table.is_empty());
        assert!(table.get(0).is_none());
    }
}
