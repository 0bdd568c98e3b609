//! Per-process address translation for user pages.
//!
//! The VM subsystem only ever talks to a [`PageDirectory`]; it never walks
//! hardware tables itself. [`SoftPageDirectory`] keeps the two-level x86
//! layout in memory and plays the role of the MMU for the accessed and dirty
//! bits through [`PageDirectory::access`].

use crate::{mem::frame_allocator::Kpage, sync::mutex::Mutex};
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::u20;
use kidneyvm_shared::{
    mem::is_user_vaddr,
    paging::{PageTable, PageTableEntry, VirtualAddress},
};

pub trait PageDirectory: Send + Sync {
    /// Maps `upage` to `kpage`. Returns `false` if `upage` is already mapped,
    /// in which case nothing changes.
    fn set_page(&self, upage: usize, kpage: Kpage, writable: bool) -> bool;

    /// Removes the mapping of `upage`, if any. Later accesses fault.
    fn clear_page(&self, upage: usize);

    fn get_page(&self, upage: usize) -> Option<Kpage>;

    fn is_accessed(&self, upage: usize) -> bool;

    fn set_accessed(&self, upage: usize, accessed: bool);

    fn is_dirty(&self, upage: usize) -> bool;

    fn set_dirty(&self, upage: usize, dirty: bool);

    /// Translates an access to `upage` the way the MMU would: sets the
    /// accessed bit, and the dirty bit for writes. Returns `None` for a
    /// not-present page or a write to a read-only one.
    fn access(&self, upage: usize, write: bool) -> Option<Kpage>;
}

#[derive(Default)]
pub struct SoftPageDirectory {
    tables: Mutex<BTreeMap<u16, Box<PageTable>>>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(upage: usize) -> (u16, usize) {
        debug_assert!(is_user_vaddr(upage));
        let va = VirtualAddress::new_with_raw_value(upage as u32);
        (
            va.page_directory_index().value(),
            va.page_table_index().value() as usize,
        )
    }

    /// Applies `f` to the present entry of `upage`. Returns `None` if there is
    /// no such entry.
    fn update<R>(&self, upage: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> Option<R> {
        let (pde, pte) = Self::split(upage);
        let mut tables = self.tables.lock();
        let entry = &mut tables.get_mut(&pde)?[pte];
        entry.present().then(|| f(entry))
    }

    /// Number of page tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn set_page(&self, upage: usize, kpage: Kpage, writable: bool) -> bool {
        let (pde, pte) = Self::split(upage);
        let mut tables = self.tables.lock();
        let entry = &mut tables.entry(pde).or_default()[pte];
        if entry.present() {
            return false;
        }
        *entry = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(kpage.frame_number() as u32));
        true
    }

    fn clear_page(&self, upage: usize) {
        let (pde, pte) = Self::split(upage);
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get_mut(&pde) {
            table[pte] = PageTableEntry::DEFAULT;
            if table.is_empty() {
                tables.remove(&pde);
            }
        }
    }

    fn get_page(&self, upage: usize) -> Option<Kpage> {
        self.update(upage, |entry| {
            Kpage::from_frame_number(entry.page_frame_address().value() as usize)
        })
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.update(upage, |entry| entry.accessed()).unwrap_or(false)
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |entry| *entry = entry.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.update(upage, |entry| entry.dirty()).unwrap_or(false)
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |entry| *entry = entry.with_dirty(dirty));
    }

    fn access(&self, upage: usize, write: bool) -> Option<Kpage> {
        self.update(upage, |entry| {
            if write && !entry.read_write() {
                return None;
            }
            *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
            Some(Kpage::from_frame_number(
                entry.page_frame_address().value() as usize,
            ))
        })
        .flatten()
    }
}
