//! Per-process record of every user page and where its contents come from.

use super::{
    frame_allocator::Kpage,
    frame_table::{FrameEntry, FrameTableGuard},
    mmap::MapId,
    vm_error::VmError,
};
use crate::{
    fs::File,
    paging::PageDirectory,
    swapping::swap_space::SwapSlot,
    sync::mutex::Mutex,
    system::System,
    user_program::process::Tid,
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::fmt;
use kidneyvm_shared::mem::{pg_round_down, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, trace, warn};

/// The part of a file that fills one page. The rest of the page is zero.
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<dyn File>,
    pub offset: usize,
    pub read_bytes: usize,
}

impl FileRegion {
    pub fn zero_bytes(&self) -> usize {
        PAGE_FRAME_SIZE - self.read_bytes
    }
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a non-resident page's contents are fetched from.
#[derive(Clone, Debug)]
pub enum PageSource {
    /// Zero-filled on first touch.
    Anonymous,
    /// A page of an executable segment. Once evicted it moves to swap.
    File(FileRegion),
    /// A page of a memory-mapped file, written back to the file when dirty.
    Mmap { region: FileRegion, mapid: MapId },
    /// Evicted to swap.
    Swapped(SwapSlot),
}

impl PageSource {
    pub fn mapid(&self) -> Option<MapId> {
        match self {
            PageSource::Mmap { mapid, .. } => Some(*mapid),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PageEntry {
    pub upage: usize,
    pub source: PageSource,
    pub writable: bool,
    /// Set exactly while the frame table has an entry for this page.
    pub resident: bool,
}

pub struct SupplementalPageTable {
    tid: Tid,
    pagedir: Arc<dyn PageDirectory>,
    entries: Mutex<BTreeMap<usize, PageEntry>>,
}

impl SupplementalPageTable {
    pub fn new(tid: Tid, pagedir: Arc<dyn PageDirectory>) -> Self {
        Self {
            tid,
            pagedir,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    /// Adds a non-resident page. File-backed sources are used as given:
    /// callers reopen the file once for a whole segment or mapping.
    pub fn install(&self, va: usize, source: PageSource, writable: bool) -> Result<(), VmError> {
        let upage = pg_round_down(va);
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return Err(VmError::AlreadyMapped);
        }
        entries.insert(upage, PageEntry {
            upage,
            source,
            writable,
            resident: false,
        });
        Ok(())
    }

    /// Installs several pages at once, or none of them if any is taken.
    pub(crate) fn install_all(
        &self,
        pages: impl Iterator<Item = (usize, PageSource)> + Clone,
        writable: bool,
    ) -> Result<(), VmError> {
        let mut entries = self.entries.lock();
        if pages.clone().any(|(upage, _)| entries.contains_key(&upage)) {
            return Err(VmError::MapConflict);
        }
        for (upage, source) in pages {
            entries.insert(upage, PageEntry {
                upage,
                source,
                writable,
                resident: false,
            });
        }
        Ok(())
    }

    pub fn lookup(&self, va: usize) -> Option<PageEntry> {
        self.entries.lock().get(&pg_round_down(va)).cloned()
    }

    pub fn exists(&self, va: usize) -> bool {
        self.entries.lock().contains_key(&pg_round_down(va))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest page of the stack, or `OFFSET` if the stack has no pages yet.
    pub fn stack_floor(&self, stack_limit: usize) -> usize {
        self.entries
            .lock()
            .range(stack_limit..OFFSET)
            .next()
            .map_or(OFFSET, |(&upage, _)| upage)
    }

    /// Makes the page containing `va` resident. Does nothing if it already
    /// is. With `pin`, the frame stays pinned until the caller unpins it.
    pub fn fault_in(self: &Arc<Self>, sys: &System, va: usize, pin: bool) -> Result<(), VmError> {
        let upage = pg_round_down(va);

        let source = {
            let mut frames = sys.frames.lock();
            let entries = self.entries.lock();
            let entry = entries.get(&upage).ok_or(VmError::NotMapped)?;
            if entry.resident {
                if pin {
                    frames.set_pinned(sys, self.tid, upage, true);
                }
                return Ok(());
            }
            entry.source.clone()
        };

        // Swapped pages are zero-filled too: the swap read overwrites the
        // whole page, but a failed read must not leak the previous owner's data.
        let zero = matches!(source, PageSource::Anonymous | PageSource::Swapped(_));
        let kpage = sys.frames.obtain_frame(sys, self.tid, zero)?;
        if let Err(e) = self.load(sys, &source, kpage) {
            sys.pool.free(kpage);
            return Err(e);
        }

        let mut frames = sys.frames.lock();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&upage) else {
            sys.pool.free(kpage);
            return Err(VmError::NotMapped);
        };
        if !self.pagedir.set_page(upage, kpage, entry.writable) {
            sys.pool.free(kpage);
            return Err(VmError::AlreadyMapped);
        }
        self.pagedir.set_dirty(upage, false);

        entry.resident = true;
        // The slot is released only once the frame is mapped.
        let freed_slot = match entry.source {
            PageSource::Swapped(slot) => {
                entry.source = PageSource::Anonymous;
                Some(slot)
            }
            _ => None,
        };
        frames.record(
            sys,
            FrameEntry {
                tid: self.tid,
                upage,
                kpage,
                owner: Arc::clone(self),
            },
            pin,
        );
        trace!("thread {} faulted in {:#x} at {:?}", self.tid, upage, kpage);
        if let Some(slot) = freed_slot {
            sys.swap.free_slot(slot)?;
        }
        Ok(())
    }

    /// Fills `kpage` from `source`. File and swap reads go through a bounce
    /// buffer so that no I/O happens under the frame's lock.
    fn load(&self, sys: &System, source: &PageSource, kpage: Kpage) -> Result<(), VmError> {
        let mut page = Box::new([0; PAGE_FRAME_SIZE]);
        match source {
            PageSource::Anonymous => return Ok(()),
            PageSource::Swapped(slot) => sys.swap.read_slot(*slot, &mut page)?,
            PageSource::File(region) | PageSource::Mmap { region, .. } => {
                let read = {
                    let _fs = sys.filesys_lock.acquire_unless_held(self.tid);
                    region
                        .file
                        .read_at(&mut page[..region.read_bytes], region.offset)
                };
                if read != region.read_bytes {
                    return Err(VmError::ShortRead);
                }
            }
        }
        sys.pool.with_frame(kpage, |frame| frame.copy_from_slice(&page[..]));
        Ok(())
    }

    /// Installs zero-filled pages from the page containing `va` up to the
    /// current bottom of the stack, faulting each one in. Pages are installed
    /// one at a time, so a page that appeared meanwhile is simply faulted in.
    pub fn grow_stack(self: &Arc<Self>, sys: &System, va: usize) -> Result<(), VmError> {
        let first = pg_round_down(va);
        // Pages the buffer validator installed can leave the floor below the
        // faulting page; the faulting page itself is always covered.
        let end = self
            .stack_floor(sys.config.stack_limit())
            .max(first + PAGE_FRAME_SIZE);
        debug!("thread {} growing stack from {:#x} to {:#x}", self.tid, end, first);

        for upage in (first..end).step_by(PAGE_FRAME_SIZE) {
            match self.install(upage, PageSource::Anonymous, true) {
                Ok(()) | Err(VmError::AlreadyMapped) => {}
                Err(e) => return Err(e),
            }
            self.fault_in(sys, upage, false)?;
        }
        Ok(())
    }

    /// Removes the page containing `va`, writing it back first if it is a
    /// dirty mapped page.
    pub fn remove(&self, sys: &System, va: usize) -> Result<(), VmError> {
        let upage = pg_round_down(va);
        let mut frames = sys.frames.lock();
        let entry = self
            .entries
            .lock()
            .remove(&upage)
            .ok_or(VmError::NotMapped)?;
        self.release_entry(sys, &mut frames, entry)
    }

    /// Removes every page with mapping id `mapid`.
    pub(crate) fn remove_mapping(&self, sys: &System, mapid: MapId) -> Result<(), VmError> {
        let mut frames = sys.frames.lock();
        let removed: alloc::vec::Vec<_> = {
            let mut entries = self.entries.lock();
            let pages: alloc::vec::Vec<_> = entries
                .values()
                .filter(|entry| entry.source.mapid() == Some(mapid))
                .map(|entry| entry.upage)
                .collect();
            pages
                .iter()
                .filter_map(|upage| entries.remove(upage))
                .collect()
        };
        if removed.is_empty() {
            return Err(VmError::InvalidMapping);
        }

        let mut result = Ok(());
        for entry in removed {
            let released = self.release_entry(sys, &mut frames, entry);
            result = result.and(released);
        }
        result
    }

    /// Releases everything the process holds. Runs once, at process exit.
    pub fn teardown(&self, sys: &System) {
        let mut frames = sys.frames.lock();
        let entries = core::mem::take(&mut *self.entries.lock());
        for entry in entries.into_values() {
            let upage = entry.upage;
            if let Err(e) = self.release_entry(sys, &mut frames, entry) {
                warn!("thread {}: releasing {:#x} failed: {}", self.tid, upage, e);
            }
        }
        frames.release_all_for_thread(sys, self.tid);
    }

    /// Frees whatever backs an entry that is no longer in the table. Dirty
    /// mapped pages are written back first; the frame is freed even when the
    /// write-back fails.
    fn release_entry(
        &self,
        sys: &System,
        frames: &mut FrameTableGuard<'_>,
        entry: PageEntry,
    ) -> Result<(), VmError> {
        if let PageSource::Swapped(slot) = entry.source {
            sys.swap.free_slot(slot)?;
            return Ok(());
        }
        if !entry.resident {
            return Ok(());
        }

        let Some(frame) = frames.take(self.tid, entry.upage) else {
            return Ok(());
        };
        let dirty = self.pagedir.is_dirty(entry.upage);
        self.pagedir.clear_page(entry.upage);

        let result = match &entry.source {
            PageSource::Mmap { region, .. } if dirty => self.write_back(sys, self.tid, region, frame.kpage),
            _ => Ok(()),
        };
        sys.pool.free(frame.kpage);
        result
    }

    fn write_back(
        &self,
        sys: &System,
        requester: Tid,
        region: &FileRegion,
        kpage: Kpage,
    ) -> Result<(), VmError> {
        let mut page = Box::new([0; PAGE_FRAME_SIZE]);
        sys.pool.with_frame(kpage, |frame| page.copy_from_slice(&frame[..]));

        let written = {
            let _fs = sys.filesys_lock.acquire_unless_held(requester);
            region
                .file
                .write_at(&page[..region.read_bytes], region.offset)
        };
        if written != region.read_bytes {
            return Err(VmError::ShortWrite);
        }
        Ok(())
    }

    /// Persists the resident page `upage` so that its frame can be reused.
    /// Called by the frame table during eviction, with the frame table locked.
    /// On error the page stays resident and mapped.
    pub(crate) fn evict(
        &self,
        sys: &System,
        requester: Tid,
        upage: usize,
        kpage: Kpage,
    ) -> Result<(), VmError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&upage).ok_or(VmError::NotMapped)?;
        debug_assert!(entry.resident);

        // Unmap first so the owner cannot write to the page while it is being
        // saved.
        let dirty = self.pagedir.is_dirty(upage);
        self.pagedir.clear_page(upage);

        let saved = match &entry.source {
            PageSource::Mmap { region, .. } if dirty => {
                self.write_back(sys, requester, region, kpage).map(|()| None)
            }
            PageSource::Mmap { .. } => Ok(None),
            PageSource::Anonymous | PageSource::File(_) => {
                let mut page = Box::new([0; PAGE_FRAME_SIZE]);
                sys.pool.with_frame(kpage, |frame| page.copy_from_slice(&frame[..]));
                sys.swap.swap_out(&page).map(Some).map_err(VmError::from)
            }
            PageSource::Swapped(_) => unreachable!("resident page {upage:#x} is marked swapped"),
        };

        match saved {
            Ok(Some(slot)) => entry.source = PageSource::Swapped(slot),
            Ok(None) => {}
            Err(e) => {
                self.pagedir.set_page(upage, kpage, entry.writable);
                self.pagedir.set_dirty(upage, dirty);
                return Err(e);
            }
        }

        entry.resident = false;
        debug!(
            "evicted {:#x} of thread {} ({:?})",
            upage, self.tid, entry.source
        );
        Ok(())
    }

    /// Marks `upage` non-resident after the frame table dropped its frame.
    pub(crate) fn forget_residency(&self, upage: usize) {
        if let Some(entry) = self.entries.lock().get_mut(&upage) {
            entry.resident = false;
        }
    }
}
