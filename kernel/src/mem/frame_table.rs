//! The frame table: which user page each allocated frame of the user pool
//! backs, kept in allocation order for the eviction clock.

use super::{
    frame_allocator::Kpage, supplemental_page_table::SupplementalPageTable, vm_error::VmError,
};
use crate::{
    swapping::page_replacement::PageReplacementPolicy,
    sync::mutex::{Mutex, MutexGuard},
    system::System,
    user_program::process::Tid,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use log::trace;

/// A frame of the user pool that currently backs a user page.
///
/// The entry names the page by `(tid, upage)` and keeps a handle to the owning
/// process's supplemental page table, through which eviction finds the page's
/// metadata and page directory.
pub struct FrameEntry {
    pub tid: Tid,
    pub upage: usize,
    pub kpage: Kpage,
    pub owner: Arc<SupplementalPageTable>,
}

struct Frames {
    entries: Vec<FrameEntry>,
    policy: Box<dyn PageReplacementPolicy>,
}

pub struct FrameTable {
    frames: Mutex<Frames>,
}

/// The frame table, locked. Anything that must not race with eviction (the
/// residency of a page, its frame entry) is changed while one of these is
/// alive.
pub struct FrameTableGuard<'a> {
    frames: MutexGuard<'a, Frames>,
}

impl FrameTable {
    pub fn new(policy: Box<dyn PageReplacementPolicy>) -> Self {
        Self {
            frames: Mutex::new(Frames {
                entries: Vec::new(),
                policy,
            }),
        }
    }

    pub fn lock(&self) -> FrameTableGuard<'_> {
        FrameTableGuard {
            frames: self.frames.lock(),
        }
    }

    /// Takes a frame from the user pool, evicting a resident page when the
    /// pool is empty. The frame is not in the table yet, so it cannot be
    /// evicted before the caller records it.
    pub fn obtain_frame(&self, sys: &System, tid: Tid, zero: bool) -> Result<Kpage, VmError> {
        loop {
            if let Some(kpage) = sys.pool.alloc(zero) {
                return Ok(kpage);
            }

            let mut frames = self.lock();
            // Another thread may have freed a frame while we waited.
            if let Some(kpage) = sys.pool.alloc(zero) {
                return Ok(kpage);
            }
            // Each eviction frees one frame, but a concurrent allocation may
            // take it before the retry.
            frames.evict(sys, tid)?;
        }
    }

    pub fn record(&self, sys: &System, entry: FrameEntry, pinned: bool) {
        self.lock().record(sys, entry, pinned);
    }

    /// Frees the frame backing `upage` of `tid`, clears its mapping and marks
    /// the page non-resident. The caller must not hold the owner's
    /// supplemental page table lock.
    pub fn release(&self, sys: &System, tid: Tid, upage: usize) {
        let mut frames = self.lock();
        if let Some(frame) = frames.take(tid, upage) {
            frame.owner.pagedir().clear_page(upage);
            frame.owner.forget_residency(upage);
            sys.pool.free(frame.kpage);
        }
    }

    pub fn release_all_for_thread(&self, sys: &System, tid: Tid) {
        self.lock().release_all_for_thread(sys, tid);
    }

    pub fn lookup_owner(&self, tid: Tid, upage: usize) -> Option<Kpage> {
        self.lock().find(tid, upage).map(|frame| frame.kpage)
    }

    pub fn len(&self) -> usize {
        self.lock().frames.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins the frame backing `upage` so that it cannot be evicted. Returns
    /// `false` if the page is not resident.
    pub fn pin(&self, sys: &System, tid: Tid, upage: usize) -> bool {
        self.lock().set_pinned(sys, tid, upage, true)
    }

    pub fn unpin(&self, sys: &System, tid: Tid, upage: usize) -> bool {
        self.lock().set_pinned(sys, tid, upage, false)
    }
}

impl FrameTableGuard<'_> {
    fn position(&self, tid: Tid, upage: usize) -> Option<usize> {
        self.frames
            .entries
            .iter()
            .position(|frame| frame.tid == tid && frame.upage == upage)
    }

    pub fn find(&self, tid: Tid, upage: usize) -> Option<&FrameEntry> {
        self.position(tid, upage).map(|i| &self.frames.entries[i])
    }

    pub fn record(&mut self, sys: &System, entry: FrameEntry, pinned: bool) {
        debug_assert!(self.find(entry.tid, entry.upage).is_none());
        if pinned {
            sys.pool.pin(entry.kpage);
        }
        self.frames.entries.push(entry);
    }

    /// Removes the entry of `upage` from the table without freeing its frame.
    pub fn take(&mut self, tid: Tid, upage: usize) -> Option<FrameEntry> {
        let index = self.position(tid, upage)?;
        Some(self.remove(index))
    }

    fn remove(&mut self, index: usize) -> FrameEntry {
        let frame = self.frames.entries.remove(index);
        self.frames.policy.removed(index);
        frame
    }

    pub fn set_pinned(&mut self, sys: &System, tid: Tid, upage: usize, pinned: bool) -> bool {
        match self.find(tid, upage) {
            Some(frame) => {
                if pinned {
                    sys.pool.pin(frame.kpage);
                } else {
                    sys.pool.unpin(frame.kpage);
                }
                true
            }
            None => false,
        }
    }

    /// Frees every frame still owned by `tid`. Entries of other threads keep
    /// their relative order, so the clock hand stays meaningful for them.
    pub fn release_all_for_thread(&mut self, sys: &System, tid: Tid) {
        for index in (0..self.frames.entries.len()).rev() {
            if self.frames.entries[index].tid != tid {
                continue;
            }
            let frame = self.remove(index);
            frame.owner.pagedir().clear_page(frame.upage);
            frame.owner.forget_residency(frame.upage);
            sys.pool.free(frame.kpage);
        }
    }

    /// Evicts one page, returning its frame to the user pool. `requester` is
    /// the thread that needs the frame.
    pub fn evict(&mut self, sys: &System, requester: Tid) -> Result<(), VmError> {
        let frames = &mut *self.frames;
        let index = frames
            .policy
            .evict_page(&frames.entries, &sys.pool)
            .ok_or(VmError::NoVictim)?;

        let victim = &frames.entries[index];
        victim
            .owner
            .evict(sys, requester, victim.upage, victim.kpage)?;

        let victim = self.remove(index);
        sys.pool.free(victim.kpage);
        trace!("freed {:?} for thread {}", victim.kpage, requester);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PageDirectory;
    use crate::{
        mem::supplemental_page_table::PageSource,
        test_util::{test_system, TestProcess},
    };
    use kidneyvm_shared::mem::PAGE_FRAME_SIZE;

    const BASE: usize = 0x1000_0000;

    fn resident(sys: &System, process: &TestProcess, pages: core::ops::Range<usize>) {
        for i in pages {
            let upage = BASE + i * PAGE_FRAME_SIZE;
            process
                .spt
                .install(upage, PageSource::Anonymous, true)
                .unwrap();
            process.spt.fault_in(sys, upage, false).unwrap();
        }
    }

    #[test]
    fn lookup_matches_page_directory() {
        let sys = test_system(4, 8);
        let process = TestProcess::new(3);
        resident(&sys, &process, 0..3);

        assert_eq!(sys.frames.len(), 3);
        for i in 0..3 {
            let upage = BASE + i * PAGE_FRAME_SIZE;
            let kpage = sys.frames.lookup_owner(3, upage).unwrap();
            assert_eq!(process.pagedir.get_page(upage), Some(kpage));
        }
        assert_eq!(sys.frames.lookup_owner(4, BASE), None);
    }

    #[test]
    fn obtain_frame_evicts_when_pool_is_empty() {
        let sys = test_system(2, 8);
        let process = TestProcess::new(1);
        resident(&sys, &process, 0..2);
        assert_eq!(sys.pool.free_frames(), 0);

        let kpage = sys.frames.obtain_frame(&sys, 1, true).unwrap();
        assert_eq!(sys.frames.len(), 1);
        assert_eq!(sys.swap.free_slots(), 7);

        // The first page was the victim: its mapping is gone and it lives in swap.
        assert_eq!(process.pagedir.get_page(BASE), None);
        let entry = process.spt.lookup(BASE).unwrap();
        assert!(!entry.resident);
        assert!(matches!(entry.source, PageSource::Swapped(_)));
        sys.pool.free(kpage);
    }

    #[test]
    fn fully_pinned_table_has_no_victim() {
        let sys = test_system(2, 8);
        let process = TestProcess::new(1);
        resident(&sys, &process, 0..2);
        assert!(sys.frames.pin(&sys, 1, BASE));
        assert!(sys.frames.pin(&sys, 1, BASE + PAGE_FRAME_SIZE));

        assert_eq!(
            sys.frames.obtain_frame(&sys, 1, true),
            Err(VmError::NoVictim)
        );

        assert!(sys.frames.unpin(&sys, 1, BASE));
        assert!(sys.frames.obtain_frame(&sys, 1, true).is_ok());
        assert!(!sys.frames.pin(&sys, 1, BASE));
    }

    #[test]
    fn release_all_leaves_other_threads_alone() {
        let sys = test_system(6, 8);
        let a = TestProcess::new(1);
        let b = TestProcess::new(2);
        resident(&sys, &a, 0..2);
        resident(&sys, &b, 0..2);
        resident(&sys, &a, 2..3);

        sys.frames.release_all_for_thread(&sys, 1);
        assert_eq!(sys.frames.len(), 2);
        assert_eq!(sys.pool.free_frames(), 4);
        assert!(sys.frames.lookup_owner(2, BASE).is_some());
        assert!(!a.spt.lookup(BASE).unwrap().resident);
        assert_eq!(a.pagedir.get_page(BASE), None);
    }

    #[test]
    fn release_frees_one_frame() {
        let sys = test_system(2, 8);
        let process = TestProcess::new(1);
        resident(&sys, &process, 0..1);

        sys.frames.release(&sys, 1, BASE);
        assert!(sys.frames.is_empty());
        assert_eq!(sys.pool.free_frames(), 2);
        assert_eq!(process.pagedir.get_page(BASE), None);
        assert!(!process.spt.lookup(BASE).unwrap().resident);
    }
}
