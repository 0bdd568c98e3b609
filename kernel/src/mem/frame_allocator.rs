//! The user pool: physical frames handed out to back user pages.

use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::{u7, Number};
use bitbybit::bitfield;
use core::fmt;
use kidneyvm_shared::mem::PAGE_FRAME_SIZE;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// Number of outstanding pins. Pinned frames are in use by the kernel and
    /// must not be evicted.
    #[bits(1..=7, rw)]
    pin_count: u7,
}

/// A physical frame of the user pool, identified by its frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kpage(usize);

impl Kpage {
    pub const fn frame_number(self) -> usize {
        self.0
    }

    pub const fn from_frame_number(frame_number: usize) -> Self {
        Self(frame_number)
    }
}

impl fmt::Debug for Kpage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kpage({})", self.0)
    }
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    // Next-fit: the search for a free frame resumes where the last one ended.
    position: usize,
    frames_allocated: usize,
}

pub struct UserPool {
    core_map: Mutex<CoreMap>,
    frames: Box<[Mutex<Box<[u8; PAGE_FRAME_SIZE]>>]>,
}

impl UserPool {
    pub fn new(total_frames: usize) -> Self {
        let frames: Vec<_> = (0..total_frames)
            .map(|_| Mutex::new(Box::new([0; PAGE_FRAME_SIZE])))
            .collect();
        Self {
            core_map: Mutex::new(CoreMap {
                entries: alloc::vec![CoreMapEntry::DEFAULT; total_frames].into_boxed_slice(),
                position: 0,
                frames_allocated: 0,
            }),
            frames: frames.into_boxed_slice(),
        }
    }

    /// Takes a free frame, or returns `None` if the pool is exhausted. The
    /// frame holds whatever its previous owner left unless `zero` is set.
    pub fn alloc(&self, zero: bool) -> Option<Kpage> {
        let kpage = {
            let mut core_map = self.core_map.lock();
            let total = core_map.entries.len();
            let start = core_map.position;
            let index = (0..total)
                .map(|i| (start + i) % total)
                .find(|&i| !core_map.entries[i].allocated())?;

            core_map.entries[index] = CoreMapEntry::DEFAULT.with_allocated(true);
            core_map.position = (index + 1) % total;
            core_map.frames_allocated += 1;
            Kpage(index)
        };

        if zero {
            self.with_frame(kpage, |bytes| bytes.fill(0));
        }
        Some(kpage)
    }

    pub fn free(&self, kpage: Kpage) {
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.entries[kpage.0];
        assert!(entry.allocated(), "double free of {kpage:?}");
        *entry = CoreMapEntry::DEFAULT;
        core_map.frames_allocated -= 1;
    }

    /// Pins may nest: the frame stays pinned until every `pin` has been
    /// matched by an `unpin`.
    pub fn pin(&self, kpage: Kpage) {
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.entries[kpage.0];
        debug_assert!(entry.allocated());
        let count = entry.pin_count();
        assert!(count < u7::MAX, "too many pins on {kpage:?}");
        *entry = entry.with_pin_count(count + u7::new(1));
    }

    pub fn unpin(&self, kpage: Kpage) {
        let mut core_map = self.core_map.lock();
        let entry = &mut core_map.entries[kpage.0];
        let count = entry.pin_count();
        assert!(count > u7::new(0), "unpin of unpinned {kpage:?}");
        *entry = entry.with_pin_count(count - u7::new(1));
    }

    pub fn is_pinned(&self, kpage: Kpage) -> bool {
        self.core_map.lock().entries[kpage.0].pin_count() > u7::new(0)
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }

    /// Runs `f` on the frame's memory. The frame lock is the innermost lock of
    /// the subsystem: `f` must not block on file or swap I/O.
    pub fn with_frame<R>(&self, kpage: Kpage, f: impl FnOnce(&mut [u8; PAGE_FRAME_SIZE]) -> R) -> R {
        f(&mut self.frames[kpage.0].lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fit_allocation() {
        let pool = UserPool::new(4);
        let a = pool.alloc(true).unwrap();
        let b = pool.alloc(true).unwrap();
        assert_eq!((a.frame_number(), b.frame_number()), (0, 1));

        pool.free(a);
        // Search resumes after the last allocation rather than at frame 0.
        assert_eq!(pool.alloc(true).unwrap().frame_number(), 2);
        assert_eq!(pool.alloc(true).unwrap().frame_number(), 3);
        assert_eq!(pool.alloc(true).unwrap().frame_number(), 0);
        assert!(pool.alloc(true).is_none());
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    fn zero_fill_is_optional() {
        let pool = UserPool::new(1);
        let kpage = pool.alloc(false).unwrap();
        pool.with_frame(kpage, |bytes| bytes.fill(0x5A));
        pool.free(kpage);

        let reused = pool.alloc(false).unwrap();
        assert_eq!(pool.with_frame(reused, |bytes| bytes[100]), 0x5A);
        pool.free(reused);

        let zeroed = pool.alloc(true).unwrap();
        assert!(pool.with_frame(zeroed, |bytes| bytes.iter().all(|&b| b == 0)));
    }

    #[test]
    fn free_clears_pin() {
        let pool = UserPool::new(2);
        let kpage = pool.alloc(true).unwrap();
        pool.pin(kpage);
        assert!(pool.is_pinned(kpage));
        pool.free(kpage);

        let again = pool.alloc(true).unwrap();
        assert!(!pool.is_pinned(again));
    }

    #[test]
    fn pins_nest() {
        let pool = UserPool::new(1);
        let kpage = pool.alloc(true).unwrap();
        pool.pin(kpage);
        pool.pin(kpage);
        pool.unpin(kpage);
        assert!(pool.is_pinned(kpage));
        pool.unpin(kpage);
        assert!(!pool.is_pinned(kpage));
    }

    #[test]
    #[should_panic(expected = "unpin of unpinned")]
    fn unbalanced_unpin_panics() {
        let pool = UserPool::new(1);
        let kpage = pool.alloc(true).unwrap();
        pool.unpin(kpage);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = UserPool::new(1);
        let kpage = pool.alloc(true).unwrap();
        pool.free(kpage);
        pool.free(kpage);
    }
}
