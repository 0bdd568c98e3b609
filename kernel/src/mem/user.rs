//! Validating user buffers before the kernel copies through them.

use super::{
    supplemental_page_table::{PageSource, SupplementalPageTable},
    vm_error::VmError,
};
use crate::system::System;
use alloc::{sync::Arc, vec::Vec};
use core::{cmp::min, mem::size_of};
use kidneyvm_shared::mem::{pg_ofs, pg_round_down, OFFSET, PAGE_FRAME_SIZE};

/// A user buffer whose pages are all resident and pinned. The pages are
/// unpinned when this is dropped.
///
/// Copies go through the owner's page directory, so accessed and dirty bits
/// are set as if the process had touched the memory itself.
pub struct PinnedBuffer<'a> {
    sys: &'a System,
    spt: &'a SupplementalPageTable,
    start: usize,
    len: usize,
    pinned_pages: usize,
}

/// Makes every page of `[ptr, ptr + len)` resident and pins it.
///
/// A page with no supplemental entry is created only inside the stack
/// reservation (a buffer in stack space not yet touched); anywhere else it
/// means the pointer is invalid. With `write`, every page must be writable.
pub fn pin_user_buffer<'a>(
    sys: &'a System,
    spt: &'a Arc<SupplementalPageTable>,
    ptr: usize,
    len: usize,
    write: bool,
) -> Result<PinnedBuffer<'a>, VmError> {
    let end = ptr.checked_add(len).ok_or(VmError::BadAddress)?;
    if end > OFFSET {
        return Err(VmError::BadAddress);
    }

    let mut buffer = PinnedBuffer {
        sys,
        spt,
        start: ptr,
        len,
        pinned_pages: 0,
    };
    for upage in page_range(ptr, len) {
        match spt.lookup(upage) {
            Some(entry) if write && !entry.writable => return Err(VmError::ReadOnly),
            Some(_) => {}
            None if upage >= sys.config.stack_limit() => {
                spt.install(upage, PageSource::Anonymous, true)?;
            }
            None => return Err(VmError::BadAddress),
        }
        // On error, dropping `buffer` unpins the pages pinned so far.
        spt.fault_in(sys, upage, true)?;
        buffer.pinned_pages += 1;
    }
    Ok(buffer)
}

/// Pages touched by `[start, start + len)`.
fn page_range(start: usize, len: usize) -> impl Iterator<Item = usize> {
    let first = pg_round_down(start);
    let count = if len == 0 {
        0
    } else {
        (pg_round_down(start + len - 1) - first) / PAGE_FRAME_SIZE + 1
    };
    (0..count).map(move |i| first + i * PAGE_FRAME_SIZE)
}

/// Reads a `u32` from user memory, such as a system call argument.
pub fn read_user_u32(
    sys: &System,
    spt: &Arc<SupplementalPageTable>,
    ptr: usize,
) -> Result<u32, VmError> {
    let bytes = pin_user_buffer(sys, spt, ptr, size_of::<u32>(), false)?.copy_in()?;
    let mut word = [0; size_of::<u32>()];
    word.copy_from_slice(&bytes);
    Ok(u32::from_le_bytes(word))
}

impl PinnedBuffer<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits the buffer at page boundaries: `(page, offset in page, offset in
    /// buffer, length)`.
    fn chunks(&self) -> impl Iterator<Item = (usize, usize, usize, usize)> + '_ {
        page_range(self.start, self.len).map(|upage| {
            let from = upage.max(self.start);
            let to = min(upage + PAGE_FRAME_SIZE, self.start + self.len);
            (upage, pg_ofs(from), from - self.start, to - from)
        })
    }

    /// Copies the whole buffer out of user memory.
    pub fn copy_in(&self) -> Result<Vec<u8>, VmError> {
        let mut bytes = alloc::vec![0; self.len];
        for (upage, ofs, at, len) in self.chunks() {
            let kpage = self
                .spt
                .pagedir()
                .access(upage, false)
                .ok_or(VmError::NotMapped)?;
            self.sys.pool.with_frame(kpage, |frame| {
                bytes[at..at + len].copy_from_slice(&frame[ofs..ofs + len]);
            });
        }
        Ok(bytes)
    }

    /// Copies `bytes` to the start of the buffer. Returns how many bytes were
    /// copied, which is less than `bytes.len()` only if the buffer is shorter.
    pub fn copy_out(&self, bytes: &[u8]) -> Result<usize, VmError> {
        let total = min(bytes.len(), self.len);
        for (upage, ofs, at, len) in self.chunks() {
            if at >= total {
                break;
            }
            let len = min(len, total - at);
            let kpage = self
                .spt
                .pagedir()
                .access(upage, true)
                .ok_or(VmError::ReadOnly)?;
            self.sys.pool.with_frame(kpage, |frame| {
                frame[ofs..ofs + len].copy_from_slice(&bytes[at..at + len]);
            });
        }
        Ok(total)
    }
}

impl Drop for PinnedBuffer<'_> {
    fn drop(&mut self) {
        let tid = self.spt.tid();
        for upage in page_range(self.start, self.len).take(self.pinned_pages) {
            self.sys.frames.unpin(self.sys, tid, upage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PageDirectory;
    use crate::{
        fs::tempfs::TempFile,
        mem::supplemental_page_table::FileRegion,
        test_util::{test_system, TestProcess},
    };

    const DATA: usize = 0x0804_8000;

    #[test]
    fn spanning_buffer_is_resident_and_pinned() {
        let sys = test_system(4, 8);
        let process = TestProcess::new(1);
        for i in 0..2 {
            process
                .spt
                .install(DATA + i * PAGE_FRAME_SIZE, PageSource::Anonymous, true)
                .unwrap();
        }

        let start = DATA + PAGE_FRAME_SIZE - 3;
        let buffer = pin_user_buffer(&sys, &process.spt, start, 6, true).unwrap();
        for upage in [DATA, DATA + PAGE_FRAME_SIZE] {
            let kpage = sys.frames.lookup_owner(1, upage).unwrap();
            assert!(sys.pool.is_pinned(kpage));
        }

        assert_eq!(buffer.copy_out(b"abcdefgh").unwrap(), 6);
        assert_eq!(buffer.copy_in().unwrap(), b"abcdef");
        assert!(process.pagedir.is_dirty(DATA + PAGE_FRAME_SIZE));

        drop(buffer);
        let kpage = sys.frames.lookup_owner(1, DATA).unwrap();
        assert!(!sys.pool.is_pinned(kpage));
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let sys = test_system(2, 8);
        let process = TestProcess::new(1);
        for i in 0..3 {
            process
                .spt
                .install(DATA + i * PAGE_FRAME_SIZE, PageSource::Anonymous, true)
                .unwrap();
        }

        let buffer = pin_user_buffer(&sys, &process.spt, DATA, 1, false).unwrap();
        process.spt.fault_in(&sys, DATA + PAGE_FRAME_SIZE, false).unwrap();
        // The only evictable frame is the unpinned one.
        process
            .spt
            .fault_in(&sys, DATA + 2 * PAGE_FRAME_SIZE, false)
            .unwrap();
        assert!(process.spt.lookup(DATA).unwrap().resident);
        assert!(!process.spt.lookup(DATA + PAGE_FRAME_SIZE).unwrap().resident);
        drop(buffer);
    }

    #[test]
    fn overlapping_buffers_keep_the_page_pinned() {
        let sys = test_system(2, 8);
        let process = TestProcess::new(1);
        for i in 0..3 {
            process
                .spt
                .install(DATA + i * PAGE_FRAME_SIZE, PageSource::Anonymous, true)
                .unwrap();
        }

        let outer = pin_user_buffer(&sys, &process.spt, DATA, 16, true).unwrap();
        let inner = pin_user_buffer(&sys, &process.spt, DATA + 8, 4, false).unwrap();
        drop(inner);
        let kpage = sys.frames.lookup_owner(1, DATA).unwrap();
        assert!(sys.pool.is_pinned(kpage));

        // With one frame pinned by `outer`, the other two pages take turns.
        process.spt.fault_in(&sys, DATA + PAGE_FRAME_SIZE, false).unwrap();
        process
            .spt
            .fault_in(&sys, DATA + 2 * PAGE_FRAME_SIZE, false)
            .unwrap();
        assert!(process.spt.lookup(DATA).unwrap().resident);
        assert_eq!(outer.copy_out(b"still here").unwrap(), 10);

        drop(outer);
        assert!(!sys.pool.is_pinned(kpage));
    }

    #[test]
    fn unmapped_pages_outside_the_stack_are_invalid() {
        let sys = test_system(4, 8);
        let process = TestProcess::new(1);
        process
            .spt
            .install(DATA, PageSource::Anonymous, true)
            .unwrap();

        // The second page has no entry: the first one must not stay pinned.
        let result = pin_user_buffer(&sys, &process.spt, DATA, PAGE_FRAME_SIZE + 1, false);
        assert_eq!(result.err(), Some(VmError::BadAddress));
        let kpage = sys.frames.lookup_owner(1, DATA).unwrap();
        assert!(!sys.pool.is_pinned(kpage));

        assert_eq!(
            pin_user_buffer(&sys, &process.spt, OFFSET - 2, 4, false).err(),
            Some(VmError::BadAddress)
        );
        assert_eq!(
            pin_user_buffer(&sys, &process.spt, usize::MAX - 1, 4, false).err(),
            Some(VmError::BadAddress)
        );
    }

    #[test]
    fn stack_pages_are_created_on_demand() {
        let sys = test_system(4, 8);
        let process = TestProcess::new(1);
        let addr = OFFSET - 3 * PAGE_FRAME_SIZE + 16;

        let buffer = pin_user_buffer(&sys, &process.spt, addr, 32, true).unwrap();
        assert_eq!(buffer.copy_in().unwrap(), [0; 32]);
        assert!(process.spt.lookup(addr).unwrap().resident);
        assert_eq!(process.spt.len(), 1);
    }

    #[test]
    fn read_into_read_only_page_fails() {
        let sys = test_system(4, 8);
        let process = TestProcess::new(1);
        let file = TempFile::new(&[7; 64]);
        process
            .spt
            .install(
                DATA,
                PageSource::File(FileRegion {
                    file,
                    offset: 0,
                    read_bytes: 64,
                }),
                false,
            )
            .unwrap();

        assert_eq!(
            pin_user_buffer(&sys, &process.spt, DATA, 8, true).err(),
            Some(VmError::ReadOnly)
        );
        let buffer = pin_user_buffer(&sys, &process.spt, DATA, 8, false).unwrap();
        assert_eq!(buffer.copy_in().unwrap(), [7; 8]);
        assert_eq!(read_user_u32(&sys, &process.spt, DATA).unwrap(), 0x0707_0707);
    }

    #[test]
    fn empty_buffer_touches_nothing() {
        let sys = test_system(1, 8);
        let process = TestProcess::new(1);
        let buffer = pin_user_buffer(&sys, &process.spt, DATA, 0, true).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.copy_out(b"x").unwrap(), 0);
        assert!(process.spt.is_empty());
    }
}
