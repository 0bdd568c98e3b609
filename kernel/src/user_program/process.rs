use crate::fs::{File, FileDescriptor};
use crate::mem::{
    supplemental_page_table::{FileRegion, PageSource, SupplementalPageTable},
    vm_error::VmError,
};
use crate::paging::PageDirectory;
use crate::sync::mutex::Mutex;
use crate::system::System;
use alloc::{collections::BTreeMap, string::String, sync::Arc};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyvm_shared::mem::{pg_ofs, OFFSET, PAGE_FRAME_SIZE};
use log::info;

pub type Tid = u16;

/// Descriptors 0 and 1 are the console.
const FIRST_FILE_DESCRIPTOR: FileDescriptor = 2;

/// A user process: one thread, its pages and its open files.
pub struct Process {
    tid: Tid,
    name: String,
    sys: Arc<System>,
    spt: Arc<SupplementalPageTable>,
    files: Mutex<BTreeMap<FileDescriptor, Arc<dyn File>>>,
    // User stack pointer saved on entry to the kernel.
    user_esp: AtomicUsize,
    exit_status: Mutex<Option<i32>>,
}

impl Process {
    pub fn new(sys: Arc<System>, tid: Tid, name: &str, pagedir: Arc<dyn PageDirectory>) -> Self {
        Self {
            tid,
            name: String::from(name),
            spt: Arc::new(SupplementalPageTable::new(tid, pagedir)),
            sys,
            files: Mutex::new(BTreeMap::new()),
            user_esp: AtomicUsize::new(OFFSET),
            exit_status: Mutex::new(None),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> &System {
        &self.sys
    }

    pub fn spt(&self) -> &Arc<SupplementalPageTable> {
        &self.spt
    }

    pub fn user_esp(&self) -> usize {
        self.user_esp.load(Ordering::Relaxed)
    }

    pub fn set_user_esp(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::Relaxed);
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    /// Adds an open file and returns its descriptor.
    pub fn add_file(&self, file: Arc<dyn File>) -> FileDescriptor {
        let mut files = self.files.lock();
        let fd = files
            .last_key_value()
            .map_or(FIRST_FILE_DESCRIPTOR, |(&fd, _)| fd + 1);
        files.insert(fd, file);
        fd
    }

    pub fn file(&self, fd: FileDescriptor) -> Option<Arc<dyn File>> {
        self.files.lock().get(&fd).cloned()
    }

    /// Lazily maps an executable segment: `read_bytes` from `file` at
    /// `offset`, followed by `zero_bytes` of zeros, starting at `upage`.
    /// Pages with nothing to read become zero-filled pages.
    pub fn load_segment(
        &self,
        file: &Arc<dyn File>,
        offset: usize,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if pg_ofs(upage) != 0 || pg_ofs(offset) != 0 {
            return Err(VmError::Misaligned);
        }
        let total = read_bytes + zero_bytes;
        if pg_ofs(total) != 0 || upage.checked_add(total).map_or(true, |end| end > OFFSET) {
            return Err(VmError::BadAddress);
        }

        let file = {
            let _fs = self.sys.filesys_lock.acquire(self.tid);
            file.reopen()
        };

        for page in (0..total).step_by(PAGE_FRAME_SIZE) {
            let page_read_bytes = min(read_bytes.saturating_sub(page), PAGE_FRAME_SIZE);
            let source = if page_read_bytes == 0 {
                PageSource::Anonymous
            } else {
                PageSource::File(FileRegion {
                    file: Arc::clone(&file),
                    offset: offset + page,
                    read_bytes: page_read_bytes,
                })
            };
            self.spt.install(upage + page, source, writable)?;
        }
        Ok(())
    }

    /// Creates the first stack page just below `OFFSET` and returns the
    /// initial stack pointer.
    pub fn setup_stack(&self) -> Result<usize, VmError> {
        let upage = OFFSET - PAGE_FRAME_SIZE;
        self.spt.install(upage, PageSource::Anonymous, true)?;
        self.spt.fault_in(&self.sys, upage, false)?;
        self.set_user_esp(OFFSET);
        Ok(OFFSET)
    }

    /// Terminates the process and releases everything it holds. Dirty mapped
    /// pages are written back to their files first. Only the first call has
    /// any effect.
    pub fn exit(&self, status: i32) {
        {
            let mut exit_status = self.exit_status.lock();
            if exit_status.is_some() {
                return;
            }
            *exit_status = Some(status);
        }
        info!("{}: exit({})", self.name, status);

        self.spt.teardown(&self.sys);
        self.files.lock().clear();
    }
}
