//! Memory-mapped files.

use super::{
    supplemental_page_table::{FileRegion, PageSource, SupplementalPageTable},
    vm_error::VmError,
};
use crate::{fs::File, system::System};
use alloc::sync::Arc;
use core::cmp::min;
use kidneyvm_shared::mem::{pg_ofs, pg_round_up, PAGE_FRAME_SIZE};
use log::debug;

pub type MapId = i32;

impl SupplementalPageTable {
    /// Maps `file` at `addr`, one lazily loaded page per page of the file. The
    /// last page is zero past the end of the file. Fails without changing the
    /// table if any page of the range is already in use, or if the range
    /// reaches into the stack reservation or kernel space.
    pub fn mmap(&self, sys: &System, file: &Arc<dyn File>, addr: usize) -> Result<MapId, VmError> {
        if addr == 0 {
            return Err(VmError::NullMapping);
        }
        if pg_ofs(addr) != 0 {
            return Err(VmError::Misaligned);
        }

        let (file, length) = {
            let _fs = sys.filesys_lock.acquire(self.tid());
            let file = file.reopen();
            let length = file.length();
            (file, length)
        };
        if length == 0 {
            return Err(VmError::EmptyFile);
        }

        let end = addr
            .checked_add(pg_round_up(length))
            .ok_or(VmError::MapConflict)?;
        // The stack reservation sits directly below kernel space.
        if end > sys.config.stack_limit() {
            return Err(VmError::MapConflict);
        }

        let mapid = sys.next_mapid();
        let pages = (0..end - addr).step_by(PAGE_FRAME_SIZE).map(|offset| {
            let region = FileRegion {
                file: Arc::clone(&file),
                offset,
                read_bytes: min(PAGE_FRAME_SIZE, length - offset),
            };
            (addr + offset, PageSource::Mmap { region, mapid })
        });
        self.install_all(pages, true)?;

        debug!(
            "thread {}: mapped {} bytes at {:#x} as mapping {}",
            self.tid(),
            length,
            addr,
            mapid
        );
        Ok(mapid)
    }

    /// Unmaps mapping `mapid`, writing dirty pages back to the file.
    pub fn munmap(&self, sys: &System, mapid: MapId) -> Result<(), VmError> {
        self.remove_mapping(sys, mapid)?;
        debug!("thread {}: unmapped mapping {}", self.tid(), mapid);
        Ok(())
    }
}
