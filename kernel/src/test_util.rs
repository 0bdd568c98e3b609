//! Fixtures shared by the unit tests.

use crate::block::{
    block_core::{Block, BlockSector, BlockType},
    ramdisk::RamDisk,
};
use crate::mem::{
    frame_allocator::UserPool, frame_table::FrameEntry,
    supplemental_page_table::SupplementalPageTable,
};
use crate::paging::{PageDirectory, SoftPageDirectory};
use crate::system::System;
use crate::user_program::process::Tid;
use crate::VmConfig;
use alloc::{boxed::Box, sync::Arc};
use kidneyvm_shared::mem::SECTORS_PER_PAGE;

/// A system with `user_frames` frames and room for `swap_slots` pages of swap.
pub fn test_system(user_frames: usize, swap_slots: usize) -> Arc<System> {
    let sectors = (swap_slots * SECTORS_PER_PAGE) as BlockSector;
    let swap = Block::new("swap", BlockType::Swap, sectors, Box::new(RamDisk::new(sectors)));
    System::new(
        VmConfig {
            user_frames,
            ..VmConfig::default()
        },
        Arc::new(swap),
    )
}

/// The per-process half of the VM state, without a `Process` around it.
pub struct TestProcess {
    pub spt: Arc<SupplementalPageTable>,
    pub pagedir: Arc<SoftPageDirectory>,
}

impl TestProcess {
    pub fn new(tid: Tid) -> Self {
        let pagedir = Arc::new(SoftPageDirectory::new());
        let spt = Arc::new(SupplementalPageTable::new(
            tid,
            Arc::clone(&pagedir) as Arc<dyn PageDirectory>,
        ));
        Self { spt, pagedir }
    }
}

/// Maps a fresh frame at `upage` and describes it the way the frame table would.
pub fn frame_entry(process: &TestProcess, pool: &UserPool, upage: usize) -> FrameEntry {
    let kpage = pool.alloc(true).expect("test pool is exhausted");
    process.pagedir.set_page(upage, kpage, true);
    FrameEntry {
        tid: process.spt.tid(),
        upage,
        kpage,
        owner: Arc::clone(&process.spt),
    }
}
