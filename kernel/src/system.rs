use crate::block::block_core::{Block, BlockType};
use crate::config::VmConfig;
use crate::mem::{frame_allocator::UserPool, frame_table::FrameTable, mmap::MapId};
use crate::swapping::{page_replacement::ClockPolicy, swap_space::SwapSpace};
use crate::sync::filesys_lock::FilesysLock;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};
use log::info;

/// State shared by every process: the user pool and the frame table over it,
/// swap space, and the filesystem lock. Created once at boot and handed to
/// each process.
pub struct System {
    pub config: VmConfig,
    pub pool: UserPool,
    pub frames: FrameTable,
    pub swap: SwapSpace,
    pub filesys_lock: FilesysLock,
    next_mapid: AtomicI32,
}

impl System {
    pub fn new(config: VmConfig, swap_block: Arc<Block>) -> Arc<Self> {
        debug_assert_eq!(swap_block.get_type(), BlockType::Swap);
        info!(
            "Virtual memory: {} user frames, stack limit {:#x}",
            config.user_frames,
            config.stack_limit()
        );
        Arc::new(Self {
            pool: UserPool::new(config.user_frames),
            frames: FrameTable::new(ClockPolicy::boxed(config.eviction_passes)),
            swap: SwapSpace::new(swap_block),
            filesys_lock: FilesysLock::new(),
            next_mapid: AtomicI32::new(1),
            config,
        })
    }

    /// A mapping id never handed out before, by any process.
    pub fn next_mapid(&self) -> MapId {
        self.next_mapid.fetch_add(1, Ordering::Relaxed)
    }
}
