use super::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};

/// A block device driver backed by kernel memory.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
        }
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data.lock()[Self::range(sector)]);
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) {
        self.data.lock()[Self::range(sector)].copy_from_slice(buf);
    }
}
