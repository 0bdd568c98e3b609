use crate::block::{
    block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE},
    block_error::BlockError,
};
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use core::error::Error;
use core::fmt::{self, Debug, Display, Formatter};
use kidneyvm_shared::{
    bit_array::BitArray,
    mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE},
};
use log::{info, trace};

/// A page-sized region of the swap device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

impl Debug for SwapSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// Every slot holds an evicted page
    Full,
    /// The slot lies past the end of the device
    SlotOutOfRange,
    /// The slot is free, so it holds no page
    SlotNotInUse,
    Block(BlockError),
}

impl Debug for SwapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::Full => write!(f, "Full"),
            SwapError::SlotOutOfRange => write!(f, "SlotOutOfRange"),
            SwapError::SlotNotInUse => write!(f, "SlotNotInUse"),
            SwapError::Block(e) => write!(f, "Block({e:?})"),
        }
    }
}

impl Display for SwapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::Full => write!(f, "no free swap slot"),
            SwapError::SlotOutOfRange => write!(f, "swap slot out of range"),
            SwapError::SlotNotInUse => write!(f, "swap slot is free"),
            SwapError::Block(e) => write!(f, "swap device error: {e}"),
        }
    }
}

impl Error for SwapError {}

impl From<BlockError> for SwapError {
    fn from(e: BlockError) -> Self {
        SwapError::Block(e)
    }
}

/// Page-sized slots over a swap block device.
///
/// A slot's bit is set from the moment [`SwapSpace::swap_out`] claims it until
/// [`SwapSpace::swap_in`] or [`SwapSpace::free_slot`] releases it. Claiming is
/// a single scan-and-flip under the bitmap lock; the sector I/O runs after the
/// lock is dropped, so distinct slots are written concurrently.
pub struct SwapSpace {
    block: Arc<Block>,
    bitmap: Mutex<BitArray>,
}

impl SwapSpace {
    pub fn new(block: Arc<Block>) -> Self {
        let slots = block.get_size() as usize / SECTORS_PER_PAGE;
        info!("Swap space on {}: {} slots", block, slots);
        Self {
            block,
            bitmap: Mutex::new(BitArray::new(slots)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.bitmap.lock().count(false)
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        let bitmap = self.bitmap.lock();
        slot.0 < bitmap.len() && bitmap.get(slot.0)
    }

    /// Claims the lowest free slot and writes `page` to it.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot, SwapError> {
        let slot = SwapSlot(
            self.bitmap
                .lock()
                .scan_and_flip(0, false)
                .ok_or(SwapError::Full)?,
        );

        let sectors = page.chunks_exact(BLOCK_SECTOR_SIZE);
        for (sector, buf) in (slot.first_sector()..).zip(sectors) {
            if let Err(e) = self.block.write(sector, buf) {
                self.bitmap.lock().set(slot.0, false);
                return Err(e.into());
            }
        }

        trace!("swapped out to {:?}", slot);
        Ok(slot)
    }

    /// Reads the page held in `slot` into `page`. The slot stays claimed.
    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<(), SwapError> {
        self.check_in_use(slot)?;

        let sectors = page.chunks_exact_mut(BLOCK_SECTOR_SIZE);
        for (sector, buf) in (slot.first_sector()..).zip(sectors) {
            self.block.read(sector, buf)?;
        }
        trace!("read {:?}", slot);
        Ok(())
    }

    /// Reads the page held in `slot` into `page` and frees the slot.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<(), SwapError> {
        self.read_slot(slot, page)?;
        self.free_slot(slot)
    }

    /// Releases `slot` without reading it back.
    pub fn free_slot(&self, slot: SwapSlot) -> Result<(), SwapError> {
        self.check_in_use(slot)?;
        self.bitmap.lock().set(slot.0, false);
        Ok(())
    }

    fn check_in_use(&self, slot: SwapSlot) -> Result<(), SwapError> {
        let bitmap = self.bitmap.lock();
        if slot.0 >= bitmap.len() {
            return Err(SwapError::SlotOutOfRange);
        }
        if !bitmap.get(slot.0) {
            return Err(SwapError::SlotNotInUse);
        }
        Ok(())
    }
}
