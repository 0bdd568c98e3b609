use super::block_error::BlockError;
use alloc::{boxed::Box, string::String};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyvm_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// The role a block device plays.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// Buffers are always exactly [`BLOCK_SECTOR_SIZE`] bytes and sectors are
/// always in range; [`Block`] checks both before calling into the driver.
pub trait BlockOp: Send + Sync {
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]);
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]);
}

/// A block device
pub struct Block {
    /// The name of the block device
    block_name: String,
    /// The role of the device
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,
    /// The size of the block device in sectors
    block_size: BlockSector,

    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl Block {
    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `block_type` must be provided, as well as the `driver` to access the block.
    pub fn new(
        block_name: &str,
        block_type: BlockType,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size
        );
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf);
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;
        if self.block_type == BlockType::Foreign {
            return Err(BlockError::ForeignWrite);
        }

        self.driver.write(sector, buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;

    fn disk(block_type: BlockType) -> Block {
        Block::new("hd0", block_type, 4, Box::new(RamDisk::new(4)))
    }

    #[test]
    fn write_then_read_sector() {
        let block = disk(BlockType::Swap);
        let data = [0xAB; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();

        let mut buf = [0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);

        block.read(1, &mut buf).unwrap();
        assert_eq!(buf, [0; BLOCK_SECTOR_SIZE]);
        assert_eq!((block.read_count(), block.write_count()), (2, 1));
    }

    #[test]
    fn rejects_bad_requests() {
        let block = disk(BlockType::Raw);
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(
            block.write(0, &buf[..100]),
            Err(BlockError::BufferInvalid)
        );
        assert_eq!(block.read_count(), 0);
    }

    #[test]
    fn foreign_devices_are_read_only() {
        let block = disk(BlockType::Foreign);
        let buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.write(0, &buf), Err(BlockError::ForeignWrite));
    }

    #[test]
    fn display_summary() {
        let block = disk(BlockType::Swap);
        assert_eq!(
            block.to_string(),
            "\"hd0\" (Swap): 0004 sectors, 0000 read, 0000 write"
        );
    }
}
