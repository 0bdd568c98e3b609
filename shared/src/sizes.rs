pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Bytes in one disk sector.
pub const SECTOR_SIZE: u32 = 512;
