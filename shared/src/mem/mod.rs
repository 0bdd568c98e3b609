use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. The user stack
// grows down from here.
pub const OFFSET: usize = 0x80000000;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / crate::sizes::SECTOR_SIZE as usize;

// Default upper bound on how far a user stack may grow below OFFSET.
pub const USER_STACK_MAX_SIZE: usize = 8 * MB;

/// Rounds `va` down to the start of its page.
#[inline]
pub const fn pg_round_down(va: usize) -> usize {
    va & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `va` up to the next page boundary.
#[inline]
pub const fn pg_round_up(va: usize) -> usize {
    pg_round_down(va + PAGE_FRAME_SIZE - 1)
}

/// Offset of `va` within its page.
#[inline]
pub const fn pg_ofs(va: usize) -> usize {
    va & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(va: usize) -> bool {
    va < OFFSET
}

#[inline]
pub const fn is_kernel_vaddr(va: usize) -> bool {
    va >= OFFSET
}
