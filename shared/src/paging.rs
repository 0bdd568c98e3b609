// https://wiki.osdev.org/Paging
// https://wiki.osdev.org/Exceptions#Page_Fault

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    fmt,
    mem::size_of,
    ops::{Deref, DerefMut},
};

pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl PageTable {
    /// Returns `true` if no entry of this table is present.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|pte| !pte.present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The accessed and dirty bits are written by the MMU; the kernel only ever
/// clears them.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

/// Error code pushed by the CPU on a page fault (interrupt 14).
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// 0: not-present page. 1: access rights violation.
    #[bit(0, rw)]
    present: bool,
    /// 0: read. 1: write.
    #[bit(1, rw)]
    write: bool,
    /// 0: kernel. 1: user process.
    #[bit(2, rw)]
    user: bool,
}

impl fmt::Debug for PageFaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFaultErrorCode")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_split() {
        let va = VirtualAddress::new_with_raw_value(0x0804_8123);
        assert_eq!(va.page_directory_index().value(), 0x20);
        assert_eq!(va.page_table_index().value(), 0x48);
        assert_eq!(va.offset().value(), 0x123);
    }

    #[test]
    fn page_table_entry_bits() {
        let pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(true)
            .with_page_frame_address(u20::new(7));
        assert!(pte.present() && pte.read_write());
        assert!(!pte.accessed() && !pte.dirty());
        assert_eq!(pte.raw_value(), (7 << 12) | 0b11);

        let touched = pte.with_accessed(true).with_dirty(true);
        assert_eq!(touched.raw_value() & 0x60, 0x60);
    }

    #[test]
    fn fault_error_code() {
        let ec = PageFaultErrorCode::new_with_raw_value(0b110);
        assert!(!ec.present());
        assert!(ec.write());
        assert!(ec.user());
        assert_eq!(
            alloc::format!("{ec:?}"),
            "PageFaultErrorCode { present: false, write: true, user: true }"
        );
    }

    #[test]
    fn fresh_table_is_empty() {
        let mut table = PageTable::default();
        assert!(table.is_empty());
        table[3] = table[3].with_present(true);
        assert!(!table.is_empty());
    }
}
