//! Demand paging: which user pages are resident, and where the others live.
//!
//! Locks are always taken in this order, never the reverse:
//! frame table, supplemental page table, filesystem lock or swap bitmap,
//! page directory or core map, frame memory.

pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod supplemental_page_table;
pub mod user;
pub mod vm_error;
