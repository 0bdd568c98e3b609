//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! The subsystem decides which user pages are resident, loads them on first
//! touch (zero fill, executable segment, memory-mapped file or swap), evicts
//! with a second-chance clock when the user pool runs dry, and validates user
//! buffers before the kernel copies through them.
//!
//! Everything global (user pool, frame table, swap space, filesystem lock) is
//! owned by one [`System`] created at boot and shared with each
//! [`Process`](user_program::process::Process).

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod fs;
pub mod interrupts;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod user_program;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::VmConfig;
pub use mem::vm_error::VmError;
pub use system::System;
