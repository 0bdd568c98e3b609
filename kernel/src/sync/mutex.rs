//! Mutual exclusion for kernel data shared between threads.
//!
//! Every lock in the VM subsystem is a [`TicketMutex`]: waiters are served in
//! arrival order, so a thread stuck behind a long eviction is not starved by
//! later faulting threads.

pub mod ticket;
pub use self::ticket::{TicketMutex as Mutex, TicketMutexGuard as MutexGuard};
