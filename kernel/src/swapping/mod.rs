//! Where evicted pages go, and how the victim is chosen.

pub mod page_replacement;
pub mod swap_space;
