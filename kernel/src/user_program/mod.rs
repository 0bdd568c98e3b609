pub mod process;
pub mod syscall;
