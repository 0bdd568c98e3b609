pub mod filesys_lock;
pub mod mutex;
