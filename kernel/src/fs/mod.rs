//! The filesystem as the VM subsystem sees it.
//!
//! Callers must hold the [`FilesysLock`](crate::sync::filesys_lock::FilesysLock)
//! around every call; implementations are not required to be reentrant.

pub mod tempfs;

use alloc::sync::Arc;

pub type FileDescriptor = i32;

/// An open file with its own seek position.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes `buf` at `offset`, growing the file if needed. Returns the
    /// number of bytes written.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;

    /// Size of the file in bytes.
    fn length(&self) -> usize;

    /// Opens the same underlying file again with an independent position.
    fn reopen(&self) -> Arc<dyn File>;

    fn seek(&self, position: usize);

    fn tell(&self) -> usize;

    /// Reads at the current position and advances it.
    fn read(&self, buf: &mut [u8]) -> usize {
        let position = self.tell();
        let n = self.read_at(buf, position);
        self.seek(position + n);
        n
    }

    /// Writes at the current position and advances it.
    fn write(&self, buf: &[u8]) -> usize {
        let position = self.tell();
        let n = self.write_at(buf, position);
        self.seek(position + n);
        n
    }
}
