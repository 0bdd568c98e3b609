use super::File;
use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::{
    cmp::min,
    sync::atomic::{AtomicUsize, Ordering},
};

/// An in-memory file. Handles obtained through [`File::reopen`] share the
/// contents but not the position.
pub struct TempFile {
    data: Arc<Mutex<Vec<u8>>>,
    position: AtomicUsize,
}

impl TempFile {
    pub fn new(contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
            position: AtomicUsize::new(0),
        })
    }

    /// Copy of the whole file, as a disk dump would show it.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for TempFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn reopen(&self) -> Arc<dyn File> {
        Arc::new(Self {
            data: Arc::clone(&self.data),
            position: AtomicUsize::new(0),
        })
    }

    fn seek(&self, position: usize) {
        self.position.store(position, Ordering::Relaxed);
    }

    fn tell(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }
}
