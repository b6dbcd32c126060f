use crate::sync::mutex::Mutex;
use crate::vfs::{Error, File, FileRef, Result};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::cmp::min;

/// A file held entirely in memory.
#[derive(Default)]
pub struct TempFile {
    data: Mutex<Vec<u8>>,
}

impl TempFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: &[u8]) -> Self {
        Self {
            data: Mutex::new(data.to_vec()),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

fn to_index(offset: u64) -> Result<usize> {
    usize::try_from(offset).map_err(|_| Error::BadOffset)
}

impl File for TempFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = to_index(offset)?;
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let offset = to_index(offset)?;
        let end = offset.checked_add(buf.len()).ok_or(Error::BadOffset)?;
        let mut data = self.data.lock();
        if end > data.len() {
            let extra = end - data.len();
            data.try_reserve(extra).map_err(|_| Error::NoSpace)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

/// in-memory filesystem
///
/// A flat namespace of [`TempFile`]s. Handles stay valid after the name is
/// removed.
#[derive(Default)]
pub struct TempFs {
    files: Mutex<BTreeMap<String, Arc<TempFile>>>,
}

impl TempFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `name` with `data`, or replaces its contents if it exists.
    pub fn create(&self, name: &str, data: &[u8]) -> Arc<TempFile> {
        let file = Arc::new(TempFile::with_contents(data));
        self.files.lock().insert(name.into(), Arc::clone(&file));
        file
    }

    pub fn open(&self, name: &str) -> Option<FileRef> {
        let file: FileRef = self.files.lock().get(name).cloned()?;
        Some(file)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}
