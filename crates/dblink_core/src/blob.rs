use std::sync::{Arc, Mutex};

use crate::error::DbError;
use crate::stream::{InputStream, MemoryInputStream, MemoryOutputStream, OutputStream};
use crate::value::BlobId;

/// Segment size used by database-backed blobs for load and writeback.
pub const BLOB_SEGMENT_SIZE: usize = 32 * 1024;

/// Binary large object.
///
/// Two concrete shapes exist: fully materialized in memory, and lazy
/// database-backed variants (driver crates) that hold an identifier and
/// materialize on first access.
pub trait Blob: Send + Sync {
    fn length(&self) -> Result<u64, DbError>;

    /// Bytes from `pos`, at most `len`. Reads past the end return the
    /// available prefix (possibly empty).
    fn get_bytes(&self, pos: u64, len: usize) -> Result<Vec<u8>, DbError>;

    /// Writes at `pos`, growing the blob to `pos + bytes.len()` if needed.
    fn set_bytes(&self, pos: u64, bytes: &[u8]) -> Result<(), DbError>;

    /// Shrink-only; lengths beyond the current size are ignored.
    fn truncate(&self, len: u64) -> Result<(), DbError>;

    /// Release the blob and any backing database object.
    fn free(&self) -> Result<(), DbError>;

    fn binary_stream(&self) -> Result<Box<dyn InputStream>, DbError>;

    fn binary_writer(&self, pos: u64) -> Result<Box<dyn OutputStream>, DbError>;
}

/// Resolves a [`BlobId`] surfaced in a result set into a live blob.
/// Implemented per driver; the result set carries one so `get_blob` can
/// hand out lazy blobs bound to the originating connection.
pub trait BlobResolver: Send + Sync {
    fn open_blob(&self, id: &BlobId) -> Result<Arc<dyn Blob>, DbError>;
}

/// Blob fully resident in memory.
pub struct MemoryBlob {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBlob {
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data.into())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBlob {
    fn default() -> Self {
        Self::new()
    }
}

impl Blob for MemoryBlob {
    fn length(&self) -> Result<u64, DbError> {
        Ok(self.lock().len() as u64)
    }

    fn get_bytes(&self, pos: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let data = self.lock();
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(Vec::new());
        }
        let end = (pos + len).min(data.len());
        Ok(data[pos..end].to_vec())
    }

    fn set_bytes(&self, pos: u64, bytes: &[u8]) -> Result<(), DbError> {
        let mut data = self.lock();
        let pos = pos as usize;
        if pos + bytes.len() > data.len() {
            data.resize(pos + bytes.len(), 0);
        }
        data[pos..pos + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<(), DbError> {
        let mut data = self.lock();
        if (len as usize) < data.len() {
            data.truncate(len as usize);
        }
        Ok(())
    }

    fn free(&self) -> Result<(), DbError> {
        let mut data = self.lock();
        data.clear();
        data.shrink_to_fit();
        Ok(())
    }

    fn binary_stream(&self) -> Result<Box<dyn InputStream>, DbError> {
        // Snapshot: the stream must stay readable while the blob mutates.
        Ok(Box::new(MemoryInputStream::new(self.lock().clone())))
    }

    fn binary_writer(&self, pos: u64) -> Result<Box<dyn OutputStream>, DbError> {
        Ok(Box::new(MemoryOutputStream::new(
            self.data.clone(),
            pos as usize,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bytes_grows_to_position_plus_length() {
        let blob = MemoryBlob::new();
        blob.set_bytes(4, &[7, 8]).unwrap();

        assert_eq!(blob.length().unwrap(), 6);
        assert_eq!(blob.get_bytes(0, 6).unwrap(), vec![0, 0, 0, 0, 7, 8]);
    }

    #[test]
    fn get_bytes_clamps_to_available_data() {
        let blob = MemoryBlob::from_bytes(vec![1, 2, 3]);
        assert_eq!(blob.get_bytes(1, 10).unwrap(), vec![2, 3]);
        assert_eq!(blob.get_bytes(9, 10).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn truncate_only_shrinks() {
        let blob = MemoryBlob::from_bytes(vec![1, 2, 3, 4]);
        blob.truncate(10).unwrap();
        assert_eq!(blob.length().unwrap(), 4);
        blob.truncate(2).unwrap();
        assert_eq!(blob.length().unwrap(), 2);
    }

    #[test]
    fn free_clears_data() {
        let blob = MemoryBlob::from_bytes(vec![1, 2, 3]);
        blob.free().unwrap();
        assert_eq!(blob.length().unwrap(), 0);
    }

    #[test]
    fn writer_shares_backing_storage() {
        let blob = MemoryBlob::from_bytes(vec![1, 2, 3]);
        let mut writer = blob.binary_writer(1).unwrap();
        writer.write(&[9, 9, 9]).unwrap();

        assert_eq!(blob.get_bytes(0, 4).unwrap(), vec![1, 9, 9, 9]);
    }

    #[test]
    fn stream_is_a_snapshot() {
        let blob = MemoryBlob::from_bytes(vec![1, 2, 3]);
        let mut stream = blob.binary_stream().unwrap();
        blob.set_bytes(0, &[9]).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf, &[1, 2, 3]);
    }
}
