use std::sync::{Arc, Mutex};

use crate::error::DbError;

/// One-way byte input.
///
/// `read` fills as much of `buf` as it can and returns the count;
/// `Ok(None)` is the end-of-stream sentinel. A zero-length buffer reads
/// zero bytes without consuming the stream.
pub trait InputStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DbError>;

    /// Advance by up to `n` bytes, never past the end. Returns the number
    /// of bytes actually skipped.
    fn skip(&mut self, n: u64) -> Result<u64, DbError>;

    /// Idempotent.
    fn close(&mut self) -> Result<(), DbError>;
}

/// One-way byte output. `write` writes the whole buffer or fails.
pub trait OutputStream: Send {
    fn write(&mut self, buf: &[u8]) -> Result<(), DbError>;
    fn flush(&mut self) -> Result<(), DbError>;

    /// Idempotent.
    fn close(&mut self) -> Result<(), DbError>;
}

/// Reads from an in-memory byte buffer.
pub struct MemoryInputStream {
    data: Arc<Vec<u8>>,
    position: usize,
    closed: bool,
}

impl MemoryInputStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::from_shared(Arc::new(data.into()))
    }

    pub fn from_shared(data: Arc<Vec<u8>>) -> Self {
        Self {
            data,
            position: 0,
            closed: false,
        }
    }
}

impl InputStream for MemoryInputStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, DbError> {
        if self.closed {
            return Err(DbError::connection_closed(
                "5D1A0C3E77B2",
                "stream is closed",
            ));
        }
        if self.position >= self.data.len() {
            return Ok(None);
        }

        let available = self.data.len() - self.position;
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        Ok(Some(count))
    }

    fn skip(&mut self, n: u64) -> Result<u64, DbError> {
        let remaining = (self.data.len() - self.position) as u64;
        let skipped = n.min(remaining);
        self.position += skipped as usize;
        Ok(skipped)
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.closed = true;
        Ok(())
    }
}

/// Writes into a shared in-memory byte buffer, growing it as needed.
pub struct MemoryOutputStream {
    data: Arc<Mutex<Vec<u8>>>,
    position: usize,
}

impl MemoryOutputStream {
    pub fn new(data: Arc<Mutex<Vec<u8>>>, position: usize) -> Self {
        Self { data, position }
    }
}

impl OutputStream for MemoryOutputStream {
    fn write(&mut self, buf: &[u8]) -> Result<(), DbError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if self.position + buf.len() > data.len() {
            data.resize(self.position + buf.len(), 0);
        }
        data[self.position..self.position + buf.len()].copy_from_slice(buf);
        self.position += buf.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Drain a stream to its end, in fixed-size chunks.
pub fn read_to_end(stream: &mut dyn InputStream) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    while let Some(n) = stream.read(&mut chunk)? {
        out.extend_from_slice(&chunk[..n]);
        if n == 0 {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_reports_eof_once_drained() {
        let mut stream = MemoryInputStream::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];

        assert_eq!(stream.read(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf, &[1, 2, 3]);
        assert_eq!(stream.read(&mut buf).unwrap(), Some(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(stream.read(&mut buf).unwrap(), None);
        assert_eq!(stream.read(&mut buf).unwrap(), None);
    }

    #[test]
    fn skip_clamps_at_end() {
        let mut stream = MemoryInputStream::new(vec![1, 2, 3]);
        assert_eq!(stream.skip(2).unwrap(), 2);
        assert_eq!(stream.skip(10).unwrap(), 1);
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), None);
    }

    #[test]
    fn closed_stream_rejects_reads() {
        let mut stream = MemoryInputStream::new(vec![1]);
        stream.close().unwrap();
        assert!(stream.read(&mut [0u8; 1]).is_err());
    }

    #[test]
    fn output_grows_backing_buffer() {
        let data = Arc::new(Mutex::new(vec![0u8; 2]));
        let mut stream = MemoryOutputStream::new(data.clone(), 1);
        stream.write(&[9, 9, 9]).unwrap();
        stream.flush().unwrap();

        assert_eq!(&*data.lock().unwrap(), &[0, 9, 9, 9]);
    }

    #[test]
    fn read_to_end_collects_everything() {
        let payload: Vec<u8> = (0..=255).cycle().take(20_000).map(|b| b as u8).collect();
        let mut stream = MemoryInputStream::new(payload.clone());
        assert_eq!(read_to_end(&mut stream).unwrap(), payload);
    }
}
