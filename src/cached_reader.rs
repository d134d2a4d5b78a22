use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

pub const CHUNK_SIZE: usize = 4096;

/// Streams `length` bytes starting at `offset` from a cached file in chunks of at most `CHUNK_SIZE` bytes.
///
/// The file handle is released exactly once: as soon as the last byte was read, when the file turns out to be
/// shorter than expected, after a read error, or when the reader is dropped before it was exhausted.
#[derive(Debug)]
pub struct CachedFileReader {
    file: Option<File>,
    offset: u64,
    remaining: u64,
    sent: u64,
}

impl CachedFileReader {
    pub fn new(file: File, offset: u64, length: u64) -> Self {
        Self {
            file: Some(file),
            offset,
            remaining: length,
            sent: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let file = match self.file.as_mut() {
            None => return Ok(None),
            Some(f) => f,
        };
        if self.sent == 0 && self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset))?;
        }
        let size = (CHUNK_SIZE as u64).min(self.remaining) as usize;
        let mut buf = vec![0; size];
        let mut filled = 0;
        while filled < size {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            debug!("Cached file ended early: {} bytes sent, {} bytes missing", self.sent, self.remaining);
            return Ok(None);
        }
        buf.truncate(filled);
        self.sent += filled as u64;
        self.remaining -= filled as u64;
        Ok(Some(buf))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Sent {} bytes from cache, starting at offset {}", self.sent, self.offset);
        }
    }
}

impl Iterator for CachedFileReader {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.close();
            return None;
        }
        match self.read_chunk() {
            Ok(Some(chunk)) => {
                if self.remaining == 0 {
                    self.close();
                }
                Some(Ok(chunk))
            }
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                error!("Unable to read from cached file: {:?}", e);
                self.close();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    fn file_with_contents(contents: &[u8]) -> File {
        let mut file = tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn numbered(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_reads_exact_range_in_bounded_chunks() {
        let contents = numbered(CHUNK_SIZE * 3 + 17);
        let reader = CachedFileReader::new(file_with_contents(&contents), 100, (CHUNK_SIZE * 2) as u64);
        let chunks: Vec<Vec<u8>> = reader.map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        let received: Vec<u8> = chunks.concat();
        assert_eq!(received, &contents[100..100 + CHUNK_SIZE * 2]);
    }

    #[test]
    fn test_short_file_ends_stream_without_error() {
        let contents = numbered(1000);
        let reader = CachedFileReader::new(file_with_contents(&contents), 900, 500);
        let received: Vec<u8> = reader.map(|c| c.unwrap()).collect::<Vec<_>>().concat();
        assert_eq!(received, &contents[900..]);
    }

    #[test]
    fn test_handle_released_when_exhausted() {
        let mut reader = CachedFileReader::new(file_with_contents(b"hello"), 0, 5);
        assert_eq!(reader.next().unwrap().unwrap(), b"hello");
        assert!(reader.file.is_none());
        assert!(reader.next().is_none());
        assert_eq!(reader.bytes_sent(), 5);
    }

    #[test]
    fn test_zero_length_reads_nothing() {
        let mut reader = CachedFileReader::new(file_with_contents(b"hello"), 0, 0);
        assert!(reader.next().is_none());
        assert!(reader.file.is_none());
    }
}
