use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cache_index::create_cfs_file;
use crate::cached_reader::CHUNK_SIZE;
use crate::fs_utils::create_parent_dir;

pub const TEMP_SUFFIX: &str = ".tmp";

pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Cache entries that are currently being written. At most one transfer writes to a given entry (and its
/// temporary file) at a time.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `None` if another transfer already writes to `path`.
    pub fn try_claim(&self, path: &Path) -> Option<InFlightClaim> {
        if self.lock().insert(path.to_path_buf()) {
            Some(InFlightClaim { in_flight: self.clone(), path: path.to_path_buf() })
        } else {
            None
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }
}

/// Exclusive right to write one cache entry. Released on drop.
#[derive(Debug)]
pub struct InFlightClaim {
    in_flight: InFlight,
    path: PathBuf,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.path);
    }
}

/// Writes the body of an upstream response to `<final_path>.tmp`. The entry becomes visible only through
/// `publish`, which renames the temporary file once the expected number of bytes has been written. A sink that
/// is dropped without being published removes its temporary file.
#[derive(Debug)]
pub struct CacheSink {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    size_written: u64,
    expected_size: u64,
    /// Size of the complete object, recorded for range entries only.
    complete_size: Option<u64>,
    published: bool,
    _claim: InFlightClaim,
}

impl CacheSink {
    pub fn create(
        claim: InFlightClaim,
        expected_size: u64,
        complete_size: Option<u64>,
    ) -> std::io::Result<Self> {
        let final_path = claim.path.clone();
        let temp_path = temp_path(&final_path);
        create_parent_dir(&final_path)?;
        debug!("Attempt to create file: {:?}", &temp_path);
        let file = File::create(&temp_path)?;
        Ok(Self {
            final_path,
            temp_path,
            writer: Some(BufWriter::with_capacity(CHUNK_SIZE, file)),
            size_written: 0,
            expected_size,
            complete_size,
            published: false,
            _claim: claim,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn size_written(&self) -> u64 {
        self.size_written
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.writer.as_mut() {
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "cache sink already closed")),
            Some(writer) => {
                writer.write_all(data)?;
                self.size_written += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Closes the temporary file and renames it to its final name. Fails without publishing anything if fewer
    /// or more bytes than expected were written.
    pub fn publish(mut self) -> std::io::Result<PathBuf> {
        let writer = self.writer.take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "cache sink already closed"))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        if self.size_written != self.expected_size {
            let message = format!("expected {} bytes, received {}", self.expected_size, self.size_written);
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, message));
        }
        if let Some(complete_size) = self.complete_size {
            create_cfs_file(&self.final_path, complete_size)?;
        }
        fs::rename(&self.temp_path, &self.final_path)?;
        self.published = true;
        info!("Published cache entry {:?} ({} bytes)", &self.final_path, self.size_written);
        Ok(self.final_path.clone())
    }
}

impl Drop for CacheSink {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.writer = None;
        match fs::remove_file(&self.temp_path) {
            Ok(()) => {
                warn!("Discarded incomplete transfer {:?} after {} bytes", &self.temp_path, self.size_written);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!("Unable to remove temporary file {:?}: {:?}", &self.temp_path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_index::complete_size_from_cfs_file;
    use tempfile::tempdir;

    #[test]
    fn test_publish_renames_into_place() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("pkgs/os/foo.rpm");
        let in_flight = InFlight::new();
        let claim = in_flight.try_claim(&final_path).unwrap();
        let mut sink = CacheSink::create(claim, 10, None).unwrap();
        sink.write_chunk(b"01234").unwrap();
        assert!(!final_path.exists());
        assert!(temp_path(&final_path).exists());
        sink.write_chunk(b"56789").unwrap();
        sink.publish().unwrap();
        assert_eq!(fs::read(&final_path).unwrap(), b"0123456789");
        assert!(!temp_path(&final_path).exists());
        assert!(!in_flight.contains(&final_path));
    }

    #[test]
    fn test_dropped_sink_discards_temp_file() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("foo.rpm");
        let in_flight = InFlight::new();
        let mut sink = CacheSink::create(in_flight.try_claim(&final_path).unwrap(), 10, None).unwrap();
        sink.write_chunk(b"012").unwrap();
        drop(sink);
        assert!(!final_path.exists());
        assert!(!temp_path(&final_path).exists());
        assert!(!in_flight.contains(&final_path));
    }

    #[test]
    fn test_short_transfer_is_not_published() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("foo.rpm");
        let in_flight = InFlight::new();
        let mut sink = CacheSink::create(in_flight.try_claim(&final_path).unwrap(), 10, None).unwrap();
        sink.write_chunk(b"012").unwrap();
        assert!(sink.publish().is_err());
        assert!(!final_path.exists());
        assert!(!temp_path(&final_path).exists());
    }

    #[test]
    fn test_range_entry_records_complete_size() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("foo(0-2).rpm");
        let in_flight = InFlight::new();
        let mut sink = CacheSink::create(in_flight.try_claim(&final_path).unwrap(), 3, Some(5000)).unwrap();
        sink.write_chunk(b"abc").unwrap();
        sink.publish().unwrap();
        assert_eq!(complete_size_from_cfs_file(&final_path), Some(5000));
    }

    #[test]
    fn test_second_claim_is_refused_until_release() {
        let in_flight = InFlight::new();
        let path = Path::new("/c/pkgs/foo.rpm");
        let claim = in_flight.try_claim(path).unwrap();
        assert!(in_flight.try_claim(path).is_none());
        drop(claim);
        assert!(in_flight.try_claim(path).is_some());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(temp_path(Path::new("/c/foo.rpm")), PathBuf::from("/c/foo.rpm.tmp"));
    }
}
