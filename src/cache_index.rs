use std::fs;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::cache_path::CachePaths;
use crate::cache_sink::TEMP_SUFFIX;

/// Which kind of cache entry satisfies a request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheEntry {
    /// The complete object. Satisfies any range by seeking.
    FullFile,
    /// Exactly the bytes of one previously requested range of an object of `complete_size` bytes.
    Range { complete_size: u64 },
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CacheHit {
    pub path: PathBuf,
    pub entry: CacheEntry,
}

impl CacheHit {
    pub fn is_full_file(&self) -> bool {
        self.entry == CacheEntry::FullFile
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CacheLookup {
    Hit(CacheHit),
    Miss,
}

/// Files the cache keeps next to its entries: temporary files of running transfers and size records. They are
/// never served and never fetched.
pub fn is_internal_file_name(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX) || (name.starts_with('.') && name.ends_with(".cfs"))
}

fn is_internal_path(path: &Path) -> bool {
    path.file_name().map(|name| is_internal_file_name(&name.to_string_lossy())).unwrap_or(false)
}

/// Decides whether a published cache entry can serve the request. The full file always wins over a range
/// entry; a range entry is only considered if its file name carries exactly the requested range, which holds
/// by construction of `paths.range`. The filesystem is consulted on every call.
pub fn lookup(paths: &CachePaths) -> CacheLookup {
    if is_internal_path(&paths.full) {
        debug!("{:?} is not a cache entry", &paths.full);
        return CacheLookup::Miss;
    }
    if paths.full.is_file() {
        debug!("Full file cache entry found: {:?}", &paths.full);
        return CacheLookup::Hit(CacheHit { path: paths.full.clone(), entry: CacheEntry::FullFile });
    }
    if let Some(range_path) = &paths.range {
        if range_path.is_file() && !is_internal_path(range_path) {
            match complete_size_from_cfs_file(range_path) {
                Some(complete_size) => {
                    debug!("Range cache entry found: {:?}", range_path);
                    let entry = CacheEntry::Range { complete_size };
                    return CacheLookup::Hit(CacheHit { path: range_path.clone(), entry });
                }
                None => {
                    warn!("Range cache entry {:?} has no size record and will be fetched again.", range_path);
                }
            }
        }
    }
    CacheLookup::Miss
}

/// The complete size of the object a range entry was cut from is kept in a hidden file next to it:
/// `foo(100-199).rpm` has its size stored in `.foo(100-199).rpm.cfs` (cfs = complete file size).
pub fn cfs_path_from_entry_path(path: &Path) -> Option<PathBuf> {
    match path.file_name() {
        None => {
            warn!("Unable to determine file name from path {:?}", path);
            None
        }
        Some(f) => {
            let cfs_filename = format!(".{}.cfs", f.to_string_lossy());
            Some(path.with_file_name(cfs_filename))
        }
    }
}

pub fn complete_size_from_cfs_file(path: &Path) -> Option<u64> {
    let cfs_path = cfs_path_from_entry_path(path)?;
    match fs::read_to_string(&cfs_path) {
        Ok(s) => match s.strip_suffix('\n').map(|digits| digits.parse::<u64>()) {
            Some(Ok(size)) => Some(size),
            _ => {
                error!("File {:?} has unexpected format: Expected a single line containing digits only", cfs_path);
                None
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("CFS file {:?} does not exist", cfs_path);
            None
        }
        Err(e) => {
            error!("Unable to read file {:?} into string: {:?}", cfs_path, e);
            None
        }
    }
}

pub fn create_cfs_file(path: &Path, complete_size: u64) -> std::io::Result<()> {
    let cfs_path = cfs_path_from_entry_path(path)
        .ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput))?;
    debug!("Creating CFS file {:?}", &cfs_path);
    let mut cfs_file = File::create(&cfs_path)?;
    cfs_file.write_all(format!("{}\n", complete_size).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeEnd, RangeSpec, RequestedRange};
    use tempfile::tempdir;

    fn paths_for(root: &Path, range: RequestedRange) -> CachePaths {
        CachePaths::resolve(root, "pkgs", "/foo.rpm", &range)
    }

    fn ranged() -> RequestedRange {
        RequestedRange::Partial(RangeSpec::new(100, RangeEnd::Inclusive(199)))
    }

    #[test]
    fn test_miss_on_empty_cache() {
        let dir = tempdir().unwrap();
        assert_eq!(lookup(&paths_for(dir.path(), ranged())), CacheLookup::Miss);
    }

    #[test]
    fn test_full_file_wins_over_range_entry() {
        let dir = tempdir().unwrap();
        let paths = paths_for(dir.path(), ranged());
        fs::create_dir_all(paths.full.parent().unwrap()).unwrap();
        fs::write(&paths.full, b"complete").unwrap();
        fs::write(paths.range.as_ref().unwrap(), b"partial").unwrap();
        create_cfs_file(paths.range.as_ref().unwrap(), 5000).unwrap();
        match lookup(&paths) {
            CacheLookup::Hit(hit) => {
                assert!(hit.is_full_file());
                assert_eq!(hit.path, paths.full);
            }
            CacheLookup::Miss => panic!("expected a hit"),
        }
    }

    #[test]
    fn test_exact_range_entry_hit() {
        let dir = tempdir().unwrap();
        let paths = paths_for(dir.path(), ranged());
        let range_path = paths.range.clone().unwrap();
        fs::create_dir_all(range_path.parent().unwrap()).unwrap();
        fs::write(&range_path, vec![0u8; 100]).unwrap();
        create_cfs_file(&range_path, 5000).unwrap();
        let expected = CacheHit { path: range_path, entry: CacheEntry::Range { complete_size: 5000 } };
        assert_eq!(lookup(&paths), CacheLookup::Hit(expected));
    }

    #[test]
    fn test_different_range_is_a_miss() {
        let dir = tempdir().unwrap();
        let cached = paths_for(dir.path(), ranged());
        let range_path = cached.range.clone().unwrap();
        fs::create_dir_all(range_path.parent().unwrap()).unwrap();
        fs::write(&range_path, vec![0u8; 100]).unwrap();
        create_cfs_file(&range_path, 5000).unwrap();
        let other = paths_for(dir.path(), RequestedRange::Partial(RangeSpec::new(100, RangeEnd::Inclusive(149))));
        assert_eq!(lookup(&other), CacheLookup::Miss);
    }

    #[test]
    fn test_range_entry_without_size_record_is_a_miss() {
        let dir = tempdir().unwrap();
        let paths = paths_for(dir.path(), ranged());
        let range_path = paths.range.clone().unwrap();
        fs::create_dir_all(range_path.parent().unwrap()).unwrap();
        fs::write(&range_path, vec![0u8; 100]).unwrap();
        assert_eq!(lookup(&paths), CacheLookup::Miss);
    }

    #[test]
    fn test_temp_files_are_invisible() {
        let dir = tempdir().unwrap();
        let paths = paths_for(dir.path(), RequestedRange::Full);
        fs::create_dir_all(paths.full.parent().unwrap()).unwrap();
        fs::write(paths.full.with_file_name("foo.rpm.tmp"), b"in progress").unwrap();
        assert_eq!(lookup(&paths), CacheLookup::Miss);
    }

    #[test]
    fn test_internal_files_are_never_a_hit() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkgs")).unwrap();
        fs::write(dir.path().join("pkgs/foo.rpm.tmp"), b"in progress").unwrap();
        fs::write(dir.path().join("pkgs/.foo(1-2).rpm.cfs"), b"5000\n").unwrap();
        for path in &["/foo.rpm.tmp", "/.foo(1-2).rpm.cfs"] {
            let paths = CachePaths::resolve(dir.path(), "pkgs", path, &RequestedRange::Full);
            assert_eq!(lookup(&paths), CacheLookup::Miss, "{} was found", path);
        }
    }

    #[test]
    fn test_internal_file_names() {
        assert!(is_internal_file_name("foo.rpm.tmp"));
        assert!(is_internal_file_name(".foo(100-199).rpm.cfs"));
        assert!(!is_internal_file_name("foo.rpm"));
        assert!(!is_internal_file_name("foo.cfs"));
        assert!(!is_internal_file_name(".hidden"));
    }

    #[test]
    fn test_cfs_path() {
        let cfs_path = cfs_path_from_entry_path(Path::new("/c/pkgs/foo(1-2).rpm")).unwrap();
        assert_eq!(cfs_path, PathBuf::from("/c/pkgs/.foo(1-2).rpm.cfs"));
    }
}
