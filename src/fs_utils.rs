use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use walkdir::WalkDir;

use crate::cache_sink::TEMP_SUFFIX;

pub fn create_dir_unless_exists(directory: &Path) -> std::io::Result<()> {
    match fs::create_dir_all(directory) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn create_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        None => Err(std::io::Error::from(ErrorKind::InvalidInput)),
        Some(parent) => create_dir_unless_exists(parent),
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct CacheInventory {
    pub num_entries: u64,
    pub size: u64,
    pub num_stale_removed: u64,
}

/// Walks the cache directory once at startup. Temporary files can only be left behind by transfers that were
/// interrupted when the process went down, so they are removed.
pub fn inspect_cache_directory(cache_directory: &Path) -> CacheInventory {
    let mut inventory = CacheInventory::default();
    for entry in WalkDir::new(cache_directory) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error while reading directory entry: {:?}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if file_name.ends_with(TEMP_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!("Removed leftover file {:?} of an interrupted transfer.", entry.path());
                    inventory.num_stale_removed += 1;
                }
                Err(e) => warn!("Unable to remove {:?}: {:?}", entry.path(), e),
            }
        } else if !file_name.starts_with('.') {
            inventory.num_entries += 1;
            inventory.size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    info!("Retrieved {} files with a total size of {} from local file system.",
          inventory.num_entries, size_to_human_readable(inventory.size));
    inventory
}

pub fn size_to_human_readable(size_in_bytes: u64) -> String {
    if size_in_bytes == 0 {
        return "0 B".to_owned();
    }
    let exponent = ((size_in_bytes as f64).log2() / 10.0) as u32;
    let unit = match exponent {
        0 => "B",
        1 => "KiB",
        2 => "MiB",
        3 => "GiB",
        4 => "TiB",
        5 => "PiB",
        _ => "EiB",
    };
    let quantity = (size_in_bytes as f64) / ((1024u64).pow(exponent.min(6)) as f64);
    format!("{:.2} {}", quantity, unit)
}
