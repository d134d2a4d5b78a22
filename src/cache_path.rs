use std::path::{Path, PathBuf};
use std::str;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::cache_index::is_internal_file_name;
use crate::range::RequestedRange;

// Characters that need to be escaped again when the normalized path is sent to the upstream server.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// The on-disk locations for one requested resource.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CachePaths {
    segments: Vec<String>,
    /// Location of the full-file cache entry.
    pub full: PathBuf,
    /// Location of the range cache entry, present only if a partial range was requested and the request
    /// names a file.
    pub range: Option<PathBuf>,
}

impl CachePaths {
    /// Maps `raw_path` into `<cache_root>/<mirror_name>/...`. Resolution never fails: the query string and
    /// fragment are dropped, percent-encoding is decoded, and every segment that could lead outside of the
    /// mirror's directory is discarded.
    pub fn resolve(cache_root: &Path, mirror_name: &str, raw_path: &str, range: &RequestedRange) -> Self {
        let segments = normalized_segments(raw_path);
        let mut full = cache_root.join(mirror_name);
        for segment in &segments {
            full.push(segment);
        }
        let range = match range.partial() {
            Some(range) if !segments.is_empty() => Some(range_path(&full, &range.file_name_marker())),
            _ => None,
        };
        Self { segments, full, range }
    }

    /// True if nothing is left of the request path after normalization.
    pub fn is_mirror_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if any segment names one of the files the cache keeps next to its entries.
    pub fn names_internal_file(&self) -> bool {
        self.segments.iter().any(|segment| is_internal_file_name(segment))
    }

    /// The normalized path, percent-encoded again, as it is appended to the mirror's base URL.
    pub fn remote_path(&self) -> String {
        let mut remote_path = String::new();
        for segment in &self.segments {
            remote_path.push('/');
            remote_path.extend(utf8_percent_encode(segment, PATH_SEGMENT_ENCODE_SET));
        }
        if remote_path.is_empty() {
            remote_path.push('/');
        }
        remote_path
    }
}

fn normalized_segments(raw_path: &str) -> Vec<String> {
    let path = raw_path.split('?').next().unwrap_or("");
    let path = path.split('#').next().unwrap_or("");
    let decoded: Vec<u8> = percent_decode_str(path).collect();
    let mut segments: Vec<String> = Vec::new();
    for raw_word in decoded.split(|b: &u8| *b == b'/' || *b == b'\\') {
        let word = match str::from_utf8(raw_word) {
            Ok(word) => strip_drive_prefix(word),
            Err(_) => {
                debug!("Dropping path segment {:?} since it is not valid UTF-8", String::from_utf8_lossy(raw_word));
                continue;
            }
        };
        match word {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            w if w.contains('\0') => {
                debug!("Dropping path segment {:?} since it contains a NUL byte", w);
            }
            w => segments.push(w.to_owned()),
        }
    }
    segments
}

/// `C:foo` becomes `foo`, `C:` becomes the empty segment.
fn strip_drive_prefix(word: &str) -> &str {
    let bytes = word.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        &word[2..]
    } else {
        word
    }
}

/// Inserts the marker before the final extension: `foo.rpm` becomes `foo(100-199).rpm`.
fn range_path(full: &Path, marker: &str) -> PathBuf {
    let stem = full.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let file_name = match full.extension() {
        Some(ext) => format!("{}{}.{}", stem, marker, ext.to_string_lossy()),
        None => format!("{}{}", stem, marker),
    };
    full.with_file_name(file_name)
}
