use std::path::Path;

use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use http::StatusCode;

use crate::range::{ContentRange, RequestedRange};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

static EXTENSIONS_MAP: &[(&str, &str)] = &[
    ("rpm", "application/x-redhat-package-manager"),
    ("deb", "application/vnd.debian.binary-package"),
    ("gz", "application/gzip"),
    ("xz", "application/x-xz"),
    ("zst", "application/zstd"),
    ("bz2", "application/x-bzip2"),
    ("tar", "application/x-tar"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("sig", "application/pgp-signature"),
    ("asc", "application/pgp-signature"),
];

pub fn content_type_for(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            EXTENSIONS_MAP.iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(ext))
                .map(|(_, content_type)| *content_type)
        })
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Status and headers for a response, derived from the size of the complete object and the range that is
/// being served. Nothing is stored redundantly: every header is computed on demand.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResponseDescriptor {
    pub content_type: &'static str,
    pub size: u64,
    pub range: RequestedRange,
}

impl ResponseDescriptor {
    pub fn new(content_type: &'static str, size: u64, range: RequestedRange) -> Self {
        Self { content_type, size, range }
    }

    pub fn status(&self) -> StatusCode {
        match &self.range {
            RequestedRange::Full => StatusCode::OK,
            RequestedRange::Partial(range) if !range.is_satisfiable(self.size) => StatusCode::RANGE_NOT_SATISFIABLE,
            RequestedRange::Partial(_) => StatusCode::PARTIAL_CONTENT,
        }
    }

    /// First and last byte (inclusive) of the body, or `None` if the body is empty.
    pub fn byte_range(&self) -> Option<(u64, u64)> {
        match &self.range {
            RequestedRange::Full if self.size == 0 => None,
            RequestedRange::Full => Some((0, self.size - 1)),
            RequestedRange::Partial(range) if !range.is_satisfiable(self.size) => None,
            RequestedRange::Partial(range) => {
                let (start, end) = (range.content_start(), range.content_end(self.size));
                if end < start {
                    None
                } else {
                    Some((start, end))
                }
            }
        }
    }

    pub fn content_length(&self) -> u64 {
        match self.byte_range() {
            None => 0,
            Some((start, end)) => (end - start) + 1,
        }
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        match (self.status(), self.byte_range()) {
            (StatusCode::PARTIAL_CONTENT, Some((start, end))) => {
                Some(ContentRange { start, end, complete_size: self.size })
            }
            _ => None,
        }
    }

    pub fn headers(&self) -> Vec<(HeaderName, String)> {
        let mut headers = vec![
            (CONTENT_TYPE, self.content_type.to_owned()),
            (CONTENT_LENGTH, self.content_length().to_string()),
        ];
        match self.status() {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(content_range) = self.content_range() {
                    headers.push((CONTENT_RANGE, content_range.to_string()));
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                headers.push((CONTENT_RANGE, format!("bytes */{}", self.size)));
            }
            _ => {}
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeEnd, RangeSpec};

    fn header<'a>(headers: &'a [(HeaderName, String)], name: &HeaderName) -> Option<&'a str> {
        headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_full_range_is_200_without_content_range() {
        let descriptor = ResponseDescriptor::new(DEFAULT_CONTENT_TYPE, 5000, RequestedRange::Full);
        assert_eq!(descriptor.status(), StatusCode::OK);
        let headers = descriptor.headers();
        assert_eq!(header(&headers, &CONTENT_LENGTH), Some("5000"));
        assert_eq!(header(&headers, &CONTENT_RANGE), None);
    }

    #[test]
    fn test_closed_ranges_are_206() {
        for &(start, end) in &[(0u64, 0u64), (0, 4999), (10, 20), (4999, 4999), (123, 4567)] {
            let range = RequestedRange::Partial(RangeSpec::new(start, RangeEnd::Inclusive(end)));
            let descriptor = ResponseDescriptor::new(DEFAULT_CONTENT_TYPE, 5000, range);
            assert_eq!(descriptor.status(), StatusCode::PARTIAL_CONTENT);
            assert_eq!(descriptor.content_length(), end - start + 1);
            let expected = format!("bytes {}-{}/5000", start, end);
            assert_eq!(header(&descriptor.headers(), &CONTENT_RANGE), Some(expected.as_str()));
        }
    }

    #[test]
    fn test_open_range_resolves_against_size() {
        let range = RequestedRange::Partial(RangeSpec::new(0, RangeEnd::ToEnd));
        let descriptor = ResponseDescriptor::new(DEFAULT_CONTENT_TYPE, 300, range);
        assert_eq!(descriptor.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(descriptor.content_length(), 300);
        assert_eq!(header(&descriptor.headers(), &CONTENT_RANGE), Some("bytes 0-299/300"));
    }

    #[test]
    fn test_range_past_end_is_unsatisfiable() {
        let range = RequestedRange::Partial(RangeSpec::new(300, RangeEnd::ToEnd));
        let descriptor = ResponseDescriptor::new(DEFAULT_CONTENT_TYPE, 300, range);
        assert_eq!(descriptor.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(descriptor.content_length(), 0);
        assert_eq!(header(&descriptor.headers(), &CONTENT_RANGE), Some("bytes */300"));
    }

    #[test]
    fn test_empty_file() {
        let descriptor = ResponseDescriptor::new(DEFAULT_CONTENT_TYPE, 0, RequestedRange::Full);
        assert_eq!(descriptor.byte_range(), None);
        assert_eq!(descriptor.content_length(), 0);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("/c/pkgs/foo.rpm")), "application/x-redhat-package-manager");
        assert_eq!(content_type_for(Path::new("/c/pkgs/foo.RPM")), "application/x-redhat-package-manager");
        assert_eq!(content_type_for(Path::new("/c/pkgs/foo.unknown")), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_for(Path::new("/c/pkgs/README")), DEFAULT_CONTENT_TYPE);
    }
}
