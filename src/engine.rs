use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;

use http::header::{HeaderName, CONTENT_LENGTH};
use http::{Method, StatusCode};

use crate::cache_index::{lookup, CacheEntry, CacheHit, CacheLookup};
use crate::cache_path::CachePaths;
use crate::cache_sink::InFlight;
use crate::cached_reader::CachedFileReader;
use crate::mirror_fetch::{fetch_and_cache, FetchError, FetchOrder, FetchStart, FetchStream, UpstreamSettings};
use crate::range::{RangeEnd, RangeSpec, RequestedRange};
use crate::response::{content_type_for, ResponseDescriptor};

/// A configured upstream, selected by the first segment of the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub name: String,
    pub base_url: String,
}

impl Mirror {
    pub fn url_for(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), remote_path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    pub method: Method,
    pub mirror: String,
    /// Everything after the mirror segment, possibly with query string and fragment.
    pub path: String,
    pub range: Option<String>,
}

impl CacheRequest {
    pub fn get(mirror: &str, path: &str, range: Option<&str>) -> Self {
        Self {
            method: Method::GET,
            mirror: mirror.to_owned(),
            path: path.to_owned(),
            range: range.map(|r| r.to_owned()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadOrigin {
    Cache,
    RemoteMirror,
    NoPayload,
}

#[derive(Debug)]
pub enum Body {
    Empty,
    Cached(CachedFileReader),
    Fetched(FetchStream),
}

impl Iterator for Body {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Body::Empty => None,
            Body::Cached(reader) => reader.next(),
            Body::Fetched(stream) => stream.next(),
        }
    }
}

/// Status and headers are complete when this is returned, the body is produced lazily while it is consumed.
#[derive(Debug)]
pub struct CacheResponse {
    pub status: StatusCode,
    /// Reason phrase forwarded from the upstream server, if it differs from the canonical one.
    pub reason: Option<String>,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Body,
    pub origin: PayloadOrigin,
}

impl CacheResponse {
    fn without_body(status: StatusCode, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            headers: vec![(CONTENT_LENGTH, "0".to_owned())],
            body: Body::Empty,
            origin: PayloadOrigin::NoPayload,
        }
    }

    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub enum ServeError {
    UnsupportedMethod(Method),
    UnknownMirror(String),
    /// The request resolves to a directory of the cache, not to a file.
    NotAFile(PathBuf),
    Upstream(FetchError),
}

impl From<FetchError> for ServeError {
    fn from(error: FetchError) -> Self {
        ServeError::Upstream(error)
    }
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::UnsupportedMethod(method) => write!(f, "unsupported method: {}", method),
            ServeError::UnknownMirror(name) => write!(f, "unknown mirror: {:?}", name),
            ServeError::NotAFile(path) => write!(f, "not a file: {:?}", path),
            ServeError::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServeError {}

/// Serves files of the configured mirrors from the cache directory, fetching and caching whatever is missing.
#[derive(Debug, Clone)]
pub struct HttpCache {
    mirrors: BTreeMap<String, Mirror>,
    cache_directory: PathBuf,
    upstream: UpstreamSettings,
    in_flight: InFlight,
}

impl HttpCache {
    pub fn new(mirrors: Vec<Mirror>, cache_directory: PathBuf, upstream: UpstreamSettings) -> Self {
        let mirrors = mirrors.into_iter().map(|m| (m.name.clone(), m)).collect();
        Self {
            mirrors,
            cache_directory,
            upstream,
            in_flight: InFlight::new(),
        }
    }

    pub fn cache_directory(&self) -> &PathBuf {
        &self.cache_directory
    }

    pub fn mirror(&self, name: &str) -> Option<&Mirror> {
        self.mirrors.get(name)
    }

    pub fn serve(&self, request: &CacheRequest) -> Result<CacheResponse, ServeError> {
        if request.method != Method::GET {
            return Err(ServeError::UnsupportedMethod(request.method.clone()));
        }
        let mirror = self.mirrors.get(&request.mirror)
            .ok_or_else(|| ServeError::UnknownMirror(request.mirror.clone()))?;
        let range = RequestedRange::from_header_lenient(request.range.as_deref());
        let paths = CachePaths::resolve(&self.cache_directory, &mirror.name, &request.path, &range);
        if paths.names_internal_file() {
            debug!("Refusing to serve internal file {:?}", &paths.full);
            return Err(ServeError::NotAFile(paths.full));
        }
        if paths.is_mirror_root() || paths.full.is_dir() {
            return Err(ServeError::NotAFile(paths.full));
        }
        debug!("Serving {}: {:?} - {}", &mirror.name, &paths.full, &request.path);
        let content_type = content_type_for(&paths.full);

        match lookup(&paths) {
            CacheLookup::Hit(hit) => Ok(self.serve_from_cache(hit, content_type, range)),
            CacheLookup::Miss => self.serve_from_mirror(mirror, paths, content_type, range),
        }
    }

    fn serve_from_cache(&self, hit: CacheHit, content_type: &'static str, range: RequestedRange) -> CacheResponse {
        // Always read in binary mode: The size on disk is exactly what is announced as the content length.
        let file = match File::open(&hit.path) {
            Ok(f) => f,
            Err(e) => {
                error!("Unable to open cached file {:?}: {:?}", &hit.path, e);
                return CacheResponse::without_body(
                    StatusCode::INTERNAL_SERVER_ERROR, Some("Could not read file".to_owned()));
            }
        };
        let file_size = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                error!("Unable to fetch metadata of {:?}: {:?}", &hit.path, e);
                return CacheResponse::without_body(
                    StatusCode::INTERNAL_SERVER_ERROR, Some("Could not read file".to_owned()));
            }
        };
        let (descriptor, offset) = match hit.entry {
            CacheEntry::FullFile => (ResponseDescriptor::new(content_type, file_size, range), None),
            CacheEntry::Range { complete_size } => {
                // The range file starts at the requested offset and holds as many bytes as the upstream sent.
                let start = range.partial().map(|r| r.start).unwrap_or(0);
                let end = (start + file_size).saturating_sub(1);
                let served = RequestedRange::Partial(RangeSpec::new(start, RangeEnd::Inclusive(end)));
                (ResponseDescriptor::new(content_type, complete_size, served), Some(start))
            }
        };
        debug!("Serve {:?} from cache with status {}", &hit.path, descriptor.status());
        let body = match descriptor.byte_range() {
            None => Body::Empty,
            Some((start, end)) => {
                let file_offset = start - offset.unwrap_or(0);
                Body::Cached(CachedFileReader::new(file, file_offset, end - start + 1))
            }
        };
        CacheResponse {
            status: descriptor.status(),
            reason: None,
            headers: descriptor.headers(),
            body,
            origin: PayloadOrigin::Cache,
        }
    }

    fn serve_from_mirror(
        &self,
        mirror: &Mirror,
        paths: CachePaths,
        content_type: &'static str,
        range: RequestedRange,
    ) -> Result<CacheResponse, ServeError> {
        let url = mirror.url_for(&paths.remote_path());
        let order = FetchOrder {
            url,
            range,
            full_path: paths.full,
            range_path: paths.range,
        };
        match fetch_and_cache(order, &self.upstream, &self.in_flight)? {
            FetchStart::Rejected { code, reason } => {
                let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
                Ok(CacheResponse::without_body(status, Some(reason)))
            }
            FetchStart::Streaming { body, stream } => {
                let descriptor = ResponseDescriptor::new(content_type, body.complete_size(), body.served_range());
                Ok(CacheResponse {
                    status: descriptor.status(),
                    reason: None,
                    headers: descriptor.headers(),
                    body: Body::Fetched(stream),
                    origin: PayloadOrigin::RemoteMirror,
                })
            }
        }
    }
}
