use std::io::{ErrorKind, Read};
use std::str;

use http::Method;
use httparse::{Header, Status};

use crate::engine::CacheRequest;

// Since a restriction for the size of header fields is also implemented by web servers like NGINX or Apache,
// we keep things simple by just setting a fixed buffer length.
const MAX_HEADER_SIZE: usize = 8192;

const MAX_HEADER_COUNT: usize = 64;

#[cfg(test)]
const TEST_REQUEST_HEADER: &[u8] = "GET /pkgs/os/foo.rpm HTTP/1.1\r\nHost: www.example.com\r\n\r\n".as_bytes();

#[derive(Debug, PartialEq, Eq)]
pub enum ClientError {
    BufferSizeExceeded,
    TimedOut,
    InvalidHeader,
    Other(ErrorKind),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClientResponse {
    Request(Request),
    SocketClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// The request target, including the mirror segment.
    pub target: String,
    pub range: Option<String>,
    pub keep_alive: bool,
}

impl Request {
    fn new(request: httparse::Request) -> Result<Self, ClientError> {
        let range = match find_header(request.headers, "range") {
            None => None,
            Some(v) => Some(v?.to_owned()),
        };
        let connection = match find_header(request.headers, "connection") {
            None => None,
            Some(v) => Some(v?.to_ascii_lowercase()),
        };
        // Request bodies are never read, so the connection cannot be reused after a request that carries one.
        let has_body = find_header(request.headers, "transfer-encoding").is_some()
            || matches!(find_header(request.headers, "content-length"), Some(Ok(v)) if v.trim() != "0");
        let keep_alive = match (request.version, connection.as_deref()) {
            _ if has_body => false,
            (_, Some("close")) => false,
            (Some(0), Some("keep-alive")) => true,
            (Some(0), _) => false,
            (_, _) => true,
        };
        let target = request.path.ok_or(ClientError::InvalidHeader)?;
        let method = match request.method.map(|m| Method::from_bytes(m.as_bytes())) {
            Some(Ok(m)) => m,
            _ => {
                error!("Expected the request method to be set.");
                return Err(ClientError::InvalidHeader);
            }
        };
        Ok(Self {
            method,
            target: target.to_owned(),
            range,
            keep_alive,
        })
    }

    /// Splits `/<mirror>/<path>` into the mirror name and the rest of the target. The mirror name ends at the
    /// first `/`, `?` or `#`.
    pub fn cache_request(&self) -> CacheRequest {
        let target = self.target.strip_prefix('/').unwrap_or(&self.target);
        let end = target.find(|c: char| c == '/' || c == '?' || c == '#').unwrap_or_else(|| target.len());
        let (mirror, path) = target.split_at(end);
        CacheRequest {
            method: self.method.clone(),
            mirror: mirror.to_owned(),
            path: path.to_owned(),
            range: self.range.clone(),
        }
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<Result<&'a str, ClientError>> {
    headers.iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| str::from_utf8(h.value).map_err(|_| {
            error!("Unable to parse header value to UTF8");
            ClientError::InvalidHeader
        }))
}

/// Reads the next request header. `pending` holds the bytes the client has sent beyond the previous header, and
/// receives the bytes sent beyond this one: Clients may pipeline requests on a keep-alive connection.
pub fn read_client_header<T>(client_stream: &mut T, pending: &mut Vec<u8>) -> Result<ClientResponse, ClientError>
    where T: Read {
    let mut buf = [0; MAX_HEADER_SIZE + 1];
    let mut size_read_all = pending.len().min(buf.len());
    buf[..size_read_all].copy_from_slice(&pending[..size_read_all]);
    pending.clear();

    loop {
        if size_read_all > 0 {
            let mut headers: [Header; MAX_HEADER_COUNT] = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
            let mut req: httparse::Request = httparse::Request::new(&mut headers);
            let res: std::result::Result<httparse::Status<usize>, httparse::Error> = req.parse(&buf[..size_read_all]);
            match res {
                Ok(Status::Complete(header_size)) => {
                    debug!("Received header from client");
                    let request = Request::new(req)?;
                    pending.extend_from_slice(&buf[header_size..size_read_all]);
                    return Ok(ClientResponse::Request(request));
                }
                Ok(Status::Partial) => {}
                Err(_) => {
                    return Err(ClientError::InvalidHeader);
                }
            }
        }
        if size_read_all >= MAX_HEADER_SIZE {
            return Err(ClientError::BufferSizeExceeded);
        }
        let size = match client_stream.read(&mut buf[size_read_all..]) {
            Ok(0) => {
                // we need this branch in case the socket is closed: Otherwise, we would read a size of 0 indefinitely.
                return Ok(ClientResponse::SocketClosed);
            }
            Ok(s) if s > MAX_HEADER_SIZE => return Err(ClientError::BufferSizeExceeded),
            Ok(s) => s,
            Err(e) => {
                let error = match e.kind() {
                    ErrorKind::TimedOut => ClientError::TimedOut,
                    ErrorKind::WouldBlock => ClientError::TimedOut,
                    other => ClientError::Other(other),
                };
                return Err(error);
            }
        };
        size_read_all += size;
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Error};

    use super::*;

    struct TooMuchDataReader {}
    impl Read for TooMuchDataReader {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            // Notice that we cause an error by writing the exact amount of the maximum header size: we can't
            // tell if the client has sent exactly this many bytes or more, so we cautiously assume the latter.
            let too_much_data = [0; MAX_HEADER_SIZE + 1];
            buf[..too_much_data.len()].copy_from_slice(&too_much_data);
            Ok(MAX_HEADER_SIZE + 1)
        }
    }

    // writes a single byte at a time.
    struct OneByteReader {
        data: Vec<u8>,
        size_read: usize,
    }
    impl Read for OneByteReader {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            if self.size_read < self.data.len() {
                buf[0] = self.data[self.size_read];
                self.size_read += 1;
                Ok(1)
            } else {
                Ok(0)
            }
        }
    }

    fn parse(data: &[u8]) -> Request {
        let mut stream = OneByteReader { data: data.to_vec(), size_read: 0 };
        match read_client_header(&mut stream, &mut Vec::new()) {
            Ok(ClientResponse::Request(request)) => request,
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_buffer_size_exceeded() {
        let mut stream = TooMuchDataReader {};
        let result = read_client_header(&mut stream, &mut Vec::new());
        assert_eq!(result, Err(ClientError::BufferSizeExceeded));
    }

    #[test]
    fn test_one_byte_reader() {
        let request = parse(TEST_REQUEST_HEADER);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.target, "/pkgs/os/foo.rpm");
        assert_eq!(request.range, None);
        assert!(request.keep_alive);
    }

    #[test]
    fn test_socket_closed() {
        let mut stream = OneByteReader { data: vec![], size_read: 0 };
        assert_eq!(read_client_header(&mut stream, &mut Vec::new()), Ok(ClientResponse::SocketClosed));
    }

    #[test]
    fn test_range_and_connection_headers() {
        let request = parse(b"GET /pkgs/foo.rpm HTTP/1.1\r\nRange: bytes=100-199\r\nConnection: close\r\n\r\n");
        assert_eq!(request.range, Some("bytes=100-199".to_owned()));
        assert!(!request.keep_alive);
    }

    #[test]
    fn test_http_1_0_closes_by_default() {
        assert!(!parse(b"GET /pkgs/foo.rpm HTTP/1.0\r\n\r\n").keep_alive);
    }

    #[test]
    fn test_pipelined_requests() {
        let mut stream = Cursor::new(
            b"GET /pkgs/a.rpm HTTP/1.1\r\n\r\nGET /pkgs/b.rpm HTTP/1.1\r\nRange: bytes=0-9\r\n\r\nGET /pk".to_vec());
        let mut pending = Vec::new();
        match read_client_header(&mut stream, &mut pending) {
            Ok(ClientResponse::Request(request)) => assert_eq!(request.target, "/pkgs/a.rpm"),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(pending.starts_with(b"GET /pkgs/b.rpm"));
        match read_client_header(&mut stream, &mut pending) {
            Ok(ClientResponse::Request(request)) => {
                assert_eq!(request.target, "/pkgs/b.rpm");
                assert_eq!(request.range, Some("bytes=0-9".to_owned()));
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(pending, b"GET /pk".to_vec());
        assert_eq!(read_client_header(&mut stream, &mut pending), Ok(ClientResponse::SocketClosed));
    }

    #[test]
    fn test_request_with_body_closes_connection() {
        assert!(!parse(b"GET /pkgs/foo.rpm HTTP/1.1\r\nContent-Length: 3\r\n\r\n").keep_alive);
        assert!(!parse(b"GET /pkgs/foo.rpm HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").keep_alive);
        assert!(parse(b"GET /pkgs/foo.rpm HTTP/1.1\r\nContent-Length: 0\r\n\r\n").keep_alive);
    }

    #[test]
    fn test_other_methods_are_passed_on() {
        assert_eq!(parse(b"DELETE /pkgs/foo.rpm HTTP/1.1\r\n\r\n").method, Method::DELETE);
    }

    #[test]
    fn test_invalid_header() {
        let mut stream = OneByteReader { data: b"\x01\x02 nonsense\r\n\r\n".to_vec(), size_read: 0 };
        assert_eq!(read_client_header(&mut stream, &mut Vec::new()), Err(ClientError::InvalidHeader));
    }

    #[test]
    fn test_cache_request_splits_mirror_segment() {
        let request = parse(b"GET /pkgs/os/foo.rpm?x=1 HTTP/1.1\r\nRange: bytes=0-\r\n\r\n");
        let cache_request = request.cache_request();
        assert_eq!(cache_request.mirror, "pkgs");
        assert_eq!(cache_request.path, "/os/foo.rpm?x=1");
        assert_eq!(cache_request.range, Some("bytes=0-".to_owned()));

        assert_eq!(parse(b"GET /pkgs HTTP/1.1\r\n\r\n").cache_request().mirror, "pkgs");
        assert_eq!(parse(b"GET /pkgs?x HTTP/1.1\r\n\r\n").cache_request().path, "?x");
    }
}
