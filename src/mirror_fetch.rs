use std::fmt;
use std::path::PathBuf;
use std::str;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use curl::easy::{Easy2, Handler, HttpVersion, List, WriteError};
use httparse::{Header, Status};

use crate::cache_sink::{CacheSink, InFlight};
use crate::cached_reader::CHUNK_SIZE;
use crate::range::{ContentRange, RequestedRange};

const MAX_HEADER_COUNT: usize = 64;

const MAX_REDIRECTIONS: u32 = 3;

// Number of chunks buffered between the transfer and the client. Bounds the memory used per request.
const CHANNEL_CAPACITY: usize = 16;

const CURLE_OPERATION_TIMEDOUT: u32 = 28;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

pub const DEFAULT_LOW_SPEED_TIME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    /// Abort transfers slower than this many bytes per second for `low_speed_time`.
    pub low_speed_limit: Option<u32>,
    pub low_speed_time: Duration,
    /// Maximum receive rate in bytes per second.
    pub max_speed_limit: Option<u64>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            low_speed_limit: None,
            low_speed_time: DEFAULT_LOW_SPEED_TIME,
            max_speed_limit: None,
        }
    }
}

#[derive(Debug)]
pub enum FetchError {
    Curl(curl::Error),
    /// The upstream response cannot be served: a malformed header, a missing length, or an unexpected status.
    InvalidResponse(String),
    Io(std::io::Error),
    Incomplete { expected: u64, received: u64 },
    /// The transfer thread went away without reporting a result.
    Disconnected,
}

impl From<curl::Error> for FetchError {
    fn from(error: curl::Error) -> Self {
        FetchError::Curl(error)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        FetchError::Io(error)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Curl(e) => write!(f, "upstream transfer failed: {}", e),
            FetchError::InvalidResponse(reason) => write!(f, "invalid upstream response: {}", reason),
            FetchError::Io(e) => write!(f, "I/O error: {}", e),
            FetchError::Incomplete { expected, received } => {
                write!(f, "upstream transfer incomplete: expected {} bytes, received {}", expected, received)
            }
            FetchError::Disconnected => write!(f, "upstream transfer ended without a result"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<FetchError> for std::io::Error {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Io(e) => e,
            e @ FetchError::Incomplete { .. } => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e),
            e => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

/// What the upstream server is about to send, according to its response header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FetchedBody {
    Full { size: u64 },
    Partial(ContentRange),
}

impl FetchedBody {
    pub fn len(&self) -> u64 {
        match self {
            FetchedBody::Full { size } => *size,
            FetchedBody::Partial(content_range) => content_range.len(),
        }
    }

    pub fn complete_size(&self) -> u64 {
        match self {
            FetchedBody::Full { size } => *size,
            FetchedBody::Partial(content_range) => content_range.complete_size,
        }
    }

    /// The range served to the client: `Full` unless the upstream confirmed a partial range.
    pub fn served_range(&self) -> RequestedRange {
        match self {
            FetchedBody::Full { .. } => RequestedRange::Full,
            FetchedBody::Partial(content_range) => RequestedRange::Partial(content_range.range_spec()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum HeadOutcome {
    Accepted(FetchedBody),
    Rejected { code: u16, reason: String },
    Redirect,
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers.iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| str::from_utf8(h.value).ok())
        .map(|v| v.trim())
}

/// Content-Range, if present, is authoritative. Otherwise the body is the complete object of Content-Length
/// bytes.
fn interpret_head(code: u16, reason: &str, headers: &[Header]) -> Result<HeadOutcome, FetchError> {
    if (300..400).contains(&code) && find_header(headers, "location").is_some() {
        return Ok(HeadOutcome::Redirect);
    }
    if code == 100 {
        return Ok(HeadOutcome::Redirect);
    }
    if code != 200 && code != 206 {
        return Ok(HeadOutcome::Rejected { code, reason: reason.to_owned() });
    }
    let content_length = match find_header(headers, "content-length") {
        None => None,
        Some(v) => match v.parse::<u64>() {
            Ok(length) => Some(length),
            Err(_) => return Err(FetchError::InvalidResponse(format!("invalid content length: {:?}", v))),
        },
    };
    match (code, find_header(headers, "content-range")) {
        (206, Some(value)) => {
            let content_range = ContentRange::parse(value)
                .ok_or_else(|| FetchError::InvalidResponse(format!("invalid content range: {:?}", value)))?;
            match content_length {
                Some(length) if length != content_range.len() => Err(FetchError::InvalidResponse(
                    format!("content length {} does not match content range {}", length, content_range))),
                _ => Ok(HeadOutcome::Accepted(FetchedBody::Partial(content_range))),
            }
        }
        (206, None) => Err(FetchError::InvalidResponse("partial content without content range".to_owned())),
        (_, _) => match content_length {
            Some(size) => Ok(HeadOutcome::Accepted(FetchedBody::Full { size })),
            None => Err(FetchError::InvalidResponse("response has no content length".to_owned())),
        },
    }
}

/// Everything needed to fetch one resource from an upstream mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOrder {
    pub url: String,
    pub range: RequestedRange,
    pub full_path: PathBuf,
    pub range_path: Option<PathBuf>,
}

impl FetchOrder {
    /// The cache entry a response body is published as. Complete objects always go to the full-file path,
    /// even if a range was requested. Partial bodies go to the range path, but only if they start where the
    /// client asked them to.
    fn target(&self, body: &FetchedBody) -> Option<(PathBuf, Option<u64>)> {
        match body {
            FetchedBody::Full { .. } => Some((self.full_path.clone(), None)),
            FetchedBody::Partial(content_range)
                if content_range.start == 0 && content_range.end + 1 == content_range.complete_size => {
                Some((self.full_path.clone(), None))
            }
            FetchedBody::Partial(content_range) => match (self.range.partial(), &self.range_path) {
                (Some(requested), Some(range_path)) if requested.start == content_range.start => {
                    Some((range_path.clone(), Some(content_range.complete_size)))
                }
                _ => None,
            },
        }
    }
}

enum FetchEvent {
    Head(HeadOutcome),
    Chunk(Vec<u8>),
    Failed(FetchError),
    Done,
}

#[derive(Debug)]
pub enum FetchStart {
    /// The upstream server replied with an error status. Nothing is cached.
    Rejected { code: u16, reason: String },
    Streaming { body: FetchedBody, stream: FetchStream },
}

/// Forwards each chunk of the upstream body to the cache sink and to the client, in that order.
struct TeeHandler {
    order: FetchOrder,
    in_flight: InFlight,
    tx: Sender<FetchEvent>,
    received_header: Vec<u8>,
    head: Option<HeadOutcome>,
    sink: Option<CacheSink>,
    consumer_gone: bool,
    size_received: u64,
    reported: bool,
}

impl TeeHandler {
    fn new(order: FetchOrder, in_flight: InFlight, tx: Sender<FetchEvent>) -> Self {
        Self {
            order,
            in_flight,
            tx,
            received_header: Vec::new(),
            head: None,
            sink: None,
            consumer_gone: false,
            size_received: 0,
            reported: false,
        }
    }

    fn send(&mut self, event: FetchEvent) {
        if self.consumer_gone {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!("Client has stopped consuming {}", &self.order.url);
            self.consumer_gone = true;
        }
    }

    fn report(&mut self, event: FetchEvent) {
        if !self.reported {
            self.reported = true;
            self.send(event);
        }
    }

    fn open_sink(&mut self, body: &FetchedBody) {
        let (target, complete_size) = match self.order.target(body) {
            None => {
                debug!("Response body for {} does not match the requested range and will not be cached",
                       &self.order.url);
                return;
            }
            Some(t) => t,
        };
        let claim = match self.in_flight.try_claim(&target) {
            None => {
                info!("{:?} is already being downloaded, {} will not be cached twice", &target, &self.order.url);
                return;
            }
            Some(c) => c,
        };
        match CacheSink::create(claim, body.len(), complete_size) {
            Ok(sink) => {
                info!("Caching {} as {:?}", &self.order.url, sink.final_path());
                self.sink = Some(sink);
            }
            Err(e) => error!("Unable to create cache file for {:?}: {:?}", &target, e),
        }
    }
}

impl Handler for TeeHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        match self.head {
            Some(HeadOutcome::Accepted(_)) => {}
            _ => return Ok(data.len()),
        }
        self.size_received += data.len() as u64;
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_chunk(data) {
                error!("Error while writing data to {:?}: {:?}", sink.final_path(), e);
                self.sink = None;
            }
        }
        self.send(FetchEvent::Chunk(data.to_vec()));
        if self.consumer_gone && self.sink.is_none() {
            debug!("Nobody is interested in the rest of {}, abort transfer", &self.order.url);
            return Ok(0);
        }
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if self.head.is_some() {
            return true;
        }
        self.received_header.extend(data);

        let mut headers: [Header; MAX_HEADER_COUNT] = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut response: httparse::Response = httparse::Response::new(&mut headers);
        let result = response.parse(self.received_header.as_slice());
        let outcome = match result {
            Ok(Status::Complete(_header_size)) => {
                let code = response.code.unwrap_or(0);
                debug!("{} replied with status code {}", &self.order.url, code);
                interpret_head(code, response.reason.unwrap_or(""), response.headers)
            }
            Ok(Status::Partial) => {
                // nothing to do, wait until this function is invoked again.
                return true;
            }
            Err(e) => Err(FetchError::InvalidResponse(format!("unable to parse header: {:?}", e))),
        };
        match outcome {
            Ok(HeadOutcome::Redirect) => {
                self.received_header.clear();
                true
            }
            Ok(HeadOutcome::Accepted(body)) => {
                self.open_sink(&body);
                self.head = Some(HeadOutcome::Accepted(body));
                self.send(FetchEvent::Head(HeadOutcome::Accepted(body)));
                true
            }
            Ok(HeadOutcome::Rejected { code, reason }) => {
                info!("{} is not available: {} {}", &self.order.url, code, &reason);
                let outcome = HeadOutcome::Rejected { code, reason };
                self.head = Some(outcome.clone());
                self.reported = true;
                self.send(FetchEvent::Head(outcome));
                false
            }
            Err(e) => {
                warn!("Unexpected response from {}: {}", &self.order.url, &e);
                self.report(FetchEvent::Failed(e));
                false
            }
        }
    }
}

fn configure(easy: &mut Easy2<TeeHandler>, settings: &UpstreamSettings) -> Result<(), curl::Error> {
    let order = easy.get_ref().order.clone();
    easy.url(&order.url)?;
    easy.get(true)?;
    if let Some(range) = order.range.partial() {
        let mut list = List::new();
        list.append(&format!("Range: {}", range.to_request_header()))?;
        easy.http_headers(list)?;
    }
    // we use httparse to parse the headers, but httparse doesn't support HTTP/2.
    easy.http_version(HttpVersion::V11)?;
    easy.connect_timeout(settings.connect_timeout)?;
    if let Some(speed) = settings.low_speed_limit {
        easy.low_speed_limit(speed)?;
        easy.low_speed_time(settings.low_speed_time)?;
    }
    if let Some(speed) = settings.max_speed_limit {
        easy.max_recv_speed(speed)?;
    }
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTIONS)?;
    easy.buffer_size(CHUNK_SIZE)?;
    Ok(())
}

fn run_transfer(mut easy: Easy2<TeeHandler>) {
    let result = easy.perform();
    let handler = easy.get_mut();
    let sink = handler.sink.take();
    let outcome = (handler.head.clone(), handler.size_received);
    let url = handler.order.url.clone();
    let mut reporter = Reporter {
        tx: handler.tx.clone(),
        consumer_gone: handler.consumer_gone,
        reported: handler.reported,
    };
    // Close the upstream connection before publishing.
    drop(easy);

    match (outcome.0, result) {
        (Some(HeadOutcome::Accepted(body)), Ok(())) => {
            let received = outcome.1;
            if received != body.len() {
                warn!("Transfer of {} incomplete: expected {} bytes, received {}", &url, body.len(), received);
                drop(sink);
                reporter.send(FetchEvent::Failed(FetchError::Incomplete { expected: body.len(), received }));
                return;
            }
            if let Some(sink) = sink {
                if let Err(e) = sink.publish() {
                    error!("Unable to publish cache entry for {}: {:?}", &url, e);
                }
            }
            debug!("Sent {} bytes from {}", received, &url);
            reporter.send(FetchEvent::Done);
        }
        (Some(HeadOutcome::Accepted(_)), Err(e)) => {
            drop(sink);
            if reporter.consumer_gone {
                debug!("Transfer of {} ended after the client went away: {:?}", &url, e);
            } else {
                if e.code() == CURLE_OPERATION_TIMEDOUT {
                    warn!("Unable to download {}: Timeout reached.", &url);
                } else {
                    warn!("An error occurred while downloading {}: {:?}", &url, e);
                }
                reporter.send(FetchEvent::Failed(FetchError::Curl(e)));
            }
        }
        (Some(_), _) => {
            // Rejected: the status has already been reported.
        }
        (None, Err(e)) => {
            warn!("Unable to fetch {}: {:?}", &url, e);
            reporter.send(FetchEvent::Failed(FetchError::Curl(e)));
        }
        (None, Ok(())) => {
            reporter.send(FetchEvent::Failed(FetchError::InvalidResponse("no response header".to_owned())));
        }
    }
}

/// Sends the final event of a transfer, unless the client is gone or a failure was already reported.
struct Reporter {
    tx: Sender<FetchEvent>,
    consumer_gone: bool,
    reported: bool,
}

impl Reporter {
    fn send(&mut self, event: FetchEvent) {
        if !self.consumer_gone && !self.reported {
            self.reported = true;
            let _ = self.tx.send(event);
        }
    }
}

/// Starts fetching `order` on a separate thread and waits until the upstream response header has arrived.
///
/// The transfer runs to completion even if the returned stream is dropped early, so that the cache entry is
/// complete. If the transfer fails, the temporary file is removed and the stream ends with an error.
pub fn fetch_and_cache(
    order: FetchOrder,
    settings: &UpstreamSettings,
    in_flight: &InFlight,
) -> Result<FetchStart, FetchError> {
    let (tx, rx) = bounded::<FetchEvent>(CHANNEL_CAPACITY);
    debug!("Fetch {} from remote mirror, range: {:?}", &order.url, &order.range);
    let mut easy = Easy2::new(TeeHandler::new(order, in_flight.clone(), tx));
    configure(&mut easy, settings)?;
    thread::Builder::new()
        .name("mirror-fetch".to_owned())
        .spawn(move || run_transfer(easy))?;

    match rx.recv() {
        Ok(FetchEvent::Head(HeadOutcome::Accepted(body))) => {
            Ok(FetchStart::Streaming { body, stream: FetchStream { rx: Some(rx) } })
        }
        Ok(FetchEvent::Head(HeadOutcome::Rejected { code, reason })) => Ok(FetchStart::Rejected { code, reason }),
        Ok(FetchEvent::Failed(e)) => Err(e),
        Ok(_) => Err(FetchError::InvalidResponse("body received before header".to_owned())),
        Err(_) => Err(FetchError::Disconnected),
    }
}

/// The client-facing half of a fetch: yields the chunks received from upstream, in order.
#[derive(Debug)]
pub struct FetchStream {
    rx: Option<Receiver<FetchEvent>>,
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchEvent::Head(outcome) => write!(f, "Head({:?})", outcome),
            FetchEvent::Chunk(data) => write!(f, "Chunk({} bytes)", data.len()),
            FetchEvent::Failed(e) => write!(f, "Failed({:?})", e),
            FetchEvent::Done => write!(f, "Done"),
        }
    }
}

impl Iterator for FetchStream {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.rx.as_ref()?.recv();
        match event {
            Ok(FetchEvent::Chunk(data)) => Some(Ok(data)),
            Ok(FetchEvent::Done) => {
                self.rx = None;
                None
            }
            Ok(FetchEvent::Failed(e)) => {
                self.rx = None;
                Some(Err(e.into()))
            }
            Ok(FetchEvent::Head(_)) => {
                self.rx = None;
                Some(Err(FetchError::InvalidResponse("duplicate response header".to_owned()).into()))
            }
            Err(_) => {
                self.rx = None;
                Some(Err(FetchError::Disconnected.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeEnd, RangeSpec};

    fn parse_head(raw: &str) -> Result<HeadOutcome, FetchError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut response = httparse::Response::new(&mut headers);
        response.parse(raw.as_bytes()).unwrap();
        interpret_head(response.code.unwrap(), response.reason.unwrap(), response.headers)
    }

    fn order(range: RequestedRange) -> FetchOrder {
        FetchOrder {
            url: "http://upstream/pkgs/foo.rpm".to_owned(),
            range,
            full_path: PathBuf::from("/c/pkgs/foo.rpm"),
            range_path: Some(PathBuf::from("/c/pkgs/foo(100-199).rpm")),
        }
    }

    #[test]
    fn test_full_response() {
        let outcome = parse_head("HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n").unwrap();
        assert_eq!(outcome, HeadOutcome::Accepted(FetchedBody::Full { size: 5000 }));
    }

    #[test]
    fn test_content_range_is_authoritative() {
        let outcome = parse_head(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 100-199/5000\r\nContent-Length: 100\r\n\r\n"
        ).unwrap();
        let content_range = ContentRange { start: 100, end: 199, complete_size: 5000 };
        assert_eq!(outcome, HeadOutcome::Accepted(FetchedBody::Partial(content_range)));
    }

    #[test]
    fn test_error_status_is_passed_through() {
        let outcome = parse_head("HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\n").unwrap();
        assert_eq!(outcome, HeadOutcome::Rejected { code: 404, reason: "Not Found".to_owned() });
    }

    #[test]
    fn test_redirect_is_followed() {
        let outcome = parse_head("HTTP/1.1 302 Found\r\nLocation: http://elsewhere/\r\n\r\n").unwrap();
        assert_eq!(outcome, HeadOutcome::Redirect);
    }

    #[test]
    fn test_missing_length_is_invalid() {
        assert!(parse_head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").is_err());
        assert!(parse_head("HTTP/1.1 206 Partial Content\r\nContent-Length: 3\r\n\r\n").is_err());
        assert!(parse_head(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-9/20\r\nContent-Length: 3\r\n\r\n"
        ).is_err());
    }

    #[test]
    fn test_target_of_full_body_is_full_path_even_for_range_requests() {
        let requested = RequestedRange::Partial(RangeSpec::new(100, RangeEnd::Inclusive(199)));
        let target = order(requested).target(&FetchedBody::Full { size: 5000 });
        assert_eq!(target, Some((PathBuf::from("/c/pkgs/foo.rpm"), None)));
    }

    #[test]
    fn test_target_of_partial_body_is_range_path() {
        let requested = RequestedRange::Partial(RangeSpec::new(100, RangeEnd::Inclusive(199)));
        let body = FetchedBody::Partial(ContentRange { start: 100, end: 199, complete_size: 5000 });
        let target = order(requested).target(&body);
        assert_eq!(target, Some((PathBuf::from("/c/pkgs/foo(100-199).rpm"), Some(5000))));
    }

    #[test]
    fn test_partial_body_covering_everything_is_a_full_file() {
        let requested = RequestedRange::Partial(RangeSpec::new(0, RangeEnd::ToEnd));
        let body = FetchedBody::Partial(ContentRange { start: 0, end: 4999, complete_size: 5000 });
        assert_eq!(order(requested).target(&body), Some((PathBuf::from("/c/pkgs/foo.rpm"), None)));
    }

    #[test]
    fn test_partial_body_at_unexpected_offset_is_not_cached() {
        let requested = RequestedRange::Partial(RangeSpec::new(100, RangeEnd::Inclusive(199)));
        let body = FetchedBody::Partial(ContentRange { start: 0, end: 199, complete_size: 5000 });
        assert_eq!(order(requested).target(&body), None);
    }
}
