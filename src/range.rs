use std::fmt;

/// The last byte of a range: either a concrete (inclusive) index, or "until the end of the file".
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RangeEnd {
    Inclusive(u64),
    ToEnd,
}

/// A byte range as it appears in `Range: bytes=<start>-[<end>]`. Both ends are inclusive.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct RangeSpec {
    pub start: u64,
    pub end: RangeEnd,
}

impl RangeSpec {
    pub fn new(start: u64, end: RangeEnd) -> Self {
        Self { start, end }
    }

    pub fn content_start(&self) -> u64 {
        self.start
    }

    /// Index of the last byte to send, resolved against the size of the complete object. Ends beyond the
    /// object are clamped to its last byte.
    pub fn content_end(&self, total_size: u64) -> u64 {
        let last_byte = total_size.saturating_sub(1);
        match self.end {
            RangeEnd::Inclusive(end) => end.min(last_byte),
            RangeEnd::ToEnd => last_byte,
        }
    }

    pub fn content_length(&self, total_size: u64) -> u64 {
        if !self.is_satisfiable(total_size) {
            return 0;
        }
        self.content_end(total_size).checked_sub(self.start).map(|d| d + 1).unwrap_or(0)
    }

    pub fn is_satisfiable(&self, total_size: u64) -> bool {
        self.start < total_size
    }

    /// Parses `bytes=<start>-[<end>]`. Returns `None` for anything else, including multi-range and suffix
    /// (`bytes=-500`) requests, and ranges whose end lies before their start.
    pub fn parse(header_value: &str) -> Option<Self> {
        let value = header_value.trim();
        let (unit, spec) = value.split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return None;
        }
        let (start, end) = spec.trim().split_once('-')?;
        let start = parse_digits(start)?;
        let end = if end.trim().is_empty() {
            RangeEnd::ToEnd
        } else {
            let end = parse_digits(end)?;
            if end < start {
                return None;
            }
            RangeEnd::Inclusive(end)
        };
        Some(RangeSpec { start, end })
    }

    /// The value of the `Range` header sent to the upstream server for this range.
    pub fn to_request_header(&self) -> String {
        match self.end {
            RangeEnd::Inclusive(end) => format!("bytes={}-{}", self.start, end),
            RangeEnd::ToEnd => format!("bytes={}-", self.start),
        }
    }

    /// The `(start-end)` marker embedded into the file name of a range cache entry.
    pub fn file_name_marker(&self) -> String {
        match self.end {
            RangeEnd::Inclusive(end) => format!("({}-{})", self.start, end),
            RangeEnd::ToEnd => format!("({}-)", self.start),
        }
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok()
}

/// What the client asked for. A request without a `Range` header is `Full`, which is not the same as an
/// explicit `bytes=0-`: the former is answered with 200, the latter with 206.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RequestedRange {
    Full,
    Partial(RangeSpec),
}

impl RequestedRange {
    /// Lenient range policy: a missing `Range` header and a malformed one are both served as a request for
    /// the complete object. Malformed input is never rejected.
    pub fn from_header_lenient(header_value: Option<&str>) -> Self {
        match header_value {
            None => RequestedRange::Full,
            Some(value) => match RangeSpec::parse(value) {
                Some(range) => RequestedRange::Partial(range),
                None => {
                    debug!("Ignoring malformed range header {:?}, serving the complete file instead.", value);
                    RequestedRange::Full
                }
            },
        }
    }

    pub fn partial(&self) -> Option<&RangeSpec> {
        match self {
            RequestedRange::Full => None,
            RequestedRange::Partial(range) => Some(range),
        }
    }

    pub fn is_full(&self) -> bool {
        *self == RequestedRange::Full
    }
}

/// `Content-Range: bytes <start>-<end>/<size>` as sent by the upstream server. The values are authoritative:
/// they describe exactly which bytes the response body contains.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub complete_size: u64,
}

impl ContentRange {
    pub fn parse(header_value: &str) -> Option<Self> {
        let value = header_value.trim();
        let (unit, rest) = value.split_once(' ')?;
        if !unit.eq_ignore_ascii_case("bytes") {
            return None;
        }
        let (range, complete_size) = rest.trim().split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = parse_digits(start)?;
        let end = parse_digits(end)?;
        let complete_size = parse_digits(complete_size)?;
        if end < start || end >= complete_size {
            return None;
        }
        Some(ContentRange { start, end, complete_size })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range_spec(&self) -> RangeSpec {
        RangeSpec::new(self.start, RangeEnd::Inclusive(self.end))
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.complete_size)
    }
}
