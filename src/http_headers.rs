use std::time::SystemTime;

use http::header::HeaderName;
use http::StatusCode;

use crate::engine::{CacheResponse, PayloadOrigin};

pub fn response_header(response: &CacheResponse, keep_alive: bool) -> String {
    reply_header(
        response.status,
        response.reason_phrase(),
        &response.headers,
        response.origin,
        keep_alive,
        SystemTime::now(),
    )
}

/// Header of a reply without payload, for requests that never reached the cache.
pub fn error_header(status: StatusCode) -> String {
    let content_length = (http::header::CONTENT_LENGTH, "0".to_owned());
    reply_header(
        status,
        status.canonical_reason().unwrap_or(""),
        &[content_length],
        PayloadOrigin::NoPayload,
        false,
        SystemTime::now(),
    )
}

fn reply_header(
    status: StatusCode,
    reason: &str,
    headers: &[(HeaderName, String)],
    payload_origin: PayloadOrigin,
    keep_alive: bool,
    now: SystemTime,
) -> String {
    let timestamp = httpdate::fmt_http_date(now);
    let mut header = format!("\
        HTTP/1.1 {} {}\r\n\
        Server: mirrorcache\r\n\
        Date: {}\r\n\
        Mirrorcache-Payload-Origin: {:?}\r\n",
                             status.as_u16(),
                             sanitize(reason),
                             timestamp,
                             payload_origin,
    );
    for (name, value) in headers {
        header.push_str(&format!("{}: {}\r\n", canonical_name(name), sanitize(value)));
    }
    if !keep_alive {
        header.push_str("Connection: close\r\n");
    }
    header.push_str("\r\n");
    debug!("Sending header to client: {:?}", &header);

    header
}

/// `http` keeps header names in lower case, `content-length` is sent as `Content-Length`.
fn canonical_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}

// A reason phrase forwarded from upstream must not be able to inject header lines.
fn sanitize(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

#[test]
fn test_reply_header() {
    let timestamp = httpdate::parse_http_date("Thu, 06 Apr 2023 20:00:18 GMT").unwrap();
    let headers = vec![
        (http::header::CONTENT_TYPE, "application/x-redhat-package-manager".to_owned()),
        (http::header::CONTENT_LENGTH, "100".to_owned()),
        (http::header::CONTENT_RANGE, "bytes 100-199/5000".to_owned()),
    ];
    let expected = "HTTP/1.1 206 Partial Content\r\n\
        Server: mirrorcache\r\n\
        Date: Thu, 06 Apr 2023 20:00:18 GMT\r\n\
        Mirrorcache-Payload-Origin: Cache\r\n\
        Content-Type: application/x-redhat-package-manager\r\n\
        Content-Length: 100\r\n\
        Content-Range: bytes 100-199/5000\r\n\r\n";
    let actual = reply_header(
        StatusCode::PARTIAL_CONTENT, "Partial Content", &headers, PayloadOrigin::Cache, true, timestamp
    );

    assert_eq!(expected, actual)
}

#[test]
fn test_forwarded_reason_cannot_inject_headers() {
    let timestamp = httpdate::parse_http_date("Thu, 06 Apr 2023 20:00:18 GMT").unwrap();
    let expected = "HTTP/1.1 404 Gone FishingX-Evil: 1\r\n\
        Server: mirrorcache\r\n\
        Date: Thu, 06 Apr 2023 20:00:18 GMT\r\n\
        Mirrorcache-Payload-Origin: NoPayload\r\n\
        Connection: close\r\n\r\n";
    let actual = reply_header(
        StatusCode::NOT_FOUND, "Gone Fishing\r\nX-Evil: 1", &[], PayloadOrigin::NoPayload, false, timestamp
    );

    assert_eq!(expected, actual)
}
