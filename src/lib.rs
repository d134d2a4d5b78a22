#[macro_use] extern crate log;

pub mod cache_index;
pub mod cache_path;
pub mod cache_sink;
pub mod cached_reader;
pub mod client_request;
pub mod engine;
pub mod fs_utils;
pub mod http_headers;
pub mod mirror_config;
pub mod mirror_fetch;
pub mod range;
pub mod response;
pub mod server;

pub use crate::engine::{Body, CacheRequest, CacheResponse, HttpCache, Mirror, PayloadOrigin, ServeError};
pub use crate::mirror_fetch::{FetchError, UpstreamSettings};
pub use crate::range::{RangeEnd, RangeSpec, RequestedRange};
pub use crate::server::{Server, ServerHandle, ServerSettings};
