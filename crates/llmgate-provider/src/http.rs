use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::headers::Headers;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Buffered(b) => f.debug_tuple("Buffered").field(&b.len()).finish(),
            UpstreamBody::Stream(_) => f.write_str("Stream(<opaque>)"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid proxy url: {0}")]
    InvalidProxy(String),
}
