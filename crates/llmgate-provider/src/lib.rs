//! The Provider Adapter (C1): per-provider HTTP shape for building probe
//! requests, issuing proxied requests, and extracting errors from bodies.
//! Polymorphic over a fixed, closed capability set — `OpenAiLike` and
//! `Gemini` — rather than open-world dynamic dispatch (spec.md §4.1, §9).

pub mod adapter;
pub mod client;
pub mod headers;
pub mod http;

pub use adapter::{
    Action, ERROR_BODY_CAP, build_forward_request, build_probe_request, client_requested_stream, materialize,
    parse_error_body, probe, send, send_raw, should_passthrough_stream,
};
pub use client::client_for;
pub use headers::{Headers, header_get, header_set, is_hop_by_hop, strip_hop_by_hop};
pub use http::{ByteStream, HttpRequest, ProviderError, UpstreamBody, UpstreamResponse};
