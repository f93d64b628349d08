use std::time::{Duration, Instant};

use bytes::Bytes;
use llmgate_classify::{classify, classify_success_override};
use llmgate_common::{CheckResult, DebugMode, ErrorParsingRule, HttpClientConfig, ProviderKind, StreamingMode};
use serde_json::{Value, json};
use tokio_stream::StreamExt as TokioStreamExt;

use crate::headers::{Headers, header_get, header_set, strip_hop_by_hop};
use crate::http::{ByteStream, HttpRequest, ProviderError, UpstreamBody, UpstreamResponse};

/// The two gateway actions a request can target (spec.md §2/§6 routes).
/// `ChatCompletions` carries its own `stream` flag in the request body;
/// Gemini splits streaming into a distinct action because it is a distinct
/// upstream path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ChatCompletions,
    GenerateContent,
    StreamGenerateContent,
}

/// `build_probe_request(key, model) -> HttpRequest`: a minimal, cheap request
/// that exercises authentication AND model access (spec.md §4.1).
pub fn build_probe_request(kind: ProviderKind, base_url: &str, key: &str, model: &str) -> HttpRequest {
    let base_url = base_url.trim_end_matches('/');
    match kind {
        ProviderKind::OpenaiLike => {
            let body = json!({
                "model": model,
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
                "stream": false,
            });
            let mut headers = Headers::new();
            header_set(&mut headers, "authorization", format!("Bearer {key}"));
            header_set(&mut headers, "content-type", "application/json");
            HttpRequest {
                url: format!("{base_url}/chat/completions"),
                headers,
                body: Bytes::from(body.to_string()),
            }
        }
        ProviderKind::Gemini => {
            let body = json!({
                "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
                "generationConfig": {"maxOutputTokens": 1},
            });
            let mut headers = Headers::new();
            header_set(&mut headers, "content-type", "application/json");
            HttpRequest {
                url: format!("{base_url}/v1beta/models/{model}:generateContent?key={key}"),
                headers,
                body: Bytes::from(body.to_string()),
            }
        }
    }
}

/// `execute_request(key, model, inbound_request) -> HttpRequest`: rewrites
/// authorization, substitutes the model if requested, and forwards headers
/// sans hop-by-hop (spec.md §4.1).
pub fn build_forward_request(
    kind: ProviderKind,
    action: Action,
    base_url: &str,
    key: &str,
    model: &str,
    inbound_headers: &Headers,
    inbound_body: &Bytes,
) -> HttpRequest {
    let base_url = base_url.trim_end_matches('/');
    let mut headers = strip_hop_by_hop(inbound_headers);
    header_set(&mut headers, "content-type", "application/json");

    match kind {
        ProviderKind::OpenaiLike => {
            header_set(&mut headers, "authorization", format!("Bearer {key}"));
            let body = substitute_model(inbound_body, model);
            HttpRequest {
                url: format!("{base_url}/chat/completions"),
                headers,
                body,
            }
        }
        ProviderKind::Gemini => {
            let action_segment = match action {
                Action::StreamGenerateContent => "streamGenerateContent",
                _ => "generateContent",
            };
            HttpRequest {
                url: format!("{base_url}/v1beta/models/{model}:{action_segment}?key={key}"),
                headers,
                body: inbound_body.clone(),
            }
        }
    }
}

fn substitute_model(body: &Bytes, model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    if let Value::Object(map) = &mut value {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
    Bytes::from(value.to_string())
}

/// Whether the client asked for a streamed response, independent of our own
/// passthrough-vs-buffer policy.
pub fn client_requested_stream(kind: ProviderKind, action: Action, body: &Bytes) -> bool {
    match kind {
        ProviderKind::Gemini => action == Action::StreamGenerateContent,
        ProviderKind::OpenaiLike => serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("stream").and_then(Value::as_bool))
            .unwrap_or(false),
    }
}

/// Streaming is passthrough only when the client asked for it, the gateway
/// policy allows it, and debug mode is off — otherwise the adapter fully
/// buffers response bytes (spec.md §4.1).
pub fn should_passthrough_stream(
    streaming_mode: StreamingMode,
    debug_mode: DebugMode,
    client_requested_stream: bool,
) -> bool {
    client_requested_stream && streaming_mode == StreamingMode::Auto && debug_mode == DebugMode::Disabled
}

/// `extract_error(status, body_bytes) -> (raw_payload, extracted_fields)`:
/// parses JSON if `Content-Type` indicates JSON or the body starts with `{`;
/// otherwise returns a synthetic `{raw: text}` (spec.md §4.1).
pub fn parse_error_body(content_type: Option<&str>, body: &[u8]) -> Value {
    let looks_json =
        content_type.is_some_and(|c| c.contains("json")) || body.first() == Some(&b'{');
    if looks_json
        && let Ok(value) = serde_json::from_slice::<Value>(body)
    {
        return value;
    }
    json!({ "raw": String::from_utf8_lossy(body) })
}

/// Hard cap on buffered error-response bytes before classification
/// (spec.md §4.2).
pub const ERROR_BODY_CAP: usize = 256 * 1024;

/// Issues an already-built request and returns the raw response with status
/// and headers available but the body not yet consumed — the split lets the
/// Conductor decide whether to stream or buffer only after it knows whether
/// the response is a success, without double-reading the body. Bounded by
/// `total_timeout`, the spec.md §5 total request timeout that streamed
/// responses are exempt from once the body starts arriving.
pub async fn send_raw(
    client: &reqwest::Client,
    req: &HttpRequest,
    total_timeout: Duration,
) -> Result<reqwest::Response, ProviderError> {
    let mut builder = client.post(&req.url).body(req.body.clone());
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    match tokio::time::timeout(total_timeout, builder.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) if err.is_timeout() => Err(ProviderError::Timeout),
        Ok(Err(err)) => Err(ProviderError::Transport(err.to_string())),
        Err(_) => Err(ProviderError::Timeout),
    }
}

/// Consumes a raw response into an [`UpstreamResponse`], buffered or
/// streamed per `passthrough_stream`. Error bodies are capped at
/// [`ERROR_BODY_CAP`] before classification (spec.md §4.2). A buffered body
/// is bounded by `total_timeout`; a streamed body has no total bound but
/// each chunk must arrive within `idle_timeout` of the previous one
/// (spec.md §5).
pub async fn materialize(
    response: reqwest::Response,
    passthrough_stream: bool,
    total_timeout: Duration,
    idle_timeout: Duration,
) -> Result<UpstreamResponse, ProviderError> {
    let status = response.status().as_u16();
    let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let body = if passthrough_stream {
        let stream: ByteStream = Box::pin(futures_util::StreamExt::map(
            TokioStreamExt::timeout(response.bytes_stream(), idle_timeout),
            |item| match item {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(err)) => Err(std::io::Error::other(err.to_string())),
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "stream idle timeout elapsed")),
            },
        ));
        UpstreamBody::Stream(stream)
    } else {
        let mut bytes = tokio::time::timeout(total_timeout, response.bytes())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) && bytes.len() > ERROR_BODY_CAP {
            bytes = bytes.slice(0..ERROR_BODY_CAP);
        }
        UpstreamBody::Buffered(bytes)
    };

    Ok(UpstreamResponse { status, headers, body })
}

/// Issues an already-built request and returns the response, buffered or
/// streamed per `passthrough_stream`. Convenience wrapper over
/// [`send_raw`]/[`materialize`] for callers that don't need to inspect the
/// status before deciding how to consume the body (e.g. probes).
pub async fn send(
    client: &reqwest::Client,
    req: &HttpRequest,
    passthrough_stream: bool,
    cfg: &HttpClientConfig,
) -> Result<UpstreamResponse, ProviderError> {
    let total_timeout = Duration::from_secs(cfg.total_timeout_sec);
    let idle_timeout = Duration::from_secs(cfg.stream_idle_timeout_sec);
    let response = send_raw(client, req, total_timeout).await?;
    materialize(response, passthrough_stream, total_timeout, idle_timeout).await
}

/// Builds, sends, and classifies a probe request in one step — the unit of
/// work the Probe Engine (C5) repeats per key.
pub async fn probe(
    client: &reqwest::Client,
    kind: ProviderKind,
    base_url: &str,
    key: &str,
    model: &str,
    rules: &[ErrorParsingRule],
    cfg: &HttpClientConfig,
) -> CheckResult {
    let req = build_probe_request(kind, base_url, key, model);
    let started = Instant::now();

    let response = match send(client, &req, false, cfg).await {
        Ok(response) => response,
        Err(ProviderError::Timeout) => {
            return CheckResult::failure(None, llmgate_common::ErrorReason::Timeout, elapsed_ms(started));
        }
        Err(_) => {
            return CheckResult::failure(None, llmgate_common::ErrorReason::NetworkError, elapsed_ms(started));
        }
    };

    let latency_ms = elapsed_ms(started);
    let UpstreamBody::Buffered(body) = &response.body else {
        unreachable!("probe always sends with passthrough_stream = false");
    };

    if (200..300).contains(&response.status) {
        if rules.iter().any(|r| r.status_code == response.status) {
            let content_type = header_get(&response.headers, "content-type");
            let parsed = parse_error_body(content_type, body);
            if let Some(reason) = classify_success_override(response.status, Some(&parsed), rules) {
                return CheckResult::failure(Some(response.status), reason, latency_ms);
            }
        }
        return CheckResult::success(response.status, latency_ms);
    }

    let content_type = header_get(&response.headers, "content-type");
    let parsed = parse_error_body(content_type, body);
    let reason = classify(response.status, Some(&parsed), rules);
    CheckResult::failure(Some(response.status), reason, latency_ms)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_request_matches_openai_shape() {
        let req = build_probe_request(ProviderKind::OpenaiLike, "https://api.example.com/", "sk-1", "gpt-4");
        assert_eq!(req.url, "https://api.example.com/chat/completions");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0]["content"], "ping");
        assert_eq!(body["max_tokens"], 1);
        assert_eq!(body["stream"], false);
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-1"));
    }

    #[test]
    fn probe_request_matches_gemini_shape() {
        let req = build_probe_request(ProviderKind::Gemini, "https://generativelanguage.googleapis.com", "k1", "gemini-pro");
        assert_eq!(
            req.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=k1"
        );
    }

    #[test]
    fn forward_request_substitutes_model_and_authorization() {
        let inbound = Bytes::from(r#"{"model":"old","messages":[],"stream":true}"#);
        let headers: Headers = vec![
            ("Authorization".to_string(), "Bearer stale".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ];
        let req = build_forward_request(
            ProviderKind::OpenaiLike,
            Action::ChatCompletions,
            "https://api.example.com",
            "sk-fresh",
            "gpt-4o",
            &headers,
            &inbound,
        );
        assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-fresh"));
        assert!(header_get(&req.headers, "connection").is_none());
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn gemini_forward_picks_stream_action_from_url() {
        let req = build_forward_request(
            ProviderKind::Gemini,
            Action::StreamGenerateContent,
            "https://generativelanguage.googleapis.com",
            "k1",
            "gemini-pro",
            &Headers::new(),
            &Bytes::from("{}"),
        );
        assert!(req.url.contains(":streamGenerateContent"));
    }

    #[test]
    fn extract_error_parses_json_without_content_type() {
        let value = parse_error_body(None, br#"{"error":{"type":"invalid_request"}}"#);
        assert_eq!(value["error"]["type"], "invalid_request");
    }

    #[test]
    fn extract_error_falls_back_to_raw_for_non_json() {
        let value = parse_error_body(Some("text/plain"), b"upstream exploded");
        assert_eq!(value["raw"], "upstream exploded");
    }

    #[test]
    fn passthrough_requires_auto_and_disabled_debug() {
        assert!(should_passthrough_stream(StreamingMode::Auto, DebugMode::Disabled, true));
        assert!(!should_passthrough_stream(StreamingMode::Off, DebugMode::Disabled, true));
        assert!(!should_passthrough_stream(StreamingMode::Auto, DebugMode::FullBody, true));
        assert!(!should_passthrough_stream(StreamingMode::Auto, DebugMode::Disabled, false));
    }

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Sends one chunk of a chunked-transfer response, then stalls forever
    /// without closing the connection — simulates a stream that goes idle
    /// mid-response (spec.md §5's idle-byte timeout).
    async fn stalling_chunked_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn passthrough_stream_errors_after_idle_gap_without_capping_total_duration() {
        let base_url = stalling_chunked_server().await;
        let client = reqwest::Client::new();
        let req = HttpRequest { url: format!("{base_url}/x"), headers: Headers::new(), body: Bytes::new() };

        // total_timeout is intentionally shorter than the test would take if
        // it applied to the stream — proving a streamed body is exempt from it.
        let total_timeout = Duration::from_millis(50);
        let idle_timeout = Duration::from_millis(200);
        let raw = send_raw(&client, &req, Duration::from_secs(5)).await.unwrap();
        let response = materialize(raw, true, total_timeout, idle_timeout).await.unwrap();
        let UpstreamBody::Stream(mut stream) = response.body else { panic!("expected a stream body") };

        let first = TokioStreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello");

        let second = tokio::time::timeout(Duration::from_secs(2), TokioStreamExt::next(&mut stream))
            .await
            .expect("idle timeout should have fired well before the outer 2s bound")
            .unwrap();
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn send_raw_times_out_when_headers_never_arrive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let client = reqwest::Client::new();
        let req = HttpRequest { url: format!("http://{addr}/x"), headers: Headers::new(), body: Bytes::new() };
        let err = send_raw(&client, &req, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }
}
