use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use llmgate_common::HttpClientConfig;

use crate::http::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, reqwest::Client>>> = OnceLock::new();

/// Returns a shared, pooled `reqwest::Client` for the given outbound proxy,
/// building and caching one on first use. Keeping a client per proxy (rather
/// than per request) is what gives us connection reuse across probes and
/// proxied requests.
pub fn client_for(cfg: &HttpClientConfig, proxy: Option<&str>) -> Result<reqwest::Client, ProviderError> {
    let key = ClientKey {
        proxy: normalize_proxy(proxy),
    };
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().expect("client cache lock poisoned");
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }
    let client = build_client(cfg, key.proxy.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

/// No client-level `.timeout()`: spec.md §5 gives streamed responses no
/// total timeout (only a per-chunk idle timeout), so the total timeout is
/// applied per-call in the Adapter instead, where streaming-vs-buffered is
/// known.
fn build_client(cfg: &HttpClientConfig, proxy: Option<&str>) -> Result<reqwest::Client, ProviderError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_sec))
        .pool_idle_timeout(Duration::from_secs(cfg.idle_timeout_sec))
        .pool_max_idle_per_host(cfg.per_host_connections);
    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|err| ProviderError::InvalidProxy(err.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|err| ProviderError::Transport(err.to_string()))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}
