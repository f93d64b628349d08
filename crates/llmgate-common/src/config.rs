use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::reason::ErrorReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    #[default]
    Auto,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    #[default]
    Disabled,
    HeadersOnly,
    FullBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiLike,
    Gemini,
}

/// A single ordered rule in the error-classification pipeline (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorParsingRuleConfig {
    pub status_code: u16,
    /// Dot-separated path into the parsed JSON error body, e.g. "error.type".
    #[serde(default)]
    pub error_path: String,
    pub match_pattern: String,
    pub map_to: ErrorReason,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

/// A compiled rule, ready for use by `llmgate-classify`. Compilation happens
/// once at config load; a bad regex is a configuration error that blocks
/// startup rather than a runtime surprise.
#[derive(Debug, Clone)]
pub struct ErrorParsingRule {
    pub status_code: u16,
    pub error_path: Vec<String>,
    pub pattern: Regex,
    pub map_to: ErrorReason,
    pub priority: i32,
    pub declaration_order: usize,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorParsingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ErrorParsingRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayPolicy {
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default)]
    pub debug_mode: DebugMode,
    #[serde(default)]
    pub error_parsing: ErrorParsingConfig,
}

/// Penalty durations applied by the Probe Engine (C5) and, for the
/// shared-shape table, by Dispatch (C4) when it marks a key bad directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthPolicy {
    #[serde(default = "defaults::on_invalid_key_days")]
    pub on_invalid_key_days: u64,
    #[serde(default = "defaults::on_no_access_days")]
    pub on_no_access_days: u64,
    #[serde(default = "defaults::on_no_quota_hr")]
    pub on_no_quota_hr: u64,
    #[serde(default = "defaults::on_rate_limit_hr")]
    pub on_rate_limit_hr: u64,
    #[serde(default = "defaults::on_server_error_min")]
    pub on_server_error_min: u64,
    #[serde(default = "defaults::on_overload_min")]
    pub on_overload_min: u64,
    #[serde(default = "defaults::on_other_error_hr")]
    pub on_other_error_hr: u64,
}

impl Default for WorkerHealthPolicy {
    fn default() -> Self {
        Self {
            on_invalid_key_days: defaults::on_invalid_key_days(),
            on_no_access_days: defaults::on_no_access_days(),
            on_no_quota_hr: defaults::on_no_quota_hr(),
            on_rate_limit_hr: defaults::on_rate_limit_hr(),
            on_server_error_min: defaults::on_server_error_min(),
            on_overload_min: defaults::on_overload_min(),
            on_other_error_hr: defaults::on_other_error_hr(),
        }
    }
}

impl WorkerHealthPolicy {
    pub fn penalty_for(&self, reason: ErrorReason) -> std::time::Duration {
        use std::time::Duration;
        match reason {
            ErrorReason::InvalidKey => Duration::from_secs(self.on_invalid_key_days * 86_400),
            ErrorReason::NoAccess => Duration::from_secs(self.on_no_access_days * 86_400),
            ErrorReason::NoQuota => Duration::from_secs(self.on_no_quota_hr * 3_600),
            ErrorReason::RateLimited => Duration::from_secs(self.on_rate_limit_hr * 3_600),
            ErrorReason::ServerError | ErrorReason::Timeout => {
                Duration::from_secs(self.on_server_error_min * 60)
            }
            ErrorReason::Overloaded => Duration::from_secs(self.on_overload_min * 60),
            ErrorReason::ServiceUnavailable => Duration::from_secs(self.on_overload_min * 60),
            ErrorReason::NoModel => Duration::from_secs(self.on_no_access_days * 86_400),
            ErrorReason::BadRequest | ErrorReason::Unknown | ErrorReason::NetworkError => {
                Duration::from_secs(self.on_other_error_hr * 3_600)
            }
        }
    }
}

mod defaults {
    pub fn on_invalid_key_days() -> u64 {
        10
    }
    pub fn on_no_access_days() -> u64 {
        10
    }
    pub fn on_no_quota_hr() -> u64 {
        4
    }
    pub fn on_rate_limit_hr() -> u64 {
        1
    }
    pub fn on_server_error_min() -> u64 {
        30
    }
    pub fn on_overload_min() -> u64 {
        60
    }
    pub fn on_other_error_hr() -> u64 {
        1
    }
    pub fn verification_attempts() -> u32 {
        3
    }
    pub fn verification_delay_sec() -> u64 {
        65
    }
    pub fn interval_sec() -> u64 {
        300
    }
    pub fn concurrency() -> usize {
        8
    }
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn connect_timeout_sec() -> u64 {
        5
    }
    pub fn total_timeout_sec() -> u64 {
        60
    }
    pub fn idle_timeout_sec() -> u64 {
        60
    }
    pub fn stream_idle_timeout_sec() -> u64 {
        60
    }
    pub fn per_host_connections() -> usize {
        100
    }
    pub fn default_listen() -> String {
        "0.0.0.0:8080".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub shared_key_status: bool,
    #[serde(default)]
    pub gateway_policy: GatewayPolicy,
    #[serde(default)]
    pub worker_health_policy: WorkerHealthPolicy,
    /// Name of an outbound-proxy row (`proxies.name`) this provider's
    /// requests should be routed through (spec.md §4.1); `None` dials
    /// upstream directly. Resolved to a URL at request/probe time via
    /// `Repository::proxy_url`, since proxy rows live in the database
    /// alongside keys, not in the static YAML.
    #[serde(default)]
    pub proxy_name: Option<String>,
}

/// Sentinel model id used in place of a concrete model for providers whose
/// key validity is account-wide.
pub const ALL_MODELS_SENTINEL: &str = "__ALL_MODELS__";

impl ProviderConfig {
    pub fn resolve_model<'a>(&self, model: &'a str) -> std::borrow::Cow<'a, str> {
        if self.shared_key_status {
            std::borrow::Cow::Borrowed(ALL_MODELS_SENTINEL)
        } else {
            std::borrow::Cow::Borrowed(model)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "defaults::default_listen")]
    pub listen: String,
    pub auth_token: Option<String>,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
    #[serde(default)]
    pub debug_mode: DebugMode,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Deliberately parsed and never acted on — see spec.md §9 Open Question.
    #[serde(default)]
    pub circuit_breaker: Option<serde_yaml::Value>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: defaults::default_listen(),
            auth_token: None,
            streaming_mode: StreamingMode::default(),
            debug_mode: DebugMode::default(),
            retry_policy: RetryPolicy::default(),
            circuit_breaker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "defaults::interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    #[serde(default = "defaults::verification_attempts")]
    pub verification_attempts: u32,
    #[serde(default = "defaults::verification_delay_sec")]
    pub verification_delay_sec: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_sec: defaults::interval_sec(),
            concurrency: defaults::concurrency(),
            verification_attempts: defaults::verification_attempts(),
            verification_delay_sec: defaults::verification_delay_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "defaults::connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    #[serde(default = "defaults::total_timeout_sec")]
    pub total_timeout_sec: u64,
    #[serde(default = "defaults::idle_timeout_sec")]
    pub idle_timeout_sec: u64,
    /// Streamed (passthrough) responses have no total timeout, only a gap
    /// timeout between consecutive chunks (spec.md §5).
    #[serde(default = "defaults::stream_idle_timeout_sec")]
    pub stream_idle_timeout_sec: u64,
    #[serde(default = "defaults::per_host_connections")]
    pub per_host_connections: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: defaults::connect_timeout_sec(),
            total_timeout_sec: defaults::total_timeout_sec(),
            idle_timeout_sec: defaults::idle_timeout_sec(),
            stream_idle_timeout_sec: defaults::stream_idle_timeout_sec(),
            per_host_connections: defaults::per_host_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RootConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Default)]
pub struct ConfigReport {
    pub errors: Vec<ConfigError>,
}

impl ConfigReport {
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(ConfigError {
            message: message.into(),
        });
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ConfigReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            writeln!(f, "{}: {}", i + 1, err.message)?;
        }
        Ok(())
    }
}

/// Resolves `${VAR}` placeholders against the process environment.
/// An unresolved placeholder is reported, not substituted away silently.
pub fn interpolate_env(input: &str, report: &mut ConfigReport) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '$' && chars.peek().map(|(_, c)| *c) == Some('{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if !closed {
                report.push(format!("unterminated ${{{name}}} placeholder"));
                continue;
            }
            match std::env::var(&name) {
                Ok(value) => out.push_str(&value),
                Err(_) => report.push(format!("unresolved environment variable: {name}")),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug)]
pub struct CompiledConfig {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub http_client: HttpClientConfig,
    pub providers: HashMap<String, CompiledProvider>,
}

#[derive(Debug)]
pub struct CompiledProvider {
    pub config: ProviderConfig,
    pub rules: Vec<ErrorParsingRule>,
}

/// Parses, interpolates, and validates a YAML configuration document,
/// accumulating every error into one report rather than failing on the first.
pub fn load_config(yaml: &str) -> Result<CompiledConfig, ConfigReport> {
    let mut report = ConfigReport::default();
    let interpolated = interpolate_env(yaml, &mut report);
    if !report.is_ok() {
        return Err(report);
    }

    let parsed: RootConfig = match serde_yaml::from_str(&interpolated) {
        Ok(cfg) => cfg,
        Err(err) => {
            report.push(format!("invalid yaml: {err}"));
            return Err(report);
        }
    };

    let mut providers = HashMap::new();
    for (name, provider) in parsed.providers {
        if provider.models.is_empty() {
            report.push(format!("provider {name}: models list must not be empty"));
        }
        let mut rules = Vec::new();
        if provider.gateway_policy.error_parsing.enabled {
            for (idx, rule) in provider.gateway_policy.error_parsing.rules.iter().enumerate() {
                match Regex::new(&rule.match_pattern) {
                    Ok(pattern) => rules.push(ErrorParsingRule {
                        status_code: rule.status_code,
                        error_path: rule
                            .error_path
                            .split('.')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                        pattern,
                        map_to: rule.map_to,
                        priority: rule.priority,
                        declaration_order: idx,
                        description: rule.description.clone(),
                    }),
                    Err(err) => report.push(format!(
                        "provider {name}: rule {idx} has invalid regex '{}': {err}",
                        rule.match_pattern
                    )),
                }
            }
        }
        providers.insert(
            name.clone(),
            CompiledProvider {
                config: provider,
                rules,
            },
        );
    }

    if !report.is_ok() {
        return Err(report);
    }

    Ok(CompiledConfig {
        gateway: parsed.gateway,
        worker: parsed.worker,
        http_client: parsed.http_client,
        providers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_known_env_var() {
        unsafe {
            std::env::set_var("LLMGATE_TEST_VAR", "hunter2");
        }
        let mut report = ConfigReport::default();
        let out = interpolate_env("token: ${LLMGATE_TEST_VAR}", &mut report);
        assert!(report.is_ok());
        assert_eq!(out, "token: hunter2");
    }

    #[test]
    fn reports_unresolved_env_var() {
        let mut report = ConfigReport::default();
        interpolate_env("token: ${LLMGATE_DEFINITELY_MISSING}", &mut report);
        assert!(!report.is_ok());
    }

    #[test]
    fn bad_regex_is_accumulated_not_fatal_immediately() {
        let yaml = r#"
providers:
  a:
    name: a
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: error.type
            match_pattern: "("
            map_to: INVALID_KEY
            priority: 1
  b:
    name: b
    kind: gemini
    base_url: https://example.com
    models: []
"#;
        let err = load_config(yaml).unwrap_err();
        assert_eq!(err.errors.len(), 2);
    }
}
