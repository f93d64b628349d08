pub mod check_result;
pub mod config;
pub mod reason;

pub use check_result::CheckResult;
pub use config::{
    ALL_MODELS_SENTINEL, CompiledConfig, CompiledProvider, ConfigError, ConfigReport, DebugMode,
    ErrorParsingConfig, ErrorParsingRule, ErrorParsingRuleConfig, GatewayConfig, GatewayPolicy,
    HttpClientConfig, ProviderConfig, ProviderKind, RetryPolicy, RootConfig, StreamingMode,
    WorkerConfig, WorkerHealthPolicy, load_config,
};
pub use reason::ErrorReason;
