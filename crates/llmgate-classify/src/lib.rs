//! The Error Classifier (C2): folds an upstream HTTP status plus an
//! optionally-parsed JSON error body into exactly one [`ErrorReason`].

use llmgate_common::{ErrorParsingRule, ErrorReason};
use serde_json::Value;

/// Why no HTTP status was ever produced for an upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Deadline,
    Other,
}

impl TransportFailure {
    pub fn classify(self) -> ErrorReason {
        match self {
            TransportFailure::Deadline => ErrorReason::Timeout,
            TransportFailure::Other => ErrorReason::NetworkError,
        }
    }
}

/// Classifies a completed upstream HTTP response (status + optionally-parsed
/// JSON body) against a provider's ordered rule set, falling back to the
/// default HTTP-code map from spec.md §6.
///
/// `rules` must already be filtered to rules whose `error_parsing.enabled`
/// was true at config load time — see `llmgate_common::config::load_config`.
pub fn classify(status: u16, body: Option<&Value>, rules: &[ErrorParsingRule]) -> ErrorReason {
    if let Some(reason) = match_rules(status, body, rules) {
        return reason;
    }
    ErrorReason::from_http_status(status).unwrap_or(ErrorReason::Unknown)
}

/// Checks a 2xx response against the provider's rules for an explicit
/// override (spec.md §4.2 step 1: "a probe that receives HTTP 200 with a
/// JSON error body is SUCCESS unless a rule with status_code=200 maps it
/// otherwise"). `None` means no rule fired and the response stays a
/// success; unlike [`classify`], this never falls back to the default
/// HTTP-code map, since that map treats every 2xx as "no reason".
pub fn classify_success_override(status: u16, body: Option<&Value>, rules: &[ErrorParsingRule]) -> Option<ErrorReason> {
    match_rules(status, body, rules)
}

fn match_rules(status: u16, body: Option<&Value>, rules: &[ErrorParsingRule]) -> Option<ErrorReason> {
    let mut candidates: Vec<&ErrorParsingRule> =
        rules.iter().filter(|r| r.status_code == status).collect();
    if candidates.is_empty() {
        return None;
    }
    // Descending priority; ties broken by declaration order (ascending).
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.declaration_order.cmp(&b.declaration_order))
    });

    for rule in candidates {
        let Some(value) = traverse(body, &rule.error_path) else {
            continue;
        };
        let text = value_to_text(value);
        if rule.pattern.is_match(&text) {
            return Some(rule.map_to);
        }
    }
    None
}

/// Dot-path traversal into a parsed JSON body. A missing segment, a
/// non-object encountered mid-path (including arrays), or a null root all
/// resolve to `None` rather than erroring — the rule is simply skipped.
fn traverse<'a>(body: Option<&'a Value>, path: &[String]) -> Option<&'a Value> {
    let mut current = body?;
    for segment in path {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmgate_common::config::load_config;
    use serde_json::json;

    fn rules_for(yaml: &str) -> Vec<ErrorParsingRule> {
        let cfg = load_config(yaml).unwrap_or_else(|e| panic!("{e}"));
        cfg.providers.into_values().next().unwrap().rules
    }

    #[test]
    fn qwen_arrearage_seed_scenario() {
        let rules = rules_for(
            r#"
providers:
  qwen:
    name: qwen
    kind: openai_like
    base_url: https://example.com
    models: [qwen-max]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.type"
            match_pattern: "Arrearage|BillingHardLimit"
            map_to: INVALID_KEY
            priority: 10
"#,
        );
        let body = json!({"error": {"type": "Arrearage"}});
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::InvalidKey);
    }

    #[test]
    fn openai_quota_seed_scenario() {
        let rules = rules_for(
            r#"
providers:
  openai:
    name: openai
    kind: openai_like
    base_url: https://example.com
    models: [gpt-4]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.code"
            match_pattern: "insufficient_quota"
            map_to: NO_QUOTA
            priority: 5
"#,
        );
        let body = json!({"error": {"code": "insufficient_quota"}});
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::NoQuota);
    }

    #[test]
    fn no_rule_match_falls_back_to_default_map() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
"#,
        );
        assert_eq!(classify(429, None, &rules), ErrorReason::RateLimited);
        assert_eq!(classify(401, None, &rules), ErrorReason::InvalidKey);
    }

    #[test]
    fn missing_path_segment_skips_rule_without_erroring() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.nested.missing"
            match_pattern: ".*"
            map_to: INVALID_KEY
            priority: 1
"#,
        );
        let body = json!({"error": {"type": "whatever"}});
        // Path doesn't exist -> rule skipped -> falls to default 400 map.
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::BadRequest);
    }

    #[test]
    fn path_through_array_is_treated_as_missing() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "errors.type"
            match_pattern: ".*"
            map_to: INVALID_KEY
            priority: 1
"#,
        );
        let body = json!({"errors": [{"type": "x"}]});
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::BadRequest);
    }

    #[test]
    fn priority_dominance_higher_wins_over_earlier_declaration() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.type"
            match_pattern: ".*"
            map_to: NO_QUOTA
            priority: 1
          - status_code: 400
            error_path: "error.type"
            match_pattern: ".*"
            map_to: INVALID_KEY
            priority: 10
"#,
        );
        let body = json!({"error": {"type": "anything"}});
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::InvalidKey);
    }

    #[test]
    fn ties_broken_by_declaration_order() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 400
            error_path: "error.type"
            match_pattern: "first"
            map_to: NO_QUOTA
            priority: 5
          - status_code: 400
            error_path: "error.type"
            match_pattern: "first"
            map_to: INVALID_KEY
            priority: 5
"#,
        );
        let body = json!({"error": {"type": "first"}});
        assert_eq!(classify(400, Some(&body), &rules), ErrorReason::NoQuota);
    }

    #[test]
    fn success_override_fires_on_200_rule_match() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 200
            error_path: "error.type"
            match_pattern: "Arrearage"
            map_to: INVALID_KEY
            priority: 1
"#,
        );
        let body = json!({"error": {"type": "Arrearage"}});
        assert_eq!(classify_success_override(200, Some(&body), &rules), Some(ErrorReason::InvalidKey));
    }

    #[test]
    fn success_override_is_none_when_no_rule_matches() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: openai_like
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 200
            error_path: "error.type"
            match_pattern: "Arrearage"
            map_to: INVALID_KEY
            priority: 1
"#,
        );
        let body = json!({"ok": true});
        assert_eq!(classify_success_override(200, Some(&body), &rules), None);
    }

    #[test]
    fn transport_failure_maps_deadline_vs_other() {
        assert_eq!(TransportFailure::Deadline.classify(), ErrorReason::Timeout);
        assert_eq!(TransportFailure::Other.classify(), ErrorReason::NetworkError);
    }

    #[test]
    fn determinism_same_input_same_output() {
        let rules = rules_for(
            r#"
providers:
  p:
    name: p
    kind: gemini
    base_url: https://example.com
    models: [m]
    gateway_policy:
      error_parsing:
        enabled: true
        rules:
          - status_code: 403
            error_path: "error.status"
            match_pattern: "PERMISSION_DENIED"
            map_to: NO_ACCESS
            priority: 1
"#,
        );
        let body = json!({"error": {"status": "PERMISSION_DENIED"}});
        let first = classify(403, Some(&body), &rules);
        for _ in 0..50 {
            assert_eq!(classify(403, Some(&body), &rules), first);
        }
    }
}
