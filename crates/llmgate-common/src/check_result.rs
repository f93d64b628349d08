use crate::reason::ErrorReason;

/// The output of every probe attempt and every proxied request (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub reason: Option<ErrorReason>,
    pub latency_ms: u64,
}

impl CheckResult {
    pub fn success(status_code: u16, latency_ms: u64) -> Self {
        Self {
            ok: true,
            status_code: Some(status_code),
            reason: None,
            latency_ms,
        }
    }

    pub fn failure(status_code: Option<u16>, reason: ErrorReason, latency_ms: u64) -> Self {
        Self {
            ok: false,
            status_code,
            reason: Some(reason),
            latency_ms,
        }
    }
}
