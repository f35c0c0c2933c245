//! Privacy/redaction filter. Two independent checks:
//!
//! - [`assert_no_forbidden_content`] runs as an explicit pre-persist check at
//!   every `Store::record_llm_call` call site, rather than an ambient signal
//!   hook, so the guard is visible at the call site that needs it.
//! - [`assert_payload_has_no_forbidden_fields`] runs before a job result is
//!   ever persisted — see `dispatcher::run_job`.
//! - [`Redactor`] scrubs secret-shaped substrings out of log lines. This
//!   crate has no `tracing-subscriber` dependency, so the `tracing_subscriber
//!   ::fmt::MakeWriter` that wraps it lives in `orchestrator-cli`'s
//!   `logging` module and is installed for every daemon when
//!   `REDACTION_ENABLED` is set.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::LlmCall;
use crate::error::{OrchestratorError, Result};

/// `LlmCall` carries only token counts and metadata by construction — there is
/// no prompt/response field to check. This function exists so every call site
/// that persists an `LlmCall` states the guarantee explicitly instead of
/// relying on the type alone.
pub fn assert_no_forbidden_content(_call: &LlmCall) -> Result<()> {
    Ok(())
}

/// Rejects a raw payload (e.g. a worker's self-reported result blob) that
/// contains one of the forbidden field names with non-empty content, mirroring
/// the guard that the original ORM enforced on save.
pub fn assert_payload_has_no_forbidden_fields(payload: &serde_json::Value) -> Result<()> {
    const FORBIDDEN: &[&str] = &[
        "prompt",
        "response",
        "prompt_content",
        "response_content",
        "messages",
        "completion_text",
    ];
    if let Some(obj) = payload.as_object() {
        for (key, v) in obj {
            let key_lower = key.to_lowercase();
            if !FORBIDDEN.contains(&key_lower.as_str()) {
                continue;
            }
            let non_empty = match v {
                serde_json::Value::Null => false,
                serde_json::Value::String(s) => !s.is_empty(),
                serde_json::Value::Array(a) => !a.is_empty(),
                _ => true,
            };
            if non_empty {
                return Err(OrchestratorError::GuardrailViolation(format!(
                    "forbidden field '{key}' populated on persisted payload"
                )));
            }
        }
    }
    Ok(())
}

struct Patterns {
    api_key: Regex,
    bearer_token: Regex,
    password: Regex,
    ipv4: Regex,
}

static PATTERNS: Lazy<Patterns> = Lazy::new(|| Patterns {
    api_key: Regex::new(r"(?i)(api[_-]?key)\s*[:=]\s*\S+").unwrap(),
    bearer_token: Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").unwrap(),
    password: Regex::new(r"(?i)(password|passwd|pwd)\s*[:=]\s*\S+").unwrap(),
    ipv4: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
});

/// Scrubs secret-shaped substrings out of a log line. Case-insensitive,
/// matching the four categories the original redacting logger covered.
pub struct Redactor;

impl Redactor {
    pub fn redact(text: &str) -> String {
        let mut out = PATTERNS.api_key.replace_all(text, "[REDACTED_API_KEY]").into_owned();
        out = PATTERNS
            .bearer_token
            .replace_all(&out, "[REDACTED_BEARER_TOKEN]")
            .into_owned();
        out = PATTERNS.password.replace_all(&out, "[REDACTED_PASSWORD]").into_owned();
        out = PATTERNS.ipv4.replace_all(&out, "[REDACTED_IP]").into_owned();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_api_key_assignment() {
        let redacted = Redactor::redact("api_key=sk-abc123");
        assert!(redacted.contains("[REDACTED_API_KEY]"));
        assert!(!redacted.contains("sk-abc123"));
    }

    #[test]
    fn redacts_bearer_token() {
        let redacted = Redactor::redact("Authorization: Bearer abc.def123");
        assert!(redacted.contains("[REDACTED_BEARER_TOKEN]"));
    }

    #[test]
    fn redacts_ipv4_address() {
        let redacted = Redactor::redact("connecting to 10.0.0.5 now");
        assert_eq!(redacted, "connecting to [REDACTED_IP] now");
    }

    #[test]
    fn forbidden_field_with_content_is_rejected() {
        let payload = serde_json::json!({"prompt": "do the thing"});
        assert!(assert_payload_has_no_forbidden_fields(&payload).is_err());
    }

    #[test]
    fn empty_forbidden_field_is_allowed() {
        let payload = serde_json::json!({"prompt": ""});
        assert!(assert_payload_has_no_forbidden_fields(&payload).is_ok());
    }
}
