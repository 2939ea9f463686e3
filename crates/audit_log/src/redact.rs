use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const SECRET_KEY_NAMES: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "access_key",
    "private_key",
];

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
                "[REDACTED PRIVATE KEY]",
            ),
            (
                r"(?i)\b(authorization\s*:\s*)(?:bearer\s+|basic\s+|token\s+)?[^\s'\x22]+",
                "${1}[REDACTED]",
            ),
            (r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/=-]{8,}", "${1}[REDACTED]"),
            (
                r#"(?i)\b(password|passwd|pwd|token|secret|api[_-]?key|access[_-]?key)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s&;]+)"#,
                "${1}${2}[REDACTED]",
            ),
            (r"\bsk-(?:ant-)?[A-Za-z0-9_-]{16,}", "[REDACTED]"),
            (r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED]"),
            (r"\bAIza[0-9A-Za-z_-]{35}\b", "[REDACTED]"),
            (r"\bgh[pousr]_[A-Za-z0-9]{36,}\b", "[REDACTED]"),
            (r"\bxox[baprs]-[A-Za-z0-9-]{10,}\b", "[REDACTED]"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|pattern| Rule {
                pattern,
                replacement,
            })
        })
        .collect()
    })
}

/// Masks credentials embedded in free text.
#[must_use]
pub fn redact_text(text: &str) -> String {
    let mut redacted = text.to_string();
    for rule in rules() {
        if rule.pattern.is_match(&redacted) {
            redacted = rule
                .pattern
                .replace_all(&redacted, rule.replacement)
                .into_owned();
        }
    }
    redacted
}

/// Masks credentials in every string of a JSON value. Values stored under
/// secret-looking keys are replaced outright.
#[must_use]
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_text(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if is_secret_key(key) && !value.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase().replace('-', "_");
    SECRET_KEY_NAMES.iter().any(|name| key == *name || key.ends_with(&format!("_{name}")))
}
