use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password",
        "passphrase",
        "private_key",
        "privatekey",
        "secret",
        "token",
        "authorization",
    ]
    .into_iter()
    .collect()
});

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    if normalized.is_empty() {
        return false;
    }
    SENSITIVE_KEYS.contains(normalized.as_str())
        || normalized.contains("secret")
        || normalized.contains("password")
}

fn looks_like_key_material(text: &str) -> bool {
    text.contains("-----BEGIN") && text.contains("PRIVATE KEY-----")
}

/// Copy of `value` with credential-bearing fields replaced, safe to log.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(text) if looks_like_key_material(text) => {
            Value::String(REDACTED.to_string())
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, entry)| {
                    let entry = if is_sensitive_key(key) && !entry.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(entry)
                    };
                    (key.clone(), entry)
                })
                .collect(),
        ),
        _ => value.clone(),
    }
}
