//! Payload redaction and size capping for stored diagnostics.

use serde_json::{Map, Value};

/// Field names redacted by default. Matching is case-insensitive.
pub const DEFAULT_REDACT_KEYS: &[&str] = &[
    "access_token",
    "refresh_token",
    "api_key",
    "authorization",
    "client_secret",
    "password",
    "secret",
    "token",
];

pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
    max_bytes: usize,
}

impl Redactor {
    pub fn new<I, S>(keys: I, max_bytes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.as_ref().trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            max_bytes,
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.keys.iter().any(|k| *k == key)
    }

    /// Replace the value of every denylisted key, at any depth.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, inner) in map {
                    let replaced = if self.is_sensitive(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.redact(inner)
                    };
                    out.insert(key.clone(), replaced);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    /// Collapse a payload whose JSON form exceeds the byte cap into a
    /// truncated string preview.
    pub fn cap(&self, value: Value) -> Value {
        let rendered = value.to_string();
        if rendered.len() <= self.max_bytes {
            return value;
        }
        let cut = floor_char_boundary(&rendered, self.max_bytes);
        Value::String(format!(
            "{}...[truncated {} bytes]",
            &rendered[..cut],
            rendered.len() - cut
        ))
    }

    pub fn sanitize(&self, value: &Value) -> Value {
        self.cap(self.redact(value))
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_REDACT_KEYS.iter().copied(), 16 * 1024)
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
