//! Redaction of sensitive values before records leave the process.

use crate::config::MaskingConfig;
use crate::constants::{DEFAULT_MASK_REPLACEMENT, SENSITIVE_KEYWORDS, TRUNCATION_MARKER};
use crate::patterns::wildcard_regex;
use regex::Regex;
use serde_json::{Map, Value};

const DEPTH_LIMIT_MARKER: &str = "[depth limit]";

#[derive(Debug, Clone)]
pub struct SensitiveDataMasker {
    enabled: bool,
    /// Lowercased names and dotted paths.
    fields: Vec<String>,
    wildcards: Vec<Regex>,
    replacement: String,
    exclude_headers: Vec<String>,
}

impl Default for SensitiveDataMasker {
    fn default() -> Self {
        Self::from_config(&MaskingConfig::default())
    }
}

impl SensitiveDataMasker {
    pub fn new<F, H>(fields: F, replacement: impl Into<String>, exclude_headers: H) -> Self
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        H: IntoIterator,
        H::Item: AsRef<str>,
    {
        let mut exact = Vec::new();
        let mut wildcards = Vec::new();
        for field in fields {
            let field = field.as_ref();
            if field.contains('*') {
                wildcards.extend(wildcard_regex(field, true));
            } else {
                exact.push(field.to_lowercase());
            }
        }

        Self {
            enabled: true,
            fields: exact,
            wildcards,
            replacement: replacement.into(),
            exclude_headers: exclude_headers.into_iter().map(|h| h.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &MaskingConfig) -> Self {
        let replacement = if config.replacement.is_empty() {
            DEFAULT_MASK_REPLACEMENT
        } else {
            config.replacement.as_str()
        };
        let mut masker = Self::new(&config.fields, replacement, &config.exclude_headers);
        masker.enabled = config.enabled;
        masker
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn should_mask(&self, key: &str, path: &str) -> bool {
        let key = key.to_lowercase();
        let path = path.to_lowercase();

        if self.fields.iter().any(|f| *f == key || *f == path) {
            return true;
        }
        if self.wildcards.iter().any(|re| re.is_match(&path)) {
            return true;
        }
        SENSITIVE_KEYWORDS.iter().any(|kw| key.contains(kw))
    }

    /// Masked copy of `data`; the input is left untouched.
    pub fn mask(&self, data: &Map<String, Value>) -> Map<String, Value> {
        if !self.enabled {
            return data.clone();
        }
        self.mask_map(data, "")
    }

    fn mask_map(&self, data: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
        let mut masked = Map::with_capacity(data.len());
        for (key, value) in data {
            let path = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };

            let value = if self.should_mask(key, &path) {
                Value::String(self.replacement.clone())
            } else {
                match value {
                    Value::Object(inner) => Value::Object(self.mask_map(inner, &path)),
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(inner) => Value::Object(self.mask_map(inner, &path)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                }
            };
            masked.insert(key.clone(), value);
        }
        masked
    }

    pub fn mask_value(&self, value: &Value) -> Value {
        if !self.enabled {
            return value.clone();
        }
        match value {
            Value::Object(map) => Value::Object(self.mask_map(map, "")),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Mask a JSON document. Text that does not parse comes back unchanged.
    pub fn mask_json(&self, text: &str) -> String {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => serde_json::to_string(&self.mask_value(&value)).unwrap_or_else(|_| text.to_string()),
            Err(_) => text.to_string(),
        }
    }

    pub fn mask_query_string(&self, query: &str) -> String {
        if !self.enabled || query.is_empty() {
            return query.to_string();
        }
        let mut out = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if self.should_mask(&key, &key) {
                out.append_pair(&key, &self.replacement);
            } else {
                out.append_pair(&key, &value);
            }
        }
        out.finish()
    }

    /// Header map with excluded headers replaced. Repeated headers are joined
    /// with ", ".
    pub fn filter_headers<I, K, V>(&self, headers: I) -> Map<String, Value>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filtered = Map::new();
        for (name, value) in headers {
            let name = name.as_ref().to_lowercase();
            if self.exclude_headers.contains(&name) {
                filtered.insert(name, Value::String(self.replacement.clone()));
                continue;
            }
            match filtered.get_mut(&name) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value.as_ref());
                }
                _ => {
                    filtered.insert(name, Value::String(value.as_ref().to_string()));
                }
            }
        }
        filtered
    }

    /// Cap `text` at `max` bytes, cutting on a char boundary.
    pub fn truncate(&self, text: &str, max: usize) -> String {
        truncate(text, max)
    }

    /// Bound a parameter structure to `max_items` entries per level and
    /// `max_depth` levels.
    pub fn normalize(&self, value: &Value, max_items: usize, max_depth: usize) -> Value {
        normalize_at(value, max_items, max_depth, 0)
    }
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

fn normalize_at(value: &Value, max_items: usize, max_depth: usize, depth: usize) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) if depth >= max_depth => Value::String(DEPTH_LIMIT_MARKER.to_string()),
        Value::Object(map) => Value::Object(
            map.iter()
                .take(max_items)
                .map(|(k, v)| (k.clone(), normalize_at(v, max_items, max_depth, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(max_items)
                .map(|v| normalize_at(v, max_items, max_depth, depth + 1))
                .collect(),
        ),
        other => other.clone(),
    }
}
