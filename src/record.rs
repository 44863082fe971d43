//! Ordered key/value proxy record.
//!
//! Records are plain values: every component that wants to change one works
//! on its own clone, so a record carried by a [`Node`](crate::model::Node)
//! is never mutated behind its back.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyRecord(Mapping);

impl ProxyRecord {
    pub fn new() -> Self {
        Self(Mapping::new())
    }

    /// Builds a record from any YAML mapping, stringifying non-string keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_mapping()?;
        let mut out = Mapping::with_capacity(map.len());
        for (k, v) in map {
            let key = match k {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            out.insert(Value::String(key), v.clone());
        }
        Some(Self(out))
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Mapping(self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(Value::String(key.to_string()), value.into());
    }

    /// Sets `key` only when `value` is non-empty.
    pub fn set_non_empty(&mut self, key: &str, value: &str) {
        if !value.trim().is_empty() {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        if !self.contains(key) {
            return;
        }
        let map = std::mem::take(&mut self.0);
        self.0 = map
            .into_iter()
            .filter(|(k, _)| k.as_str() != Some(key))
            .collect();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().filter_map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
    }

    /// String view of a scalar field; numbers and booleans are stringified.
    pub fn str(&self, key: &str) -> String {
        match self.get(key) {
            Some(v) => scalar_to_string(v).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// First non-blank string among `keys`.
    pub fn first_str(&self, keys: &[&str]) -> String {
        keys.iter()
            .map(|k| self.str(k))
            .find(|v| !v.trim().is_empty())
            .unwrap_or_default()
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => parse_int_lenient(s),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => parse_bool_str(s),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        }
    }

    /// Nested mapping stored under `key`, as its own record.
    pub fn sub_record(&self, key: &str) -> Option<ProxyRecord> {
        self.get(key).and_then(ProxyRecord::from_value)
    }

    /// Sequence of strings under `key`; a CSV string counts as a sequence.
    pub fn str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Sequence(seq) => Some(seq.iter().filter_map(scalar_to_string).collect()),
            Value::String(s) => Some(split_csv(s)),
            _ => None,
        }
    }

    /// Lowercased `type` field.
    pub fn record_type(&self) -> String {
        self.str("type").trim().to_ascii_lowercase()
    }

    pub fn name(&self) -> String {
        self.str("name")
    }
}

impl From<Mapping> for ProxyRecord {
    fn from(map: Mapping) -> Self {
        Self(map)
    }
}

impl From<ProxyRecord> for Value {
    fn from(record: ProxyRecord) -> Self {
        record.into_value()
    }
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn parse_int_lenient(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
}

pub fn parse_bool_str(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
