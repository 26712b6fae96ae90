//! Registration payload — the metadata written into each ephemeral node.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Key/value metadata advertised alongside a registration.
///
/// Keys are kept sorted, so the encoded node content is byte-stable
/// across re-registrations as long as the payload itself is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the textual forms accepted in the config file.
    ///
    /// Either a JSON object:
    ///
    /// ```text
    /// { "foo": "bar", "bar": "foo" }
    /// ```
    ///
    /// or comma-separated `key=value` pairs:
    ///
    /// ```text
    /// foo=bar, bar=foo
    /// ```
    ///
    /// Pairs that don't split into exactly one key and one value are dropped.
    pub fn parse(text: &str) -> Self {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
            return Self(map.into_iter().collect());
        }

        let mut map = BTreeMap::new();
        for pair in text.split(',') {
            let parts: Vec<&str> = pair.split('=').collect();
            if let [key, value] = parts.as_slice() {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                map.insert(key.to_string(), Value::String(value.trim().to_string()));
            }
        }
        Self(map)
    }

    /// Canonical node content: compact JSON with sorted keys.
    pub fn to_bytes(&self) -> Vec<u8> {
        let object: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Value::Object(object).to_string().into_bytes()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Config accepts a table or a string (JSON or `k=v` pairs).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Table(BTreeMap<String, Value>),
    Text(String),
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawPayload::deserialize(deserializer)? {
            RawPayload::Table(map) => Self(map),
            RawPayload::Text(text) => Self::parse(&text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_object() {
        let payload = Payload::parse(r#"{ "foo": "bar", "weight": 3 }"#);
        assert_eq!(payload.get("foo"), Some(&Value::from("bar")));
        assert_eq!(payload.get("weight"), Some(&Value::from(3)));
    }

    #[test]
    fn parse_single_pair() {
        let payload = Payload::parse("foo=bar");
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.get("foo"), Some(&Value::from("bar")));
    }

    #[test]
    fn parse_pairs_trims_whitespace() {
        let payload = Payload::parse("foo=bar, bar = foo");
        assert_eq!(payload.get("foo"), Some(&Value::from("bar")));
        assert_eq!(payload.get("bar"), Some(&Value::from("foo")));
    }

    #[test]
    fn parse_drops_malformed_pairs() {
        let payload = Payload::parse("foo=bar, junk, a=b=c, =empty");
        assert_eq!(payload.len(), 1);
        assert!(payload.get("a").is_none());
    }

    #[test]
    fn json_array_falls_back_to_pairs() {
        assert!(Payload::parse("[1, 2]").is_empty());
    }

    #[test]
    fn encoding_is_sorted_and_stable() {
        let a: Payload = [("zone", "a"), ("app", "web")].into_iter().collect();
        let b: Payload = [("app", "web"), ("zone", "a")].into_iter().collect();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.to_bytes(), br#"{"app":"web","zone":"a"}"#.to_vec());
    }

    #[test]
    fn empty_payload_encodes_as_empty_object() {
        assert_eq!(Payload::new().to_bytes(), b"{}".to_vec());
    }
}
