//! gRPC metadata (headers and trailers).

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

/// Suffix marking a binary-valued metadata key.
pub const BINARY_SUFFIX: &str = "-bin";

/// gRPC metadata key-value pairs.
///
/// Metadata is used for request headers, response headers and trailers.
/// Keys are normalized to lowercase ASCII and insertion order is preserved,
/// so headers go out on the wire in the order they were added. Binary values
/// live under keys ending in `-bin` and are stored base64 encoded, which is
/// their wire representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

/// Whether `key` names a binary metadata entry.
pub fn is_binary_key(key: &str) -> bool {
    key.len() > BINARY_SUFFIX.len() && key.to_ascii_lowercase().ends_with(BINARY_SUFFIX)
}

/// Whether `key` is owned by the protocol layer and may not be set by
/// handlers (pseudo-headers and the gRPC status/encoding headers).
pub fn is_reserved_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with(':')
        || matches!(
            key.as_str(),
            "content-type"
                | "te"
                | "grpc-status"
                | "grpc-message"
                | "grpc-encoding"
                | "grpc-accept-encoding"
                | "grpc-timeout"
        )
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key-value pair.
    ///
    /// Keys are normalized to lowercase. Multiple values for the same
    /// key are allowed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// Insert a binary value under a `-bin` key.
    ///
    /// Returns `false` (and inserts nothing) when the key lacks the suffix.
    pub fn insert_bin(&mut self, key: impl Into<String>, value: &[u8]) -> bool {
        let key = key.into();
        if !is_binary_key(&key) {
            return false;
        }
        self.insert(key, STANDARD_NO_PAD.encode(value));
        true
    }

    /// Replace every value of `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the first binary value for a `-bin` key, decoded.
    ///
    /// Padded and unpadded base64 are both accepted. Returns `None` when the
    /// key is absent or the value is not valid base64.
    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        if !is_binary_key(key) {
            return None;
        }
        let value = self.get(key)?;
        STANDARD_NO_PAD
            .decode(value.trim_end_matches('='))
            .or_else(|_| STANDARD.decode(value))
            .ok()
    }

    /// Get all values for a key, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Remove all values for a key, returning them.
    pub fn remove(&mut self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        let mut removed = Vec::new();
        self.entries.retain(|(k, v)| {
            if *k == key {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Append every entry of `other`.
    pub fn extend_from(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries (including duplicates).
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_new() {
        let md = Metadata::new();
        assert!(md.is_empty());
        assert_eq!(md.len(), 0);
    }

    #[test]
    fn test_metadata_insert_get_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("Content-Type", "application/grpc");

        assert_eq!(md.get("content-type"), Some("application/grpc"));
        assert_eq!(md.get("CONTENT-TYPE"), Some("application/grpc"));
        assert!(md.contains_key("Content-Type"));
    }

    #[test]
    fn test_metadata_multiple_values_keep_order() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("other", "x");
        md.insert("key", "value2");

        assert_eq!(md.get("key"), Some("value1"));
        assert_eq!(md.get_all("key"), vec!["value1", "value2"]);

        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["key", "other", "key"]);
    }

    #[test]
    fn test_metadata_set_replaces() {
        let mut md = Metadata::new();
        md.insert("key", "a");
        md.insert("key", "b");
        md.set("key", "c");
        assert_eq!(md.get_all("key"), vec!["c"]);
    }

    #[test]
    fn test_metadata_remove() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("key", "value2");

        assert_eq!(md.remove("key"), vec!["value1", "value2"]);
        assert!(md.is_empty());
        assert!(md.remove("key").is_empty());
    }

    #[test]
    fn test_metadata_binary_values() {
        let mut md = Metadata::new();
        assert!(md.insert_bin("trace-bin", &[0, 1, 2, 255]));
        assert!(!md.insert_bin("trace", &[1]));

        assert_eq!(md.get("trace-bin"), Some("AAEC/w"));
        assert_eq!(md.get_bin("trace-bin"), Some(vec![0, 1, 2, 255]));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_metadata_binary_accepts_padding() {
        let mut md = Metadata::new();
        md.insert("data-bin", "AAEC/w==");
        assert_eq!(md.get_bin("data-bin"), Some(vec![0, 1, 2, 255]));

        md.insert("bad-bin", "!!!");
        assert_eq!(md.get_bin("bad-bin"), None);
        assert_eq!(md.get_bin("plain"), None);
    }

    #[test]
    fn test_binary_and_reserved_keys() {
        assert!(is_binary_key("x-bin"));
        assert!(is_binary_key("X-BIN"));
        assert!(!is_binary_key("-bin"));
        assert!(!is_binary_key("binary"));

        assert!(is_reserved_key(":path"));
        assert!(is_reserved_key("grpc-status"));
        assert!(is_reserved_key("Content-Type"));
        assert!(!is_reserved_key("x-request-id"));
    }

    #[test]
    fn test_metadata_extend_from() {
        let mut a: Metadata = [("k1", "v1")].into_iter().collect();
        let b: Metadata = [("k2", "v2"), ("k1", "v3")].into_iter().collect();
        a.extend_from(&b);

        assert_eq!(a.len(), 3);
        assert_eq!(a.get_all("k1"), vec!["v1", "v3"]);
    }

    #[test]
    fn test_metadata_from_iterator() {
        let pairs = vec![
            ("key1".to_string(), "value1".to_string()),
            ("KEY2".to_string(), "value2".to_string()),
        ];

        let md: Metadata = pairs.into_iter().collect();
        assert_eq!(md.len(), 2);
        assert_eq!(md.get("key1"), Some("value1"));
        assert_eq!(md.get("key2"), Some("value2"));
    }
}
