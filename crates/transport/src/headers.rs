use std::collections::HashMap;
use std::collections::hash_map::Iter;

/// Header carrying the JetStream de-duplication id.
pub const MSG_ID: &str = "Nats-Msg-Id";
/// Header carrying the expected stream name.
pub const EXPECTED_STREAM: &str = "Nats-Expected-Stream";
/// Header carrying the expected id of the last stored message.
pub const EXPECTED_LAST_MSG_ID: &str = "Nats-Expected-Last-Msg-Id";
/// Header carrying the expected last stream sequence.
pub const EXPECTED_LAST_SEQUENCE: &str = "Nats-Expected-Last-Sequence";
/// Header carrying the expected last sequence for the subject.
pub const EXPECTED_LAST_SUBJECT_SEQUENCE: &str = "Nats-Expected-Last-Subject-Sequence";

/// Multi-valued message headers.
///
/// Keys are case-sensitive. Iteration order of keys is unspecified; values
/// under one key keep insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    inner: HashMap<String, Vec<String>>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value under `key` with `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), vec![value.into()]);
    }

    /// Adds `value` under `key`, keeping existing values.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.entry(key.into()).or_default().push(value.into());
    }

    /// First value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value stored under `key`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.inner.get(key).map_or(&[], Vec::as_slice)
    }

    /// Removes `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.inner.remove(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there are no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over keys and their values.
    pub fn iter(&self) -> Iter<'_, String, Vec<String>> {
        self.inner.iter()
    }
}

impl From<HashMap<String, Vec<String>>> for Headers {
    fn from(inner: HashMap<String, Vec<String>>) -> Self {
        Self { inner }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (key, value) in iter {
            headers.append(key, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_valued_headers() {
        let mut headers = Headers::new();
        headers.append("trace", "a");
        headers.append("trace", "b");
        headers.insert("Trace", "c");

        assert_eq!(headers.get_all("trace"), ["a", "b"]);
        assert_eq!(headers.get("Trace"), Some("c"));
        assert_eq!(headers.len(), 2);

        headers.insert("trace", "z");
        assert_eq!(headers.get_all("trace"), ["z"]);
        assert!(headers.get_all("missing").is_empty());
    }

    #[test]
    fn test_collect_appends() {
        let headers: Headers = [("k", "1"), ("k", "2")].into_iter().collect();
        assert_eq!(headers.get_all("k").len(), 2);
    }
}
