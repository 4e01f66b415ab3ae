//! String-keyed store backing every cache in testmachine.
//!
//! Keys can optionally be replaced by their BLAKE3 digest, which keeps the
//! map small when the keys are whole source texts.

use std::collections::HashMap;
use testmachine_util::hash::blake3_str;

/// Associative container keyed by strings, with optional key hashing.
#[derive(Debug, Clone)]
pub struct Collection<V> {
    entries: HashMap<String, V>,
    hash_keys: bool,
}

impl<V> Default for Collection<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Collection<V> {
    /// Create a collection that stores keys verbatim.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hash_keys: false,
        }
    }

    /// Create a collection that stores the BLAKE3 digest of each key.
    #[must_use]
    pub fn hashed() -> Self {
        Self {
            entries: HashMap::new(),
            hash_keys: true,
        }
    }

    /// Whether keys are hashed before storage.
    #[must_use]
    pub fn hashes_keys(&self) -> bool {
        self.hash_keys
    }

    fn key(&self, key: &str) -> String {
        if self.hash_keys {
            blake3_str(key)
        } else {
            key.to_string()
        }
    }

    /// Insert or replace the value stored under `key`.
    pub fn set(&mut self, key: &str, value: V) {
        let key = self.key(key);
        self.entries.insert(key, value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(&self.key(key))
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(&self.key(key))
    }

    /// Remove `key`, returning the value it held.
    pub fn delete(&mut self, key: &str) -> Option<V> {
        let key = self.key(key);
        self.entries.remove(&key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bulk insert. Later pairs overwrite earlier ones with the same key.
    pub fn fill<K, I>(&mut self, pairs: I)
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.set(key.as_ref(), value);
        }
    }

    /// Iterate over stored entries. With hashing enabled the keys are digests.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut c = Collection::new();
        c.set("a", 1);
        c.set("b", 2);
        assert_eq!(c.get("a"), Some(&1));
        assert!(c.has("b"));
        assert_eq!(c.len(), 2);

        assert_eq!(c.delete("a"), Some(1));
        assert!(!c.has("a"));
        assert_eq!(c.delete("a"), None);
    }

    #[test]
    fn test_hashed_keys() {
        let source = "module.exports = 42;\n".repeat(100);
        let mut c = Collection::hashed();
        c.set(&source, "compiled");

        assert!(c.has(&source));
        assert_eq!(c.get(&source), Some(&"compiled"));
        let (key, _) = c.iter().next().unwrap();
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn test_fill_and_clear() {
        let mut c = Collection::new();
        c.fill([("x", 1), ("y", 2), ("x", 3)]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("x"), Some(&3));

        c.clear();
        assert!(c.is_empty());
    }
}
