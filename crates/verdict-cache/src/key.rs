use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// An error deriving a [`CacheKey`] from call arguments.
#[derive(Debug, Error)]
pub enum KeyError {
    /// An argument could not be converted into its canonical form.
    #[error("failed to serialize cache key argument")]
    Serialize(#[from] serde_json::Error),
    /// The same keyword argument was passed twice.
    #[error("duplicate keyword argument `{0}`")]
    DuplicateKeyword(String),
}

/// Identifies the result of a computation by the arguments it was called with.
///
/// Two keys are equal when they were built from equal positional arguments, in the same order,
/// and equal keyword arguments, in any order.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Create a [`CacheKeyBuilder`] that collects the arguments contributing to the key.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Serialize) -> Self {
        Self::builder().arg(&key).unwrap().build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// Every argument is canonicalized into JSON, with object keys sorted, so composite arguments
/// compare by value. Keyword arguments are sorted by name. The resulting text is kept alongside
/// the key for debugging, and its SHA-256 digest is what keys are compared by.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    positional: Vec<String>,
    keywords: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Appends the next positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, KeyError> {
        self.positional.push(canonicalize(value)?);
        Ok(self)
    }

    /// Adds a keyword argument.
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self, KeyError> {
        let value = canonicalize(value)?;
        if self.keywords.insert(name.to_owned(), value).is_some() {
            return Err(KeyError::DuplicateKeyword(name.to_owned()));
        }
        Ok(self)
    }

    /// Finalizes the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let mut metadata = String::new();
        for (index, value) in self.positional.iter().enumerate() {
            // writing into a `String` never fails
            let _ = writeln!(metadata, "arg[{index}]: {value}");
        }
        for (name, value) in &self.keywords {
            let _ = writeln!(metadata, "kwarg[{name:?}]: {value}");
        }

        let hash = Sha256::digest(&metadata);
        CacheKey {
            metadata: metadata.into(),
            hash: hash.into(),
        }
    }
}

fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String, KeyError> {
    // `serde_json::Value` keeps object keys in a sorted map
    let value = serde_json::to_value(value)?;
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_keyword_order_does_not_matter() {
        let ab = CacheKey::builder()
            .kwarg("a", &1)
            .unwrap()
            .kwarg("b", &2)
            .unwrap()
            .build();
        let ba = CacheKey::builder()
            .kwarg("b", &2)
            .unwrap()
            .kwarg("a", &1)
            .unwrap()
            .build();

        assert_eq!(ab, ba);
        assert_eq!(ab.metadata(), ba.metadata());
    }

    #[test]
    fn test_positional_order_matters() {
        let key1 = CacheKey::builder().arg(&1).unwrap().arg(&2).unwrap().build();
        let key2 = CacheKey::builder().arg(&2).unwrap().arg(&1).unwrap().build();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_positional_and_keyword_are_distinct() {
        let positional = CacheKey::builder().arg(&1).unwrap().build();
        let keyword = CacheKey::builder().kwarg("arg[0]", &1).unwrap().build();
        assert_ne!(positional, keyword);
    }

    #[test]
    fn test_composite_values_compare_structurally() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for (k, v) in [("x", 1), ("y", 2), ("z", 3)] {
            first.insert(k, v);
        }
        for (k, v) in [("z", 3), ("y", 2), ("x", 1)] {
            second.insert(k, v);
        }

        let key1 = CacheKey::builder().arg(&first).unwrap().build();
        let key2 = CacheKey::builder().arg(&second).unwrap().build();
        assert_eq!(key1, key2);

        let key3 = CacheKey::builder().arg(&vec![1, 2]).unwrap().build();
        let key4 = CacheKey::builder().arg(&vec![2, 1]).unwrap().build();
        assert_ne!(key3, key4);
    }

    #[test]
    fn test_types_are_distinguished() {
        assert_ne!(CacheKey::for_testing("1"), CacheKey::for_testing(1));
    }

    #[test]
    fn test_duplicate_keyword() {
        let result = CacheKey::builder().kwarg("a", &1).unwrap().kwarg("a", &2);
        assert!(matches!(result, Err(KeyError::DuplicateKeyword(name)) if name == "a"));
    }

    #[test]
    fn test_unserializable_argument() {
        let mut map = HashMap::new();
        map.insert((1, 2), "tuple keys are not valid JSON object keys");

        let result = CacheKey::builder().arg(&map);
        assert!(matches!(result, Err(KeyError::Serialize(_))));
    }

    #[test]
    fn test_metadata() {
        let key = CacheKey::builder()
            .arg("https://example.com/image.png")
            .unwrap()
            .kwarg("size", &[64, 64])
            .unwrap()
            .build();

        assert_eq!(
            key.metadata(),
            "arg[0]: \"https://example.com/image.png\"\nkwarg[\"size\"]: [64,64]\n"
        );
        assert_eq!(key.to_string().len(), 16);
    }
}
