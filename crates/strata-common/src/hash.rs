//! Stable content hashes for templates
//!
//! Hashes end up in annotations and in persisted status, so they must not
//! depend on the toolchain (`DefaultHasher` is not stable across releases).

use serde::Serialize;

use crate::Error;

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash the JSON encoding of a value
///
/// Callers must only pass types with a stable field order (structs and
/// `BTreeMap`s, never `HashMap`s).
pub fn hash_serialized<T: Serialize>(value: &T) -> Result<String, Error> {
    let encoded =
        serde_json::to_string(value).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(deterministic_hash(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hash_is_16_hex_chars_and_stable() {
        let a = deterministic_hash("ghcr.io/strata/runtime:2.1");
        let b = deterministic_hash("ghcr.io/strata/runtime:2.1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_input_gives_different_hash() {
        assert_ne!(deterministic_hash("a"), deterministic_hash("b"));
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let mut first = BTreeMap::new();
        first.insert("B", 2);
        first.insert("A", 1);
        let mut second = BTreeMap::new();
        second.insert("A", 1);
        second.insert("B", 2);
        assert_eq!(
            hash_serialized(&first).unwrap(),
            hash_serialized(&second).unwrap()
        );
    }
}
