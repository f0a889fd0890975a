//! Cache key schema.
//!
//! All keys live under the `stf:v1:` namespace so pattern invalidation can
//! target a versioned slice of the keyspace.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

const NAMESPACE: &str = "stf:v1";

/// Suffix marking a negative ("known absent") sibling entry.
pub const NEGATIVE_SUFFIX: &str = ":neg";

/// `stf:v1:entity:{id}`
pub fn entity_key(id: &str) -> String {
    format!("{NAMESPACE}:entity:{id}")
}

/// `stf:v1:entity:{id}:field:{name}`
pub fn entity_field_key(id: &str, field: &str) -> String {
    format!("{NAMESPACE}:entity:{id}:field:{field}")
}

/// `stf:v1:tag:{tag}` — a derived collection keyed by tag.
pub fn tag_key(tag: &str) -> String {
    format!("{NAMESPACE}:tag:{tag}")
}

/// `stf:v1:entities:qhash:{hash}` — one list-query result page.
pub fn entity_list_key(query_hash: u64) -> String {
    format!("{NAMESPACE}:entities:qhash:{query_hash:x}")
}

/// Pattern covering every cached list-query page.
pub fn entity_list_pattern() -> String {
    format!("{NAMESPACE}:entities:qhash:*")
}

/// Pattern covering a tag's derived collections.
pub fn tag_pattern(tag: &str) -> String {
    format!("{NAMESPACE}:tag:{tag}*")
}

/// `stf:v1:cmd:status:{id}` — ephemeral command-status cache.
pub fn command_status_key(id: Uuid) -> String {
    format!("{NAMESPACE}:cmd:status:{id}")
}

/// The negative sibling of a key.
pub fn negative_key(key: &str) -> String {
    format!("{key}{NEGATIVE_SUFFIX}")
}

/// Hash a list query (normalized filter + page window) into a cache key.
pub fn hash_query<T: Hash>(query: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(entity_key("e-42"), "stf:v1:entity:e-42");
        assert_eq!(negative_key(&entity_key("e-42")), "stf:v1:entity:e-42:neg");
        assert_eq!(entity_field_key("e-42", "name"), "stf:v1:entity:e-42:field:name");
        assert_eq!(tag_key("reports"), "stf:v1:tag:reports");
    }

    #[test]
    fn query_hash_is_stable() {
        let a = hash_query(&("tag", 20u32, 0u64));
        let b = hash_query(&("tag", 20u32, 0u64));
        let c = hash_query(&("tag", 20u32, 20u64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(entity_list_key(a).starts_with("stf:v1:entities:qhash:"));
    }
}
