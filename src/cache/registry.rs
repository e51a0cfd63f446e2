//! Bidirectional tag registry.
//!
//! Tracks the relationship between provided tags and cache entries so an
//! invalidation can find every affected key, and an eviction can clean up
//! the tags it provided.

use std::collections::{HashMap, HashSet};

use super::keys::CacheKey;
use super::tags::Tag;

/// Tracks tag → cache_keys and cache_key → tags mappings.
///
/// Lives inside [`super::ApiState`] and is only mutated by the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagRegistry {
    tag_to_keys: HashMap<Tag, HashSet<CacheKey>>,
    key_to_tags: HashMap<CacheKey, HashSet<Tag>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags provided by `cache_key`.
    ///
    /// Tags may change between fulfillments of the same key, so the previous
    /// set is dropped first.
    pub fn register(&mut self, cache_key: CacheKey, tags: impl IntoIterator<Item = Tag>) {
        self.unregister(&cache_key);

        let tags: HashSet<Tag> = tags.into_iter().collect();
        if tags.is_empty() {
            return;
        }
        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(cache_key.clone());
        }
        self.key_to_tags.insert(cache_key, tags);
    }

    /// Keys whose provided tags are hit by invalidating any of `tags`.
    pub fn keys_for_tags(&self, tags: &[Tag]) -> HashSet<CacheKey> {
        let mut keys = HashSet::new();
        for invalidated in tags {
            if invalidated.id.is_some() {
                if let Some(found) = self.tag_to_keys.get(invalidated) {
                    keys.extend(found.iter().cloned());
                }
                continue;
            }
            for (provided, found) in &self.tag_to_keys {
                if invalidated.matches(provided) {
                    keys.extend(found.iter().cloned());
                }
            }
        }
        keys
    }

    #[cfg(test)]
    pub(crate) fn tags_for_key(&self, cache_key: &CacheKey) -> HashSet<Tag> {
        self.key_to_tags
            .get(cache_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a cache key and clean up tag mappings.
    pub fn unregister(&mut self, cache_key: &CacheKey) {
        if let Some(tags) = self.key_to_tags.remove(cache_key) {
            for tag in tags {
                if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                    keys.remove(cache_key);
                    if keys.is_empty() {
                        self.tag_to_keys.remove(&tag);
                    }
                }
            }
        }
    }

    /// Number of distinct provided tags.
    #[cfg(test)]
    pub(crate) fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    /// Number of keys providing at least one tag.
    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = TagRegistry::new();
        registry.register(key("getPost(1)"), [Tag::with_id("Post", 1)]);

        let keys = registry.keys_for_tags(&[Tag::with_id("Post", 1)]);
        assert!(keys.contains(&key("getPost(1)")));

        let tags = registry.tags_for_key(&key("getPost(1)"));
        assert!(tags.contains(&Tag::with_id("Post", 1)));
    }

    #[test]
    fn kind_only_invalidation_hits_every_id() {
        let mut registry = TagRegistry::new();
        registry.register(key("getPost(1)"), [Tag::with_id("Post", 1)]);
        registry.register(key("getPost(2)"), [Tag::with_id("Post", 2)]);
        registry.register(key("listPosts(null)"), [Tag::new("Post")]);
        registry.register(key("getUser(1)"), [Tag::with_id("User", 1)]);

        let keys = registry.keys_for_tags(&[Tag::new("Post")]);
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&key("getUser(1)")));
    }

    #[test]
    fn id_invalidation_skips_list_tag() {
        let mut registry = TagRegistry::new();
        registry.register(key("getPost(1)"), [Tag::with_id("Post", 1)]);
        registry.register(key("listPosts(null)"), [Tag::new("Post")]);

        let keys = registry.keys_for_tags(&[Tag::with_id("Post", 1)]);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&key("getPost(1)")));
    }

    #[test]
    fn re_registering_replaces_previous_tags() {
        let mut registry = TagRegistry::new();
        registry.register(key("feed(null)"), [Tag::with_id("Post", 1)]);
        registry.register(key("feed(null)"), [Tag::with_id("Post", 2)]);

        assert!(
            registry
                .keys_for_tags(&[Tag::with_id("Post", 1)])
                .is_empty()
        );
        assert_eq!(registry.keys_for_tags(&[Tag::with_id("Post", 2)]).len(), 1);
        assert_eq!(registry.tag_count(), 1);
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let mut registry = TagRegistry::new();
        registry.register(
            key("getPost(1)"),
            [Tag::with_id("Post", 1), Tag::new("Post")],
        );
        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.tag_count(), 2);

        registry.unregister(&key("getPost(1)"));
        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.tag_count(), 0);
    }

    #[test]
    fn empty_tag_set_is_not_tracked() {
        let mut registry = TagRegistry::new();
        registry.register(key("ping(null)"), Vec::new());
        assert_eq!(registry.key_count(), 0);
    }
}
