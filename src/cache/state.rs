//! The cache state slice and its entries.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::QueryError;
use super::keys::CacheKey;
use super::registry::TagRegistry;
use super::tags::Tag;

/// Per-attempt identifier; also identifies subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// Cached state of one `(endpoint, args)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCacheEntry {
    pub key: CacheKey,
    pub endpoint_name: String,
    pub original_args: Value,
    pub status: QueryStatus,
    /// Last fulfilled payload; survives later pending/rejected transitions.
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub request_id: Option<RequestId>,
    pub started_at: Option<OffsetDateTime>,
    pub fulfilled_at: Option<OffsetDateTime>,
    pub subscriber_ref_count: usize,
    pub tags: BTreeSet<Tag>,
    /// Set by invalidation; the next initiate refetches instead of serving.
    pub is_stale: bool,
}

impl QueryCacheEntry {
    /// Placeholder returned by selectors when no entry exists.
    pub fn uninitialized(key: CacheKey, endpoint_name: impl Into<String>, args: Value) -> Self {
        Self {
            key,
            endpoint_name: endpoint_name.into(),
            original_args: args,
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            request_id: None,
            started_at: None,
            fulfilled_at: None,
            subscriber_ref_count: 0,
            tags: BTreeSet::new(),
            is_stale: false,
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.status == QueryStatus::Uninitialized
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status == QueryStatus::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.status == QueryStatus::Rejected
    }

    /// Age of the last fulfillment relative to `now`.
    pub fn age(&self, now: OffsetDateTime) -> Option<Duration> {
        let fulfilled_at = self.fulfilled_at?;
        let elapsed = now - fulfilled_at;
        Some(elapsed.try_into().unwrap_or(Duration::ZERO))
    }
}

/// Cached state of one mutation attempt, keyed by its request id.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationCacheEntry {
    pub request_id: RequestId,
    pub endpoint_name: String,
    pub original_args: Value,
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub started_at: OffsetDateTime,
    pub fulfilled_at: Option<OffsetDateTime>,
}

/// The whole cache slice. Snapshots are immutable; the store swaps in a new
/// `Arc<ApiState>` on every dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiState {
    pub(crate) queries: HashMap<CacheKey, QueryCacheEntry>,
    pub(crate) mutations: HashMap<RequestId, MutationCacheEntry>,
    pub(crate) subscriptions: HashMap<CacheKey, HashSet<RequestId>>,
    pub(crate) provided: TagRegistry,
}

impl ApiState {
    pub fn query(&self, key: &CacheKey) -> Option<&QueryCacheEntry> {
        self.queries.get(key)
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryCacheEntry> {
        self.queries.values()
    }

    pub fn mutation(&self, request_id: &RequestId) -> Option<&MutationCacheEntry> {
        self.mutations.get(request_id)
    }

    pub fn mutations(&self) -> impl Iterator<Item = &MutationCacheEntry> {
        self.mutations.values()
    }

    /// Active subscriber count for `key` (0 when untracked).
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscriptions.get(key).map_or(0, HashSet::len)
    }

    pub fn is_subscribed(&self, key: &CacheKey, subscriber: &RequestId) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|subscribers| subscribers.contains(subscriber))
    }

    pub fn provided(&self) -> &TagRegistry {
        &self.provided
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn uninitialized_placeholder_has_no_payload() {
        let entry = QueryCacheEntry::uninitialized(
            CacheKey::from_raw("getUser(1)"),
            "getUser",
            json!(1),
        );
        assert!(entry.is_uninitialized());
        assert!(entry.data.is_none());
        assert!(entry.request_id.is_none());
        assert_eq!(entry.subscriber_ref_count, 0);
    }

    #[test]
    fn age_is_measured_from_fulfillment() {
        let mut entry = QueryCacheEntry::uninitialized(
            CacheKey::from_raw("getUser(1)"),
            "getUser",
            json!(1),
        );
        assert!(entry.age(datetime!(2024-01-01 0:00 UTC)).is_none());

        entry.fulfilled_at = Some(datetime!(2024-01-01 0:00 UTC));
        assert_eq!(
            entry.age(datetime!(2024-01-01 0:01 UTC)),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            entry.age(datetime!(2023-12-31 23:59 UTC)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let encoded = serde_json::to_string(&QueryStatus::Fulfilled).expect("serializable");
        assert_eq!(encoded, "\"fulfilled\"");
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
