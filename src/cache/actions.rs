//! Actions reduced into [`super::ApiState`].
//!
//! Every state change is expressed as one of these plain records. Side
//! effects (fetching, timers, hooks) react to them after reduction.

use serde_json::Value;
use time::OffsetDateTime;

use super::error::QueryError;
use super::keys::CacheKey;
use super::patches::Patch;
use super::state::RequestId;
use super::tags::Tag;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A query request started; creates the entry on first sight of `key`.
    QueryPending {
        key: CacheKey,
        endpoint_name: String,
        args: Value,
        request_id: RequestId,
        started_at: OffsetDateTime,
    },
    /// Applied only when `request_id` matches the entry's current request.
    QueryFulfilled {
        key: CacheKey,
        request_id: RequestId,
        data: Value,
        tags: Vec<Tag>,
        fulfilled_at: OffsetDateTime,
    },
    /// Applied only when `request_id` matches the entry's current request.
    QueryRejected {
        key: CacheKey,
        request_id: RequestId,
        error: QueryError,
    },
    /// Write a fulfilled entry without fetching.
    QueryDataUpserted {
        key: CacheKey,
        endpoint_name: String,
        args: Value,
        request_id: RequestId,
        data: Value,
        tags: Vec<Tag>,
        fulfilled_at: OffsetDateTime,
    },
    /// Apply recorded patches to an entry's data; no-op without data.
    QueryResultPatched { key: CacheKey, patches: Vec<Patch> },
    /// Evict an entry.
    RemoveQueryResult { key: CacheKey },
    MutationPending {
        request_id: RequestId,
        endpoint_name: String,
        args: Value,
        started_at: OffsetDateTime,
    },
    MutationFulfilled {
        request_id: RequestId,
        data: Value,
        fulfilled_at: OffsetDateTime,
    },
    MutationRejected {
        request_id: RequestId,
        error: QueryError,
    },
    RemoveMutationResult { request_id: RequestId },
    Subscribe { key: CacheKey, subscriber: RequestId },
    Unsubscribe { key: CacheKey, subscriber: RequestId },
    /// Mark entries providing any of `tags` stale; subscribed ones refetch.
    InvalidateTags { tags: Vec<Tag> },
    /// Drop the whole slice.
    ResetApiState,
}

impl Action {
    /// The action's type string, e.g. `queries/pending`.
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::QueryPending { .. } => "queries/pending",
            Self::QueryFulfilled { .. } => "queries/fulfilled",
            Self::QueryRejected { .. } => "queries/rejected",
            Self::QueryDataUpserted { .. } => "queries/upserted",
            Self::QueryResultPatched { .. } => "queries/patched",
            Self::RemoveQueryResult { .. } => "queries/removed",
            Self::MutationPending { .. } => "mutations/pending",
            Self::MutationFulfilled { .. } => "mutations/fulfilled",
            Self::MutationRejected { .. } => "mutations/rejected",
            Self::RemoveMutationResult { .. } => "mutations/removed",
            Self::Subscribe { .. } => "subscriptions/subscribe",
            Self::Unsubscribe { .. } => "subscriptions/unsubscribe",
            Self::InvalidateTags { .. } => "tags/invalidate",
            Self::ResetApiState => "resetApiState",
        }
    }

    /// The query key this action targets, if any.
    pub fn query_key(&self) -> Option<&CacheKey> {
        match self {
            Self::QueryPending { key, .. }
            | Self::QueryFulfilled { key, .. }
            | Self::QueryRejected { key, .. }
            | Self::QueryDataUpserted { key, .. }
            | Self::QueryResultPatched { key, .. }
            | Self::RemoveQueryResult { key }
            | Self::Subscribe { key, .. }
            | Self::Unsubscribe { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_types_are_namespaced() {
        let key = CacheKey::from_raw("getUser(1)");
        let subscribe = Action::Subscribe {
            key: key.clone(),
            subscriber: RequestId::new(),
        };
        assert_eq!(subscribe.action_type(), "subscriptions/subscribe");
        assert_eq!(subscribe.query_key(), Some(&key));

        let invalidate = Action::InvalidateTags {
            tags: vec![Tag::new("User")],
        };
        assert_eq!(invalidate.action_type(), "tags/invalidate");
        assert!(invalidate.query_key().is_none());
    }
}
