//! Tag invalidation and refetch fan-out.
//!
//! The reducer marks every entry hit by an `InvalidateTags` action stale.
//! This module then refetches the hits that still have subscribers and turns
//! completed mutations into invalidations.

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use super::actions::Action;
use super::api::Api;
use super::error::QueryError;
use super::keys::CacheKey;
use super::state::{ApiState, RequestId};
use super::tags::Tag;

const METRIC_TAGS_INVALIDATED_TOTAL: &str = "quarry_tags_invalidated_total";

/// A cache entry that an invalidation would hit.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidatedEntry {
    pub key: CacheKey,
    pub endpoint_name: String,
    pub original_args: Value,
}

/// Build the action that invalidates `tags`; dispatch it to take effect.
pub fn invalidate_tags(tags: impl IntoIterator<Item = Tag>) -> Action {
    Action::InvalidateTags {
        tags: tags.into_iter().collect(),
    }
}

/// Entries whose provided tags match any of `tags`, ordered by key.
pub fn select_invalidated_by(state: &ApiState, tags: &[Tag]) -> Vec<InvalidatedEntry> {
    let mut hits: Vec<InvalidatedEntry> = state
        .provided()
        .keys_for_tags(tags)
        .into_iter()
        .filter_map(|key| {
            state.query(&key).map(|entry| InvalidatedEntry {
                key,
                endpoint_name: entry.endpoint_name.clone(),
                original_args: entry.original_args.clone(),
            })
        })
        .collect();
    hits.sort_by(|a, b| a.key.cmp(&b.key));
    hits
}

pub(crate) fn after_dispatch(api: &Api, action: &Action, state: &ApiState) {
    match action {
        Action::InvalidateTags { tags } => refetch_subscribed(api, tags, state),
        Action::MutationFulfilled {
            request_id, data, ..
        } => invalidate_after_mutation(api, *request_id, Ok(data), state),
        Action::MutationRejected { request_id, error } if !error.is_aborted() => {
            invalidate_after_mutation(api, *request_id, Err(error), state)
        }
        _ => {}
    }
}

fn refetch_subscribed(api: &Api, tags: &[Tag], state: &ApiState) {
    let hits = select_invalidated_by(state, tags);
    if hits.is_empty() {
        return;
    }
    counter!(METRIC_TAGS_INVALIDATED_TOTAL).increment(hits.len() as u64);

    let mut refetched = 0usize;
    for hit in &hits {
        if state.subscriber_count(&hit.key) == 0 {
            continue;
        }
        match api.refetch_entry(&hit.endpoint_name, hit.key.clone(), hit.original_args.clone()) {
            Ok(_) => refetched += 1,
            Err(err) => {
                warn!(key = %hit.key, error = %err, "Invalidated entry could not be refetched")
            }
        }
    }
    debug!(
        tags = tags.len(),
        hits = hits.len(),
        refetched,
        "Tags invalidated"
    );
}

fn invalidate_after_mutation(
    api: &Api,
    request_id: RequestId,
    outcome: Result<&Value, &QueryError>,
    state: &ApiState,
) {
    let Some(mutation) = state.mutation(&request_id) else {
        return;
    };
    let endpoint = match api.mutation_endpoint(&mutation.endpoint_name) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "Mutation endpoint missing");
            return;
        }
    };
    let tags = endpoint
        .invalidates_tags
        .resolve(outcome, &mutation.original_args);
    if tags.is_empty() {
        return;
    }
    debug!(
        endpoint = %mutation.endpoint_name,
        request_id = %request_id,
        tags = tags.len(),
        "Mutation invalidates tags"
    );
    api.dispatch(invalidate_tags(tags));
}
