//! Pure state transitions for the cache slice.

use tracing::{trace, warn};

use super::actions::Action;
use super::patches::apply_patches;
use super::state::{ApiState, MutationCacheEntry, QueryCacheEntry, QueryStatus};

/// Reducer transforms state based on actions.
///
/// The reducer is the only place where state transitions happen.
/// It must be a pure function: (State, Action) -> State
pub trait Reducer {
    type State;
    type Action;

    fn reduce(state: Self::State, action: &Self::Action) -> Self::State;
}

/// Transition table for [`ApiState`].
pub struct ApiReducer;

impl Reducer for ApiReducer {
    type State = ApiState;
    type Action = Action;

    fn reduce(mut state: ApiState, action: &Action) -> ApiState {
        match action {
            Action::QueryPending {
                key,
                endpoint_name,
                args,
                request_id,
                started_at,
            } => {
                let subscribers = state.subscriber_count(key);
                let entry = state.queries.entry(key.clone()).or_insert_with(|| {
                    QueryCacheEntry::uninitialized(key.clone(), endpoint_name.clone(), args.clone())
                });
                entry.status = QueryStatus::Pending;
                entry.request_id = Some(*request_id);
                entry.error = None;
                entry.started_at = Some(*started_at);
                entry.original_args = args.clone();
                entry.subscriber_ref_count = subscribers;
            }
            Action::QueryFulfilled {
                key,
                request_id,
                data,
                tags,
                fulfilled_at,
            } => {
                let Some(entry) = state.queries.get_mut(key) else {
                    trace!(key = %key, "Fulfilled result for evicted entry ignored");
                    return state;
                };
                if entry.request_id != Some(*request_id) {
                    trace!(key = %key, request_id = %request_id, "Stale fulfilled result ignored");
                    return state;
                }
                entry.status = QueryStatus::Fulfilled;
                entry.data = Some(data.clone());
                entry.error = None;
                entry.fulfilled_at = Some(*fulfilled_at);
                entry.is_stale = false;
                entry.tags = tags.iter().cloned().collect();
                state.provided.register(key.clone(), tags.iter().cloned());
            }
            Action::QueryRejected {
                key,
                request_id,
                error,
            } => {
                let Some(entry) = state.queries.get_mut(key) else {
                    trace!(key = %key, "Rejected result for evicted entry ignored");
                    return state;
                };
                if entry.request_id != Some(*request_id) {
                    trace!(key = %key, request_id = %request_id, "Stale rejected result ignored");
                    return state;
                }
                entry.status = QueryStatus::Rejected;
                entry.error = Some(error.clone());
            }
            Action::QueryDataUpserted {
                key,
                endpoint_name,
                args,
                request_id,
                data,
                tags,
                fulfilled_at,
            } => {
                let subscribers = state.subscriber_count(key);
                let entry = state.queries.entry(key.clone()).or_insert_with(|| {
                    QueryCacheEntry::uninitialized(key.clone(), endpoint_name.clone(), args.clone())
                });
                entry.status = QueryStatus::Fulfilled;
                entry.request_id = Some(*request_id);
                entry.data = Some(data.clone());
                entry.error = None;
                entry.started_at.get_or_insert(*fulfilled_at);
                entry.fulfilled_at = Some(*fulfilled_at);
                entry.is_stale = false;
                entry.subscriber_ref_count = subscribers;
                entry.tags = tags.iter().cloned().collect();
                state.provided.register(key.clone(), tags.iter().cloned());
            }
            Action::QueryResultPatched { key, patches } => {
                let Some(data) = state
                    .queries
                    .get_mut(key)
                    .and_then(|entry| entry.data.as_mut())
                else {
                    return state;
                };
                let mut draft = data.clone();
                match apply_patches(&mut draft, patches) {
                    Ok(()) => *data = draft,
                    Err(err) => warn!(key = %key, error = %err, "Cache patch rejected"),
                }
            }
            Action::RemoveQueryResult { key } => {
                state.queries.remove(key);
                state.provided.unregister(key);
            }
            Action::MutationPending {
                request_id,
                endpoint_name,
                args,
                started_at,
            } => {
                state.mutations.insert(
                    *request_id,
                    MutationCacheEntry {
                        request_id: *request_id,
                        endpoint_name: endpoint_name.clone(),
                        original_args: args.clone(),
                        status: QueryStatus::Pending,
                        data: None,
                        error: None,
                        started_at: *started_at,
                        fulfilled_at: None,
                    },
                );
            }
            Action::MutationFulfilled {
                request_id,
                data,
                fulfilled_at,
            } => {
                if let Some(entry) = state.mutations.get_mut(request_id) {
                    entry.status = QueryStatus::Fulfilled;
                    entry.data = Some(data.clone());
                    entry.error = None;
                    entry.fulfilled_at = Some(*fulfilled_at);
                }
            }
            Action::MutationRejected { request_id, error } => {
                if let Some(entry) = state.mutations.get_mut(request_id) {
                    entry.status = QueryStatus::Rejected;
                    entry.error = Some(error.clone());
                }
            }
            Action::RemoveMutationResult { request_id } => {
                state.mutations.remove(request_id);
            }
            Action::Subscribe { key, subscriber } => {
                let subscribers = state.subscriptions.entry(key.clone()).or_default();
                subscribers.insert(*subscriber);
                let count = subscribers.len();
                if let Some(entry) = state.queries.get_mut(key) {
                    entry.subscriber_ref_count = count;
                }
            }
            Action::Unsubscribe { key, subscriber } => {
                let count = match state.subscriptions.get_mut(key) {
                    Some(subscribers) => {
                        subscribers.remove(subscriber);
                        subscribers.len()
                    }
                    None => 0,
                };
                if count == 0 {
                    state.subscriptions.remove(key);
                }
                if let Some(entry) = state.queries.get_mut(key) {
                    entry.subscriber_ref_count = count;
                }
            }
            Action::InvalidateTags { tags } => {
                for key in state.provided.keys_for_tags(tags) {
                    if let Some(entry) = state.queries.get_mut(&key) {
                        entry.is_stale = true;
                    }
                }
            }
            Action::ResetApiState => return ApiState::default(),
        }
        state
    }
}
