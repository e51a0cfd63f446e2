//! Lifecycle hook dispatcher.
//!
//! `on_cache_entry_added` runs once per cache entry and can wait for the
//! first fulfilled value and for the entry's removal. `on_query_started`
//! runs once per request attempt and can wait for that attempt's outcome.
//! Hook failures and panics are logged and counted, never propagated.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::actions::Action;
use super::api::Api;
use super::endpoint::{CacheEntryHook, QueryStartedHook};
use super::error::{HookError, QueryError};
use super::executor::QueryPromise;
use super::keys::CacheKey;
use super::patches::PatchCollection;
use super::state::{ApiState, QueryCacheEntry, RequestId};

const METRIC_HOOK_FAILURE_TOTAL: &str = "quarry_hook_failure_total";

#[derive(Debug, Clone, PartialEq)]
enum FirstValue {
    Waiting,
    Loaded(Value),
    NeverResolved,
}

struct EntryRecord {
    first_value: watch::Sender<FirstValue>,
    removed: watch::Sender<bool>,
}

#[derive(Default)]
pub(crate) struct LifecycleDispatcher {
    records: DashMap<CacheKey, EntryRecord>,
}

impl LifecycleDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tracked_entries(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn after_dispatch(&self, api: &Api, action: &Action, state: &ApiState) {
        match action {
            Action::QueryPending {
                key,
                endpoint_name,
                args,
                ..
            } => self.entry_added(api, key, endpoint_name, args),
            Action::QueryDataUpserted {
                key,
                endpoint_name,
                args,
                data,
                ..
            } => {
                self.entry_added(api, key, endpoint_name, args);
                self.data_loaded(key, data);
            }
            Action::QueryFulfilled {
                key,
                request_id,
                data,
                ..
            } => {
                let accepted = state
                    .query(key)
                    .is_some_and(|entry| entry.request_id == Some(*request_id));
                if accepted {
                    self.data_loaded(key, data);
                }
            }
            Action::RemoveQueryResult { key } => self.entry_removed(key),
            Action::ResetApiState => {
                let keys: Vec<CacheKey> =
                    self.records.iter().map(|record| record.key().clone()).collect();
                for key in &keys {
                    self.entry_removed(key);
                }
            }
            _ => {}
        }
    }

    fn entry_added(&self, api: &Api, key: &CacheKey, endpoint_name: &str, args: &Value) {
        let (first_value_rx, removed_rx) = match self.records.entry(key.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let (first_value, first_value_rx) = watch::channel(FirstValue::Waiting);
                let (removed, removed_rx) = watch::channel(false);
                slot.insert(EntryRecord {
                    first_value,
                    removed,
                });
                (first_value_rx, removed_rx)
            }
        };

        let Ok(endpoint) = api.query_endpoint(endpoint_name) else {
            return;
        };
        let Some(hook) = endpoint.on_cache_entry_added.clone() else {
            return;
        };
        let lifecycle = CacheLifecycleApi {
            key: key.clone(),
            endpoint_name: endpoint_name.to_string(),
            args: args.clone(),
            first_value: first_value_rx,
            removed: removed_rx,
            api: api.clone(),
        };
        debug!(key = %key, "Cache entry hook started");
        spawn_hook(
            "on_cache_entry_added",
            endpoint_name,
            run_cache_entry_hook(hook, args.clone(), lifecycle),
        );
    }

    fn data_loaded(&self, key: &CacheKey, data: &Value) {
        if let Some(record) = self.records.get(key) {
            record.first_value.send_if_modified(|value| {
                if *value == FirstValue::Waiting {
                    *value = FirstValue::Loaded(data.clone());
                    true
                } else {
                    false
                }
            });
        }
    }

    fn entry_removed(&self, key: &CacheKey) {
        let Some((_, record)) = self.records.remove(key) else {
            return;
        };
        record.first_value.send_if_modified(|value| {
            if *value == FirstValue::Waiting {
                *value = FirstValue::NeverResolved;
                true
            } else {
                false
            }
        });
        record.removed.send_replace(true);
        debug!(key = %key, "Cache entry removed");
    }

    /// Run an endpoint's `on_query_started` hook for one attempt.
    pub(crate) fn query_started(
        &self,
        api: &Api,
        hook: &QueryStartedHook,
        endpoint_name: &str,
        key: Option<CacheKey>,
        args: Value,
        query_fulfilled: QueryPromise,
    ) {
        let lifecycle = QueryLifecycleApi {
            request_id: query_fulfilled.request_id(),
            endpoint_name: endpoint_name.to_string(),
            key,
            args: args.clone(),
            query_fulfilled,
            api: api.clone(),
        };
        let hook = Arc::clone(hook);
        spawn_hook(
            "on_query_started",
            endpoint_name,
            async move { hook(args, lifecycle).await }.boxed(),
        );
    }
}

fn run_cache_entry_hook(
    hook: CacheEntryHook,
    args: Value,
    lifecycle: CacheLifecycleApi,
) -> BoxFuture<'static, Result<(), HookError>> {
    async move { hook(args, lifecycle).await }.boxed()
}

fn spawn_hook(
    hook_name: &'static str,
    endpoint_name: &str,
    hook: BoxFuture<'static, Result<(), HookError>>,
) {
    let endpoint_name = endpoint_name.to_string();
    tokio::spawn(async move {
        match AssertUnwindSafe(hook).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err))
                if matches!(
                    err.downcast_ref::<QueryError>(),
                    Some(QueryError::NeverResolved)
                ) =>
            {
                debug!(hook = hook_name, endpoint = %endpoint_name, "Hook ended before data loaded");
            }
            Ok(Err(err)) => {
                counter!(METRIC_HOOK_FAILURE_TOTAL, "hook" => hook_name).increment(1);
                warn!(hook = hook_name, endpoint = %endpoint_name, error = %err, "Lifecycle hook failed");
            }
            Err(_) => {
                counter!(METRIC_HOOK_FAILURE_TOTAL, "hook" => hook_name).increment(1);
                error!(hook = hook_name, endpoint = %endpoint_name, "Lifecycle hook panicked");
            }
        }
    });
}

/// Handed to `on_cache_entry_added`.
#[derive(Clone)]
pub struct CacheLifecycleApi {
    key: CacheKey,
    endpoint_name: String,
    args: Value,
    first_value: watch::Receiver<FirstValue>,
    removed: watch::Receiver<bool>,
    api: Api,
}

impl CacheLifecycleApi {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// First value ever fulfilled for the entry.
    ///
    /// Fails with [`QueryError::NeverResolved`] when the entry is removed
    /// first. Returning that error from the hook is not counted as a failure.
    pub async fn cache_data_loaded(&self) -> Result<Value, QueryError> {
        let mut rx = self.first_value.clone();
        let settled = match rx.wait_for(|value| *value != FirstValue::Waiting).await {
            Ok(value) => value.clone(),
            Err(_) => FirstValue::NeverResolved,
        };
        match settled {
            FirstValue::Loaded(value) => Ok(value),
            FirstValue::Waiting | FirstValue::NeverResolved => Err(QueryError::NeverResolved),
        }
    }

    /// Resolves once the entry has been evicted or reset.
    pub async fn cache_entry_removed(&self) {
        let mut rx = self.removed.clone();
        let _ = rx.wait_for(|removed| *removed).await;
    }

    /// Live entry; an uninitialized placeholder once removed.
    pub fn get_cache_entry(&self) -> QueryCacheEntry {
        self.api
            .cache_entry(&self.key, &self.endpoint_name, &self.args)
    }

    /// Edit the cached data in place; no-op while no data is present.
    pub fn update_cached_data<F>(&self, recipe: F) -> PatchCollection
    where
        F: FnOnce(&mut Value),
    {
        self.api.update_entry_data(&self.key, recipe)
    }

    pub fn dispatch(&self, action: Action) -> Arc<ApiState> {
        self.api.dispatch(action)
    }

    pub fn get_state(&self) -> Arc<ApiState> {
        self.api.get_state()
    }
}

impl fmt::Debug for CacheLifecycleApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLifecycleApi")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Handed to `on_query_started`, for queries and mutations alike.
#[derive(Clone)]
pub struct QueryLifecycleApi {
    request_id: RequestId,
    endpoint_name: String,
    key: Option<CacheKey>,
    args: Value,
    query_fulfilled: QueryPromise,
    api: Api,
}

impl QueryLifecycleApi {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Cache key of the query; `None` for mutations.
    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Outcome of this attempt.
    pub async fn query_fulfilled(&self) -> Result<Value, QueryError> {
        self.query_fulfilled.result().await
    }

    /// Live entry of the query; `None` for mutations.
    pub fn get_cache_entry(&self) -> Option<QueryCacheEntry> {
        self.key
            .as_ref()
            .map(|key| self.api.cache_entry(key, &self.endpoint_name, &self.args))
    }

    /// Edit the query's cached data; `None` for mutations.
    pub fn update_cached_data<F>(&self, recipe: F) -> Option<PatchCollection>
    where
        F: FnOnce(&mut Value),
    {
        self.key
            .as_ref()
            .map(|key| self.api.update_entry_data(key, recipe))
    }

    /// The owning api, for edits to other endpoints' entries.
    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn dispatch(&self, action: Action) -> Arc<ApiState> {
        self.api.dispatch(action)
    }

    pub fn get_state(&self) -> Arc<ApiState> {
        self.api.get_state()
    }
}

impl fmt::Debug for QueryLifecycleApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryLifecycleApi")
            .field("request_id", &self.request_id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
