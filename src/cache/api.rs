//! The consumer-facing cache API.
//!
//! An [`Api`] owns one store plus the executor, eviction timers and lifecycle
//! records that react to its actions. Every state change goes through
//! [`Api::dispatch`], which reduces the action and then runs the side-effect
//! handlers in a fixed order: executor, subscriptions, invalidation,
//! lifecycle. The store lock is released before the handlers run, so they
//! may dispatch again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::actions::Action;
use super::config::ApiConfig;
use super::endpoint::{EndpointDefinition, MutationEndpoint, QueryEndpoint};
use super::error::QueryError;
use super::executor::{MutationRetention, QueryPromise, RequestExecutor};
use super::invalidation;
use super::keys::{CacheKey, to_query_args};
use super::lifecycle::LifecycleDispatcher;
use super::patches::{Patch, PatchCollection, diff};
use super::signal::AbortController;
use super::state::{ApiState, MutationCacheEntry, QueryCacheEntry, RequestId};
use super::store::Store;
use super::subscriptions::SubscriptionManager;

const METRIC_CACHE_HIT_TOTAL: &str = "quarry_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "quarry_cache_miss_total";
const METRIC_REQUEST_COALESCED_TOTAL: &str = "quarry_request_coalesced_total";

/// Reads one query entry out of a state snapshot.
pub type QuerySelector = Box<dyn Fn(&ApiState) -> QueryCacheEntry + Send + Sync>;

/// Options for [`Api::initiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateOptions {
    /// Hold a subscription on the entry until [`QueryHandle::unsubscribe`].
    pub subscribe: bool,
    /// Start a new request even if one is in flight or the data is fresh.
    pub force_refetch: bool,
    /// Refetch fulfilled data older than this; falls back to the global
    /// `refetch_on_mount_or_arg_change` setting.
    pub refetch_if_older_than: Option<Duration>,
}

impl Default for InitiateOptions {
    fn default() -> Self {
        Self {
            subscribe: true,
            force_refetch: false,
            refetch_if_older_than: None,
        }
    }
}

impl InitiateOptions {
    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            ..Self::default()
        }
    }

    pub fn unsubscribed() -> Self {
        Self {
            subscribe: false,
            ..Self::default()
        }
    }
}

/// Registers endpoints and builds an [`Api`].
pub struct ApiBuilder {
    config: ApiConfig,
    endpoints: HashMap<String, EndpointDefinition>,
}

impl ApiBuilder {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            endpoints: HashMap::new(),
        }
    }

    pub fn query(self, name: impl Into<String>, endpoint: QueryEndpoint) -> Self {
        self.endpoint(name, EndpointDefinition::Query(endpoint))
    }

    pub fn mutation(self, name: impl Into<String>, endpoint: MutationEndpoint) -> Self {
        self.endpoint(name, EndpointDefinition::Mutation(endpoint))
    }

    /// Register `definition` under `name`, replacing an earlier one.
    pub fn endpoint(mut self, name: impl Into<String>, definition: EndpointDefinition) -> Self {
        let name = name.into();
        let kind = definition.kind();
        if let Some(previous) = self.endpoints.insert(name.clone(), definition) {
            warn!(
                endpoint = %name,
                previous = previous.kind(),
                replacement = kind,
                "Endpoint definition replaced"
            );
        }
        self
    }

    pub fn build(self) -> Api {
        debug!(
            reducer_path = %self.config.reducer_path,
            endpoints = self.endpoints.len(),
            "Cache api built"
        );
        Api {
            inner: Arc::new(ApiInner {
                config: self.config,
                endpoints: self.endpoints,
                store: Arc::new(Store::new()),
                executor: RequestExecutor::new(),
                subscriptions: SubscriptionManager::new(),
                lifecycle: LifecycleDispatcher::new(),
            }),
        }
    }
}

struct ApiInner {
    config: ApiConfig,
    endpoints: HashMap<String, EndpointDefinition>,
    store: Arc<Store>,
    executor: RequestExecutor,
    subscriptions: SubscriptionManager,
    lifecycle: LifecycleDispatcher,
}

/// Request cache bound to one store. Cheap to clone.
///
/// Methods that start requests or timers spawn Tokio tasks and must run
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl Api {
    pub fn builder(config: ApiConfig) -> ApiBuilder {
        ApiBuilder::new(config)
    }

    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointDefinition> {
        self.inner.endpoints.get(name)
    }

    pub fn get_state(&self) -> Arc<ApiState> {
        self.inner.store.get_state()
    }

    /// Reduce `action`, run side effects, and return the reduced snapshot.
    pub fn dispatch(&self, action: Action) -> Arc<ApiState> {
        let state = self.inner.store.dispatch(&action);
        self.inner.executor.after_dispatch(&action);
        self.inner.subscriptions.after_dispatch(self, &action, &state);
        invalidation::after_dispatch(self, &action, &state);
        self.inner.lifecycle.after_dispatch(self, &action, &state);
        state
    }

    /// Clear every entry, subscription and timer; abort in-flight queries.
    pub fn reset(&self) {
        self.dispatch(Action::ResetApiState);
    }

    /// Cache key `name` would use for `args`.
    pub fn query_key<A>(&self, name: &str, args: &A) -> Result<CacheKey, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let endpoint = self.query_endpoint(name)?;
        endpoint.cache_key(name, &to_query_args(args)?)
    }

    /// Subscribe to `name(args)` and fetch it unless fresh data is cached or
    /// an identical request is already in flight.
    #[instrument(skip_all, fields(endpoint = name))]
    pub fn initiate<A>(
        &self,
        name: &str,
        args: &A,
        options: InitiateOptions,
    ) -> Result<QueryHandle, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let endpoint = self.query_endpoint(name)?;
        let args = to_query_args(args)?;
        let key = endpoint.cache_key(name, &args)?;

        let subscriber = options.subscribe.then(RequestId::new);
        if let Some(subscriber) = subscriber {
            self.dispatch(Action::Subscribe {
                key: key.clone(),
                subscriber,
            });
        }

        let promise = self.run_query(
            name,
            endpoint,
            key.clone(),
            args.clone(),
            options.force_refetch,
            options.refetch_if_older_than,
        );

        Ok(QueryHandle {
            api: self.clone(),
            endpoint_name: name.to_string(),
            args,
            key,
            subscriber,
            promise,
            unsubscribed: AtomicBool::new(false),
        })
    }

    /// Warm the cache without subscribing.
    pub fn prefetch<A>(
        &self,
        name: &str,
        args: &A,
        if_older_than: Option<Duration>,
    ) -> Result<QueryPromise, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let handle = self.initiate(
            name,
            args,
            InitiateOptions {
                subscribe: false,
                force_refetch: false,
                refetch_if_older_than: if_older_than,
            },
        )?;
        Ok(handle.promise)
    }

    /// Start a mutation. Every call runs the fetch function.
    ///
    /// The mutation's entry stays in the state until the returned handle is
    /// dropped and the request has settled. [`MutationHandle::reset`] removes
    /// it earlier.
    #[instrument(skip_all, fields(endpoint = name))]
    pub fn initiate_mutation<A>(&self, name: &str, args: &A) -> Result<MutationHandle, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let endpoint = self.mutation_endpoint(name)?;
        let args = to_query_args(args)?;
        let (promise, controller, retention) =
            self.inner
                .executor
                .execute_mutation(self, name, endpoint, args);
        Ok(MutationHandle {
            api: self.clone(),
            promise,
            controller,
            retention,
        })
    }

    /// Selector for `name(args)`; yields an uninitialized placeholder when
    /// the entry does not exist.
    pub fn select<A>(&self, name: &str, args: &A) -> Result<QuerySelector, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let endpoint = self.query_endpoint(name)?;
        let args = to_query_args(args)?;
        let key = endpoint.cache_key(name, &args)?;
        let endpoint_name = name.to_string();
        Ok(Box::new(move |state: &ApiState| {
            state.query(&key).cloned().unwrap_or_else(|| {
                QueryCacheEntry::uninitialized(key.clone(), endpoint_name.clone(), args.clone())
            })
        }))
    }

    pub fn select_mutation(&self, request_id: &RequestId) -> Option<MutationCacheEntry> {
        self.get_state().mutation(request_id).cloned()
    }

    /// Promise of the in-flight request for `name(args)`, if any.
    pub fn running_query<A>(&self, name: &str, args: &A) -> Result<Option<QueryPromise>, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let key = self.query_key(name, args)?;
        Ok(self.inner.executor.running(&key))
    }

    /// Apply `recipe` to a copy of the cached data and dispatch the
    /// difference. Returns an empty collection when nothing is cached.
    pub fn update_query_data<A, F>(
        &self,
        name: &str,
        args: &A,
        recipe: F,
    ) -> Result<PatchCollection, QueryError>
    where
        A: Serialize + ?Sized,
        F: FnOnce(&mut Value),
    {
        let key = self.query_key(name, args)?;
        Ok(self.update_entry_data(&key, recipe))
    }

    /// Apply previously recorded patches to the cached data.
    pub fn patch_query_data<A>(
        &self,
        name: &str,
        args: &A,
        patches: Vec<Patch>,
    ) -> Result<(), QueryError>
    where
        A: Serialize + ?Sized,
    {
        let key = self.query_key(name, args)?;
        if !patches.is_empty() {
            self.dispatch(Action::QueryResultPatched { key, patches });
        }
        Ok(())
    }

    /// Write `data` as a fulfilled result without fetching.
    pub fn upsert_query_data<A>(&self, name: &str, args: &A, data: Value) -> Result<(), QueryError>
    where
        A: Serialize + ?Sized,
    {
        let endpoint = self.query_endpoint(name)?;
        let args = to_query_args(args)?;
        let key = endpoint.cache_key(name, &args)?;
        let tags = endpoint.provides_tags.resolve(Ok(&data), &args);
        self.dispatch(Action::QueryDataUpserted {
            key,
            endpoint_name: name.to_string(),
            args,
            request_id: RequestId::new(),
            data,
            tags,
            fulfilled_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.inner.store)
    }

    pub(crate) fn executor(&self) -> &RequestExecutor {
        &self.inner.executor
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub(crate) fn lifecycle(&self) -> &LifecycleDispatcher {
        &self.inner.lifecycle
    }

    pub(crate) fn query_endpoint(&self, name: &str) -> Result<&QueryEndpoint, QueryError> {
        match self.inner.endpoints.get(name) {
            Some(EndpointDefinition::Query(endpoint)) => Ok(endpoint),
            Some(other) => Err(QueryError::EndpointKind {
                name: name.to_string(),
                expected: "query",
                actual: other.kind(),
            }),
            None => Err(QueryError::unknown_endpoint(name)),
        }
    }

    pub(crate) fn mutation_endpoint(&self, name: &str) -> Result<&MutationEndpoint, QueryError> {
        match self.inner.endpoints.get(name) {
            Some(EndpointDefinition::Mutation(endpoint)) => Ok(endpoint),
            Some(other) => Err(QueryError::EndpointKind {
                name: name.to_string(),
                expected: "mutation",
                actual: other.kind(),
            }),
            None => Err(QueryError::unknown_endpoint(name)),
        }
    }

    /// Eviction delay for entries of `endpoint_name`.
    pub(crate) fn keep_unused_data_for(&self, endpoint_name: &str) -> Duration {
        self.query_endpoint(endpoint_name)
            .ok()
            .and_then(|endpoint| endpoint.keep_unused_data_for)
            .unwrap_or_else(|| self.inner.config.keep_unused_data_for())
    }

    /// Forced refetch of an existing entry, used by invalidation.
    pub(crate) fn refetch_entry(
        &self,
        endpoint_name: &str,
        key: CacheKey,
        args: Value,
    ) -> Result<QueryPromise, QueryError> {
        let endpoint = self.query_endpoint(endpoint_name)?;
        Ok(self
            .inner
            .executor
            .execute_query(self, endpoint_name, endpoint, key, args, true))
    }

    pub(crate) fn cache_entry(
        &self,
        key: &CacheKey,
        endpoint_name: &str,
        args: &Value,
    ) -> QueryCacheEntry {
        self.get_state().query(key).cloned().unwrap_or_else(|| {
            QueryCacheEntry::uninitialized(key.clone(), endpoint_name, args.clone())
        })
    }

    pub(crate) fn update_entry_data<F>(&self, key: &CacheKey, recipe: F) -> PatchCollection
    where
        F: FnOnce(&mut Value),
    {
        let state = self.get_state();
        let Some(current) = state.query(key).and_then(|entry| entry.data.as_ref()) else {
            return PatchCollection::empty(key.clone());
        };
        let mut draft = current.clone();
        recipe(&mut draft);

        let patches = diff(current, &draft);
        if patches.is_empty() {
            return PatchCollection::empty(key.clone());
        }
        let inverse_patches = diff(&draft, current);
        self.dispatch(Action::QueryResultPatched {
            key: key.clone(),
            patches: patches.clone(),
        });
        PatchCollection::new(key.clone(), patches, inverse_patches, self.clone())
    }

    /// Decide between serving the cache, joining the in-flight request and
    /// starting a new one.
    fn run_query(
        &self,
        name: &str,
        endpoint: &QueryEndpoint,
        key: CacheKey,
        args: Value,
        force: bool,
        max_age: Option<Duration>,
    ) -> QueryPromise {
        let state = self.get_state();
        if !force && let Some(entry) = state.query(&key) {
            if entry.is_pending()
                && let Some(promise) = self.inner.executor.running(&key)
            {
                counter!(METRIC_REQUEST_COALESCED_TOTAL).increment(1);
                debug!(key = %key, request_id = %promise.request_id(), "Joined in-flight request");
                return promise;
            }
            if entry.is_fulfilled()
                && !entry.is_stale
                && !self.is_expired(entry, max_age)
                && let Some(data) = &entry.data
            {
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                debug!(key = %key, "Served from cache");
                let request_id = entry.request_id.unwrap_or_default();
                return QueryPromise::resolved(request_id, Ok(data.clone()));
            }
        }

        counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
        self.inner
            .executor
            .execute_query(self, name, endpoint, key, args, force)
    }

    fn is_expired(&self, entry: &QueryCacheEntry, max_age: Option<Duration>) -> bool {
        let Some(max_age) = max_age.or_else(|| self.inner.config.refetch_on_mount_or_arg_change())
        else {
            return false;
        };
        entry
            .age(OffsetDateTime::now_utc())
            .is_none_or(|age| age >= max_age)
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut endpoints: Vec<&str> = self.inner.endpoints.keys().map(String::as_str).collect();
        endpoints.sort_unstable();
        f.debug_struct("Api")
            .field("config", &self.inner.config)
            .field("endpoints", &endpoints)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Api::initiate`].
pub struct QueryHandle {
    api: Api,
    endpoint_name: String,
    args: Value,
    key: CacheKey,
    subscriber: Option<RequestId>,
    promise: QueryPromise,
    unsubscribed: AtomicBool,
}

impl QueryHandle {
    /// Id of the request this handle observes; a joined request keeps the
    /// id of the call that started it.
    pub fn request_id(&self) -> RequestId {
        self.promise.request_id()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn promise(&self) -> &QueryPromise {
        &self.promise
    }

    pub async fn result(&self) -> Result<Value, QueryError> {
        self.promise.result().await
    }

    /// Release the subscription. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        let Some(subscriber) = self.subscriber else {
            return;
        };
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.api.dispatch(Action::Unsubscribe {
            key: self.key.clone(),
            subscriber,
        });
    }

    /// Forced refetch of the same arguments; the subscription is kept.
    pub fn refetch(&self) -> Result<QueryPromise, QueryError> {
        let endpoint = self.api.query_endpoint(&self.endpoint_name)?;
        Ok(self.api.run_query(
            &self.endpoint_name,
            endpoint,
            self.key.clone(),
            self.args.clone(),
            true,
            None,
        ))
    }

    /// Abort the observed request if it is still in flight.
    pub fn abort(&self) {
        self.api
            .executor()
            .abort(&self.key, self.promise.request_id());
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.key)
            .field("request_id", &self.promise.request_id())
            .field("subscribed", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}

/// Returned by [`Api::initiate_mutation`].
pub struct MutationHandle {
    api: Api,
    promise: QueryPromise,
    controller: AbortController,
    retention: MutationRetention,
}

impl MutationHandle {
    pub fn request_id(&self) -> RequestId {
        self.promise.request_id()
    }

    pub fn promise(&self) -> &QueryPromise {
        &self.promise
    }

    pub async fn result(&self) -> Result<Value, QueryError> {
        self.promise.result().await
    }

    pub fn abort(&self) {
        self.controller.abort();
    }

    /// Drop the mutation's entry from the state.
    pub fn reset(&self) {
        self.api.dispatch(Action::RemoveMutationResult {
            request_id: self.promise.request_id(),
        });
    }
}

impl Drop for MutationHandle {
    fn drop(&mut self) {
        self.retention.release(&self.api);
    }
}

impl fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("request_id", &self.promise.request_id())
            .field("aborted", &self.controller.is_aborted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::cache::error::FetchError;
    use crate::cache::patches::PathSegment;
    use crate::cache::state::QueryStatus;
    use crate::cache::tags::{Tag, TagsSpec};

    fn counting(calls: &Arc<AtomicUsize>) -> QueryEndpoint {
        let calls = Arc::clone(calls);
        QueryEndpoint::new(move |args, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"id": args, "fetch": n}))
            }
        })
    }

    #[test]
    fn unknown_and_wrong_kind_endpoints_are_rejected() {
        let api = Api::builder(ApiConfig::default())
            .mutation(
                "addPost",
                MutationEndpoint::new(|args, _ctx| async move { Ok(args) }),
            )
            .build();

        assert_eq!(
            api.query_key("missing", &1).expect_err("unknown"),
            QueryError::unknown_endpoint("missing")
        );
        assert_eq!(
            api.query_key("addPost", &1).expect_err("wrong kind"),
            QueryError::EndpointKind {
                name: "addPost".into(),
                expected: "query",
                actual: "mutation",
            }
        );
    }

    #[test]
    fn duplicate_registration_replaces_definition() {
        let api = Api::builder(ApiConfig::default())
            .query(
                "getPost",
                QueryEndpoint::new(|args, _ctx| async move { Ok(args) }),
            )
            .mutation(
                "getPost",
                MutationEndpoint::new(|args, _ctx| async move { Ok(args) }),
            )
            .build();
        assert_eq!(api.endpoint("getPost").map(EndpointDefinition::kind), Some("mutation"));
    }

    #[test]
    fn select_yields_placeholder_for_missing_entry() {
        let api = Api::builder(ApiConfig::default())
            .query("getUser", counting(&Arc::new(AtomicUsize::new(0))))
            .build();
        let selector = api.select("getUser", &5).expect("selector");
        let entry = selector(&api.get_state());
        assert!(entry.is_uninitialized());
        assert_eq!(entry.key.as_str(), "getUser(5)");
        assert_eq!(entry.original_args, json!(5));
    }

    #[tokio::test]
    async fn fresh_data_is_served_without_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let api = Api::builder(ApiConfig::default())
            .query("getUser", counting(&calls))
            .build();

        let first = api
            .initiate("getUser", &1, InitiateOptions::default())
            .expect("initiate");
        first.result().await.expect("fulfilled");
        let second = api
            .initiate("getUser", &1, InitiateOptions::default())
            .expect("initiate");

        assert!(second.promise().is_settled());
        assert_eq!(second.result().await, Ok(json!({"id": 1, "fetch": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.get_state().subscriber_count(first.key()), 2);
    }

    #[tokio::test]
    async fn zero_max_age_always_refetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let api = Api::builder(ApiConfig::default())
            .query("getUser", counting(&calls))
            .build();

        api.prefetch("getUser", &1, None)
            .expect("prefetch")
            .result()
            .await
            .expect("fulfilled");
        let refreshed = api
            .prefetch("getUser", &1, Some(Duration::ZERO))
            .expect("prefetch");

        assert_eq!(refreshed.result().await, Ok(json!({"id": 1, "fetch": 2})));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let api = Api::builder(ApiConfig::default())
            .query("getUser", counting(&Arc::new(AtomicUsize::new(0))))
            .build();
        let a = api
            .initiate("getUser", &1, InitiateOptions::default())
            .expect("initiate");
        let b = api
            .initiate("getUser", &1, InitiateOptions::default())
            .expect("initiate");

        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(api.get_state().subscriber_count(b.key()), 1);

        let unsubscribed = api
            .initiate("getUser", &1, InitiateOptions::unsubscribed())
            .expect("initiate");
        unsubscribed.unsubscribe();
        assert_eq!(api.get_state().subscriber_count(b.key()), 1);
    }

    #[tokio::test]
    async fn refetch_and_running_query() {
        let gate = Arc::new(Semaphore::new(0));
        let fetch_gate = Arc::clone(&gate);
        let api = Api::builder(ApiConfig::default())
            .query(
                "getUser",
                QueryEndpoint::new(move |args, _ctx| {
                    let gate = Arc::clone(&fetch_gate);
                    async move {
                        let _permit = gate.acquire().await.expect("gate open");
                        Ok(args)
                    }
                }),
            )
            .build();

        assert!(api.running_query("getUser", &1).expect("key").is_none());
        let handle = api
            .initiate("getUser", &1, InitiateOptions::default())
            .expect("initiate");
        let running = api
            .running_query("getUser", &1)
            .expect("key")
            .expect("in flight");
        assert_eq!(running.request_id(), handle.request_id());

        let refetched = handle.refetch().expect("refetch");
        assert_ne!(refetched.request_id(), handle.request_id());
        assert_eq!(
            api.running_query("getUser", &1)
                .expect("key")
                .map(|p| p.request_id()),
            Some(refetched.request_id())
        );

        gate.add_permits(1);
        handle.result().await.expect("first settles");
        refetched.result().await.expect("refetch settles");
    }

    #[tokio::test]
    async fn update_query_data_records_and_undoes_patches() {
        let api = Api::builder(ApiConfig::default())
            .query("getPost", counting(&Arc::new(AtomicUsize::new(0))))
            .build();

        let noop = api
            .update_query_data("getPost", &1, |draft| draft["title"] = json!("x"))
            .expect("key");
        assert!(noop.is_empty());

        api.upsert_query_data("getPost", &1, json!({"id": 1, "title": "Draft"}))
            .expect("upsert");
        let collection = api
            .update_query_data("getPost", &1, |draft| draft["title"] = json!("Published"))
            .expect("key");
        assert_eq!(
            collection.patches,
            vec![Patch::Replace {
                path: vec![PathSegment::Key("title".into())],
                value: json!("Published"),
            }]
        );

        let key = api.query_key("getPost", &1).expect("key");
        let data = |api: &Api| api.get_state().query(&key).and_then(|e| e.data.clone());
        assert_eq!(data(&api), Some(json!({"id": 1, "title": "Published"})));

        collection.undo();
        assert_eq!(data(&api), Some(json!({"id": 1, "title": "Draft"})));

        api.patch_query_data("getPost", &1, collection.patches.clone())
            .expect("key");
        assert_eq!(data(&api), Some(json!({"id": 1, "title": "Published"})));
    }

    #[tokio::test]
    async fn upsert_registers_provided_tags() {
        let api = Api::builder(ApiConfig::default())
            .query(
                "getPost",
                counting(&Arc::new(AtomicUsize::new(0))).provides_tags(TagsSpec::computed(
                    |_outcome, args| vec![Tag::with_id("Post", args)],
                )),
            )
            .build();

        api.upsert_query_data("getPost", &3, json!({"id": 3}))
            .expect("upsert");
        let state = api.get_state();
        let key = api.query_key("getPost", &3).expect("key");
        let entry = state.query(&key).expect("upserted");
        assert_eq!(entry.status, QueryStatus::Fulfilled);
        assert!(entry.tags.contains(&Tag::with_id("Post", 3)));
    }

    #[tokio::test]
    async fn mutation_handle_reset_removes_entry() {
        let api = Api::builder(ApiConfig::default())
            .mutation(
                "addPost",
                MutationEndpoint::new(|args, _ctx| async move { Ok(json!({"created": args})) }),
            )
            .build();

        let handle = api
            .initiate_mutation("addPost", &json!({"title": "Hi"}))
            .expect("mutation");
        assert_eq!(
            handle.result().await,
            Ok(json!({"created": {"title": "Hi"}}))
        );
        let entry = api
            .select_mutation(&handle.request_id())
            .expect("mutation entry");
        assert_eq!(entry.status, QueryStatus::Fulfilled);

        handle.reset();
        assert!(api.select_mutation(&handle.request_id()).is_none());
    }

    #[tokio::test]
    async fn aborted_mutation_rejects() {
        let api = Api::builder(ApiConfig::default())
            .mutation(
                "slowWrite",
                MutationEndpoint::new(|_args, ctx: crate::cache::FetchContext| async move {
                    ctx.signal.aborted().await;
                    Err(FetchError::new("cancelled by server"))
                }),
            )
            .build();

        let handle = api.initiate_mutation("slowWrite", &()).expect("mutation");
        handle.abort();
        assert_eq!(handle.result().await, Err(QueryError::Aborted));
    }

    #[tokio::test]
    async fn dropping_settled_mutation_handle_removes_entry() {
        let api = Api::builder(ApiConfig::default())
            .mutation(
                "addPost",
                MutationEndpoint::new(|args, _ctx| async move { Ok(args) }),
            )
            .build();

        let handle = api.initiate_mutation("addPost", &1).expect("mutation");
        handle.result().await.expect("fulfilled");
        let request_id = handle.request_id();
        assert!(api.select_mutation(&request_id).is_some());

        drop(handle);
        assert!(api.select_mutation(&request_id).is_none());
        assert_eq!(api.get_state().mutations().count(), 0);
    }

    #[tokio::test]
    async fn mutation_dropped_in_flight_settles_then_cleans_up() {
        let gate = Arc::new(Semaphore::new(0));
        let task_gate = Arc::clone(&gate);
        let api = Api::builder(ApiConfig::default())
            .query(
                "getPost",
                QueryEndpoint::new(|args, _ctx| async move { Ok(json!({"id": args})) })
                    .provides_tags(TagsSpec::fixed([Tag::new("Post")])),
            )
            .mutation(
                "editPost",
                MutationEndpoint::new(move |args, _ctx| {
                    let gate = Arc::clone(&task_gate);
                    async move {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|_| FetchError::new("gate closed"))?;
                        Ok(args)
                    }
                })
                .invalidates_tags(TagsSpec::fixed([Tag::new("Post")])),
            )
            .build();
        api.upsert_query_data("getPost", &1, json!({"id": 1}))
            .expect("upsert");
        let key = api.query_key("getPost", &1).expect("key");

        let handle = api.initiate_mutation("editPost", &1).expect("mutation");
        let promise = handle.promise().clone();
        let request_id = handle.request_id();
        drop(handle);

        let entry = api.select_mutation(&request_id).expect("entry kept");
        assert_eq!(entry.status, QueryStatus::Pending);

        gate.add_permits(1);
        assert_eq!(promise.result().await, Ok(json!(1)));
        assert!(api.select_mutation(&request_id).is_none());
        assert!(api.get_state().query(&key).expect("entry").is_stale);
    }
}
