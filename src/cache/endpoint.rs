//! Endpoint definitions registered on an [`super::Api`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::error::{FetchError, HookError, QueryError};
use super::keys::{CacheKey, KeySerializer, default_serialize_query_args};
use super::lifecycle::{CacheLifecycleApi, QueryLifecycleApi};
use super::signal::AbortSignal;
use super::state::{ApiState, RequestId};
use super::store::Store;
use super::tags::TagsSpec;

pub type FetchFn =
    Arc<dyn Fn(Value, FetchContext) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

pub type CacheEntryHook = Arc<
    dyn Fn(Value, CacheLifecycleApi) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync,
>;

pub type QueryStartedHook = Arc<
    dyn Fn(Value, QueryLifecycleApi) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync,
>;

/// Second argument of every fetch function.
#[derive(Clone)]
pub struct FetchContext {
    /// Resolves when the request is aborted; fetch functions should stop.
    pub signal: AbortSignal,
    pub request_id: RequestId,
    pub endpoint_name: String,
    /// Whether the request bypassed coalescing.
    pub forced: bool,
    store: Arc<Store>,
}

impl FetchContext {
    pub(crate) fn new(
        signal: AbortSignal,
        request_id: RequestId,
        endpoint_name: impl Into<String>,
        forced: bool,
        store: Arc<Store>,
    ) -> Self {
        Self {
            signal,
            request_id,
            endpoint_name: endpoint_name.into(),
            forced,
            store,
        }
    }

    pub fn get_state(&self) -> Arc<ApiState> {
        self.store.get_state()
    }
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("request_id", &self.request_id)
            .field("endpoint_name", &self.endpoint_name)
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

fn box_fetch<F, Fut>(fetch: F) -> FetchFn
where
    F: Fn(Value, FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move |args, ctx| fetch(args, ctx).boxed())
}

fn box_query_started<F, Fut>(hook: F) -> QueryStartedHook
where
    F: Fn(Value, QueryLifecycleApi) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    Arc::new(move |args, api| hook(args, api).boxed())
}

/// A cached, deduplicated read.
#[derive(Clone)]
pub struct QueryEndpoint {
    pub(crate) fetch: FetchFn,
    pub(crate) provides_tags: TagsSpec,
    pub(crate) keep_unused_data_for: Option<Duration>,
    pub(crate) serialize_args: Option<KeySerializer>,
    pub(crate) on_cache_entry_added: Option<CacheEntryHook>,
    pub(crate) on_query_started: Option<QueryStartedHook>,
}

impl QueryEndpoint {
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(Value, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self {
            fetch: box_fetch(fetch),
            provides_tags: TagsSpec::None,
            keep_unused_data_for: None,
            serialize_args: None,
            on_cache_entry_added: None,
            on_query_started: None,
        }
    }

    pub fn provides_tags(mut self, tags: TagsSpec) -> Self {
        self.provides_tags = tags;
        self
    }

    /// Eviction delay for this endpoint; overrides the global setting.
    pub fn keep_unused_data_for(mut self, delay: Duration) -> Self {
        self.keep_unused_data_for = Some(delay);
        self
    }

    pub fn serialize_args<F>(mut self, serializer: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<CacheKey, QueryError> + Send + Sync + 'static,
    {
        self.serialize_args = Some(Arc::new(serializer));
        self
    }

    /// Runs once per cache entry, from creation until eviction.
    pub fn on_cache_entry_added<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Value, CacheLifecycleApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.on_cache_entry_added = Some(Arc::new(move |args, api| hook(args, api).boxed()));
        self
    }

    /// Runs once per request execution.
    pub fn on_query_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Value, QueryLifecycleApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.on_query_started = Some(box_query_started(hook));
        self
    }

    pub(crate) fn cache_key(&self, endpoint_name: &str, args: &Value) -> Result<CacheKey, QueryError> {
        match &self.serialize_args {
            Some(serializer) => serializer(endpoint_name, args),
            None => Ok(default_serialize_query_args(endpoint_name, args)),
        }
    }
}

impl fmt::Debug for QueryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEndpoint")
            .field("provides_tags", &self.provides_tags)
            .field("keep_unused_data_for", &self.keep_unused_data_for)
            .field("custom_serializer", &self.serialize_args.is_some())
            .field("on_cache_entry_added", &self.on_cache_entry_added.is_some())
            .field("on_query_started", &self.on_query_started.is_some())
            .finish_non_exhaustive()
    }
}

/// An uncached write; never coalesced.
#[derive(Clone)]
pub struct MutationEndpoint {
    pub(crate) fetch: FetchFn,
    pub(crate) invalidates_tags: TagsSpec,
    pub(crate) on_query_started: Option<QueryStartedHook>,
}

impl MutationEndpoint {
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(Value, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self {
            fetch: box_fetch(fetch),
            invalidates_tags: TagsSpec::None,
            on_query_started: None,
        }
    }

    pub fn invalidates_tags(mut self, tags: TagsSpec) -> Self {
        self.invalidates_tags = tags;
        self
    }

    pub fn on_query_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Value, QueryLifecycleApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.on_query_started = Some(box_query_started(hook));
        self
    }
}

impl fmt::Debug for MutationEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEndpoint")
            .field("invalidates_tags", &self.invalidates_tags)
            .field("on_query_started", &self.on_query_started.is_some())
            .finish_non_exhaustive()
    }
}

/// Query or mutation, resolved once at registration.
#[derive(Debug, Clone)]
pub enum EndpointDefinition {
    Query(QueryEndpoint),
    Mutation(MutationEndpoint),
}

impl EndpointDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Mutation(_) => "mutation",
        }
    }
}
