//! Quarry request cache engine.
//!
//! Components, leaf first:
//!
//! - **Keys**: canonical `endpoint(args)` serialization.
//! - **Executor**: runs fetch functions, dispatches pending/fulfilled/rejected,
//!   coalesces identical in-flight requests.
//! - **Store + reducer**: the single state slice, mutated only by dispatched
//!   [`Action`]s.
//! - **Subscriptions**: subscriber reference counts and deferred eviction.
//! - **Invalidation**: tag → key registry and refetch fan-out.
//! - **Lifecycle**: per-entry and per-request hooks.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! reducer_path = "api"
//! keep_unused_data_for_seconds = 60
//! # refetch_on_mount_or_arg_change_seconds = 300
//! ```

mod actions;
mod api;
mod config;
mod endpoint;
mod error;
mod executor;
mod invalidation;
mod keys;
mod lifecycle;
pub mod patches;
mod reducer;
mod registry;
mod signal;
mod state;
mod store;
mod subscriptions;
mod tags;

pub use actions::Action;
pub use api::{Api, ApiBuilder, InitiateOptions, MutationHandle, QueryHandle, QuerySelector};
pub use config::ApiConfig;
pub use endpoint::{
    CacheEntryHook, EndpointDefinition, FetchContext, FetchFn, MutationEndpoint, QueryEndpoint,
    QueryStartedHook,
};
pub use error::{FetchError, HookError, QueryError};
pub use executor::QueryPromise;
pub use invalidation::{InvalidatedEntry, invalidate_tags, select_invalidated_by};
pub use keys::{CacheKey, KeySerializer, default_serialize_query_args, to_query_args};
pub use lifecycle::{CacheLifecycleApi, QueryLifecycleApi};
pub use patches::{Patch, PatchCollection, PatchError, PathSegment};
pub use reducer::{ApiReducer, Reducer};
pub use registry::TagRegistry;
pub use signal::{AbortController, AbortSignal};
pub use state::{ApiState, MutationCacheEntry, QueryCacheEntry, QueryStatus, RequestId};
pub use store::{Epoch, Store};
pub use tags::{Tag, TagsSpec};
