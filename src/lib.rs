//! Quarry: declarative request caching over a single-writer state store.
//!
//! Consumers ask for `(endpoint, args)`; the engine serializes that pair into a
//! [`cache::CacheKey`], serves cached data when it is fresh, coalesces identical
//! in-flight requests, reference-counts subscribers so unused entries are
//! evicted after a delay, and refetches subscribed entries when a tag they
//! provide is invalidated.
//!
//! ```ignore
//! let api = Api::builder(ApiConfig::default())
//!     .query("getUser", QueryEndpoint::new(|args, _ctx| async move {
//!         fetch_user(args).await
//!     }).provides_tags(TagsSpec::fixed([Tag::new("User")])))
//!     .build();
//!
//! let handle = api.initiate("getUser", &1, InitiateOptions::default())?;
//! let user = handle.result().await?;
//! ```

pub mod cache;
pub mod config;
pub mod infra;
