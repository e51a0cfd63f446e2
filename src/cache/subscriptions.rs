//! Subscriber reference counting and deferred eviction.
//!
//! Counts live in [`ApiState`]; this module only owns the eviction timers.
//! An entry becomes eligible for eviction when it has no subscribers and is
//! not pending. Eligible entries are removed after the endpoint's
//! `keep_unused_data_for` delay unless a subscriber arrives first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::actions::Action;
use super::api::Api;
use super::keys::CacheKey;
use super::state::ApiState;

const METRIC_CACHE_EVICT_TOTAL: &str = "quarry_cache_evict_total";

struct EvictionTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct SubscriptionManager {
    timers: DashMap<CacheKey, EvictionTimer>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn has_pending_eviction(&self, key: &CacheKey) -> bool {
        self.timers.contains_key(key)
    }

    pub(crate) fn after_dispatch(&self, api: &Api, action: &Action, state: &ApiState) {
        match action {
            Action::Subscribe { key, .. } => self.cancel(key, "subscribed"),
            Action::Unsubscribe { key, .. }
            | Action::QueryFulfilled { key, .. }
            | Action::QueryRejected { key, .. }
            | Action::QueryDataUpserted { key, .. } => self.schedule_if_unused(api, key, state),
            Action::RemoveQueryResult { key } => self.cancel(key, "removed"),
            Action::ResetApiState => self.cancel_all(),
            _ => {}
        }
    }

    fn schedule_if_unused(&self, api: &Api, key: &CacheKey, state: &ApiState) {
        let Some(entry) = state.query(key) else {
            return;
        };
        if state.subscriber_count(key) > 0 || entry.is_pending() {
            return;
        }
        let delay = api.keep_unused_data_for(&entry.endpoint_name);
        self.schedule(api, key, delay);
    }

    fn schedule(&self, api: &Api, key: &CacheKey, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let task_api = api.clone();
        let task_key = key.clone();
        // The timer only starts once its record is in `timers`; `expire`
        // treats a missing record as cancelled.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            task_api
                .subscriptions()
                .expire(&task_api, &task_key, generation);
        });

        if let Some(previous) = self
            .timers
            .insert(key.clone(), EvictionTimer { generation, handle })
        {
            previous.handle.abort();
        }
        let _ = armed_tx.send(());
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Eviction scheduled");
    }

    fn cancel(&self, key: &CacheKey, reason: &'static str) {
        if let Some((_, timer)) = self.timers.remove(key) {
            timer.handle.abort();
            debug!(key = %key, reason, "Eviction cancelled");
        }
    }

    fn cancel_all(&self) {
        let cancelled = self.timers.len();
        for timer in self.timers.iter() {
            timer.handle.abort();
        }
        self.timers.clear();
        if cancelled > 0 {
            debug!(cancelled, "All evictions cancelled");
        }
    }

    fn expire(&self, api: &Api, key: &CacheKey, generation: u64) {
        if self
            .timers
            .remove_if(key, |_, timer| timer.generation == generation)
            .is_none()
        {
            return;
        }

        let state = api.get_state();
        let Some(entry) = state.query(key) else {
            return;
        };
        if state.subscriber_count(key) > 0 || entry.is_pending() {
            trace!(key = %key, "Eviction skipped; entry in use");
            return;
        }

        counter!(METRIC_CACHE_EVICT_TOTAL).increment(1);
        info!(key = %key, "Evicting unused cache entry");
        api.dispatch(Action::RemoveQueryResult { key: key.clone() });
    }
}
