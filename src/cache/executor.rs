//! Request execution engine.
//!
//! Every attempt dispatches `pending` first, then exactly one of `fulfilled`
//! or `rejected`. In-flight query attempts are tracked per cache key so that
//! identical, non-forced initiates can join them instead of fetching again.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use metrics::histogram;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::actions::Action;
use super::api::Api;
use super::endpoint::{FetchContext, MutationEndpoint, QueryEndpoint};
use super::error::QueryError;
use super::keys::CacheKey;
use super::signal::AbortController;
use super::state::RequestId;

const METRIC_FETCH_MS: &str = "quarry_fetch_ms";

type Outcome = Option<Result<Value, QueryError>>;

/// Settles once with the outcome of one request attempt.
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Clone)]
pub struct QueryPromise {
    request_id: RequestId,
    rx: watch::Receiver<Outcome>,
}

impl QueryPromise {
    fn pending(request_id: RequestId) -> (watch::Sender<Outcome>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { request_id, rx })
    }

    /// A promise that has already settled.
    pub(crate) fn resolved(request_id: RequestId, outcome: Result<Value, QueryError>) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { request_id, rx }
    }

    /// Id of the attempt this promise observes.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the attempt to settle.
    ///
    /// Resolves to `Aborted` if the attempt was torn down without an outcome.
    pub async fn result(&self) -> Result<Value, QueryError> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(QueryError::Aborted))
    }
}

impl fmt::Debug for QueryPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPromise")
            .field("request_id", &self.request_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

struct InFlight {
    request_id: RequestId,
    promise: QueryPromise,
    controller: AbortController,
}

/// Keeps a mutation entry alive until its handle is dropped and its request
/// has settled. Whichever happens last removes the entry.
#[derive(Clone)]
pub(crate) struct MutationRetention {
    request_id: RequestId,
    holders: Arc<AtomicUsize>,
}

impl MutationRetention {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            holders: Arc::new(AtomicUsize::new(2)),
        }
    }

    pub(crate) fn release(&self, api: &Api) {
        if self.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!(request_id = %self.request_id, "Mutation entry released");
            api.dispatch(Action::RemoveMutationResult {
                request_id: self.request_id,
            });
        }
    }
}

/// Starts fetches and tracks the latest in-flight attempt per cache key.
#[derive(Default)]
pub(crate) struct RequestExecutor {
    in_flight: DashMap<CacheKey, InFlight>,
}

impl RequestExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Promise of the latest in-flight attempt for `key`.
    pub(crate) fn running(&self, key: &CacheKey) -> Option<QueryPromise> {
        self.in_flight
            .get(key)
            .map(|record| record.promise.clone())
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Abort the attempt `request_id` if it is still the in-flight one for `key`.
    pub(crate) fn abort(&self, key: &CacheKey, request_id: RequestId) {
        if let Some(record) = self.in_flight.get(key)
            && record.request_id == request_id
        {
            debug!(key = %key, request_id = %request_id, "Aborting in-flight query");
            record.controller.abort();
        }
    }

    /// Abort every in-flight query and forget them.
    pub(crate) fn abort_all(&self) {
        let aborted = self.in_flight.len();
        for record in self.in_flight.iter() {
            record.controller.abort();
        }
        self.in_flight.clear();
        if aborted > 0 {
            debug!(aborted, "Aborted all in-flight queries");
        }
    }

    pub(crate) fn after_dispatch(&self, action: &Action) {
        if matches!(action, Action::ResetApiState) {
            self.abort_all();
        }
    }

    /// Start a new attempt for `key`, replacing any tracked in-flight one.
    ///
    /// A replaced attempt keeps running; its result is discarded by the
    /// reducer because its request id is no longer current.
    pub(crate) fn execute_query(
        &self,
        api: &Api,
        endpoint_name: &str,
        endpoint: &QueryEndpoint,
        key: CacheKey,
        args: Value,
        forced: bool,
    ) -> QueryPromise {
        let request_id = RequestId::new();
        let controller = AbortController::new();
        let (tx, promise) = QueryPromise::pending(request_id);

        self.in_flight.insert(
            key.clone(),
            InFlight {
                request_id,
                promise: promise.clone(),
                controller: controller.clone(),
            },
        );

        debug!(
            key = %key,
            request_id = %request_id,
            forced,
            "Query started"
        );
        api.dispatch(Action::QueryPending {
            key: key.clone(),
            endpoint_name: endpoint_name.to_string(),
            args: args.clone(),
            request_id,
            started_at: OffsetDateTime::now_utc(),
        });

        if let Some(hook) = &endpoint.on_query_started {
            api.lifecycle().query_started(
                api,
                hook,
                endpoint_name,
                Some(key.clone()),
                args.clone(),
                promise.clone(),
            );
        }

        let fetch = Arc::clone(&endpoint.fetch);
        let provides_tags = endpoint.provides_tags.clone();
        let signal = controller.signal();
        let ctx = FetchContext::new(signal.clone(), request_id, endpoint_name, forced, api.store());
        let endpoint_name = endpoint_name.to_string();
        let api = api.clone();

        tokio::spawn(async move {
            let started_at = Instant::now();
            let outcome = tokio::select! {
                result = fetch(args.clone(), ctx) => result.map_err(QueryError::from),
                () = signal.aborted() => Err(QueryError::Aborted),
            };
            histogram!(METRIC_FETCH_MS, "endpoint" => endpoint_name.clone())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            match &outcome {
                Ok(data) => {
                    let tags = provides_tags.resolve(Ok(data), &args);
                    trace!(key = %key, request_id = %request_id, tags = tags.len(), "Query fulfilled");
                    api.dispatch(Action::QueryFulfilled {
                        key: key.clone(),
                        request_id,
                        data: data.clone(),
                        tags,
                        fulfilled_at: OffsetDateTime::now_utc(),
                    });
                }
                Err(error) => {
                    debug!(key = %key, request_id = %request_id, error = %error, "Query rejected");
                    api.dispatch(Action::QueryRejected {
                        key: key.clone(),
                        request_id,
                        error: error.clone(),
                    });
                }
            }

            api.executor()
                .in_flight
                .remove_if(&key, |_, record| record.request_id == request_id);
            tx.send_replace(Some(outcome));
        });

        promise
    }

    /// Start a mutation attempt. Mutations are never coalesced.
    pub(crate) fn execute_mutation(
        &self,
        api: &Api,
        endpoint_name: &str,
        endpoint: &MutationEndpoint,
        args: Value,
    ) -> (QueryPromise, AbortController, MutationRetention) {
        let request_id = RequestId::new();
        let controller = AbortController::new();
        let (tx, promise) = QueryPromise::pending(request_id);
        let retention = MutationRetention::new(request_id);
        let task_retention = retention.clone();

        debug!(endpoint = endpoint_name, request_id = %request_id, "Mutation started");
        api.dispatch(Action::MutationPending {
            request_id,
            endpoint_name: endpoint_name.to_string(),
            args: args.clone(),
            started_at: OffsetDateTime::now_utc(),
        });

        if let Some(hook) = &endpoint.on_query_started {
            api.lifecycle().query_started(
                api,
                hook,
                endpoint_name,
                None,
                args.clone(),
                promise.clone(),
            );
        }

        let fetch = Arc::clone(&endpoint.fetch);
        let signal = controller.signal();
        let ctx = FetchContext::new(signal.clone(), request_id, endpoint_name, false, api.store());
        let endpoint_name = endpoint_name.to_string();
        let api = api.clone();

        tokio::spawn(async move {
            let started_at = Instant::now();
            let outcome = tokio::select! {
                result = fetch(args, ctx) => result.map_err(QueryError::from),
                () = signal.aborted() => Err(QueryError::Aborted),
            };
            histogram!(METRIC_FETCH_MS, "endpoint" => endpoint_name.clone())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            match &outcome {
                Ok(data) => {
                    api.dispatch(Action::MutationFulfilled {
                        request_id,
                        data: data.clone(),
                        fulfilled_at: OffsetDateTime::now_utc(),
                    });
                }
                Err(error) => {
                    debug!(endpoint = %endpoint_name, request_id = %request_id, error = %error, "Mutation rejected");
                    api.dispatch(Action::MutationRejected {
                        request_id,
                        error: error.clone(),
                    });
                }
            }
            tx.send_replace(Some(outcome));
            task_retention.release(&api);
        });

        (promise, controller, retention)
    }
}
