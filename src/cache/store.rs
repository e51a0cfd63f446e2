//! Single-writer store for the cache slice.
//!
//! Reductions run one at a time under the write lock; readers receive
//! immutable `Arc<ApiState>` snapshots that later dispatches never touch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LockResult, RwLock};

use tracing::{debug, warn};

use super::actions::Action;
use super::keys::CacheKey;
use super::reducer::{ApiReducer, Reducer};
use super::state::ApiState;

/// Monotonic dispatch counter.
pub type Epoch = u64;

pub struct Store {
    state: RwLock<Arc<ApiState>>,
    epoch_counter: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(ApiState::default())),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn get_state(&self) -> Arc<ApiState> {
        Arc::clone(&*recover(self.state.read(), "get_state", self.epoch()))
    }

    /// Number of actions reduced so far.
    pub fn epoch(&self) -> Epoch {
        self.epoch_counter.load(Ordering::SeqCst)
    }

    /// Reduce `action` into the current state and return the new snapshot.
    ///
    /// The previous snapshot is moved into the reducer when nobody else holds
    /// it, and cloned otherwise.
    pub fn dispatch(&self, action: &Action) -> Arc<ApiState> {
        let mut slot = recover(self.state.write(), "dispatch", self.epoch());
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let current = std::mem::take(&mut *slot);
        let next = Arc::new(ApiReducer::reduce(Arc::unwrap_or_clone(current), action));
        *slot = Arc::clone(&next);
        drop(slot);

        debug!(
            epoch,
            action_type = action.action_type(),
            key = action.query_key().map(CacheKey::as_str),
            "Action reduced"
        );
        next
    }
}

/// Guards are recovered after a panic elsewhere; a reducer that panicked
/// mid-dispatch leaves an empty slice behind.
fn recover<G>(result: LockResult<G>, op: &'static str, epoch: Epoch) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op,
            epoch,
            result = "poisoned_recovered",
            "Recovered from poisoned store lock"
        );
        poisoned.into_inner()
    })
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
