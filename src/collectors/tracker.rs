//! Start snapshots of in-flight executions keyed by correlation id.

use crate::collectors::timing::StartSnapshot;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

struct TrackerState<K> {
    entries: HashMap<K, StartSnapshot>,
    last_sweep: Instant,
}

/// Map of start snapshots. Entries older than the TTL are evicted by a sweep
/// that runs at most once per sweep interval, on insert.
pub struct StartTracker<K> {
    ttl: Duration,
    sweep_interval: Duration,
    state: Mutex<TrackerState<K>>,
}

impl<K: Eq + Hash> StartTracker<K> {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            ttl,
            sweep_interval,
            state: Mutex::new(TrackerState { entries: HashMap::new(), last_sweep: Instant::now() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState<K>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, key: K, snapshot: StartSnapshot) {
        let mut state = self.lock();
        if state.last_sweep.elapsed() >= self.sweep_interval {
            let ttl = self.ttl;
            let before = state.entries.len();
            state.entries.retain(|_, s| s.elapsed() < ttl);
            let evicted = before - state.entries.len();
            if evicted > 0 {
                debug!("Evicted {} abandoned start entries", evicted);
            }
            state.last_sweep = Instant::now();
        }
        state.entries.insert(key, snapshot);
    }

    pub fn remove(&self, key: &K) -> Option<StartSnapshot> {
        self.lock().entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
