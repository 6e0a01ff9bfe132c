// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Third-party crates
use parking_lot::RwLock;
use tracing::debug;

use crate::context::ServerContext;

/// Minimum spacing between two sweeps.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Mapping from correlation identifier to the active server context of the
/// call. At most one entry per correlation identifier; promotion replaces
/// the entry under the table lock; the sweep is the only removal path
/// during normal operation.
pub struct CallTable<M> {
    entries: RwLock<HashMap<String, ServerContext<M>>>,
    // monotonic sweep guard; wall-clock regression cannot defer cleanup
    start: Instant,
    last_sweep_ms: AtomicU64,
}

impl<M> Default for CallTable<M> {
    fn default() -> Self {
        CallTable {
            entries: RwLock::new(HashMap::new()),
            start: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }
}

impl<M> CallTable<M>
where
    M: Send + 'static,
{
    pub fn new() -> Self {
        CallTable::default()
    }

    pub fn get(&self, call_id: &str) -> Option<ServerContext<M>> {
        self.entries.read().get(call_id).cloned()
    }

    /// Insert or replace the context of a call. Replacement is the atomic
    /// promotion path: the table never lacks an entry for the call in
    /// between.
    pub fn insert(&self, call_id: String, context: ServerContext<M>) -> Option<ServerContext<M>> {
        self.entries.write().insert(call_id, context)
    }

    pub fn remove(&self, call_id: &str) -> Option<ServerContext<M>> {
        self.entries.write().remove(call_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sweep the table if at least [`SWEEP_INTERVAL`] passed since the last
    /// sweep. The guard is a compare-exchange, so concurrent callers elect
    /// exactly one sweeper.
    pub fn maybe_sweep(&self) {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SWEEP_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.sweep();
    }

    /// Remove every entry whose context reports closed. A context promoted
    /// concurrently is re-checked under the write lock, so a fresh entry
    /// under a swept call id is never lost.
    pub(crate) fn sweep(&self) {
        let closed: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, ctx)| ctx.is_closed())
            .map(|(call_id, _)| call_id.clone())
            .collect();

        if closed.is_empty() {
            return;
        }

        let mut entries = self.entries.write();
        for call_id in closed {
            if let Some(ctx) = entries.get(&call_id) {
                if ctx.is_closed() {
                    debug!(%call_id, "removing closed call context");
                    entries.remove(&call_id);
                }
            }
        }
    }
}
