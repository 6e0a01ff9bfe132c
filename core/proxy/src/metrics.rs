// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by one proxy instance. Cheap to bump from any task;
/// surfaced through [`ServerMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct ServerMetrics {
    requests: AtomicU64,
    incompatible_messages: AtomicU64,
    request_timeouts: AtomicU64,
    fragmented_uploads_requested: AtomicU64,
    fragmented_uploads_completed: AtomicU64,
    errors: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        ServerMetrics::default()
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incompatible_message(&self) {
        self.incompatible_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragmented_upload_requested(&self) {
        self.fragmented_uploads_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragmented_upload_completed(&self) {
        self.fragmented_uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            incompatible_messages: self.incompatible_messages.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            fragmented_uploads_requested: self.fragmented_uploads_requested.load(Ordering::Relaxed),
            fragmented_uploads_completed: self.fragmented_uploads_completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the proxy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub incompatible_messages: u64,
    pub request_timeouts: u64,
    pub fragmented_uploads_requested: u64,
    pub fragmented_uploads_completed: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());

        metrics.request();
        metrics.request();
        metrics.incompatible_message();
        metrics.request_timeout();
        metrics.fragmented_upload_requested();
        metrics.fragmented_upload_completed();
        metrics.error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.incompatible_messages, 1);
        assert_eq!(snapshot.request_timeouts, 1);
        assert_eq!(snapshot.fragmented_uploads_requested, 1);
        assert_eq!(snapshot.fragmented_uploads_completed, 1);
        assert_eq!(snapshot.errors, 1);
    }
}
