//! Pipeline counters for the metrics endpoint.
//!
//! A single `PipelineMetrics` instance is constructed at process start
//! and shared by handle; it subscribes to circuit-breaker transitions
//! through [`BreakerObserver`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::circuit_breaker::{BreakerObserver, CircuitState};

#[derive(Default)]
pub struct PipelineMetrics {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    active_jobs: AtomicI64,
    requests_total: AtomicU64,
    rate_limit_hits: AtomicU64,
    breaker_transitions: AtomicU64,
    breaker_opens: AtomicU64,
    errors_by_kind: Mutex<HashMap<&'static str, u64>>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub active_jobs: i64,
    pub requests_total: u64,
    pub rate_limit_hits: u64,
    pub breaker_transitions: u64,
    pub breaker_opens: u64,
    pub errors_by_kind: HashMap<String, u64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// A job left the worker without reaching a terminal state
    /// (released back to pending on shutdown).
    pub fn job_released(&self) {
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &'static str) {
        let mut errors = self.errors_by_kind.lock().unwrap_or_else(|p| p.into_inner());
        *errors.entry(kind).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = self.errors_by_kind.lock().unwrap_or_else(|p| p.into_inner());
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            breaker_opens: self.breaker_opens.load(Ordering::Relaxed),
            errors_by_kind: errors.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

impl BreakerObserver for PipelineMetrics {
    fn on_transition(&self, _key: &str, _from: CircuitState, to: CircuitState) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        if to == CircuitState::Open {
            self.breaker_opens.fetch_add(1, Ordering::Relaxed);
        }
    }
}
