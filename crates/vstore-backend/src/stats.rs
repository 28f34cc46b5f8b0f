//! Per-backend telemetry counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tracing::field::{debug, display};

use vstore_config::{log_backend_debug, log_backend_warn};

use crate::{FetchError, ObjectFetchContext, Operation};

#[derive(Debug, Default)]
pub struct BackendStats {
    requests: AtomicU64,
    successes: AtomicU64,
    not_found: AtomicU64,
    failures: AtomicU64,
    bytes_fetched: AtomicU64,
    latency_us_total: AtomicU64,
}

/// Point-in-time copy of [`BackendStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub not_found: u64,
    pub failures: u64,
    pub bytes_fetched: u64,
    pub latency_us_total: u64,
}

impl BackendStatsSnapshot {
    pub fn avg_latency_us(&self) -> u64 {
        if self.requests == 0 {
            0
        } else {
            self.latency_us_total / self.requests
        }
    }
}

impl BackendStats {
    pub fn snapshot(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            latency_us_total: self.latency_us_total.load(Ordering::Relaxed),
        }
    }

    /// Count one request and emit a telemetry event tagged with the
    /// context's advisory fields.
    pub(crate) fn record(
        &self,
        backend: &str,
        operation: Operation,
        ctx: &ObjectFetchContext,
        started: Instant,
        result: &Result<Bytes, FetchError>,
    ) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_us_total.fetch_add(elapsed_us, Ordering::Relaxed);

        let outcome = match result {
            Ok(bytes) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.bytes_fetched.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                "ok"
            }
            Err(FetchError::NotFound { .. }) => {
                self.not_found.fetch_add(1, Ordering::Relaxed);
                "not_found"
            }
            Err(FetchError::Unsupported { .. }) => "unsupported",
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                "error"
            }
        };

        match result {
            Err(e @ (FetchError::Unavailable { .. } | FetchError::Protocol { .. })) => log_backend_warn!(
                "Backend request failed",
                backend = backend,
                operation = display(operation),
                request_id = ctx.request_id(),
                priority = debug(ctx.priority()),
                cause = debug(ctx.cause()),
                elapsed_us = elapsed_us,
                error = display(e),
            ),
            _ => log_backend_debug!(
                "Backend request finished",
                backend = backend,
                operation = display(operation),
                request_id = ctx.request_id(),
                priority = debug(ctx.priority()),
                cause = debug(ctx.cause()),
                bytes = result.as_ref().map(|b| b.len()).unwrap_or(0),
                elapsed_us = elapsed_us,
                outcome = outcome,
            ),
        }
    }
}
